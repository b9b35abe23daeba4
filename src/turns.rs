//! Turn journal: admission, deduplication, and state transitions for
//! `message_turns`.
//!
//! Every transition is a conditional `UPDATE ... WHERE status IN (...)` on
//! the current state, so concurrent writers (driver, turn-worker,
//! outbox-side finalization) converge without locks and terminal rows are
//! never mutated again.

use crate::context::MsgContext;
use crate::db::{now_ms, MessageDb};
use crate::error::Result;
use sqlx::Row as _;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{LazyLock, Mutex};

/// Recovery attempts before a turn is terminally failed.
pub const MAX_TURN_RECOVERY_ATTEMPTS: i64 = 3;

/// Delay added to `next_attempt_at` per recovery failure.
pub const TURN_RECOVERY_BACKOFF_MS: i64 = 15_000;

/// Turns older than this are failed outright instead of resumed.
pub const MAX_TURN_RECOVERY_AGE_MS: i64 = 24 * 60 * 60 * 1_000;

/// Terminal turns older than this are pruned.
pub const TURN_PRUNE_AGE_MS: i64 = 48 * 60 * 60 * 1_000;

/// SQL fragment naming the terminal turn statuses.
const TERMINAL_STATUSES: &str = "'delivered','aborted','failed_terminal'";

/// Lifecycle state of a turn row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Accepted,
    Running,
    DeliveryPending,
    FailedRetryable,
    Delivered,
    Aborted,
    FailedTerminal,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Accepted => "accepted",
            TurnStatus::Running => "running",
            TurnStatus::DeliveryPending => "delivery_pending",
            TurnStatus::FailedRetryable => "failed_retryable",
            TurnStatus::Delivered => "delivered",
            TurnStatus::Aborted => "aborted",
            TurnStatus::FailedTerminal => "failed_terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnStatus::Delivered | TurnStatus::Aborted | TurnStatus::FailedTerminal
        )
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TurnStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(TurnStatus::Accepted),
            "running" => Ok(TurnStatus::Running),
            "delivery_pending" => Ok(TurnStatus::DeliveryPending),
            "failed_retryable" => Ok(TurnStatus::FailedRetryable),
            "delivered" => Ok(TurnStatus::Delivered),
            "aborted" => Ok(TurnStatus::Aborted),
            "failed_terminal" => Ok(TurnStatus::FailedTerminal),
            other => Err(format!("invalid turn status: '{other}'")),
        }
    }
}

/// Terminal outcome applied by `finalize_turn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Delivered,
    Aborted,
    Failed,
}

impl TurnOutcome {
    fn status(&self) -> TurnStatus {
        match self {
            TurnOutcome::Delivered => TurnStatus::Delivered,
            TurnOutcome::Aborted => TurnStatus::Aborted,
            TurnOutcome::Failed => TurnStatus::FailedTerminal,
        }
    }
}

/// Result of a turn admission attempt.
#[derive(Debug, Clone)]
pub struct Admission {
    pub accepted: bool,
    pub id: String,
}

/// A persisted turn row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TurnRow {
    pub id: String,
    pub channel: String,
    pub account_id: Option<String>,
    pub external_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub session_key: Option<String>,
    pub payload: String,
    pub route_channel: Option<String>,
    pub route_to: Option<String>,
    pub route_account_id: Option<String>,
    pub route_thread_id: Option<String>,
    pub route_reply_to_id: Option<String>,
    pub status: String,
    pub accepted_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub attempt_count: i64,
    pub next_attempt_at: i64,
    pub terminal_reason: Option<String>,
}

impl TurnRow {
    pub fn status(&self) -> Option<TurnStatus> {
        self.status.parse().ok()
    }
}

/// A turn hydrated back from its persisted payload.
#[derive(Debug, Clone)]
pub struct HydratedTurn {
    pub ctx: MsgContext,
    pub route: crate::context::RouteTarget,
}

/// In-memory dedupe fallback used while the journal is unavailable.
///
/// Process-wide: its loss on restart is the safe default (admission fails
/// open and the durable unique index takes over once the journal returns).
struct FallbackDedupe {
    entries: Mutex<HashMap<(String, String, String), i64>>,
}

const FALLBACK_TTL_MS: i64 = 10 * 60 * 1_000;
const JOURNAL_WARN_INTERVAL_MS: i64 = 60 * 1_000;

static FALLBACK_DEDUPE: LazyLock<FallbackDedupe> = LazyLock::new(|| FallbackDedupe {
    entries: Mutex::new(HashMap::new()),
});

static LAST_JOURNAL_WARN_MS: AtomicI64 = AtomicI64::new(0);

impl FallbackDedupe {
    /// Returns true when the key has not been seen within the TTL.
    fn admit(&self, key: (String, String, String), now: i64) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, inserted| now - *inserted < FALLBACK_TTL_MS);
        match entries.get(&key) {
            Some(_) => false,
            None => {
                entries.insert(key, now);
                true
            }
        }
    }
}

/// Warn about journal unavailability at most once per minute.
fn warn_journal_unavailable(error: &sqlx::Error) {
    let now = now_ms();
    let last = LAST_JOURNAL_WARN_MS.load(Ordering::Relaxed);
    if now - last >= JOURNAL_WARN_INTERVAL_MS
        && LAST_JOURNAL_WARN_MS
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        tracing::warn!(%error, "turn journal unavailable, admission running on in-memory dedupe");
    }
}

/// Persistence and transitions for `message_turns`.
#[derive(Debug, Clone)]
pub struct TurnStore {
    db: MessageDb,
}

impl TurnStore {
    pub fn new(db: MessageDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &MessageDb {
        &self.db
    }

    /// Admit an inbound turn: compute the dedupe key, persist the canonical
    /// payload and route target, and decide acceptance.
    ///
    /// A non-null dedupe key is inserted with `INSERT OR IGNORE` against the
    /// partial unique index; the row count decides acceptance. When the key
    /// is null the message cannot be deduplicated and is always accepted.
    /// If the journal is down, admission fails open through the in-memory
    /// fallback cache.
    pub async fn accept_turn(
        &self,
        ctx: &MsgContext,
        turn_id: Option<String>,
    ) -> Result<Admission> {
        let id = turn_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let dedupe_key = ctx.dedupe_key();
        let payload = serde_json::to_string(ctx)
            .map_err(|e| anyhow::anyhow!("failed to serialize turn payload: {e}"))?;
        let channel = ctx.provider_key().unwrap_or_else(|| "unknown".to_string());
        let route = ctx.route_target();
        let now = now_ms();

        let insert = sqlx::query(
            "INSERT OR IGNORE INTO message_turns \
             (id, channel, account_id, external_id, dedupe_key, session_key, payload, \
              route_channel, route_to, route_account_id, route_thread_id, route_reply_to_id, \
              status, accepted_at, updated_at, attempt_count, next_attempt_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'accepted', ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(&channel)
        .bind(&ctx.account_id)
        .bind(&ctx.message_sid)
        .bind(&dedupe_key)
        .bind(&ctx.session_key)
        .bind(&payload)
        .bind(route.as_ref().map(|r| r.channel.as_str()))
        .bind(route.as_ref().map(|r| r.to.as_str()))
        .bind(route.as_ref().and_then(|r| r.account_id.as_deref()))
        .bind(route.as_ref().and_then(|r| r.thread_id.as_deref()))
        .bind(route.as_ref().and_then(|r| r.reply_to_id.as_deref()))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await;

        match insert {
            Ok(done) => {
                let accepted = dedupe_key.is_none() || done.rows_affected() == 1;
                if !accepted {
                    tracing::debug!(turn_id = %id, channel = %channel, "duplicate turn rejected");
                }
                Ok(Admission { accepted, id })
            }
            Err(error) => {
                warn_journal_unavailable(&error);
                let accepted = match &dedupe_key {
                    Some(_) => FALLBACK_DEDUPE.admit(
                        (
                            channel.clone(),
                            ctx.account_id.clone().unwrap_or_default(),
                            ctx.message_sid.clone().unwrap_or_default(),
                        ),
                        now,
                    ),
                    // No dedupe key is computable: fail open.
                    None => true,
                };
                Ok(Admission { accepted, id })
            }
        }
    }

    /// `accepted`/`failed_retryable` → `running`.
    pub async fn mark_turn_running(&self, turn_id: &str) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE message_turns SET status = 'running', updated_at = ? \
             WHERE id = ? AND status IN ('accepted','failed_retryable')",
        )
        .bind(now_ms())
        .bind(turn_id)
        .execute(self.db.pool())
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Non-terminal → `delivery_pending` (queued outbox work remains).
    pub async fn mark_turn_delivery_pending(&self, turn_id: &str) -> Result<bool> {
        let done = sqlx::query(&format!(
            "UPDATE message_turns SET status = 'delivery_pending', updated_at = ? \
             WHERE id = ? AND status NOT IN ({TERMINAL_STATUSES})"
        ))
        .bind(now_ms())
        .bind(turn_id)
        .execute(self.db.pool())
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Non-terminal → terminal. Returns false when the row was already
    /// terminal (or missing), which makes concurrent finalizations converge.
    pub async fn finalize_turn(
        &self,
        turn_id: &str,
        outcome: TurnOutcome,
        reason: Option<&str>,
    ) -> Result<bool> {
        let now = now_ms();
        let done = sqlx::query(&format!(
            "UPDATE message_turns \
             SET status = ?, terminal_reason = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status NOT IN ({TERMINAL_STATUSES})"
        ))
        .bind(outcome.status().as_str())
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(turn_id)
        .execute(self.db.pool())
        .await?;

        let applied = done.rows_affected() == 1;
        if applied {
            tracing::info!(turn_id = %turn_id, outcome = %outcome.status(), "turn finalized");
        }
        Ok(applied)
    }

    /// Record a failed recovery attempt. The turn goes back to
    /// `failed_retryable` with a pushed-out `next_attempt_at`, or terminal
    /// once the attempt cap is reached. Returns the resulting status, or
    /// `None` when the row was already terminal or missing.
    pub async fn record_turn_recovery_failure(
        &self,
        turn_id: &str,
        reason: &str,
    ) -> Result<Option<TurnStatus>> {
        let turn_id = turn_id.to_string();
        let reason = reason.to_string();
        self.db
            .write_txn(move |tx| {
                Box::pin(async move {
                    let row = sqlx::query(&format!(
                        "SELECT attempt_count FROM message_turns \
                         WHERE id = ? AND status NOT IN ({TERMINAL_STATUSES})"
                    ))
                    .bind(&turn_id)
                    .fetch_optional(&mut **tx)
                    .await?;

                    let Some(row) = row else {
                        return Ok(None);
                    };
                    let attempt_count: i64 = row.try_get("attempt_count")?;
                    let next_count = attempt_count + 1;
                    let now = now_ms();

                    if next_count >= MAX_TURN_RECOVERY_ATTEMPTS {
                        sqlx::query(&format!(
                            "UPDATE message_turns \
                             SET status = 'failed_terminal', attempt_count = ?, \
                                 terminal_reason = ?, completed_at = ?, updated_at = ? \
                             WHERE id = ? AND status NOT IN ({TERMINAL_STATUSES})"
                        ))
                        .bind(next_count)
                        .bind(&reason)
                        .bind(now)
                        .bind(now)
                        .bind(&turn_id)
                        .execute(&mut **tx)
                        .await?;
                        tracing::warn!(
                            turn_id = %turn_id,
                            attempts = next_count,
                            reason = %reason,
                            "turn recovery attempts exhausted"
                        );
                        Ok(Some(TurnStatus::FailedTerminal))
                    } else {
                        sqlx::query(&format!(
                            "UPDATE message_turns \
                             SET status = 'failed_retryable', attempt_count = ?, \
                                 next_attempt_at = ?, updated_at = ? \
                             WHERE id = ? AND status NOT IN ({TERMINAL_STATUSES})"
                        ))
                        .bind(next_count)
                        .bind(now + TURN_RECOVERY_BACKOFF_MS)
                        .bind(now)
                        .bind(&turn_id)
                        .execute(&mut **tx)
                        .await?;
                        Ok(Some(TurnStatus::FailedRetryable))
                    }
                })
            })
            .await
    }

    /// Blanket sweep: any non-terminal turn older than `max_age_ms` is
    /// terminally failed. Returns the number of rows swept.
    pub async fn fail_stale_turns(&self, max_age_ms: i64) -> Result<u64> {
        let now = now_ms();
        let done = sqlx::query(&format!(
            "UPDATE message_turns \
             SET status = 'failed_terminal', terminal_reason = 'exceeded recovery age', \
                 completed_at = ?, updated_at = ? \
             WHERE status NOT IN ({TERMINAL_STATUSES}) AND accepted_at < ?"
        ))
        .bind(now)
        .bind(now)
        .bind(now - max_age_ms)
        .execute(self.db.pool())
        .await?;
        Ok(done.rows_affected())
    }

    /// Session-scoped abort: every non-terminal turn for the session is
    /// moved to `aborted`, which also suppresses further orphan recovery.
    pub async fn abort_turns_for_session(&self, session_key: &str) -> Result<u64> {
        let now = now_ms();
        let done = sqlx::query(&format!(
            "UPDATE message_turns \
             SET status = 'aborted', terminal_reason = 'superseded by session abort', \
                 completed_at = ?, updated_at = ? \
             WHERE session_key = ? AND status NOT IN ({TERMINAL_STATUSES})"
        ))
        .bind(now)
        .bind(now)
        .bind(session_key)
        .execute(self.db.pool())
        .await?;

        if done.rows_affected() > 0 {
            tracing::info!(
                session_key = %session_key,
                aborted = done.rows_affected(),
                "aborted in-flight turns for session"
            );
        }
        Ok(done.rows_affected())
    }

    /// Delete terminal turns older than `age_ms`.
    pub async fn prune_turns(&self, age_ms: i64) -> Result<u64> {
        let done = sqlx::query(&format!(
            "DELETE FROM message_turns \
             WHERE status IN ({TERMINAL_STATUSES}) \
               AND COALESCE(completed_at, updated_at, accepted_at) < ?"
        ))
        .bind(now_ms() - age_ms)
        .execute(self.db.pool())
        .await?;
        Ok(done.rows_affected())
    }

    /// Non-terminal turns due for recovery, oldest first.
    ///
    /// `min_age_ms` keeps the worker off turns a live in-process driver is
    /// still running; `max_age_ms` bounds the window to rows the stale
    /// sweep has not yet claimed.
    pub async fn list_recoverable_turns(
        &self,
        min_age_ms: i64,
        max_age_ms: i64,
        limit: i64,
    ) -> Result<Vec<TurnRow>> {
        let now = now_ms();
        let rows = sqlx::query_as::<_, TurnRow>(&format!(
            "SELECT * FROM message_turns \
             WHERE status NOT IN ({TERMINAL_STATUSES}) \
               AND accepted_at >= ? AND accepted_at <= ? \
               AND next_attempt_at <= ? \
             ORDER BY accepted_at ASC \
             LIMIT ?"
        ))
        .bind(now - max_age_ms)
        .bind(now - min_age_ms)
        .bind(now)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Fetch a single turn row.
    pub async fn get(&self, turn_id: &str) -> Result<Option<TurnRow>> {
        let row = sqlx::query_as::<_, TurnRow>("SELECT * FROM message_turns WHERE id = ?")
            .bind(turn_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row)
    }

    /// Current status of a turn, if the row exists.
    pub async fn status_of(&self, turn_id: &str) -> Result<Option<TurnStatus>> {
        Ok(self.get(turn_id).await?.and_then(|row| row.status()))
    }
}

/// Reconstruct the canonical context and route target from a persisted row.
///
/// The route columns captured at admission win over anything re-derivable
/// from the payload. Returns `None` when the payload does not parse or when
/// neither source yields a reply channel and peer.
pub fn hydrate_turn_context(row: &TurnRow) -> Option<HydratedTurn> {
    let ctx: MsgContext = match serde_json::from_str(&row.payload) {
        Ok(ctx) => ctx,
        Err(error) => {
            tracing::warn!(turn_id = %row.id, %error, "turn payload failed to parse");
            return None;
        }
    };

    let derived = ctx.route_target();
    let channel = row
        .route_channel
        .clone()
        .or_else(|| derived.as_ref().map(|r| r.channel.clone()))?;
    let to = row
        .route_to
        .clone()
        .or_else(|| derived.as_ref().map(|r| r.to.clone()))?;

    let route = crate::context::RouteTarget {
        channel,
        to,
        account_id: row
            .route_account_id
            .clone()
            .or_else(|| derived.as_ref().and_then(|r| r.account_id.clone())),
        thread_id: row
            .route_thread_id
            .clone()
            .or_else(|| derived.as_ref().and_then(|r| r.thread_id.clone())),
        reply_to_id: row
            .route_reply_to_id
            .clone()
            .or_else(|| derived.as_ref().and_then(|r| r.reply_to_id.clone())),
    };

    Some(HydratedTurn { ctx, route })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadId;

    async fn store() -> TurnStore {
        let db = MessageDb::open_in_memory()
            .await
            .expect("in-memory store should open");
        TurnStore::new(db)
    }

    fn inbound(sid: Option<&str>) -> MsgContext {
        MsgContext {
            body: Some("hello".into()),
            from: Some("user-7".into()),
            to: Some("chat-1".into()),
            originating_channel: Some("telegram".into()),
            session_key: Some("agent:telegram:chat-1".into()),
            account_id: Some("acct-1".into()),
            message_sid: sid.map(String::from),
            thread_id: Some(ThreadId::Int(7)),
            ..MsgContext::default()
        }
    }

    async fn backdate_accepted(store: &TurnStore, turn_id: &str, delta_ms: i64) {
        sqlx::query(
            "UPDATE message_turns SET accepted_at = accepted_at - ?, next_attempt_at = 0 \
             WHERE id = ?",
        )
        .bind(delta_ms)
        .bind(turn_id)
        .execute(store.db().pool())
        .await
        .expect("backdate should succeed");
    }

    #[tokio::test]
    async fn duplicate_admission_is_rejected() {
        let store = store().await;
        let ctx = inbound(Some("msg-1"));

        let first = store
            .accept_turn(&ctx, None)
            .await
            .expect("first admission should succeed");
        assert!(first.accepted);

        let second = store
            .accept_turn(&ctx, None)
            .await
            .expect("second admission should succeed");
        assert!(!second.accepted, "identical dedupe key must be rejected");

        // The persisted unique index carries the decision across a fresh
        // store handle over the same database, as it would after a restart.
        let restarted = TurnStore::new(store.db().clone());
        let third = restarted
            .accept_turn(&ctx, None)
            .await
            .expect("post-restart admission should succeed");
        assert!(!third.accepted);
    }

    #[tokio::test]
    async fn missing_message_sid_never_dedupes() {
        let store = store().await;
        let ctx = inbound(None);

        let first = store.accept_turn(&ctx, None).await.expect("should accept");
        let second = store.accept_turn(&ctx, None).await.expect("should accept");
        assert!(first.accepted);
        assert!(second.accepted, "null dedupe key must not dedupe");
    }

    #[tokio::test]
    async fn terminal_rows_never_change_status() {
        let store = store().await;
        let admission = store
            .accept_turn(&inbound(Some("msg-t")), None)
            .await
            .expect("admission should succeed");
        let id = admission.id;

        assert!(store
            .finalize_turn(&id, TurnOutcome::Delivered, None)
            .await
            .expect("finalize should succeed"));

        assert!(!store.mark_turn_running(&id).await.expect("query ok"));
        assert!(!store.mark_turn_delivery_pending(&id).await.expect("query ok"));
        assert!(!store
            .finalize_turn(&id, TurnOutcome::Failed, Some("late"))
            .await
            .expect("query ok"));
        assert_eq!(
            store
                .record_turn_recovery_failure(&id, "late")
                .await
                .expect("query ok"),
            None
        );
        assert_eq!(
            store.status_of(&id).await.expect("query ok"),
            Some(TurnStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn finalize_twice_is_idempotent() {
        let store = store().await;
        let admission = store
            .accept_turn(&inbound(Some("msg-i")), None)
            .await
            .expect("admission should succeed");

        assert!(store
            .finalize_turn(&admission.id, TurnOutcome::Delivered, None)
            .await
            .expect("first finalize should apply"));
        assert!(!store
            .finalize_turn(&admission.id, TurnOutcome::Delivered, None)
            .await
            .expect("second finalize should be a no-op"));
    }

    #[tokio::test]
    async fn recovery_failure_terminalizes_at_the_attempt_cap() {
        let store = store().await;
        let admission = store
            .accept_turn(&inbound(Some("msg-r")), None)
            .await
            .expect("admission should succeed");
        let id = admission.id;

        for attempt in 1..MAX_TURN_RECOVERY_ATTEMPTS {
            let status = store
                .record_turn_recovery_failure(&id, "generator crashed")
                .await
                .expect("recovery record should succeed");
            assert_eq!(
                status,
                Some(TurnStatus::FailedRetryable),
                "attempt {attempt} stays retryable"
            );
        }

        let status = store
            .record_turn_recovery_failure(&id, "generator crashed")
            .await
            .expect("recovery record should succeed");
        assert_eq!(status, Some(TurnStatus::FailedTerminal));

        let row = store.get(&id).await.expect("query ok").expect("row exists");
        assert_eq!(row.attempt_count, MAX_TURN_RECOVERY_ATTEMPTS);
        assert_eq!(row.terminal_reason.as_deref(), Some("generator crashed"));
    }

    #[tokio::test]
    async fn next_attempt_at_is_monotonic_across_retries() {
        let store = store().await;
        let admission = store
            .accept_turn(&inbound(Some("msg-m")), None)
            .await
            .expect("admission should succeed");

        store
            .record_turn_recovery_failure(&admission.id, "boom")
            .await
            .expect("first failure should record");
        let first = store
            .get(&admission.id)
            .await
            .expect("query ok")
            .expect("row exists")
            .next_attempt_at;

        store
            .record_turn_recovery_failure(&admission.id, "boom")
            .await
            .expect("second failure should record");
        let second = store
            .get(&admission.id)
            .await
            .expect("query ok")
            .expect("row exists")
            .next_attempt_at;

        assert!(second >= first, "retry schedule must not move backwards");
    }

    #[tokio::test]
    async fn stale_sweep_fails_old_non_terminal_turns() {
        let store = store().await;
        let admission = store
            .accept_turn(&inbound(Some("msg-s")), None)
            .await
            .expect("admission should succeed");
        backdate_accepted(&store, &admission.id, 10).await;

        let swept = store.fail_stale_turns(1).await.expect("sweep should run");
        assert_eq!(swept, 1);

        let row = store
            .get(&admission.id)
            .await
            .expect("query ok")
            .expect("row exists");
        assert_eq!(row.status(), Some(TurnStatus::FailedTerminal));
        assert_eq!(row.terminal_reason.as_deref(), Some("exceeded recovery age"));
    }

    #[tokio::test]
    async fn session_abort_flips_every_non_terminal_turn() {
        let store = store().await;
        let mut first = inbound(Some("msg-a1"));
        let mut second = inbound(Some("msg-a2"));
        first.session_key = Some("agent:telegram:chat-9".into());
        second.session_key = Some("agent:telegram:chat-9".into());

        let a = store.accept_turn(&first, None).await.expect("should accept");
        let b = store.accept_turn(&second, None).await.expect("should accept");
        store
            .finalize_turn(&a.id, TurnOutcome::Delivered, None)
            .await
            .expect("finalize should succeed");

        let aborted = store
            .abort_turns_for_session("agent:telegram:chat-9")
            .await
            .expect("abort should run");
        assert_eq!(aborted, 1, "terminal rows are left alone");
        assert_eq!(
            store.status_of(&b.id).await.expect("query ok"),
            Some(TurnStatus::Aborted)
        );
        assert_eq!(
            store.status_of(&a.id).await.expect("query ok"),
            Some(TurnStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn recoverable_listing_respects_age_window_and_schedule() {
        let store = store().await;
        let fresh = store
            .accept_turn(&inbound(Some("msg-f")), None)
            .await
            .expect("should accept");
        let due = store
            .accept_turn(&inbound(Some("msg-d")), None)
            .await
            .expect("should accept");
        backdate_accepted(&store, &due.id, 60_000).await;

        let rows = store
            .list_recoverable_turns(30_000, MAX_TURN_RECOVERY_AGE_MS, 16)
            .await
            .expect("listing should succeed");
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&due.id.as_str()));
        assert!(
            !ids.contains(&fresh.id.as_str()),
            "turns younger than min age belong to the live driver"
        );

        // A future next_attempt_at hides the row until it comes due.
        sqlx::query("UPDATE message_turns SET next_attempt_at = ? WHERE id = ?")
            .bind(now_ms() + 60_000)
            .bind(&due.id)
            .execute(store.db().pool())
            .await
            .expect("update should succeed");
        let rows = store
            .list_recoverable_turns(30_000, MAX_TURN_RECOVERY_AGE_MS, 16)
            .await
            .expect("listing should succeed");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_only_old_terminal_rows() {
        let store = store().await;
        let done = store
            .accept_turn(&inbound(Some("msg-p1")), None)
            .await
            .expect("should accept");
        let live = store
            .accept_turn(&inbound(Some("msg-p2")), None)
            .await
            .expect("should accept");
        store
            .finalize_turn(&done.id, TurnOutcome::Delivered, None)
            .await
            .expect("finalize should succeed");
        sqlx::query(
            "UPDATE message_turns SET completed_at = completed_at - ?, updated_at = updated_at - ? \
             WHERE id = ?",
        )
        .bind(TURN_PRUNE_AGE_MS + 1_000)
        .bind(TURN_PRUNE_AGE_MS + 1_000)
        .bind(&done.id)
        .execute(store.db().pool())
        .await
        .expect("backdate should succeed");
        backdate_accepted(&store, &live.id, TURN_PRUNE_AGE_MS + 1_000).await;

        let pruned = store
            .prune_turns(TURN_PRUNE_AGE_MS)
            .await
            .expect("prune should run");
        assert_eq!(pruned, 1);
        assert!(store.get(&done.id).await.expect("query ok").is_none());
        assert!(
            store.get(&live.id).await.expect("query ok").is_some(),
            "non-terminal rows are never pruned"
        );
    }

    #[tokio::test]
    async fn hydration_round_trips_context_and_prefers_stored_route() {
        let store = store().await;
        let ctx = inbound(Some("msg-h")).normalized();
        let admission = store
            .accept_turn(&ctx, None)
            .await
            .expect("admission should succeed");

        let row = store
            .get(&admission.id)
            .await
            .expect("query ok")
            .expect("row exists");
        let hydrated = hydrate_turn_context(&row).expect("hydration should succeed");
        assert_eq!(hydrated.ctx, ctx);
        assert_eq!(hydrated.route.channel, "telegram");
        assert_eq!(hydrated.route.to, "chat-1");
        assert_eq!(hydrated.route.thread_id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn hydration_rejects_garbage_payloads() {
        let store = store().await;
        let admission = store
            .accept_turn(&inbound(Some("msg-g")), None)
            .await
            .expect("admission should succeed");
        sqlx::query("UPDATE message_turns SET payload = 'not json' WHERE id = ?")
            .bind(&admission.id)
            .execute(store.db().pool())
            .await
            .expect("update should succeed");

        let row = store
            .get(&admission.id)
            .await
            .expect("query ok")
            .expect("row exists");
        assert!(hydrate_turn_context(&row).is_none());
    }

    #[test]
    fn fallback_cache_expires_entries() {
        let cache = FallbackDedupe {
            entries: Mutex::new(HashMap::new()),
        };
        let key = || {
            (
                "telegram".to_string(),
                "acct-1".to_string(),
                "msg-1".to_string(),
            )
        };

        assert!(cache.admit(key(), 0));
        assert!(!cache.admit(key(), 1_000), "fresh duplicate is rejected");
        assert!(
            cache.admit(key(), FALLBACK_TTL_MS + 1),
            "expired entries readmit"
        );
    }
}
