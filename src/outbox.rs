//! Outbox journal: persistence and state transitions for `message_outbox`.
//!
//! Each row is one deliverable final payload aimed at a concrete
//! destination. The journal owns row state; the dispatch driver and the
//! workers are the only writers. Terminal transitions consult the owning
//! turn's outbox aggregate and conditionally finalize the turn, converging
//! on the same predicate the driver evaluates after draining a dispatcher.

use crate::context::ThreadId;
use crate::db::{now_ms, MessageDb};
use crate::error::Result;
use crate::turns::{TurnOutcome, TurnStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::path::Path;
use std::sync::LazyLock;

/// Delivery attempts before a row is terminally failed.
pub const MAX_DELIVERY_RETRIES: i64 = 5;

/// Terminal outbox rows older than this are pruned.
pub const OUTBOX_PRUNE_AGE_MS: i64 = 48 * 60 * 60 * 1_000;

/// Fixed retry backoff table, indexed by failed-attempt count.
const BACKOFF_TABLE_MS: [i64; 4] = [5_000, 25_000, 120_000, 600_000];

const ACTIVE_STATUSES: &str = "'queued','failed_retryable'";
const TERMINAL_STATUSES: &str = "'delivered','failed_terminal','expired'";

/// Delivery failures that retrying can never fix.
static PERMANENT_ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        "no conversation reference found",
        "chat not found",
        "user not found",
        "bot was blocked by the user",
        "forbidden: bot was kicked",
        "chat_id is empty",
        "recipient is not a valid",
        "outbound not configured for channel",
    ]
    .iter()
    .map(|pattern| {
        Regex::new(&format!("(?i){}", regex::escape(pattern))).expect("hardcoded pattern")
    })
    .collect()
});

/// Backoff before the next attempt after `attempt_count` failures.
pub fn backoff_ms(attempt_count: i64) -> i64 {
    if attempt_count <= 0 {
        return 0;
    }
    let index = ((attempt_count - 1) as usize).min(BACKOFF_TABLE_MS.len() - 1);
    BACKOFF_TABLE_MS[index]
}

/// Whether a delivery error message matches the permanent-failure list.
pub fn is_permanent_delivery_error(message: &str) -> bool {
    PERMANENT_ERROR_PATTERNS
        .iter()
        .any(|pattern| pattern.is_match(message))
}

/// One reply unit inside a delivery payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplyPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Whether any media URL is set.
    pub fn has_media(&self) -> bool {
        self.media_url.is_some() || self.media_urls.as_ref().is_some_and(|urls| !urls.is_empty())
    }
}

/// Poll content for channels that support it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollPayload {
    pub question: String,
    pub options: Vec<String>,
}

/// Serialized form of an outbox row: everything an adapter needs to send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub channel: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub payloads: Vec<ReplyPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_effort: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gif_playback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<bool>,
}

/// Lifecycle state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Queued,
    FailedRetryable,
    Delivered,
    FailedTerminal,
    Expired,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Queued => "queued",
            OutboxStatus::FailedRetryable => "failed_retryable",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::FailedTerminal => "failed_terminal",
            OutboxStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboxStatus::Delivered | OutboxStatus::FailedTerminal | OutboxStatus::Expired
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(OutboxStatus::Queued),
            "failed_retryable" => Ok(OutboxStatus::FailedRetryable),
            "delivered" => Ok(OutboxStatus::Delivered),
            "failed_terminal" => Ok(OutboxStatus::FailedTerminal),
            "expired" => Ok(OutboxStatus::Expired),
            other => Err(format!("invalid outbox status: '{other}'")),
        }
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: String,
    pub turn_id: Option<String>,
    pub channel: String,
    pub account_id: Option<String>,
    pub target: Option<String>,
    pub payload: String,
    pub idempotency_key: Option<String>,
    pub queued_at: i64,
    pub status: String,
    pub attempt_count: i64,
    pub next_attempt_at: i64,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub error_class: Option<String>,
    pub terminal_reason: Option<String>,
    pub delivered_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl OutboxRow {
    pub fn status(&self) -> Option<OutboxStatus> {
        self.status.parse().ok()
    }

    pub fn delivery_payload(&self) -> Result<DeliveryPayload> {
        serde_json::from_str(&self.payload)
            .map_err(|e| anyhow::anyhow!("invalid outbox payload for row {}: {e}", self.id).into())
    }

    /// Earliest instant this row may be attempted again. Never-attempted
    /// rows are immediately eligible; everything else waits out the backoff
    /// from its last activity.
    pub fn eligible_at(&self) -> i64 {
        if self.attempt_count == 0 && self.last_attempt_at.is_none() {
            return 0;
        }
        self.last_attempt_at
            .unwrap_or(0)
            .max(self.queued_at)
            .saturating_add(backoff_ms(self.attempt_count))
    }
}

/// Per-turn outbox aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    /// Rows still in `queued` or `failed_retryable`.
    pub queued: i64,
    pub delivered: i64,
    /// Rows in `failed_terminal` or `expired`.
    pub failed: i64,
}

/// What `fail_delivery` decided for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDisposition {
    /// Matched the permanent-failure list; terminal immediately.
    Permanent,
    /// Transient, but the retry budget is spent; terminal.
    RetriesExhausted,
    /// Transient; scheduled for another attempt.
    Retrying { next_attempt_at: i64 },
}

/// Parameters for a new outbox row.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub turn_id: Option<String>,
    pub payload: DeliveryPayload,
    pub idempotency_key: Option<String>,
}

/// On-disk shape of a legacy file-queue entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LegacyQueuedDelivery {
    id: String,
    channel: String,
    to: String,
    account_id: Option<String>,
    payloads: Vec<ReplyPayload>,
    thread_id: Option<ThreadId>,
    reply_to_id: Option<String>,
    enqueued_at: Option<i64>,
    retry_count: Option<i64>,
    last_attempt_at: Option<i64>,
}

impl Default for LegacyQueuedDelivery {
    fn default() -> Self {
        Self {
            id: String::new(),
            channel: String::new(),
            to: String::new(),
            account_id: None,
            payloads: Vec::new(),
            thread_id: None,
            reply_to_id: None,
            enqueued_at: None,
            retry_count: None,
            last_attempt_at: None,
        }
    }
}

/// Persistence and transitions for `message_outbox`.
#[derive(Debug, Clone)]
pub struct OutboxStore {
    db: MessageDb,
    turns: TurnStore,
}

impl OutboxStore {
    pub fn new(db: MessageDb) -> Self {
        let turns = TurnStore::new(db.clone());
        Self { db, turns }
    }

    pub fn db(&self) -> &MessageDb {
        &self.db
    }

    /// Insert a new deliverable row in `queued`, immediately eligible.
    ///
    /// When an idempotency key is supplied and a row with the same key
    /// already exists, the existing row's id is returned instead of
    /// inserting a duplicate.
    pub async fn enqueue_delivery(&self, new: NewDelivery) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let inserted = self
            .insert_row(
                &id,
                new.turn_id.as_deref(),
                &new.payload,
                new.idempotency_key.as_deref(),
                now,
                0,
                now,
                None,
            )
            .await?;

        if inserted {
            return Ok(id);
        }
        // Unique idempotency_key conflict: hand back the existing row.
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM message_outbox WHERE idempotency_key = ?")
                .bind(&new.idempotency_key)
                .fetch_optional(self.db.pool())
                .await?;
        existing.ok_or_else(|| {
            anyhow::anyhow!("enqueue was ignored but no existing row matched the idempotency key")
                .into()
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_row(
        &self,
        id: &str,
        turn_id: Option<&str>,
        payload: &DeliveryPayload,
        idempotency_key: Option<&str>,
        queued_at: i64,
        attempt_count: i64,
        next_attempt_at: i64,
        last_attempt_at: Option<i64>,
    ) -> Result<bool> {
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| anyhow::anyhow!("failed to serialize delivery payload: {e}"))?;
        let done = sqlx::query(
            "INSERT OR IGNORE INTO message_outbox \
             (id, turn_id, channel, account_id, target, payload, idempotency_key, \
              queued_at, status, attempt_count, next_attempt_at, last_attempt_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?)",
        )
        .bind(id)
        .bind(turn_id)
        .bind(&payload.channel)
        .bind(&payload.account_id)
        .bind(&payload.to)
        .bind(&payload_json)
        .bind(idempotency_key)
        .bind(queued_at)
        .bind(attempt_count)
        .bind(next_attempt_at)
        .bind(last_attempt_at)
        .execute(self.db.pool())
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Rows ready for delivery, oldest first.
    ///
    /// With a startup cutoff, rows enqueued at or after the cutoff that
    /// have never been attempted are excluded — a live dispatch driver in
    /// this process is already delivering them.
    pub async fn load_pending_deliveries(
        &self,
        startup_cutoff: Option<i64>,
    ) -> Result<Vec<OutboxRow>> {
        let now = now_ms();
        let rows = match startup_cutoff {
            Some(cutoff) => {
                sqlx::query_as::<_, OutboxRow>(&format!(
                    "SELECT * FROM message_outbox \
                     WHERE status IN ({ACTIVE_STATUSES}) AND next_attempt_at <= ? \
                       AND NOT (queued_at >= ? AND attempt_count = 0 AND last_attempt_at IS NULL) \
                     ORDER BY queued_at ASC"
                ))
                .bind(now)
                .bind(cutoff)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, OutboxRow>(&format!(
                    "SELECT * FROM message_outbox \
                     WHERE status IN ({ACTIVE_STATUSES}) AND next_attempt_at <= ? \
                     ORDER BY queued_at ASC"
                ))
                .bind(now)
                .fetch_all(self.db.pool())
                .await?
            }
        };
        Ok(rows)
    }

    /// Active rows that have outlived the TTL window, oldest first.
    pub async fn list_overdue(&self, max_age_ms: i64) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT * FROM message_outbox \
             WHERE status IN ({ACTIVE_STATUSES}) AND queued_at < ? \
             ORDER BY queued_at ASC"
        ))
        .bind(now_ms() - max_age_ms)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Expire every active row older than the TTL window. Returns the
    /// number of rows expired.
    pub async fn expire_overdue(&self, max_age_ms: i64) -> Result<u64> {
        let now = now_ms();
        let cutoff = now - max_age_ms;

        let stale = sqlx::query(&format!(
            "SELECT id, turn_id FROM message_outbox \
             WHERE status IN ({ACTIVE_STATUSES}) AND queued_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let done = sqlx::query(&format!(
            "UPDATE message_outbox \
             SET status = 'expired', error_class = 'terminal', terminal_reason = 'expired', \
                 completed_at = ? \
             WHERE status IN ({ACTIVE_STATUSES}) AND queued_at < ?"
        ))
        .bind(now)
        .bind(cutoff)
        .execute(self.db.pool())
        .await?;

        let mut turn_ids: Vec<String> = stale
            .iter()
            .filter_map(|row| row.try_get::<Option<String>, _>("turn_id").ok().flatten())
            .collect();
        turn_ids.sort();
        turn_ids.dedup();
        for turn_id in turn_ids {
            self.maybe_finalize_turn(&turn_id).await?;
        }

        tracing::warn!(expired = done.rows_affected(), "expired overdue deliveries");
        Ok(done.rows_affected())
    }

    /// Mark a row delivered. Idempotent: acking a terminal row is a no-op.
    pub async fn ack_delivery(&self, delivery_id: &str) -> Result<bool> {
        let now = now_ms();
        let done = sqlx::query(&format!(
            "UPDATE message_outbox \
             SET status = 'delivered', delivered_at = ?, completed_at = ?, last_error = NULL \
             WHERE id = ? AND status IN ({ACTIVE_STATUSES})"
        ))
        .bind(now)
        .bind(now)
        .bind(delivery_id)
        .execute(self.db.pool())
        .await?;

        let applied = done.rows_affected() == 1;
        if applied
            && let Some(turn_id) = self.turn_id_of(delivery_id).await?
        {
            self.maybe_finalize_turn(&turn_id).await?;
        }
        Ok(applied)
    }

    /// Record a failed attempt: permanent errors terminalize immediately,
    /// transient errors increment the attempt count and either reschedule
    /// with backoff or terminalize once the retry budget is spent.
    ///
    /// Returns `None` when the row was already terminal or missing.
    pub async fn fail_delivery(
        &self,
        delivery_id: &str,
        error_text: &str,
    ) -> Result<Option<DeliveryDisposition>> {
        let delivery_id_owned = delivery_id.to_string();
        let error_owned = error_text.to_string();
        let permanent = is_permanent_delivery_error(error_text);

        let outcome = self
            .db
            .write_txn(move |tx| {
                Box::pin(async move {
                    let row = sqlx::query(&format!(
                        "SELECT attempt_count, turn_id FROM message_outbox \
                         WHERE id = ? AND status IN ({ACTIVE_STATUSES})"
                    ))
                    .bind(&delivery_id_owned)
                    .fetch_optional(&mut **tx)
                    .await?;

                    let Some(row) = row else {
                        return Ok(None);
                    };
                    let attempt_count: i64 = row.try_get("attempt_count")?;
                    let turn_id: Option<String> = row.try_get("turn_id")?;
                    let next_count = attempt_count + 1;
                    let now = now_ms();

                    let disposition = if permanent {
                        sqlx::query(&format!(
                            "UPDATE message_outbox \
                             SET status = 'failed_terminal', error_class = 'permanent', \
                                 terminal_reason = 'permanent delivery error', last_error = ?, \
                                 attempt_count = ?, last_attempt_at = ?, completed_at = ? \
                             WHERE id = ? AND status IN ({ACTIVE_STATUSES})"
                        ))
                        .bind(&error_owned)
                        .bind(next_count)
                        .bind(now)
                        .bind(now)
                        .bind(&delivery_id_owned)
                        .execute(&mut **tx)
                        .await?;
                        DeliveryDisposition::Permanent
                    } else if next_count >= MAX_DELIVERY_RETRIES {
                        sqlx::query(&format!(
                            "UPDATE message_outbox \
                             SET status = 'failed_terminal', error_class = 'terminal', \
                                 terminal_reason = 'retries exhausted', last_error = ?, \
                                 attempt_count = ?, last_attempt_at = ?, completed_at = ? \
                             WHERE id = ? AND status IN ({ACTIVE_STATUSES})"
                        ))
                        .bind(&error_owned)
                        .bind(next_count)
                        .bind(now)
                        .bind(now)
                        .bind(&delivery_id_owned)
                        .execute(&mut **tx)
                        .await?;
                        DeliveryDisposition::RetriesExhausted
                    } else {
                        let next_attempt_at = now + backoff_ms(next_count);
                        sqlx::query(&format!(
                            "UPDATE message_outbox \
                             SET status = 'failed_retryable', last_error = ?, \
                                 attempt_count = ?, last_attempt_at = ?, next_attempt_at = ? \
                             WHERE id = ? AND status IN ({ACTIVE_STATUSES})"
                        ))
                        .bind(&error_owned)
                        .bind(next_count)
                        .bind(now)
                        .bind(next_attempt_at)
                        .bind(&delivery_id_owned)
                        .execute(&mut **tx)
                        .await?;
                        DeliveryDisposition::Retrying { next_attempt_at }
                    };

                    Ok(Some((disposition, turn_id)))
                })
            })
            .await?;

        let Some((disposition, turn_id)) = outcome else {
            return Ok(None);
        };
        if !matches!(disposition, DeliveryDisposition::Retrying { .. })
            && let Some(turn_id) = turn_id
        {
            self.maybe_finalize_turn(&turn_id).await?;
        }

        match disposition {
            DeliveryDisposition::Permanent => {
                tracing::warn!(delivery_id = %delivery_id, error = %error_text, "permanent delivery failure");
            }
            DeliveryDisposition::RetriesExhausted => {
                tracing::warn!(delivery_id = %delivery_id, error = %error_text, "delivery retries exhausted");
            }
            DeliveryDisposition::Retrying { next_attempt_at } => {
                tracing::debug!(
                    delivery_id = %delivery_id,
                    next_attempt_at,
                    error = %error_text,
                    "delivery failed, retry scheduled"
                );
            }
        }
        Ok(Some(disposition))
    }

    /// Terminally fail a row with a generic reason. Idempotent.
    pub async fn move_to_failed(&self, delivery_id: &str, reason: &str) -> Result<bool> {
        let now = now_ms();
        let done = sqlx::query(&format!(
            "UPDATE message_outbox \
             SET status = 'failed_terminal', error_class = 'terminal', terminal_reason = ?, \
                 completed_at = ? \
             WHERE id = ? AND status IN ({ACTIVE_STATUSES})"
        ))
        .bind(reason)
        .bind(now)
        .bind(delivery_id)
        .execute(self.db.pool())
        .await?;

        let applied = done.rows_affected() == 1;
        if applied
            && let Some(turn_id) = self.turn_id_of(delivery_id).await?
        {
            self.maybe_finalize_turn(&turn_id).await?;
        }
        Ok(applied)
    }

    /// Delete terminal rows older than `age_ms`.
    pub async fn prune_outbox(&self, age_ms: i64) -> Result<u64> {
        let done = sqlx::query(&format!(
            "DELETE FROM message_outbox \
             WHERE status IN ({TERMINAL_STATUSES}) \
               AND COALESCE(completed_at, delivered_at, queued_at) < ?"
        ))
        .bind(now_ms() - age_ms)
        .execute(self.db.pool())
        .await?;
        Ok(done.rows_affected())
    }

    /// Aggregate outbox counters for a turn.
    pub async fn status_for_turn(&self, turn_id: &str) -> Result<OutboxCounts> {
        let row = sqlx::query(&format!(
            "SELECT \
               COALESCE(SUM(CASE WHEN status IN ({ACTIVE_STATUSES}) THEN 1 ELSE 0 END), 0) AS queued, \
               COALESCE(SUM(CASE WHEN status = 'delivered' THEN 1 ELSE 0 END), 0) AS delivered, \
               COALESCE(SUM(CASE WHEN status IN ('failed_terminal','expired') THEN 1 ELSE 0 END), 0) AS failed \
             FROM message_outbox WHERE turn_id = ?"
        ))
        .bind(turn_id)
        .fetch_one(self.db.pool())
        .await?;

        Ok(OutboxCounts {
            queued: row.try_get("queued")?,
            delivered: row.try_get("delivered")?,
            failed: row.try_get("failed")?,
        })
    }

    /// Fetch a single outbox row.
    pub async fn get(&self, delivery_id: &str) -> Result<Option<OutboxRow>> {
        let row = sqlx::query_as::<_, OutboxRow>("SELECT * FROM message_outbox WHERE id = ?")
            .bind(delivery_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row)
    }

    async fn turn_id_of(&self, delivery_id: &str) -> Result<Option<String>> {
        let turn_id: Option<Option<String>> =
            sqlx::query_scalar("SELECT turn_id FROM message_outbox WHERE id = ?")
                .bind(delivery_id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(turn_id.flatten())
    }

    /// Finalize the owning turn once its outbox has fully resolved: as
    /// delivered when at least one row delivered and none failed, as failed
    /// when failures remain and nothing is active. The dispatch driver
    /// evaluates the same predicate post-drain, so whichever side runs last
    /// converges on the same terminal state.
    pub async fn maybe_finalize_turn(&self, turn_id: &str) -> Result<()> {
        let counts = self.status_for_turn(turn_id).await?;
        if counts.queued > 0 {
            return Ok(());
        }
        if counts.delivered > 0 && counts.failed == 0 {
            self.turns
                .finalize_turn(turn_id, TurnOutcome::Delivered, None)
                .await?;
        } else if counts.failed > 0 {
            self.turns
                .finalize_turn(turn_id, TurnOutcome::Failed, Some("outbox delivery failed"))
                .await?;
        }
        Ok(())
    }

    /// Import the legacy JSON file queue from `<state_dir>/delivery-queue/`.
    ///
    /// Each well-formed file is inserted (keyed by its own id, so re-runs
    /// are no-ops) and unlinked. Malformed and non-JSON files are skipped in
    /// place. Returns the number of files consumed.
    pub async fn import_legacy_file_queue(&self, state_dir: &Path) -> Result<u32> {
        let queue_dir = state_dir.join("delivery-queue");
        if !queue_dir.is_dir() {
            return Ok(0);
        }

        let entries = std::fs::read_dir(&queue_dir)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", queue_dir.display()))?;
        let mut imported = 0u32;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(error) => {
                    tracing::warn!(file = %path.display(), %error, "failed to read legacy queue file");
                    continue;
                }
            };
            let legacy: LegacyQueuedDelivery = match serde_json::from_str::<LegacyQueuedDelivery>(&raw) {
                Ok(legacy) if !legacy.id.is_empty() => legacy,
                Ok(_) => {
                    tracing::warn!(file = %path.display(), "legacy queue entry has no id, skipping");
                    continue;
                }
                Err(error) => {
                    tracing::warn!(file = %path.display(), %error, "malformed legacy queue entry, skipping");
                    continue;
                }
            };

            let payload = DeliveryPayload {
                channel: legacy.channel,
                to: legacy.to,
                account_id: legacy.account_id,
                payloads: legacy.payloads,
                thread_id: legacy.thread_id,
                reply_to_id: legacy.reply_to_id,
                ..DeliveryPayload::default()
            };
            let now = now_ms();
            let inserted = self
                .insert_row(
                    &legacy.id,
                    None,
                    &payload,
                    None,
                    legacy.enqueued_at.unwrap_or(now),
                    legacy.retry_count.unwrap_or(0),
                    now,
                    legacy.last_attempt_at,
                )
                .await?;

            if let Err(error) = std::fs::remove_file(&path) {
                tracing::warn!(file = %path.display(), %error, "failed to unlink imported queue file");
                continue;
            }
            if inserted {
                imported += 1;
                tracing::info!(delivery_id = %legacy.id, "imported legacy queued delivery");
            }
        }

        Ok(imported)
    }
}
