//! Turn-worker: the continuous recovery loop for `message_turns`.
//!
//! Each pass sweeps stale turns, resumes recoverable ones by re-invoking
//! the reply generator with the persisted context, and prunes terminal
//! rows. Every error is swallowed and accounted per-row; the loop itself
//! never dies.

use crate::adapters::SendFn;
use crate::config::ConfigHandle;
use crate::dispatcher::{Dispatcher, DispatcherOptions};
use crate::driver::{DispatchDriver, ReplyResolver};
use crate::error::{DispatchError, Error};
use crate::outbox::DeliveryPayload;
use crate::turns::{
    hydrate_turn_context, TurnOutcome, MAX_TURN_RECOVERY_AGE_MS, TURN_PRUNE_AGE_MS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Minimum turn age before the worker considers it orphaned. Keeps the
/// worker off turns a live in-process driver is still running.
pub const TURN_RESUME_MIN_AGE_MS: i64 = 15_000;

/// Counters from one turn-worker pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnWorkerReport {
    pub stale_failed: u64,
    pub resumed: u32,
    pub finalized: u32,
    pub recovery_failures: u32,
    pub skipped: u32,
    pub pruned: u64,
}

impl TurnWorkerReport {
    fn has_activity(&self) -> bool {
        self.stale_failed > 0
            || self.resumed > 0
            || self.finalized > 0
            || self.recovery_failures > 0
            || self.pruned > 0
    }
}

/// Continuous turn recovery loop.
pub struct TurnWorker {
    driver: DispatchDriver,
    resolver: ReplyResolver,
    config: ConfigHandle,
    shutdown: watch::Receiver<bool>,
}

impl TurnWorker {
    pub fn new(
        driver: DispatchDriver,
        resolver: ReplyResolver,
        config: ConfigHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            driver,
            resolver,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        tracing::info!("turn worker started");
        loop {
            let interval_ms = self.config.load().turn_interval_ms.max(100);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {
                    let report = self.pass().await;
                    if report.has_activity() {
                        tracing::debug!(?report, "turn worker pass");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("turn worker stopped");
    }

    /// One recovery pass.
    pub async fn pass(&self) -> TurnWorkerReport {
        let mut report = TurnWorkerReport::default();
        let turns = self.driver.turns();
        let outbox = self.driver.outbox();

        match turns.fail_stale_turns(MAX_TURN_RECOVERY_AGE_MS).await {
            Ok(swept) => report.stale_failed = swept,
            Err(error) => tracing::warn!(%error, "stale turn sweep failed"),
        }

        let max_per_pass = self.config.load().max_turns_per_pass as i64;
        let rows = match turns
            .list_recoverable_turns(TURN_RESUME_MIN_AGE_MS, MAX_TURN_RECOVERY_AGE_MS, max_per_pass)
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(%error, "recoverable turn listing failed");
                Vec::new()
            }
        };

        for row in rows {
            if self.driver.active_turns().contains(&row.id) {
                report.skipped += 1;
                continue;
            }

            // Settle turns whose outbox already resolved them.
            let counts = match outbox.status_for_turn(&row.id).await {
                Ok(counts) => counts,
                Err(error) => {
                    tracing::warn!(%error, turn_id = %row.id, "outbox aggregate read failed");
                    continue;
                }
            };
            if counts.queued > 0 {
                // The outbox-worker owns the remaining deliveries.
                report.skipped += 1;
                continue;
            }
            if counts.delivered > 0 && counts.failed == 0 {
                if let Err(error) = turns
                    .finalize_turn(&row.id, TurnOutcome::Delivered, None)
                    .await
                {
                    tracing::warn!(%error, turn_id = %row.id, "turn finalization failed");
                } else {
                    report.finalized += 1;
                }
                continue;
            }
            if counts.failed > 0 {
                if let Err(error) = turns
                    .finalize_turn(&row.id, TurnOutcome::Failed, Some("outbox delivery failed"))
                    .await
                {
                    tracing::warn!(%error, turn_id = %row.id, "turn finalization failed");
                } else {
                    report.finalized += 1;
                }
                continue;
            }

            let Some(hydrated) = hydrate_turn_context(&row) else {
                if let Err(error) = turns
                    .record_turn_recovery_failure(&row.id, "invalid turn payload")
                    .await
                {
                    tracing::warn!(%error, turn_id = %row.id, "recovery failure record failed");
                }
                report.recovery_failures += 1;
                continue;
            };

            if hydrated.ctx.is_interaction_scoped() {
                // A one-shot callback token cannot be replayed to the route
                // fallback; the turn can only burn down its retry budget.
                if let Err(error) = turns
                    .record_turn_recovery_failure(&row.id, "interaction-scoped turn cannot be replayed")
                    .await
                {
                    tracing::warn!(%error, turn_id = %row.id, "recovery failure record failed");
                }
                report.recovery_failures += 1;
                continue;
            }

            // Resumed turns deliver straight through the route adapter;
            // no delivery-queue context is re-attached.
            let dispatcher = Dispatcher::new(DispatcherOptions {
                direct_send: Some(route_bound_send(
                    self.driver.adapters().send_fn(),
                    &hydrated.route,
                )),
                ..DispatcherOptions::default()
            });

            tracing::info!(turn_id = %row.id, channel = %hydrated.route.channel, "resuming orphaned turn");
            match self
                .driver
                .dispatch_resumed_turn(&row.id, hydrated.ctx, dispatcher, self.resolver.clone())
                .await
            {
                Ok(_) => report.resumed += 1,
                Err(error) => {
                    report.recovery_failures += 1;
                    tracing::warn!(%error, turn_id = %row.id, "turn resume failed");
                    // Generator failures were already recorded by the driver.
                    if !matches!(error, Error::Dispatch(DispatchError::ReplyGenerator(_)))
                        && let Err(record_error) = turns
                            .record_turn_recovery_failure(&row.id, &error.to_string())
                            .await
                    {
                        tracing::warn!(%record_error, turn_id = %row.id, "recovery failure record failed");
                    }
                }
            }
        }

        match turns.prune_turns(TURN_PRUNE_AGE_MS).await {
            Ok(pruned) => report.pruned = pruned,
            Err(error) => tracing::warn!(%error, "turn pruning failed"),
        }

        report
    }
}

/// Bind a registry send closure to a concrete route so payloads emitted by
/// a context-less resumed dispatcher still reach the right destination.
fn route_bound_send(send: SendFn, route: &crate::context::RouteTarget) -> SendFn {
    let route = route.clone();
    Arc::new(move |mut payload: DeliveryPayload| {
        let send = send.clone();
        let route = route.clone();
        Box::pin(async move {
            if payload.channel.is_empty() {
                payload.channel = route.channel;
                payload.to = route.to;
                payload.account_id = route.account_id;
                payload.thread_id = route.thread_id.map(|raw| {
                    raw.parse::<i64>()
                        .map(crate::context::ThreadId::Int)
                        .unwrap_or(crate::context::ThreadId::Text(raw))
                });
                payload.reply_to_id = route.reply_to_id;
            }
            send(payload).await
        })
    })
}
