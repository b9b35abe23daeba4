//! Outbox-worker: the continuous delivery drain for `message_outbox`.
//!
//! Each pass imports the legacy file queue (first pass only), applies TTL
//! expiry, then walks eligible rows oldest-first under a wall-clock budget,
//! delivering through the configured send seam. Failures are classified by
//! the journal; the loop swallows everything and accounts it per-row.

use crate::adapters::SendFn;
use crate::config::{ConfigHandle, ExpireAction};
use crate::db::now_ms;
use crate::error::Result;
use crate::outbox::{
    DeliveryDisposition, OutboxRow, OutboxStore, MAX_DELIVERY_RETRIES, OUTBOX_PRUNE_AGE_MS,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Counters from one outbox-worker pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxWorkerReport {
    pub imported: u32,
    pub expired: u64,
    pub delivered: u32,
    pub retried: u32,
    pub moved_terminal: u32,
    pub deferred: u32,
    pub pruned: u64,
}

impl OutboxWorkerReport {
    fn has_activity(&self) -> bool {
        self.imported > 0
            || self.expired > 0
            || self.delivered > 0
            || self.retried > 0
            || self.moved_terminal > 0
            || self.pruned > 0
    }
}

/// Continuous outbox drain loop.
pub struct OutboxWorker {
    outbox: OutboxStore,
    deliver: SendFn,
    config: ConfigHandle,
    state_dir: PathBuf,
    /// Wall-clock instant the process started its current run. Rows
    /// enqueued after this that were never attempted are being delivered
    /// live and are invisible to the first pass.
    startup_cutoff_ms: i64,
    first_pass_done: bool,
    imported_legacy: bool,
    shutdown: watch::Receiver<bool>,
}

impl OutboxWorker {
    pub fn new(
        outbox: OutboxStore,
        deliver: SendFn,
        config: ConfigHandle,
        state_dir: PathBuf,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            outbox,
            deliver,
            config,
            state_dir,
            startup_cutoff_ms: now_ms(),
            first_pass_done: false,
            imported_legacy: false,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        tracing::info!("outbox worker started");
        loop {
            let interval_ms = self.config.load().outbox_interval_ms.max(100);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {
                    let report = self.pass().await;
                    if report.has_activity() {
                        tracing::debug!(?report, "outbox worker pass");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("outbox worker stopped");
    }

    /// One drain pass.
    pub async fn pass(&mut self) -> OutboxWorkerReport {
        let mut report = OutboxWorkerReport::default();
        let config = self.config.load_full();
        let delivery = &config.messages.delivery;

        if !self.imported_legacy {
            match self.outbox.import_legacy_file_queue(&self.state_dir).await {
                Ok(imported) => report.imported = imported,
                Err(error) => tracing::warn!(%error, "legacy file queue import failed"),
            }
            self.imported_legacy = true;
        }

        match delivery.expire_action {
            ExpireAction::Fail => match self.outbox.expire_overdue(delivery.max_age_ms).await {
                Ok(expired) => report.expired = expired,
                Err(error) => tracing::warn!(%error, "outbox expiry failed"),
            },
            ExpireAction::Deliver => {
                if let Err(error) = self
                    .deliver_overdue_once(delivery.max_age_ms, &mut report)
                    .await
                {
                    tracing::warn!(%error, "final-attempt expiry failed");
                }
            }
        }

        let cutoff = if self.first_pass_done {
            None
        } else {
            Some(self.startup_cutoff_ms)
        };
        self.first_pass_done = true;

        let rows = match self.outbox.load_pending_deliveries(cutoff).await {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(%error, "pending delivery listing failed");
                Vec::new()
            }
        };

        // Leave headroom inside the loop period; whatever does not fit is
        // deferred to the next pass rather than blocking it.
        let budget = Duration::from_millis(config.outbox_interval_ms.max(100) * 3 / 4);
        let deadline = Instant::now() + budget;

        let total = rows.len();
        for (index, row) in rows.into_iter().enumerate() {
            if Instant::now() >= deadline {
                report.deferred += (total - index) as u32;
                tracing::debug!(remaining = total - index, "pass budget exhausted, deferring");
                break;
            }
            self.drain_row(row, &mut report).await;
        }

        match self.outbox.prune_outbox(OUTBOX_PRUNE_AGE_MS).await {
            Ok(pruned) => report.pruned = pruned,
            Err(error) => tracing::warn!(%error, "outbox pruning failed"),
        }

        report
    }

    async fn drain_row(&self, row: OutboxRow, report: &mut OutboxWorkerReport) {
        if row.attempt_count >= MAX_DELIVERY_RETRIES {
            if let Err(error) = self.outbox.move_to_failed(&row.id, "retries exhausted").await {
                tracing::warn!(%error, delivery_id = %row.id, "failed to terminalize exhausted row");
            } else {
                report.moved_terminal += 1;
            }
            return;
        }

        if row.eligible_at() > now_ms() {
            report.deferred += 1;
            return;
        }

        let payload = match row.delivery_payload() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, delivery_id = %row.id, "undeliverable payload");
                if let Err(move_error) = self
                    .outbox
                    .move_to_failed(&row.id, "invalid delivery payload")
                    .await
                {
                    tracing::warn!(%move_error, delivery_id = %row.id, "failed to terminalize row");
                } else {
                    report.moved_terminal += 1;
                }
                return;
            }
        };

        match (self.deliver)(payload).await {
            Ok(_receipt) => {
                if let Err(error) = self.outbox.ack_delivery(&row.id).await {
                    tracing::warn!(%error, delivery_id = %row.id, "failed to ack delivery");
                } else {
                    report.delivered += 1;
                }
            }
            Err(error) => match self.outbox.fail_delivery(&row.id, &error.to_string()).await {
                Ok(Some(DeliveryDisposition::Retrying { .. })) => report.retried += 1,
                Ok(Some(_)) => report.moved_terminal += 1,
                Ok(None) => {}
                Err(journal_error) => {
                    tracing::warn!(%journal_error, delivery_id = %row.id, "failed to record delivery failure");
                }
            },
        }
    }

    /// `expireAction = deliver`: give each overdue row one last attempt,
    /// then terminalize it either way.
    async fn deliver_overdue_once(
        &self,
        max_age_ms: i64,
        report: &mut OutboxWorkerReport,
    ) -> Result<()> {
        let overdue = self.outbox.list_overdue(max_age_ms).await?;
        for row in overdue {
            let payload = match row.delivery_payload() {
                Ok(payload) => payload,
                Err(_) => {
                    self.outbox
                        .move_to_failed(&row.id, "invalid delivery payload")
                        .await?;
                    report.moved_terminal += 1;
                    continue;
                }
            };
            match (self.deliver)(payload).await {
                Ok(_receipt) => {
                    self.outbox.ack_delivery(&row.id).await?;
                    report.delivered += 1;
                }
                Err(error) => {
                    tracing::warn!(%error, delivery_id = %row.id, "final delivery attempt failed");
                    self.outbox.move_to_failed(&row.id, "expired").await?;
                    report.expired += 1;
                }
            }
        }
        Ok(())
    }
}
