//! Dispatch driver: orchestrates one turn from admission through reply
//! generation to finalization.
//!
//! The driver guarantees the dispatcher is drained on every exit path, then
//! reads the turn's outbox aggregate and finalizes the row. The same
//! aggregate predicate runs on the outbox side when rows terminalize, so
//! whichever writer observes the resolved state last converges on the same
//! terminal status.

use crate::adapters::AdapterRegistry;
use crate::config::{ConfigHandle, UnconfirmedFinalAction};
use crate::context::MsgContext;
use crate::dispatcher::{DeliveryQueueContext, DispatchCounts, Dispatcher, DispatcherOptions};
use crate::error::{DispatchError, Result};
use crate::outbox::OutboxStore;
use crate::turns::{TurnOutcome, TurnStore};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// The reply generator seam: computes zero or more replies for a context,
/// emitting them through the dispatcher.
pub type ReplyResolver =
    Arc<dyn Fn(MsgContext, Dispatcher) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// In-process registry of turns currently owned by a live driver.
///
/// Deliberately not persisted: after a crash the new process has no active
/// turns and every non-terminal row becomes eligible for recovery.
#[derive(Debug, Clone, Default)]
pub struct ActiveTurns {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveTurns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the turn was already registered.
    pub fn register(&self, turn_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(turn_id.to_string())
    }

    pub fn unregister(&self, turn_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(turn_id);
    }

    pub fn contains(&self, turn_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(turn_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a driver invocation.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub turn_id: Option<String>,
    /// False when the message was rejected as a duplicate.
    pub accepted: bool,
    pub queued_final: bool,
    pub counts: DispatchCounts,
}

/// Per-process turn orchestrator.
#[derive(Clone)]
pub struct DispatchDriver {
    turns: TurnStore,
    outbox: OutboxStore,
    adapters: AdapterRegistry,
    active: ActiveTurns,
    config: ConfigHandle,
}

impl DispatchDriver {
    pub fn new(
        turns: TurnStore,
        outbox: OutboxStore,
        adapters: AdapterRegistry,
        active: ActiveTurns,
        config: ConfigHandle,
    ) -> Self {
        Self {
            turns,
            outbox,
            adapters,
            active,
            config,
        }
    }

    pub fn turns(&self) -> &TurnStore {
        &self.turns
    }

    pub fn outbox(&self) -> &OutboxStore {
        &self.outbox
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn active_turns(&self) -> &ActiveTurns {
        &self.active
    }

    /// Normal inbound path: admit the turn, run the generator, finalize.
    /// Duplicate admissions drain the dispatcher and return without
    /// invoking the generator. Heartbeats are never admitted.
    pub async fn dispatch_inbound_message(
        &self,
        ctx: MsgContext,
        dispatcher: Dispatcher,
        resolver: ReplyResolver,
    ) -> Result<DispatchOutcome> {
        let ctx = ctx.normalized();

        let turn_id = if ctx.is_heartbeat {
            None
        } else {
            let admission = self.turns.accept_turn(&ctx, None).await?;
            if !admission.accepted {
                dispatcher.mark_complete().await;
                dispatcher.wait_for_idle().await;
                let counts = dispatcher.counts().await;
                return Ok(DispatchOutcome {
                    turn_id: Some(admission.id),
                    accepted: false,
                    queued_final: false,
                    counts,
                });
            }
            Some(admission.id)
        };

        self.run_turn(turn_id, ctx, dispatcher, resolver).await
    }

    /// Replay path for the turn-worker: the row already exists, so
    /// admission (and with it inbound dedupe) is bypassed.
    pub async fn dispatch_resumed_turn(
        &self,
        turn_id: &str,
        ctx: MsgContext,
        dispatcher: Dispatcher,
        resolver: ReplyResolver,
    ) -> Result<DispatchOutcome> {
        self.run_turn(
            Some(turn_id.to_string()),
            ctx.normalized(),
            dispatcher,
            resolver,
        )
        .await
    }

    /// Convenience variant that builds the dispatcher from the adapter
    /// registry: routed through the outbox, direct-sending when the route
    /// channel has an adapter, buffered or plain.
    pub async fn dispatch_inbound_with_adapters(
        &self,
        ctx: MsgContext,
        resolver: ReplyResolver,
        buffered: bool,
    ) -> Result<DispatchOutcome> {
        let ctx = ctx.normalized();
        let direct_send = ctx
            .route_channel()
            .and_then(|channel| self.adapters.get(&channel))
            .map(|_| self.adapters.send_fn());
        let dispatcher = Dispatcher::new(DispatcherOptions {
            outbox: Some(self.outbox.clone()),
            direct_send,
            interaction_scoped: ctx.is_interaction_scoped(),
            buffered,
        });
        self.dispatch_inbound_message(ctx, dispatcher, resolver).await
    }

    async fn run_turn(
        &self,
        turn_id: Option<String>,
        ctx: MsgContext,
        dispatcher: Dispatcher,
        resolver: ReplyResolver,
    ) -> Result<DispatchOutcome> {
        if let Some(id) = &turn_id {
            self.active.register(id);

            if let Err(error) = self.turns.mark_turn_running(id).await {
                tracing::warn!(%error, turn_id = %id, "failed to mark turn running");
            }

            if dispatcher.supports_delivery_queue()
                && !ctx.is_interaction_scoped()
                && let Some(route) = ctx.route_target()
            {
                dispatcher
                    .set_delivery_queue_context(DeliveryQueueContext {
                        supports_idempotency_key: self
                            .adapters
                            .supports_idempotency_key(&route.channel),
                        channel: route.channel,
                        to: route.to,
                        account_id: route.account_id,
                        thread_id: route.thread_id,
                        reply_to_id: route.reply_to_id,
                        turn_id: id.clone(),
                    })
                    .await;
            }
        }

        let result = resolver(ctx, dispatcher.clone()).await;

        // The dispatcher drains on every exit path, including generator
        // failure, so queued work is never stranded half-emitted.
        dispatcher.mark_complete().await;
        dispatcher.wait_for_idle().await;
        let counts = dispatcher.counts().await;

        let finalization: Result<()> = match (&turn_id, result) {
            (Some(id), Ok(())) => self.finalize_after_drain(id, &counts).await,
            (Some(id), Err(error)) => {
                if let Err(record_error) = self
                    .turns
                    .record_turn_recovery_failure(id, &format!("reply generation failed: {error}"))
                    .await
                {
                    tracing::warn!(%record_error, turn_id = %id, "failed to record recovery failure");
                }
                Err(DispatchError::ReplyGenerator(error).into())
            }
            (None, Ok(())) => Ok(()),
            (None, Err(error)) => Err(DispatchError::ReplyGenerator(error).into()),
        };

        if let Some(id) = &turn_id {
            self.active.unregister(id);
        }
        finalization?;

        Ok(DispatchOutcome {
            turn_id,
            accepted: true,
            queued_final: counts.queued_final,
            counts,
        })
    }

    /// Post-drain finalization: the outbox aggregate wins; the in-process
    /// counters only settle turns that left nothing durable behind.
    async fn finalize_after_drain(&self, turn_id: &str, counts: &DispatchCounts) -> Result<()> {
        let status = self.outbox.status_for_turn(turn_id).await?;

        if status.queued > 0 {
            self.turns.mark_turn_delivery_pending(turn_id).await?;
        } else if status.delivered > 0 && status.failed == 0 {
            self.turns
                .finalize_turn(turn_id, TurnOutcome::Delivered, None)
                .await?;
        } else if status.failed > 0 {
            self.turns
                .finalize_turn(turn_id, TurnOutcome::Failed, Some("outbox delivery failed"))
                .await?;
        } else if counts.attempted_final > 0 && !counts.queued_final {
            self.turns
                .record_turn_recovery_failure(turn_id, "final delivery did not queue successfully")
                .await?;
        } else if counts.attempted_final > 0 {
            if counts.confirmed_sends > 0 {
                self.turns
                    .finalize_turn(turn_id, TurnOutcome::Delivered, None)
                    .await?;
            } else {
                let action = self.config.load().messages.delivery.unconfirmed_final_action;
                match action {
                    UnconfirmedFinalAction::Deliver => {
                        self.turns
                            .finalize_turn(turn_id, TurnOutcome::Delivered, None)
                            .await?;
                    }
                    UnconfirmedFinalAction::RecoveryFailure => {
                        self.turns
                            .record_turn_recovery_failure(
                                turn_id,
                                "final reply had no confirmed send",
                            )
                            .await?;
                    }
                }
            }
        } else {
            // Command-only turn: no final reply was ever attempted.
            self.turns
                .finalize_turn(turn_id, TurnOutcome::Delivered, None)
                .await?;
        }
        Ok(())
    }
}
