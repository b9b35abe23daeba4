//! Per-turn dispatcher: serializes reply-generator emissions and couples
//! them to the outbox.
//!
//! One dispatcher exists per in-flight turn. The generator calls the
//! `send_*` methods in emission order; only final replies are durable. For
//! a routed dispatcher every final reply is enqueued as an outbox row in
//! lock-step with the direct send: a confirmed send acks the row, a failed
//! send hands it to the retry machinery. Interaction-scoped turns refuse
//! the delivery-queue context so one-shot callback tokens are never
//! replayed to a fallback destination.

use crate::adapters::{SendFn, SendReceipt};
use crate::context::ThreadId;
use crate::outbox::{DeliveryPayload, NewDelivery, OutboxStore, ReplyPayload};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Reply destination a routed dispatcher persists with each final payload.
#[derive(Debug, Clone)]
pub struct DeliveryQueueContext {
    pub channel: String,
    pub to: String,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub turn_id: String,
    /// Adapter metadata: when set, outbox rows carry a deterministic
    /// idempotency key so a replayed turn cannot double-queue.
    pub supports_idempotency_key: bool,
}

/// Emission counters captured when the dispatcher drains.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchCounts {
    pub tool_results: u32,
    pub block_replies: u32,
    pub final_replies: u32,
    /// Final replies the generator attempted to emit.
    pub attempted_final: u32,
    /// Direct sends that the provider confirmed.
    pub confirmed_sends: u32,
    /// True when every attempted final either reached the outbox or did
    /// not require queueing.
    pub queued_final: bool,
}

#[derive(Default)]
struct DispatcherState {
    queue_ctx: Option<DeliveryQueueContext>,
    completed: bool,
    outstanding: usize,
    enqueue_failures: u32,
    tool_results: u32,
    block_replies: u32,
    final_replies: u32,
    attempted_final: u32,
    confirmed_sends: u32,
    buffered_blocks: Vec<String>,
}

/// Construction options for a dispatcher.
#[derive(Default)]
pub struct DispatcherOptions {
    /// Outbox journal for durable routing. Absent for pure direct-send
    /// dispatchers (e.g. resumed turns delivering straight to an adapter).
    pub outbox: Option<OutboxStore>,
    /// Direct send path, invoked in lock-step with the outbox enqueue.
    pub direct_send: Option<SendFn>,
    /// Suppresses the delivery-queue context for one-shot callback turns.
    pub interaction_scoped: bool,
    /// Buffered-typing variant: block replies are folded into the next
    /// final payload instead of being sent as they arrive.
    pub buffered: bool,
}

/// In-process coordinator for one turn's emissions.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    outbox: Option<OutboxStore>,
    direct_send: Option<SendFn>,
    interaction_scoped: bool,
    buffered: bool,
    state: Mutex<DispatcherState>,
    idle: Notify,
}

impl Dispatcher {
    pub fn new(options: DispatcherOptions) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                outbox: options.outbox,
                direct_send: options.direct_send,
                interaction_scoped: options.interaction_scoped,
                buffered: options.buffered,
                state: Mutex::new(DispatcherState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Whether this dispatcher can persist final replies to the outbox.
    pub fn supports_delivery_queue(&self) -> bool {
        self.inner.outbox.is_some() && !self.inner.interaction_scoped
    }

    /// Attach the delivery-queue context. Ignored for interaction-scoped
    /// dispatchers: their reply tokens cannot be replayed, so their finals
    /// must never land in the outbox.
    pub async fn set_delivery_queue_context(&self, ctx: DeliveryQueueContext) {
        if self.inner.interaction_scoped {
            tracing::debug!(
                turn_id = %ctx.turn_id,
                "delivery queue context suppressed for interaction-scoped turn"
            );
            return;
        }
        let mut state = self.inner.state.lock().await;
        state.queue_ctx = Some(ctx);
    }

    /// Record a tool-result emission. Not durable.
    pub async fn send_tool_result(&self, text: &str) {
        self.send_transient(text, EmissionKind::Tool).await;
    }

    /// Record a block-reply emission. Not durable.
    pub async fn send_block_reply(&self, text: &str) {
        self.send_transient(text, EmissionKind::Block).await;
    }

    async fn send_transient(&self, text: &str, kind: EmissionKind) {
        let direct_send = {
            let mut state = self.inner.state.lock().await;
            if state.completed {
                tracing::debug!("emission after completion ignored");
                return;
            }
            match kind {
                EmissionKind::Tool => state.tool_results += 1,
                EmissionKind::Block => state.block_replies += 1,
            }
            if self.inner.buffered {
                state.buffered_blocks.push(text.to_string());
                return;
            }
            state.outstanding += 1;
            self.inner.direct_send.clone()
        };

        if let Some(send) = direct_send {
            let payload = self.transient_payload(text).await;
            if let Some(payload) = payload
                && let Err(error) = send(payload).await
            {
                tracing::warn!(%error, "transient emission send failed");
            }
        }
        self.end_work().await;
    }

    async fn transient_payload(&self, text: &str) -> Option<DeliveryPayload> {
        let state = self.inner.state.lock().await;
        let ctx = state.queue_ctx.as_ref()?;
        Some(build_payload(ctx, vec![ReplyPayload::text(text)]))
    }

    /// Emit a final reply: enqueue to the outbox (when routed) and invoke
    /// the direct send, acking or failing the row with the send outcome.
    pub async fn send_final_reply(&self, mut payloads: Vec<ReplyPayload>) -> crate::error::Result<()> {
        let (queue_ctx, mut payloads, final_index) = {
            let mut state = self.inner.state.lock().await;
            if state.completed {
                tracing::debug!("final reply after completion ignored");
                return Ok(());
            }
            state.final_replies += 1;
            state.attempted_final += 1;
            state.outstanding += 1;
            let mut combined: Vec<ReplyPayload> = state
                .buffered_blocks
                .drain(..)
                .map(ReplyPayload::text)
                .collect();
            combined.append(&mut payloads);
            (state.queue_ctx.clone(), combined, state.attempted_final)
        };

        if payloads.is_empty() {
            payloads.push(ReplyPayload::default());
        }

        let mut row_id = None;
        let delivery = queue_ctx.as_ref().map(|ctx| build_payload(ctx, payloads.clone()));

        if let (Some(ctx), Some(outbox), Some(delivery)) =
            (&queue_ctx, &self.inner.outbox, delivery.clone())
        {
            let idempotency_key = ctx
                .supports_idempotency_key
                .then(|| format!("{}:{final_index}", ctx.turn_id));
            match outbox
                .enqueue_delivery(NewDelivery {
                    turn_id: Some(ctx.turn_id.clone()),
                    payload: delivery,
                    idempotency_key,
                })
                .await
            {
                Ok(id) => row_id = Some(id),
                Err(error) => {
                    tracing::warn!(%error, turn_id = %ctx.turn_id, "failed to enqueue final reply");
                    let mut state = self.inner.state.lock().await;
                    state.enqueue_failures += 1;
                }
            }
        }

        if let Some(send) = self.inner.direct_send.clone() {
            let payload = delivery.unwrap_or_else(|| DeliveryPayload {
                payloads,
                ..DeliveryPayload::default()
            });
            match send(payload).await {
                Ok(receipt) => {
                    self.record_confirmed_send(&receipt).await;
                    if let (Some(id), Some(outbox)) = (&row_id, &self.inner.outbox)
                        && let Err(error) = outbox.ack_delivery(id).await
                    {
                        tracing::warn!(%error, delivery_id = %id, "failed to ack live delivery");
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "direct send failed");
                    if let (Some(id), Some(outbox)) = (&row_id, &self.inner.outbox)
                        && let Err(ack_error) = outbox.fail_delivery(id, &error.to_string()).await
                    {
                        tracing::warn!(%ack_error, delivery_id = %id, "failed to record delivery failure");
                    }
                }
            }
        }

        self.end_work().await;
        Ok(())
    }

    async fn record_confirmed_send(&self, receipt: &SendReceipt) {
        let mut state = self.inner.state.lock().await;
        state.confirmed_sends += 1;
        if let Some(message_id) = &receipt.message_id {
            tracing::debug!(message_id = %message_id, "final reply confirmed");
        }
    }

    async fn end_work(&self) {
        let mut state = self.inner.state.lock().await;
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.inner.idle.notify_one();
        }
    }

    /// Close the dispatcher to new emissions. Buffered block replies that
    /// never joined a final are flushed best-effort through the direct
    /// send.
    pub async fn mark_complete(&self) {
        let leftovers = {
            let mut state = self.inner.state.lock().await;
            if state.completed {
                return;
            }
            state.completed = true;
            std::mem::take(&mut state.buffered_blocks)
        };

        if leftovers.is_empty() {
            return;
        }
        if let Some(send) = self.inner.direct_send.clone() {
            let payload = {
                let state = self.inner.state.lock().await;
                state
                    .queue_ctx
                    .as_ref()
                    .map(|ctx| build_payload(ctx, vec![ReplyPayload::text(leftovers.join("\n"))]))
            };
            if let Some(payload) = payload
                && let Err(error) = send(payload).await
            {
                tracing::warn!(%error, "failed to flush buffered block replies");
            }
        }
    }

    /// Resolve once no outstanding work remains.
    pub async fn wait_for_idle(&self) {
        loop {
            {
                let state = self.inner.state.lock().await;
                if state.outstanding == 0 {
                    return;
                }
            }
            self.inner.idle.notified().await;
        }
    }

    /// Snapshot the emission counters.
    pub async fn counts(&self) -> DispatchCounts {
        let state = self.inner.state.lock().await;
        DispatchCounts {
            tool_results: state.tool_results,
            block_replies: state.block_replies,
            final_replies: state.final_replies,
            attempted_final: state.attempted_final,
            confirmed_sends: state.confirmed_sends,
            queued_final: state.attempted_final > 0 && state.enqueue_failures == 0,
        }
    }
}

enum EmissionKind {
    Tool,
    Block,
}

fn build_payload(ctx: &DeliveryQueueContext, payloads: Vec<ReplyPayload>) -> DeliveryPayload {
    DeliveryPayload {
        channel: ctx.channel.clone(),
        to: ctx.to.clone(),
        account_id: ctx.account_id.clone(),
        payloads,
        thread_id: ctx.thread_id.as_deref().map(|raw| {
            raw.parse::<i64>()
                .map(ThreadId::Int)
                .unwrap_or_else(|_| ThreadId::Text(raw.to_string()))
        }),
        reply_to_id: ctx.reply_to_id.clone(),
        ..DeliveryPayload::default()
    }
}
