//! Outbound adapter contract and registry.
//!
//! Each channel plugs in a [`ChannelAdapter`]: delivery metadata plus one of
//! three emission shapes — the current `send_final`, or one of the legacy
//! pair (`send_payload`, or split `send_text`/`send_media`). Legacy shapes
//! are normalized behind the same `send_final` surface, choosing the media
//! path when any media URL is set, with a one-time runtime warning per
//! channel on first use.

use crate::error::DispatchError;
use crate::outbox::{DeliveryPayload, ReplyPayload};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, RwLock};

/// Result of a completed send.
#[derive(Debug, Clone, Default)]
pub struct SendReceipt {
    /// Provider message id of the (first) sent message, when known.
    pub message_id: Option<String>,
}

/// Dyn-safe async send closure shared by adapters, the dispatcher's direct
/// path, and the outbox-worker's deliver seam.
pub type SendFn =
    Arc<dyn Fn(DeliveryPayload) -> BoxFuture<'static, anyhow::Result<SendReceipt>> + Send + Sync>;

/// Target-string normalization hook.
pub type ResolveTargetFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// How replies reach the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The adapter talks to the provider API directly.
    Direct,
    /// Replies are relayed through an upstream gateway process.
    Gateway,
}

/// How oversized text payloads are split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkerMode {
    /// Hard split at the character limit.
    Length,
    /// Prefer breaking at the last newline inside the window.
    Paragraph,
}

enum AdapterEmission {
    /// v2 contract.
    Final(SendFn),
    /// Legacy single-shot payload sender.
    LegacyPayload(SendFn),
    /// Legacy split pair.
    LegacyTextMedia { text: SendFn, media: SendFn },
}

static WARNED_LEGACY_CHANNELS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

fn warn_legacy_once(channel: &str) {
    let mut warned = WARNED_LEGACY_CHANNELS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if warned.insert(channel.to_string()) {
        tracing::warn!(
            channel = %channel,
            "channel uses the legacy outbound emission shape; migrate it to send_final"
        );
    }
}

/// One channel's outbound surface.
pub struct ChannelAdapter {
    channel: String,
    pub delivery_mode: DeliveryMode,
    pub chunker_mode: ChunkerMode,
    /// Per-message character limit applied to text payloads in direct mode.
    pub text_chunk_limit: usize,
    pub poll_max_options: Option<usize>,
    /// Enables the durable idempotency key on outbox rows for this channel.
    pub supports_idempotency_key: bool,
    emission: AdapterEmission,
    resolve_target: Option<ResolveTargetFn>,
}

impl ChannelAdapter {
    fn with_emission(channel: impl Into<String>, emission: AdapterEmission) -> Self {
        Self {
            channel: channel.into(),
            delivery_mode: DeliveryMode::Direct,
            chunker_mode: ChunkerMode::Length,
            text_chunk_limit: 4096,
            poll_max_options: None,
            supports_idempotency_key: false,
            emission,
            resolve_target: None,
        }
    }

    /// A current-contract adapter.
    pub fn v2(channel: impl Into<String>, send_final: SendFn) -> Self {
        Self::with_emission(channel, AdapterEmission::Final(send_final))
    }

    /// A legacy adapter exposing a single payload sender.
    pub fn v1_payload(channel: impl Into<String>, send_payload: SendFn) -> Self {
        Self::with_emission(channel, AdapterEmission::LegacyPayload(send_payload))
    }

    /// A legacy adapter exposing a text/media sender pair.
    pub fn v1_split(channel: impl Into<String>, send_text: SendFn, send_media: SendFn) -> Self {
        Self::with_emission(
            channel,
            AdapterEmission::LegacyTextMedia {
                text: send_text,
                media: send_media,
            },
        )
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_chunker_mode(mut self, mode: ChunkerMode) -> Self {
        self.chunker_mode = mode;
        self
    }

    pub fn with_text_chunk_limit(mut self, limit: usize) -> Self {
        self.text_chunk_limit = limit;
        self
    }

    pub fn with_poll_max_options(mut self, max: usize) -> Self {
        self.poll_max_options = Some(max);
        self
    }

    pub fn with_idempotency_support(mut self) -> Self {
        self.supports_idempotency_key = true;
        self
    }

    pub fn with_resolve_target(mut self, resolve: ResolveTargetFn) -> Self {
        self.resolve_target = Some(resolve);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_legacy(&self) -> bool {
        !matches!(self.emission, AdapterEmission::Final(_))
    }

    /// Normalize a raw target string for this channel.
    pub fn resolve_target(&self, raw: &str) -> String {
        match &self.resolve_target {
            Some(resolve) => resolve(raw),
            None => raw.to_string(),
        }
    }

    /// Emit a final payload through whichever shape the channel supplies.
    pub async fn send_final(&self, delivery: DeliveryPayload) -> anyhow::Result<SendReceipt> {
        match &self.emission {
            AdapterEmission::Final(send) => send(delivery).await,
            AdapterEmission::LegacyPayload(send) => {
                warn_legacy_once(&self.channel);
                send(delivery).await
            }
            AdapterEmission::LegacyTextMedia { text, media } => {
                warn_legacy_once(&self.channel);
                let has_media = delivery.payloads.iter().any(ReplyPayload::has_media);
                if has_media {
                    media(delivery).await
                } else {
                    text(delivery).await
                }
            }
        }
    }
}

impl std::fmt::Debug for ChannelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAdapter")
            .field("channel", &self.channel)
            .field("delivery_mode", &self.delivery_mode)
            .field("legacy", &self.is_legacy())
            .finish()
    }
}

/// Split text into chunks of at most `limit` characters.
pub fn chunk_text(text: &str, limit: usize, mode: ChunkerMode) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let window_end = rest
            .char_indices()
            .nth(limit)
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        if window_end == rest.len() {
            chunks.push(rest.to_string());
            break;
        }

        let split_at = match mode {
            ChunkerMode::Length => window_end,
            ChunkerMode::Paragraph => match rest[..window_end].rfind('\n') {
                Some(newline) if newline > 0 => newline,
                _ => window_end,
            },
        };
        chunks.push(rest[..split_at].trim_end_matches('\n').to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    chunks.retain(|chunk| !chunk.is_empty());
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// Channel → adapter lookup shared by the workers and the dispatcher's
/// direct-send seam.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<String, Arc<ChannelAdapter>>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: ChannelAdapter) {
        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        adapters.insert(adapter.channel().to_string(), Arc::new(adapter));
    }

    pub fn get(&self, channel: &str) -> Option<Arc<ChannelAdapter>> {
        let adapters = self.adapters.read().unwrap_or_else(|e| e.into_inner());
        adapters.get(channel).cloned()
    }

    /// Whether the channel's adapter wants durable idempotency keys.
    pub fn supports_idempotency_key(&self, channel: &str) -> bool {
        self.get(channel)
            .is_some_and(|adapter| adapter.supports_idempotency_key)
    }

    /// Deliver one payload: resolve the target, clamp polls, chunk
    /// oversized text for direct-mode channels, and emit.
    pub async fn deliver(&self, payload: DeliveryPayload) -> anyhow::Result<SendReceipt> {
        let adapter = self.get(&payload.channel).ok_or_else(|| {
            anyhow::Error::from(DispatchError::ChannelNotConfigured {
                channel: payload.channel.clone(),
            })
        })?;

        let mut payload = payload;
        payload.to = adapter.resolve_target(&payload.to);

        if let Some(max_options) = adapter.poll_max_options {
            for reply in &mut payload.payloads {
                if let Some(poll) = &mut reply.poll
                    && poll.options.len() > max_options
                {
                    tracing::warn!(
                        channel = %payload.channel,
                        options = poll.options.len(),
                        max_options,
                        "truncating poll options to the channel limit"
                    );
                    poll.options.truncate(max_options);
                }
            }
        }

        if adapter.delivery_mode == DeliveryMode::Direct {
            payload.payloads = payload
                .payloads
                .into_iter()
                .flat_map(|reply| {
                    match &reply.text {
                        Some(text) if !reply.has_media() && reply.poll.is_none() => {
                            chunk_text(text, adapter.text_chunk_limit, adapter.chunker_mode)
                                .into_iter()
                                .map(|chunk| ReplyPayload {
                                    text: Some(chunk),
                                    reply_to_id: reply.reply_to_id.clone(),
                                    ..ReplyPayload::default()
                                })
                                .collect::<Vec<_>>()
                        }
                        _ => vec![reply],
                    }
                })
                .collect();
        }

        adapter.send_final(payload).await
    }

    /// The registry as a plain send closure for worker deliver seams.
    pub fn send_fn(&self) -> SendFn {
        let registry = self.clone();
        Arc::new(move |payload| {
            let registry = registry.clone();
            Box::pin(async move { registry.deliver(payload).await })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::PollPayload;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_send(counter: Arc<AtomicU32>) -> SendFn {
        Arc::new(move |_payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(SendReceipt::default()) })
        })
    }

    #[test]
    fn chunk_text_splits_on_char_boundaries() {
        let chunks = chunk_text("abc→def", 4, ChunkerMode::Length);
        assert_eq!(chunks, vec!["abc→", "def"]);

        let whole = chunk_text("short", 100, ChunkerMode::Length);
        assert_eq!(whole, vec!["short"]);
    }

    #[test]
    fn paragraph_chunker_prefers_newlines() {
        let chunks = chunk_text("first line\nsecond line", 15, ChunkerMode::Paragraph);
        assert_eq!(chunks, vec!["first line", "second line"]);

        // No newline inside the window falls back to a hard split.
        let hard = chunk_text("abcdefghij", 4, ChunkerMode::Paragraph);
        assert_eq!(hard, vec!["abcd", "efgh", "ij"]);
    }

    #[tokio::test]
    async fn legacy_split_adapter_routes_media_payloads() {
        let text_sends = Arc::new(AtomicU32::new(0));
        let media_sends = Arc::new(AtomicU32::new(0));
        let adapter = ChannelAdapter::v1_split(
            "signal",
            counting_send(text_sends.clone()),
            counting_send(media_sends.clone()),
        );

        adapter
            .send_final(DeliveryPayload {
                channel: "signal".into(),
                to: "+1555".into(),
                payloads: vec![ReplyPayload::text("plain")],
                ..DeliveryPayload::default()
            })
            .await
            .expect("text send should succeed");
        assert_eq!(text_sends.load(Ordering::SeqCst), 1);
        assert_eq!(media_sends.load(Ordering::SeqCst), 0);

        adapter
            .send_final(DeliveryPayload {
                channel: "signal".into(),
                to: "+1555".into(),
                payloads: vec![ReplyPayload {
                    media_url: Some("https://example.com/cat.png".into()),
                    ..ReplyPayload::default()
                }],
                ..DeliveryPayload::default()
            })
            .await
            .expect("media send should succeed");
        assert_eq!(media_sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_channel_is_a_permanent_delivery_error() {
        let registry = AdapterRegistry::new();
        let error = registry
            .deliver(DeliveryPayload {
                channel: "signal".into(),
                to: "+1555".into(),
                payloads: vec![ReplyPayload::text("hi")],
                ..DeliveryPayload::default()
            })
            .await
            .expect_err("missing adapter must fail");

        assert!(crate::outbox::is_permanent_delivery_error(&error.to_string()));
    }

    #[tokio::test]
    async fn registry_resolves_targets_and_clamps_polls() {
        let seen: Arc<std::sync::Mutex<Vec<DeliveryPayload>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let send: SendFn = Arc::new(move |payload| {
            sink.lock().expect("sink lock").push(payload);
            Box::pin(async move { Ok(SendReceipt::default()) })
        });

        let registry = AdapterRegistry::new();
        registry.register(
            ChannelAdapter::v2("telegram", send)
                .with_poll_max_options(2)
                .with_resolve_target(Arc::new(|raw| format!("chat:{raw}"))),
        );

        registry
            .deliver(DeliveryPayload {
                channel: "telegram".into(),
                to: "42".into(),
                payloads: vec![ReplyPayload {
                    poll: Some(PollPayload {
                        question: "pick".into(),
                        options: vec!["a".into(), "b".into(), "c".into()],
                    }),
                    ..ReplyPayload::default()
                }],
                ..DeliveryPayload::default()
            })
            .await
            .expect("deliver should succeed");

        let sent = seen.lock().expect("sink lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "chat:42");
        let poll = sent[0].payloads[0].poll.as_ref().expect("poll survives");
        assert_eq!(poll.options, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn direct_mode_chunks_oversized_text() {
        let seen: Arc<std::sync::Mutex<Vec<DeliveryPayload>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let send: SendFn = Arc::new(move |payload| {
            sink.lock().expect("sink lock").push(payload);
            Box::pin(async move { Ok(SendReceipt::default()) })
        });

        let registry = AdapterRegistry::new();
        registry.register(ChannelAdapter::v2("telegram", send).with_text_chunk_limit(4));

        registry
            .deliver(DeliveryPayload {
                channel: "telegram".into(),
                to: "chat-1".into(),
                payloads: vec![ReplyPayload::text("abcdefgh")],
                ..DeliveryPayload::default()
            })
            .await
            .expect("deliver should succeed");

        let sent = seen.lock().expect("sink lock");
        let texts: Vec<_> = sent[0]
            .payloads
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        assert_eq!(texts, vec!["abcd", "efgh"]);
    }
}
