//! Canonical inbound message context.
//!
//! Channel producers normalize provider wire formats into [`MsgContext`]
//! before admission. The struct is also the durable turn payload: it is
//! serialized into `message_turns.payload` at admission and hydrated back
//! on resume. Hydration tolerates the legacy lower-camelCase key spellings
//! that older gateway versions persisted.

use serde::{Deserialize, Serialize};

/// Non-printable separator for dedupe-key segments, so channel-provided
/// strings cannot collide across segment boundaries.
const DEDUPE_SEPARATOR: char = '\u{1f}';

/// Where a command-style turn originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    /// Parsed out of ordinary message text.
    Text,
    /// A provider-native interaction (slash command, button) whose reply
    /// callback token is one-shot and cannot survive recovery.
    Native,
}

/// Thread identifier as providers send it: numeric or string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThreadId {
    Int(i64),
    Text(String),
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadId::Int(value) => write!(f, "{value}"),
            ThreadId::Text(value) => f.write_str(value),
        }
    }
}

/// Reply destination captured at turn admission, so recovery never has to
/// re-derive where a reply belongs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub channel: String,
    pub to: String,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
    pub reply_to_id: Option<String>,
}

/// Canonical inbound message context.
///
/// Serializes with the canonical PascalCase keys; deserialization accepts
/// both the canonical spelling and the legacy lower-camelCase one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MsgContext {
    #[serde(alias = "body", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(alias = "bodyForAgent", skip_serializing_if = "Option::is_none")]
    pub body_for_agent: Option<String>,
    #[serde(alias = "bodyForCommands", skip_serializing_if = "Option::is_none")]
    pub body_for_commands: Option<String>,
    #[serde(alias = "from", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(alias = "to", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(alias = "originatingChannel", skip_serializing_if = "Option::is_none")]
    pub originating_channel: Option<String>,
    #[serde(alias = "originatingTo", skip_serializing_if = "Option::is_none")]
    pub originating_to: Option<String>,
    #[serde(alias = "sessionKey", skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(alias = "accountId", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(alias = "messageSid", skip_serializing_if = "Option::is_none")]
    pub message_sid: Option<String>,
    #[serde(alias = "messageSidFull", skip_serializing_if = "Option::is_none")]
    pub message_sid_full: Option<String>,
    #[serde(alias = "replyToId", skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(alias = "chatType", skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    #[serde(alias = "provider", skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(alias = "surface", skip_serializing_if = "Option::is_none")]
    pub surface: Option<String>,
    #[serde(alias = "senderId", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(alias = "senderName", skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(alias = "senderUsername", skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(alias = "senderE164", skip_serializing_if = "Option::is_none")]
    pub sender_e164: Option<String>,
    #[serde(alias = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(alias = "commandSource", skip_serializing_if = "Option::is_none")]
    pub command_source: Option<CommandSource>,
    #[serde(alias = "timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(alias = "commandAuthorized")]
    pub command_authorized: bool,
    #[serde(alias = "wasMentioned")]
    pub was_mentioned: bool,
    #[serde(alias = "isForum")]
    pub is_forum: bool,
    /// Set by the inbound normalizer for liveness-probe turns, which must
    /// never be admitted to the journal.
    #[serde(alias = "isHeartbeat")]
    pub is_heartbeat: bool,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn cleaned(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl MsgContext {
    /// Normalize the context: trim every string field, drop empties, and
    /// default the derived bodies to `Body`.
    pub fn normalized(mut self) -> Self {
        self.body = cleaned(self.body);
        self.body_for_agent = cleaned(self.body_for_agent).or_else(|| self.body.clone());
        self.body_for_commands = cleaned(self.body_for_commands).or_else(|| self.body.clone());
        self.from = cleaned(self.from);
        self.to = cleaned(self.to);
        self.originating_channel = cleaned(self.originating_channel);
        self.originating_to = cleaned(self.originating_to);
        self.session_key = cleaned(self.session_key);
        self.account_id = cleaned(self.account_id);
        self.message_sid = cleaned(self.message_sid);
        self.message_sid_full = cleaned(self.message_sid_full);
        self.reply_to_id = cleaned(self.reply_to_id);
        self.chat_type = cleaned(self.chat_type);
        self.provider = cleaned(self.provider);
        self.surface = cleaned(self.surface);
        self.sender_id = cleaned(self.sender_id);
        self.sender_name = cleaned(self.sender_name);
        self.sender_username = cleaned(self.sender_username);
        self.sender_e164 = cleaned(self.sender_e164);
        self
    }

    /// Normalized provider identity: `OriginatingChannel` ∨ `Provider` ∨
    /// `Surface`, trimmed and lowercased.
    pub fn provider_key(&self) -> Option<String> {
        non_empty(self.originating_channel.as_ref())
            .or_else(|| non_empty(self.provider.as_ref()))
            .or_else(|| non_empty(self.surface.as_ref()))
            .map(str::to_lowercase)
    }

    /// Resolved peer for dedupe purposes: `OriginatingTo` ∨ `To` ∨ `From`
    /// ∨ `SessionKey`.
    pub fn resolved_peer(&self) -> Option<&str> {
        non_empty(self.originating_to.as_ref())
            .or_else(|| non_empty(self.to.as_ref()))
            .or_else(|| non_empty(self.from.as_ref()))
            .or_else(|| non_empty(self.session_key.as_ref()))
    }

    /// Thread id stringified for key and route columns.
    pub fn thread_id_string(&self) -> Option<String> {
        self.thread_id.as_ref().map(ThreadId::to_string)
    }

    /// Deterministic dedupe key, or `None` when the message cannot be
    /// deduplicated (no provider identity or no `MessageSid`).
    pub fn dedupe_key(&self) -> Option<String> {
        let provider = self.provider_key()?;
        let sid = non_empty(self.message_sid.as_ref())?;

        let thread_id_string = self.thread_id_string();
        let segments = [
            provider.as_str(),
            non_empty(self.account_id.as_ref()).unwrap_or(""),
            non_empty(self.session_key.as_ref()).unwrap_or(""),
            self.resolved_peer().unwrap_or(""),
            thread_id_string.as_deref().unwrap_or(""),
            sid,
        ];
        let mut key = String::new();
        for (index, segment) in segments.iter().enumerate() {
            if index > 0 {
                key.push(DEDUPE_SEPARATOR);
            }
            key.push_str(segment);
        }
        Some(key)
    }

    /// Reply destination channel, same resolution chain as
    /// [`MsgContext::provider_key`].
    pub fn route_channel(&self) -> Option<String> {
        self.provider_key()
    }

    /// Reply destination peer: `OriginatingTo` ∨ `To` ∨ `From`.
    pub fn route_to(&self) -> Option<&str> {
        non_empty(self.originating_to.as_ref())
            .or_else(|| non_empty(self.to.as_ref()))
            .or_else(|| non_empty(self.from.as_ref()))
    }

    /// Full route target, when both channel and peer are known.
    pub fn route_target(&self) -> Option<RouteTarget> {
        let channel = self.route_channel()?;
        let to = self.route_to()?.to_string();
        Some(RouteTarget {
            channel,
            to,
            account_id: non_empty(self.account_id.as_ref()).map(str::to_string),
            thread_id: self.thread_id_string(),
            reply_to_id: non_empty(self.reply_to_id.as_ref()).map(str::to_string),
        })
    }

    /// Whether the turn came from a provider-native interaction whose
    /// reply callback cannot be replayed to a fallback destination.
    pub fn is_interaction_scoped(&self) -> bool {
        self.command_source == Some(CommandSource::Native)
    }
}
