//! Configuration surface for the lifecycle core.
//!
//! Hosts embed the crate and hand workers an [`ConfigHandle`] (an
//! `ArcSwap`), so cadences and delivery options can be hot-swapped without
//! restarting the loops. Keys follow the gateway's camelCase convention.

use anyhow::Context as _;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Shared, hot-swappable configuration handle.
pub type ConfigHandle = Arc<ArcSwap<Config>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub messages: MessagesConfig,
    pub session: SessionConfig,
    /// Outbox-worker loop period in milliseconds.
    pub outbox_interval_ms: u64,
    /// Turn-worker loop period in milliseconds.
    pub turn_interval_ms: u64,
    /// Upper bound on turns resumed per turn-worker pass.
    pub max_turns_per_pass: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            messages: MessagesConfig::default(),
            session: SessionConfig::default(),
            outbox_interval_ms: 1_000,
            turn_interval_ms: 1_200,
            max_turns_per_pass: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessagesConfig {
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// Outbox TTL window in milliseconds.
    pub max_age_ms: i64,
    /// What to do with a row that outlives the TTL window.
    pub expire_action: ExpireAction,
    /// How to finalize a turn whose final reply queued but produced no
    /// confirmed send.
    pub unconfirmed_final_action: UnconfirmedFinalAction,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 30 * 60 * 1_000,
            expire_action: ExpireAction::Fail,
            unconfirmed_final_action: UnconfirmedFinalAction::RecoveryFailure,
        }
    }
}

/// TTL expiry behavior for overdue outbox rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireAction {
    /// Mark the row `expired` without attempting delivery.
    #[default]
    Fail,
    /// Attempt one final delivery, then terminalize either way.
    Deliver,
}

/// Finalization policy for `attempted_final && queued_final` turns with zero
/// confirmed sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnconfirmedFinalAction {
    /// Record a turn recovery failure so the turn-worker retries the turn.
    #[default]
    RecoveryFailure,
    /// Trust the queued outbox row and finalize the turn as delivered.
    Deliver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Session entry location template. May contain `{agentId}`.
    pub store: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: "sessions/{agentId}".to_string(),
        }
    }
}

impl SessionConfig {
    /// Resolve the session store template for a concrete agent.
    pub fn store_path(&self, agent_id: &str) -> String {
        self.store.replace("{agentId}", agent_id)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Wrap the config in a hot-swappable handle for the workers.
    pub fn into_handle(self) -> ConfigHandle {
        Arc::new(ArcSwap::from_pointee(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_worker_cadences() {
        let config = Config::default();
        assert_eq!(config.outbox_interval_ms, 1_000);
        assert_eq!(config.turn_interval_ms, 1_200);
        assert_eq!(config.max_turns_per_pass, 16);
        assert_eq!(config.messages.delivery.max_age_ms, 30 * 60 * 1_000);
        assert_eq!(config.messages.delivery.expire_action, ExpireAction::Fail);
    }

    #[test]
    fn camel_case_keys_parse() {
        let config: Config = toml::from_str(
            r#"
            outboxIntervalMs = 250
            turnIntervalMs = 300
            maxTurnsPerPass = 4

            [messages.delivery]
            maxAgeMs = 60000
            expireAction = "deliver"
            unconfirmedFinalAction = "deliver"

            [session]
            store = "state/{agentId}/sessions"
            "#,
        )
        .expect("camelCase config should parse");

        assert_eq!(config.outbox_interval_ms, 250);
        assert_eq!(config.messages.delivery.max_age_ms, 60_000);
        assert_eq!(
            config.messages.delivery.expire_action,
            ExpireAction::Deliver
        );
        assert_eq!(
            config.messages.delivery.unconfirmed_final_action,
            UnconfirmedFinalAction::Deliver
        );
        assert_eq!(config.session.store_path("kit"), "state/kit/sessions");
    }
}
