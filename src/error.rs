//! Crate-wide error types.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error for lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Db(DbError::Query(error))
    }
}

/// Durable-store failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to open message-lifecycle store: {0}")]
    Open(#[source] sqlx::Error),

    #[error("failed to prepare state directory: {0}")]
    StateDir(#[source] std::io::Error),

    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

/// Dispatch-path failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The route target could not be reconstructed for a persisted turn.
    #[error("turn {turn_id} has no reconstructable route target")]
    MissingRoute { turn_id: String },

    /// No outbound adapter is registered for the payload's channel. The
    /// message text doubles as a permanent-failure marker for the outbox.
    #[error("outbound not configured for channel {channel}")]
    ChannelNotConfigured { channel: String },

    /// The serialized turn payload could not be parsed back into a context.
    #[error("invalid turn payload for turn {turn_id}")]
    InvalidTurnPayload { turn_id: String },

    /// The reply generator failed. Recorded as a turn recovery failure
    /// before being re-raised to the inbound producer.
    #[error("reply generation failed: {0}")]
    ReplyGenerator(#[source] anyhow::Error),
}
