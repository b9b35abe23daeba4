//! Durable message lifecycle for a multi-channel conversational gateway.
//!
//! One embedded SQLite store braids four concerns into a single recoverable
//! model: inbound deduplication, a per-turn state machine, an outbound
//! retry/backoff queue, and continuous crash recovery. A host gateway
//! plugs in three seams — an inbound normalizer producing [`MsgContext`],
//! a reply generator, and per-channel outbound adapters — and gets
//! at-most-once-per-turn user-visible semantics with bounded at-least-once
//! delivery attempts.

pub mod adapters;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod outbox;
pub mod turns;
pub mod workers;

pub use adapters::{AdapterRegistry, ChannelAdapter, ChunkerMode, DeliveryMode, SendFn, SendReceipt};
pub use config::{Config, ConfigHandle, ExpireAction, UnconfirmedFinalAction};
pub use context::{CommandSource, MsgContext, RouteTarget, ThreadId};
pub use db::MessageDb;
pub use dispatcher::{DeliveryQueueContext, DispatchCounts, Dispatcher, DispatcherOptions};
pub use driver::{ActiveTurns, DispatchDriver, DispatchOutcome, ReplyResolver};
pub use error::{DbError, DispatchError, Error, Result};
pub use outbox::{
    DeliveryPayload, NewDelivery, OutboxCounts, OutboxRow, OutboxStatus, OutboxStore, PollPayload,
    ReplyPayload,
};
pub use turns::{Admission, HydratedTurn, TurnOutcome, TurnRow, TurnStatus, TurnStore};
pub use workers::{OutboxWorker, OutboxWorkerReport, TurnWorker, TurnWorkerReport};
