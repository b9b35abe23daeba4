//! Background recovery workers (turn resume and outbox drain).

pub mod outbox;
pub mod turn;

pub use outbox::{OutboxWorker, OutboxWorkerReport};
pub use turn::{TurnWorker, TurnWorkerReport};
