//! Secure message queue for the veridian node.
//!
//! Delivers end-to-end encrypted, signed messages between platform nodes
//! with at-least-once transport semantics reconciled down to at-most-once
//! local effects: every raw message is persisted before processing,
//! duplicate ids are suppressed inside a TTL window, and processing is
//! gated on ledger readiness without losing messages.
//!
//! - [`codec`] — binary framing for signed and hybrid-encrypted envelopes
//! - [`seal`] — per-receiver hybrid encryption
//! - [`dedup`] — durable duplicate-suppression records with expiry timers
//! - [`engine`] — the receive/send pipelines and backlog replay

pub mod codec;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod seal;

pub use engine::{MqEngine, MqEngineConfig, MqEvent};
pub use error::{MqError, SealError};
