//! Master-dispatch router for the veridian orchestrator.
//!
//! One orchestrating process fans business-logic calls out to a pool of
//! worker processes over persistent bidirectional channels. Concurrent
//! calls are multiplexed by correlation id, control-plane state is
//! broadcast to every worker and replayed to late joiners, and workers
//! can ask the orchestrator to exercise orchestrator-only capabilities
//! (ledger calls, outbound callbacks, secure-queue sends) on their
//! behalf.
//!
//! - [`frames`] — wire frames and the transport-safe error shape
//! - [`catalog`] — callable functions grouped by role namespace
//! - [`control`] — last-value-wins control-plane state
//! - [`codec`] — length-prefixed msgpack framing over a stream
//! - [`server`] — listener, worker pool, and call routing

pub mod catalog;
pub mod codec;
pub mod control;
pub mod error;
pub mod frames;
pub mod server;

pub use catalog::FunctionCatalog;
pub use control::ControlState;
pub use error::DispatchError;
pub use frames::{MasterFrame, WireError, WorkerFrame};
pub use server::{DispatchConfig, DispatchServer, WorkerRequest};
