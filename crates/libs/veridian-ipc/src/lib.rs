//! Boundary traits for the veridian node.
//!
//! This crate defines the contracts between the message-delivery core and
//! its external collaborators. It provides:
//!
//! - **Boundary types** crossing the transport and dispatch seams
//! - **Async trait definitions** for the collaborators the core consumes
//! - **`MemoryStore`** — an in-process [`DurableStore`] for tests and tooling
//! - **`AppError`** — the serializable application error that travels
//!   across process boundaries
//!
//! # Trait overview
//!
//! - [`Transport`] — fire-and-forget delivery of raw bytes to a peer node
//! - [`LedgerClient`] — ledger sync state and the node key directory
//! - [`DurableStore`] — crash-safe key/value persistence

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, LedgerError, StoreError, TransportError};
pub use traits::{DurableStore, LedgerClient, Transport};
pub use types::*;

mod stub;
pub use stub::MemoryStore;
