use async_trait::async_trait;

use crate::error::{LedgerError, StoreError, TransportError};

/// Fire-and-forget delivery of raw bytes to a peer node.
///
/// Inbound traffic does not flow through this trait: the transport
/// implementation decodes its own framing and hands the engine
/// [`crate::InboundMessage`] values directly.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, receiver_address: &str, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// Ledger sync state and the node key directory.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// `true` once the local ledger node has caught up and accepts reads.
    fn is_ready(&self) -> bool;

    /// `true` while the local ledger node is replaying blocks.
    fn is_syncing(&self) -> bool;

    /// Ed25519 signing public key registered on the ledger for `node_id`.
    async fn node_public_key(&self, node_id: &str) -> Result<Vec<u8>, LedgerError>;
}

/// Crash-safe key/value persistence.
///
/// The store is the single source of truth across restarts; in-memory
/// state (timers, retry queues) is reconciled against it at startup and
/// never trusted alone. Expiry is the caller's concern — records that
/// need a TTL carry their deadline inside the value.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}
