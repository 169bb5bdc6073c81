use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Serializable application error.
///
/// This is the one error shape allowed to cross a process boundary: the
/// dispatcher maps embedded errors into it before serializing call
/// arguments, and reconstructs it from a worker's error payload so the
/// original caller sees the original kind, code, and cause.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct AppError {
    pub code: u32,
    pub message: String,
    /// `true` when the root cause is a client mistake rather than a
    /// platform fault.
    #[serde(default)]
    pub client_caused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl AppError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            client_caused: false,
            details: None,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Errors from the raw byte transport.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("send to {address} failed: {reason}")]
    Send { address: String, reason: String },
}

/// Errors from the ledger client.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("node not found on ledger: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("ledger query failed: {reason}")]
    Query { reason: String },
}

/// Errors from the durable key/value store.
///
/// Store failures are recoverable by contract: callers log and surface
/// them, they never terminate the process.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("store i/o error: {reason}")]
    Io { reason: String },
}
