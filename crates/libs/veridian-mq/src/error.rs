use veridian_ipc::{LedgerError, StoreError};

/// Failure of the hybrid seal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    #[error("receiver key must be 32 bytes")]
    BadKey,

    #[error("ciphertext too short")]
    Truncated,

    #[error("symmetric key unwrap failed")]
    Unwrap,

    #[error("payload decryption failed")]
    Payload,

    #[error("payload encryption failed")]
    Encrypt,
}

/// Message-queue pipeline errors.
///
/// These stay local to the engine: receive-side failures are reported on
/// the engine's event stream and never thrown across its boundary.
/// Duplicates are not represented here — they are dropped silently.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MqError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("cannot decrypt message: {0}")]
    Decrypt(#[from] SealError),

    #[error("invalid message signature")]
    InvalidSignature,

    #[error("message carries no known sender identity")]
    UnknownSender,

    #[error("cannot encode message: {0}")]
    Encode(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
