use serde::{Deserialize, Serialize};

/// A raw message handed to the engine by the transport layer.
///
/// `sender_id` and `message_id` come from the transport's own framing and
/// together form the deduplication key; `payload` is the opaque encrypted
/// envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender_id: String,
    pub message_id: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Delivery target for an outbound secure message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receiver {
    pub node_id: String,
    /// X25519 public key used for hybrid encryption, 32 bytes.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    /// Transport address understood by the [`crate::Transport`] impl.
    pub address: String,
}
