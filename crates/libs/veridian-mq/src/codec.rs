//! Binary framing for signed and hybrid-encrypted message envelopes.
//!
//! Envelopes are msgpack maps so that a missing field is distinguishable
//! from an empty one; decoding goes through `rmpv::Value` and treats an
//! absent or nil field as `MALFORMED_MESSAGE`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::MqError;

/// Inner signed unit: the structured message text plus its signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message: String,
    pub signature: ByteBuf,
}

/// Outer transport unit, one per receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted_symmetric_key: ByteBuf,
    pub encrypted_payload: ByteBuf,
}

/// Signs `message` and wraps it into an envelope.
pub fn sign_envelope(message: String, signing_key: &SigningKey) -> MessageEnvelope {
    let signature = signing_key.sign(message.as_bytes());
    MessageEnvelope {
        message,
        signature: ByteBuf::from(signature.to_bytes().to_vec()),
    }
}

/// Verifies an envelope's signature against the sender's public key.
pub fn verify_envelope(envelope: &MessageEnvelope, verifying_key: &VerifyingKey) -> bool {
    let Ok(signature) = Signature::from_slice(&envelope.signature) else {
        return false;
    };
    verifying_key.verify(envelope.message.as_bytes(), &signature).is_ok()
}

impl MessageEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MqError> {
        rmp_serde::to_vec_named(self).map_err(|err| MqError::Encode(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MqError> {
        let entries = decode_map(bytes)?;
        let mut message = None;
        let mut signature = None;
        for (key, value) in entries {
            match key.as_str() {
                Some("message") => message = value_to_string(value),
                Some("signature") => signature = value_to_bytes(value),
                _ => {}
            }
        }
        let message = message.ok_or_else(|| MqError::Malformed("missing message".into()))?;
        let signature = signature.ok_or_else(|| MqError::Malformed("missing signature".into()))?;
        Ok(Self { message, signature: ByteBuf::from(signature) })
    }
}

impl EncryptedEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MqError> {
        rmp_serde::to_vec_named(self).map_err(|err| MqError::Encode(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MqError> {
        let entries = decode_map(bytes)?;
        let mut encrypted_symmetric_key = None;
        let mut encrypted_payload = None;
        for (key, value) in entries {
            match key.as_str() {
                Some("encrypted_symmetric_key") => encrypted_symmetric_key = value_to_bytes(value),
                Some("encrypted_payload") => encrypted_payload = value_to_bytes(value),
                _ => {}
            }
        }
        let encrypted_symmetric_key = encrypted_symmetric_key
            .ok_or_else(|| MqError::Malformed("missing encrypted symmetric key".into()))?;
        let encrypted_payload = encrypted_payload
            .ok_or_else(|| MqError::Malformed("missing encrypted payload".into()))?;
        Ok(Self {
            encrypted_symmetric_key: ByteBuf::from(encrypted_symmetric_key),
            encrypted_payload: ByteBuf::from(encrypted_payload),
        })
    }
}

fn decode_map(bytes: &[u8]) -> Result<Vec<(rmpv::Value, rmpv::Value)>, MqError> {
    let value = rmp_serde::from_slice::<rmpv::Value>(bytes)
        .map_err(|err| MqError::Malformed(err.to_string()))?;
    let rmpv::Value::Map(entries) = value else {
        return Err(MqError::Malformed("envelope is not a map".into()));
    };
    Ok(entries)
}

fn value_to_string(value: rmpv::Value) -> Option<String> {
    match value {
        rmpv::Value::String(text) => text.into_str(),
        _ => None,
    }
}

fn value_to_bytes(value: rmpv::Value) -> Option<Vec<u8>> {
    match value {
        rmpv::Value::Binary(bytes) => Some(bytes),
        _ => None,
    }
}
