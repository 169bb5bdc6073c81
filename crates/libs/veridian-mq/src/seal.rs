//! Per-receiver hybrid encryption.
//!
//! Each sealed envelope uses a fresh 32-byte AES-256-GCM payload key. The
//! payload key is wrapped for the receiver under a key derived from an
//! ephemeral X25519 agreement (HKDF-SHA256), so the same signed payload
//! sealed twice never produces the same ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde_bytes::ByteBuf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::codec::EncryptedEnvelope;
use crate::error::SealError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const PUBLIC_KEY_LEN: usize = 32;
const WRAP_INFO: &[u8] = b"veridian-mq key wrap v1";

/// Seals `envelope_bytes` for one receiver.
///
/// `receiver_public_key` is the receiver's 32-byte X25519 public key as
/// registered on the ledger.
pub fn encrypt_for_receiver(
    receiver_public_key: &[u8],
    envelope_bytes: &[u8],
) -> Result<EncryptedEnvelope, SealError> {
    let key_bytes: [u8; PUBLIC_KEY_LEN] =
        receiver_public_key.try_into().map_err(|_| SealError::BadKey)?;
    let receiver_key = PublicKey::from(key_bytes);

    let mut payload_key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut payload_key);
    let mut payload_nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut payload_nonce);

    let payload_cipher =
        Aes256Gcm::new_from_slice(&payload_key).map_err(|_| SealError::Encrypt)?;
    let ciphertext = payload_cipher
        .encrypt(Nonce::from_slice(&payload_nonce), envelope_bytes)
        .map_err(|_| SealError::Encrypt)?;
    let mut encrypted_payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    encrypted_payload.extend_from_slice(&payload_nonce);
    encrypted_payload.extend_from_slice(&ciphertext);

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&receiver_key);
    let wrap_key = derive_wrap_key(shared.as_bytes())?;

    let wrap_cipher = Aes256Gcm::new_from_slice(&wrap_key).map_err(|_| SealError::Encrypt)?;
    let mut wrap_nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut wrap_nonce);
    let wrapped_key = wrap_cipher
        .encrypt(Nonce::from_slice(&wrap_nonce), payload_key.as_slice())
        .map_err(|_| SealError::Encrypt)?;

    let mut encrypted_symmetric_key =
        Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN + wrapped_key.len());
    encrypted_symmetric_key.extend_from_slice(ephemeral_public.as_bytes());
    encrypted_symmetric_key.extend_from_slice(&wrap_nonce);
    encrypted_symmetric_key.extend_from_slice(&wrapped_key);

    Ok(EncryptedEnvelope {
        encrypted_symmetric_key: ByteBuf::from(encrypted_symmetric_key),
        encrypted_payload: ByteBuf::from(encrypted_payload),
    })
}

/// Reverses [`encrypt_for_receiver`] with the node's own private key.
pub fn decrypt_with_own_key(
    private_key: &StaticSecret,
    encrypted: &EncryptedEnvelope,
) -> Result<Vec<u8>, SealError> {
    let key_blob = encrypted.encrypted_symmetric_key.as_slice();
    if key_blob.len() <= PUBLIC_KEY_LEN + NONCE_LEN {
        return Err(SealError::Truncated);
    }
    let mut ephemeral_bytes = [0u8; PUBLIC_KEY_LEN];
    ephemeral_bytes.copy_from_slice(&key_blob[..PUBLIC_KEY_LEN]);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);
    let wrap_nonce = &key_blob[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + NONCE_LEN];
    let wrapped_key = &key_blob[PUBLIC_KEY_LEN + NONCE_LEN..];

    let shared = private_key.diffie_hellman(&ephemeral_public);
    let wrap_key = derive_wrap_key(shared.as_bytes())?;
    let wrap_cipher = Aes256Gcm::new_from_slice(&wrap_key).map_err(|_| SealError::Unwrap)?;
    let payload_key = wrap_cipher
        .decrypt(Nonce::from_slice(wrap_nonce), wrapped_key)
        .map_err(|_| SealError::Unwrap)?;

    let payload = encrypted.encrypted_payload.as_slice();
    if payload.len() <= NONCE_LEN {
        return Err(SealError::Truncated);
    }
    let payload_cipher =
        Aes256Gcm::new_from_slice(&payload_key).map_err(|_| SealError::Unwrap)?;
    payload_cipher
        .decrypt(Nonce::from_slice(&payload[..NONCE_LEN]), &payload[NONCE_LEN..])
        .map_err(|_| SealError::Payload)
}

fn derive_wrap_key(shared_secret: &[u8]) -> Result<[u8; KEY_LEN], SealError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut wrap_key = [0u8; KEY_LEN];
    hkdf.expand(WRAP_INFO, &mut wrap_key).map_err(|_| SealError::Unwrap)?;
    Ok(wrap_key)
}
