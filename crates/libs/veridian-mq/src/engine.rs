//! Receive and send pipelines for the secure message queue.
//!
//! Receive: `dedup -> persist raw -> ledger gate -> decode -> decrypt ->
//! verify -> emit -> cleanup`. Every raw message is durably persisted
//! before any processing attempt and removed only at a terminal outcome,
//! success or failure alike, so a crash-time replay cannot apply effects
//! twice.
//!
//! Send: sign once, then seal and deliver an independent encrypted copy
//! per receiver; one receiver's transport failure never aborts delivery
//! to the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use x25519_dalek::StaticSecret;

use veridian_ipc::{DurableStore, InboundMessage, LedgerClient, Receiver, Transport};

use crate::codec::{self, EncryptedEnvelope, MessageEnvelope};
use crate::dedup::{DedupOutcome, DedupRegistry, DEFAULT_DEDUP_TTL};
use crate::error::MqError;
use crate::seal;

const RAW_PREFIX: &str = "raw:";
const EVENT_CAPACITY: usize = 64;

/// Domain events emitted by the engine.
///
/// Receive-side failures surface here and nowhere else; duplicates emit
/// nothing at all.
#[derive(Debug, Clone)]
pub enum MqEvent {
    /// A verified message body, ready for business logic.
    Message(String),
    /// A terminal receive-side failure. Cleanup has already run.
    Error(MqError),
}

#[derive(Debug, Clone)]
pub struct MqEngineConfig {
    pub dedup_ttl: Duration,
}

impl Default for MqEngineConfig {
    fn default() -> Self {
        Self { dedup_ttl: DEFAULT_DEDUP_TTL }
    }
}

pub struct MqEngine {
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn DurableStore>,
    signing_key: SigningKey,
    decrypt_key: StaticSecret,
    dedup: DedupRegistry,
    /// Raw messages buffered while the ledger is not ready, keyed by the
    /// generated internal message id. Also consulted at startup so the
    /// durable backlog cannot double-process an id queued here.
    pending_ledger: Mutex<HashMap<String, Vec<u8>>>,
    events: broadcast::Sender<MqEvent>,
}

impl MqEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn DurableStore>,
        signing_key: SigningKey,
        decrypt_key: StaticSecret,
        config: MqEngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let dedup = DedupRegistry::new(Arc::clone(&store), config.dedup_ttl);
        Self {
            transport,
            ledger,
            store,
            signing_key,
            decrypt_key,
            dedup,
            pending_ledger: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MqEvent> {
        self.events.subscribe()
    }

    /// Startup recovery: reconcile the dedup table against wall-clock
    /// time, then replay the durable backlog (excluding anything already
    /// queued for the in-memory ledger retry).
    pub async fn recover(&self) -> Result<(), MqError> {
        self.dedup.reconcile().await?;
        self.load_backlog().await
    }

    /// Entry point for the transport layer: one raw inbound message.
    pub async fn receive(&self, inbound: InboundMessage) {
        let dedup_id = format!("{}:{}", inbound.sender_id, inbound.message_id);
        match self.dedup.add_if_absent(&dedup_id).await {
            Ok(DedupOutcome::Fresh) => {}
            Ok(DedupOutcome::Duplicate) => {
                log::debug!("dropping duplicate message {dedup_id}");
                return;
            }
            Err(err) => {
                self.emit_error(err.into());
                return;
            }
        }

        log::info!(
            "received message from queue: sender={} bytes={}",
            inbound.sender_id,
            inbound.payload.len()
        );
        let message_id = random_message_id();
        if let Err(err) = self.store.set(&raw_key(&message_id), inbound.payload.clone()).await {
            self.emit_error(err.into());
            return;
        }

        if !self.ledger.is_ready() || self.ledger.is_syncing() {
            log::info!("ledger not ready, buffering message {message_id}");
            lock(&self.pending_ledger).insert(message_id, inbound.payload);
        } else {
            self.process_message(&message_id, &inbound.payload).await;
        }
    }

    /// Drains and replays the in-memory backlog exactly once. Call when
    /// the ledger signals readiness.
    pub async fn on_ledger_ready(&self) {
        let drained: Vec<(String, Vec<u8>)> = lock(&self.pending_ledger).drain().collect();
        if !drained.is_empty() {
            log::info!("ledger ready, replaying {} buffered messages", drained.len());
        }
        for (message_id, raw) in drained {
            self.process_message(&message_id, &raw).await;
        }
    }

    /// Replays the durable backlog left over from a previous run.
    pub async fn load_backlog(&self) -> Result<(), MqError> {
        let entries = self.store.scan_prefix(RAW_PREFIX).await?;
        if entries.is_empty() {
            log::info!("no backlog messages to process");
            return Ok(());
        }
        let queued: Vec<String> = lock(&self.pending_ledger).keys().cloned().collect();
        for (key, raw) in entries {
            let message_id = &key[RAW_PREFIX.len()..];
            if queued.iter().any(|id| id == message_id) {
                continue;
            }
            self.process_message(message_id, &raw).await;
        }
        Ok(())
    }

    /// Signs `message` once and delivers an independently sealed copy to
    /// each receiver. An empty receiver list is a no-op.
    pub async fn send(&self, receivers: &[Receiver], message: &JsonValue) -> Result<(), MqError> {
        if receivers.is_empty() {
            log::debug!("no receivers for outbound message");
            return Ok(());
        }
        let message_str =
            serde_json::to_string(message).map_err(|err| MqError::Encode(err.to_string()))?;
        let envelope = codec::sign_envelope(message_str, &self.signing_key);
        let envelope_bytes = envelope.to_bytes()?;
        log::info!(
            "sending message over queue: bytes={} receivers={}",
            envelope_bytes.len(),
            receivers.len()
        );

        for receiver in receivers {
            let sealed = match seal::encrypt_for_receiver(&receiver.public_key, &envelope_bytes) {
                Ok(sealed) => sealed,
                Err(err) => {
                    log::error!("cannot seal message for {}: {err}", receiver.node_id);
                    continue;
                }
            };
            let bytes = match sealed.to_bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::error!("cannot encode sealed message for {}: {err}", receiver.node_id);
                    continue;
                }
            };
            if let Err(err) = self.transport.send(&receiver.address, bytes).await {
                log::error!("transport send to {} failed: {err}", receiver.node_id);
            }
        }
        Ok(())
    }

    /// Cancels dedup timers. Durable state stays for the next startup.
    pub fn close(&self) {
        self.dedup.close();
        log::info!("message queue engine closed");
    }

    async fn process_message(&self, message_id: &str, raw: &[u8]) {
        log::info!("processing raw message {message_id} ({} bytes)", raw.len());
        match self.run_pipeline(raw).await {
            Ok(message) => {
                let _ = self.events.send(MqEvent::Message(message));
            }
            Err(err) => {
                log::error!("message {message_id} failed terminally: {err}");
                let _ = self.events.send(MqEvent::Error(err));
            }
        }
        // Cleanup runs on failure too, so effects stay at-most-once.
        self.remove_raw_message(message_id).await;
    }

    async fn run_pipeline(&self, raw: &[u8]) -> Result<String, MqError> {
        let outer = EncryptedEnvelope::from_bytes(raw)?;
        let envelope_bytes = seal::decrypt_with_own_key(&self.decrypt_key, &outer)?;
        let envelope = MessageEnvelope::from_bytes(&envelope_bytes)?;

        let sender_id = sender_node_id(&envelope.message)?;
        let key_bytes = self.ledger.node_public_key(&sender_id).await?;
        let verifying_key = parse_verifying_key(&key_bytes)?;
        if !codec::verify_envelope(&envelope, &verifying_key) {
            return Err(MqError::InvalidSignature);
        }
        Ok(envelope.message)
    }

    async fn remove_raw_message(&self, message_id: &str) {
        log::debug!("removing raw message {message_id} from durable store");
        if let Err(err) = self.store.delete(&raw_key(message_id)).await {
            log::error!("cannot remove raw message {message_id}: {err}");
        }
    }

    fn emit_error(&self, err: MqError) {
        log::error!("message queue receive error: {err}");
        let _ = self.events.send(MqEvent::Error(err));
    }
}

/// Reads the sender identity from one of the three role fields of the
/// decoded message. All absent fails without attempting verification.
fn sender_node_id(message: &str) -> Result<String, MqError> {
    let body: JsonValue =
        serde_json::from_str(message).map_err(|err| MqError::Malformed(err.to_string()))?;
    ["idp_id", "rp_id", "as_id"]
        .iter()
        .find_map(|field| body.get(field).and_then(JsonValue::as_str))
        .map(str::to_string)
        .ok_or(MqError::UnknownSender)
}

fn parse_verifying_key(bytes: &[u8]) -> Result<VerifyingKey, MqError> {
    let fixed: [u8; 32] = bytes.try_into().map_err(|_| MqError::InvalidSignature)?;
    VerifyingKey::from_bytes(&fixed).map_err(|_| MqError::InvalidSignature)
}

/// Storage key for a buffered raw message, for callers seeding fixtures.
pub fn raw_key(message_id: &str) -> String {
    format!("{RAW_PREFIX}{message_id}")
}

/// Internal id for a raw inbound message, unique per process lifetime.
fn random_message_id() -> String {
    let mut bytes = [0u8; 10];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
