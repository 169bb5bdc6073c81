//! Ledger client backed by a static node-key directory.
//!
//! Stands in for the consensus ledger client: the key directory comes
//! from configuration and readiness is a flag the daemon flips once
//! startup recovery has run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use veridian_ipc::{LedgerClient, LedgerError};

pub struct DirectoryLedger {
    keys: BTreeMap<String, Vec<u8>>,
    ready: AtomicBool,
}

impl DirectoryLedger {
    /// Builds the directory from hex-encoded verification keys. Starts
    /// not ready; the daemon marks readiness explicitly.
    pub fn from_hex_keys(entries: &BTreeMap<String, String>) -> Result<Self, LedgerError> {
        let mut keys = BTreeMap::new();
        for (node_id, hex_key) in entries {
            let bytes = hex::decode(hex_key).map_err(|err| LedgerError::Query {
                reason: format!("invalid key for {node_id}: {err}"),
            })?;
            keys.insert(node_id.clone(), bytes);
        }
        Ok(Self { keys, ready: AtomicBool::new(false) })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerClient for DirectoryLedger {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_syncing(&self) -> bool {
        // A static directory has no block replay phase.
        false
    }

    async fn node_public_key(&self, node_id: &str) -> Result<Vec<u8>, LedgerError> {
        self.keys
            .get(node_id)
            .cloned()
            .ok_or_else(|| LedgerError::NodeNotFound { node_id: node_id.to_string() })
    }
}
