use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use veridian_dispatch::DispatchConfig;

/// Which role this node plays on the platform. Purely informational for
/// the daemon itself; workers decide behavior per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Ordinary,
    Orchestrator,
    Proxy,
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    pub node_id: String,
    #[serde(default = "default_role")]
    pub role: NodeRole,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub mq: MqSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub ledger: LedgerSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqSection {
    pub listen: String,
    /// Upper bound on one inbound queue frame, in bytes.
    pub max_message_size: usize,
    pub dedup_ttl_secs: u64,
}

impl Default for MqSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5555".to_string(),
            max_message_size: 8 * 1024 * 1024,
            dedup_ttl_secs: 120,
        }
    }
}

impl MqSection {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub listen: String,
    pub retry_interval_ms: u64,
    /// `None` keeps retrying until a worker appears.
    pub max_retry_attempts: Option<u32>,
    /// `None` waits for a result indefinitely.
    pub call_timeout_ms: Option<u64>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7000".to_string(),
            retry_interval_ms: 2000,
            max_retry_attempts: None,
            call_timeout_ms: None,
        }
    }
}

impl DispatchSection {
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            max_retry_attempts: self.max_retry_attempts,
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Node key directory standing in for the consensus ledger.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Hex-encoded Ed25519 verification keys by node id.
    pub node_keys: BTreeMap<String, String>,
}

impl DaemonConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

fn default_role() -> NodeRole {
    NodeRole::Ordinary
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("veridian-data")
}
