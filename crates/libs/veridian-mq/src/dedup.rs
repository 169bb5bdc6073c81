//! Duplicate-suppression records with expiry timers.
//!
//! Each seen message id gets a durable record holding its expiry deadline
//! plus an in-process timer that clears the record when the TTL lapses.
//! The durable table is authoritative: at startup [`DedupRegistry::reconcile`]
//! drops rows that expired while the process was down and re-arms timers
//! for the remainder of each surviving row's window, so the table cannot
//! grow without bound across restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use veridian_ipc::{DurableStore, StoreError};

pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(120);

const DEDUP_PREFIX: &str = "dedup:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sight of this id inside the TTL window.
    Fresh,
    /// Already seen; the caller must drop the message silently.
    Duplicate,
}

pub struct DedupRegistry {
    store: Arc<dyn DurableStore>,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    ttl: Duration,
}

impl DedupRegistry {
    pub fn new(store: Arc<dyn DurableStore>, ttl: Duration) -> Self {
        Self { store, timers: Arc::new(Mutex::new(HashMap::new())), ttl }
    }

    /// Records `id` if unseen, arming its expiry timer.
    pub async fn add_if_absent(&self, id: &str) -> Result<DedupOutcome, StoreError> {
        let key = storage_key(id);
        if self.store.get(&key).await?.is_some() {
            return Ok(DedupOutcome::Duplicate);
        }
        let expires_at = now_ms() + self.ttl.as_millis() as i64;
        self.store.set(&key, expires_at.to_be_bytes().to_vec()).await?;
        self.arm_timer(id.to_string(), self.ttl);
        Ok(DedupOutcome::Fresh)
    }

    /// Reconciles the durable table against wall-clock time at startup.
    pub async fn reconcile(&self) -> Result<(), StoreError> {
        let now = now_ms();
        for (key, value) in self.store.scan_prefix(DEDUP_PREFIX).await? {
            let id = key[DEDUP_PREFIX.len()..].to_string();
            let expires_at = parse_deadline(&value);
            if expires_at <= now {
                self.store.delete(&key).await?;
            } else {
                self.arm_timer(id, Duration::from_millis((expires_at - now) as u64));
            }
        }
        Ok(())
    }

    /// Cancels every live timer. Durable records are left for the next
    /// startup reconcile.
    pub fn close(&self) {
        for (_, handle) in lock(&self.timers).drain() {
            handle.abort();
        }
    }

    fn arm_timer(&self, id: String, delay: Duration) {
        let store = Arc::clone(&self.store);
        let timers = Arc::clone(&self.timers);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = store.delete(&storage_key(&timer_id)).await {
                log::warn!("cannot clear expired dedup record {timer_id}: {err}");
            }
            lock(&timers).remove(&timer_id);
        });
        if let Some(previous) = lock(&self.timers).insert(id, handle) {
            previous.abort();
        }
    }
}

fn storage_key(id: &str) -> String {
    format!("{DEDUP_PREFIX}{id}")
}

fn parse_deadline(value: &[u8]) -> i64 {
    // A record we cannot parse counts as expired.
    value.try_into().map(i64::from_be_bytes).unwrap_or(0)
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Durable record value for a given expiry deadline, for callers seeding
/// test fixtures or migrations.
pub fn deadline_value(expires_at_ms: i64) -> Vec<u8> {
    expires_at_ms.to_be_bytes().to_vec()
}

/// Storage key for a dedup id.
pub fn dedup_key(id: &str) -> String {
    storage_key(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veridian_ipc::MemoryStore;

    fn registry(ttl: Duration) -> DedupRegistry {
        DedupRegistry::new(Arc::new(MemoryStore::new()), ttl)
    }

    #[tokio::test]
    async fn second_sight_within_ttl_is_a_duplicate() {
        let registry = registry(Duration::from_secs(120));
        assert_eq!(
            registry.add_if_absent("idp-1:msg-1").await.expect("add"),
            DedupOutcome::Fresh
        );
        assert_eq!(
            registry.add_if_absent("idp-1:msg-1").await.expect("add"),
            DedupOutcome::Duplicate
        );
        registry.close();
    }

    #[tokio::test(start_paused = true)]
    async fn record_expires_after_ttl() {
        let registry = registry(Duration::from_millis(50));
        registry.add_if_absent("idp-1:msg-1").await.expect("add");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            registry.add_if_absent("idp-1:msg-1").await.expect("add"),
            DedupOutcome::Fresh
        );
        registry.close();
    }

    #[tokio::test]
    async fn reconcile_drops_expired_rows_and_keeps_live_ones() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(&dedup_key("stale"), deadline_value(now_ms() - 1_000))
            .await
            .expect("seed stale");
        store
            .set(&dedup_key("live"), deadline_value(now_ms() + 60_000))
            .await
            .expect("seed live");

        let registry = DedupRegistry::new(Arc::clone(&store) as Arc<dyn DurableStore>, DEFAULT_DEDUP_TTL);
        registry.reconcile().await.expect("reconcile");

        assert_eq!(store.get(&dedup_key("stale")).await.expect("get"), None);
        assert!(store.get(&dedup_key("live")).await.expect("get").is_some());
        assert_eq!(
            registry.add_if_absent("live").await.expect("add"),
            DedupOutcome::Duplicate
        );
        registry.close();
    }
}
