//! Durable key/value store over sqlite.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use veridian_ipc::{DurableStore, StoreError};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        lock(&self.conn).execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        lock(&self.conn)
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(store_err)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        lock(&self.conn)
            .execute("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)", params![key, value])
            .map(|_| ())
            .map_err(store_err)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.conn)
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map(|_| ())
            .map_err(store_err)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")
            .map_err(store_err)?;
        let mut rows = stmt.query(params![prefix]).map_err(store_err)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().map_err(store_err)? {
            let key: String = row.get(0).map_err(store_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            let value: Vec<u8> = row.get(1).map_err(store_err)?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}

fn store_err(err: rusqlite::Error) -> StoreError {
    StoreError::Io { reason: err.to_string() }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
