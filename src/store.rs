use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

/// Durable key/value storage owned by a single relay instance.
///
/// Values are opaque strings (the relay stores JSON). Only the relay actor
/// writes to a store, so implementations need no cross-writer coordination.
pub trait Store: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write several entries as one logical unit: all land or none do.
    fn put_many(&mut self, entries: &[(&str, String)]) -> Result<()>;

    fn put(&mut self, key: &str, value: String) -> Result<()> {
        self.put_many(&[(key, value)])
    }

    /// Remove every key.
    fn clear(&mut self) -> Result<()>;
}

/// SQLite-backed store; survives process restarts.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS relay_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .context("create relay_kv table")?;
        Ok(Self { conn })
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM relay_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("read key {key}"))
    }

    fn put_many(&mut self, entries: &[(&str, String)]) -> Result<()> {
        let tx = self.conn.transaction().context("begin store write")?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO relay_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .with_context(|| format!("write key {key}"))?;
        }
        tx.commit().context("commit store write")
    }

    fn clear(&mut self) -> Result<()> {
        self.conn
            .execute("DELETE FROM relay_kv", [])
            .context("clear store")?;
        Ok(())
    }
}

/// Volatile store for tests and throwaway runs.
///
/// Clones share the same entries, so a caller can keep a handle for
/// inspection after moving another into the relay.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn put_many(&mut self, entries: &[(&str, String)]) -> Result<()> {
        let mut map = self.entries();
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.entries().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &mut dyn Store) {
        assert_eq!(store.get("history").unwrap(), None);

        store
            .put_many(&[("history", "[]".to_string()), ("last_id", "5".to_string())])
            .unwrap();
        assert_eq!(store.get("history").unwrap().as_deref(), Some("[]"));
        assert_eq!(store.get("last_id").unwrap().as_deref(), Some("5"));

        store.put("last_id", "6".to_string()).unwrap();
        assert_eq!(store.get("last_id").unwrap().as_deref(), Some("6"));

        store.clear().unwrap();
        assert_eq!(store.get("history").unwrap(), None);
    }

    #[test]
    fn memory_store_basics() {
        let mut store = MemoryStore::new();
        exercise(&mut store);
        assert!(store.is_empty());
    }

    #[test]
    fn memory_store_clones_share_entries() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        store.put("last_id", "3".to_string()).unwrap();
        assert_eq!(observer.get("last_id").unwrap().as_deref(), Some("3"));
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn sqlite_store_basics() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        exercise(&mut store);
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.put("auth_cookie", "\"tok\"".to_string()).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("auth_cookie").unwrap().as_deref(), Some("\"tok\""));
    }

    #[test]
    fn sqlite_put_many_overwrites_existing_keys() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.put("last_id", "1".to_string()).unwrap();
        store
            .put_many(&[("last_id", "2".to_string()), ("history", "[]".to_string())])
            .unwrap();
        assert_eq!(store.get("last_id").unwrap().as_deref(), Some("2"));
    }
}
