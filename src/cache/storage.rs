//! Key-value storage trait and SQLite implementation for the local fallback tier.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::{CacheError, Result, Tier};

/// Trait for key-value storage backends.
///
/// String keys, string values. The store knows nothing about expiry; callers
/// encode a [`CacheEntry`](super::CacheEntry) envelope as JSON.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;

  fn clear(&self) -> Result<()>;
}

/// Build the storage key for a cache key within a namespace.
///
/// The cache key is hashed so arbitrary user input (repository names, query
/// strings) yields a fixed-length key.
pub fn storage_key(namespace: &str, cache_key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(cache_key.as_bytes());
  format!("{}:{}", namespace, hex::encode(hasher.finalize()))
}

/// Storage implementation that doesn't store anything.
/// Used when the fallback tier is disabled - all operations are no-ops.
pub struct NoopStorage;

impl KeyValueStore for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &str) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based key-value storage implementation.
pub struct SqliteKvStore {
  conn: Mutex<Connection>,
}

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn unavailable(context: &str, err: impl std::fmt::Display) -> CacheError {
  CacheError::tier(Tier::Fallback, format!("{}: {}", context, err))
}

impl SqliteKvStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open the store at an explicit path, creating parent directories.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| unavailable("Failed to create cache directory", e))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      unavailable(
        &format!("Failed to open cache database at {}", path.display()),
        e,
      )
    })?;
    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| unavailable("Failed to open in-memory database", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| unavailable("Failed to run cache migrations", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| unavailable("Could not determine data directory", "no home"))?;

    Ok(data_dir.join("contrib-cache").join("local.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| unavailable("Lock poisoned", e))
  }
}

impl KeyValueStore for SqliteKvStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| unavailable("Failed to read key", e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, written_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| unavailable("Failed to write key", e))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| unavailable("Failed to remove key", e))?;
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_store", [])
      .map_err(|e| unavailable("Failed to clear store", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_set_get_remove() {
    let store = SqliteKvStore::open_in_memory().unwrap();
    assert_eq!(store.get("a").unwrap(), None);

    store.set("a", "1").unwrap();
    store.set("a", "2").unwrap();
    assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));

    store.remove("a").unwrap();
    assert_eq!(store.get("a").unwrap(), None);
  }

  #[test]
  fn test_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("local.db");

    SqliteKvStore::open_at(&path)
      .unwrap()
      .set("avatar:1", "https://avatars.githubusercontent.com/u/1")
      .unwrap();

    let reopened = SqliteKvStore::open_at(&path).unwrap();
    assert_eq!(
      reopened.get("avatar:1").unwrap().as_deref(),
      Some("https://avatars.githubusercontent.com/u/1")
    );

    reopened.clear().unwrap();
    assert_eq!(reopened.get("avatar:1").unwrap(), None);
  }

  #[test]
  fn test_storage_key_is_namespaced_and_stable() {
    let a = storage_key("repo_stats", "torvalds/linux/30/false");
    let b = storage_key("repo_stats", "torvalds/linux/30/false");
    assert_eq!(a, b);
    assert!(a.starts_with("repo_stats:"));
    assert_eq!(a.len(), "repo_stats:".len() + 64);
    assert_ne!(a, storage_key("avatar", "torvalds/linux/30/false"));
  }
}
