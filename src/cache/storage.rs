//! Cache storage backends: SQLite for the real program, memory for tests.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::traits::{CacheStorage, CachedResponse, RequestKey};
use crate::network::FetchResponse;

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Database that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Generation set: one row per named store
CREATE TABLE IF NOT EXISTS cache_stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by request hash within a store
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, request_hash),
    FOREIGN KEY (store_name) REFERENCES cache_stores(name) ON DELETE CASCADE
);

-- Last activated version
CREATE TABLE IF NOT EXISTS registration (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

fn ensure_store(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache store {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  name: &str,
  key: &RequestKey,
  response: &FetchResponse,
) -> Result<()> {
  let metadata =
    serde_json::to_string(response).map_err(|e| eyre!("Failed to serialize response: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (store_name, request_hash, method, url, response, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.cache_hash(),
        key.method,
        key.url,
        metadata,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key, name, e))?;
  Ok(())
}

fn read_entry(metadata: &str, body: Vec<u8>, cached_at: &str) -> Result<CachedResponse> {
  let mut response: FetchResponse =
    serde_json::from_str(metadata).map_err(|e| eyre!("Failed to deserialize response: {}", e))?;
  response.body = body;
  Ok(CachedResponse {
    response,
    cached_at: parse_datetime(cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_store(&conn, name)
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;
    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row: Option<(String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT response, body, cached_at FROM cache_entries
         WHERE store_name = ? AND request_hash = ?",
        params![name, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, name, e))?;

    row
      .map(|(metadata, body, cached_at)| read_entry(&metadata, body, &cached_at))
      .transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row: Option<(String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT ce.response, ce.body, ce.cached_at FROM cache_entries ce
         INNER JOIN cache_stores cs ON cs.name = ce.store_name
         WHERE ce.request_hash = ?
         ORDER BY cs.id
         LIMIT 1",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row
      .map(|(metadata, body, cached_at)| read_entry(&metadata, body, &cached_at))
      .transpose()
  }

  fn put(&self, name: &str, key: &RequestKey, response: &FetchResponse) -> Result<()> {
    let conn = self.lock()?;
    ensure_store(&conn, name)?;
    insert_entry(&conn, name, key, response)
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, FetchResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_store(&tx, name)?;
    for (key, response) in entries {
      insert_entry(&tx, name, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE store_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![name], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
  }

  fn active_version(&self) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM registration WHERE key = 'active_version'",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }

  fn set_active_version(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO registration (key, value) VALUES ('active_version', ?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to record active version: {}", e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

type MemoryEntries = HashMap<String, (RequestKey, CachedResponse)>;

#[derive(Default)]
struct MemoryState {
  /// Stores in creation order
  stores: Vec<(String, MemoryEntries)>,
  active_version: Option<String>,
}

impl MemoryState {
  fn store_mut(&mut self, name: &str) -> &mut MemoryEntries {
    let index = match self.stores.iter().position(|(n, _)| n == name) {
      Some(index) => index,
      None => {
        self.stores.push((name.to_string(), HashMap::new()));
        self.stores.len() - 1
      }
    };
    &mut self.stores[index].1
  }

  fn store(&self, name: &str) -> Option<&MemoryEntries> {
    self
      .stores
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, entries)| entries)
  }
}

/// In-process storage with no persistence.
///
/// Can be switched into an unavailable mode where every call fails, to
/// simulate quota or open failures.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
  unavailable: AtomicBool,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  #[cfg(test)]
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(eyre!("Cache storage unavailable"));
    }
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    self.lock()?.store_mut(name);
    Ok(())
  }

  fn has(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.store(name).is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(
      self
        .lock()?
        .stores
        .iter()
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut state = self.lock()?;
    let before = state.stores.len();
    state.stores.retain(|(n, _)| n != name);
    Ok(state.stores.len() != before)
  }

  fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let state = self.lock()?;
    Ok(
      state
        .store(name)
        .and_then(|entries| entries.get(&key.cache_hash()))
        .map(|(_, cached)| cached.clone()),
    )
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let state = self.lock()?;
    let hash = key.cache_hash();
    Ok(
      state
        .stores
        .iter()
        .find_map(|(_, entries)| entries.get(&hash))
        .map(|(_, cached)| cached.clone()),
    )
  }

  fn put(&self, name: &str, key: &RequestKey, response: &FetchResponse) -> Result<()> {
    let mut state = self.lock()?;
    let cached = CachedResponse {
      response: response.clone(),
      cached_at: Utc::now(),
    };
    state
      .store_mut(name)
      .insert(key.cache_hash(), (key.clone(), cached));
    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, FetchResponse)]) -> Result<()> {
    let mut state = self.lock()?;
    let store = state.store_mut(name);
    let now = Utc::now();
    for (key, response) in entries {
      let cached = CachedResponse {
        response: response.clone(),
        cached_at: now,
      };
      store.insert(key.cache_hash(), (key.clone(), cached));
    }
    Ok(())
  }

  fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>> {
    let state = self.lock()?;
    let mut keys: Vec<RequestKey> = state
      .store(name)
      .map(|entries| entries.values().map(|(key, _)| key.clone()).collect())
      .unwrap_or_default();
    keys.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(keys)
  }

  fn active_version(&self) -> Result<Option<String>> {
    Ok(self.lock()?.active_version.clone())
  }

  fn set_active_version(&self, name: &str) -> Result<()> {
    self.lock()?.active_version = Some(name.to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(url: &str) -> RequestKey {
    RequestKey::new("GET", url)
  }

  fn response(url: &str, status: u16, body: &str) -> FetchResponse {
    let mut response = FetchResponse::new(url, status, body);
    response
      .headers
      .push(("content-type".to_string(), "text/plain".to_string()));
    response
  }

  fn exercise_backend(storage: &dyn CacheStorage) {
    storage.open("app-shell-v1").unwrap();
    storage
      .put(
        "pwa-cache",
        &key("https://a.test/x"),
        &response("https://a.test/x", 200, "runtime"),
      )
      .unwrap();

    assert_eq!(storage.keys().unwrap(), vec!["app-shell-v1", "pwa-cache"]);
    assert!(storage.has("pwa-cache").unwrap());
    assert!(!storage.has("other").unwrap());

    let hit = storage
      .match_in("pwa-cache", &key("https://a.test/x"))
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body, b"runtime");
    assert_eq!(hit.response.header("Content-Type"), Some("text/plain"));
    assert!(storage
      .match_in("app-shell-v1", &key("https://a.test/x"))
      .unwrap()
      .is_none());

    // Oldest store wins in match_any
    storage
      .put(
        "app-shell-v1",
        &key("https://a.test/x"),
        &response("https://a.test/x", 200, "shell"),
      )
      .unwrap();
    let any = storage.match_any(&key("https://a.test/x")).unwrap().unwrap();
    assert_eq!(any.response.body, b"shell");

    assert!(storage.delete("app-shell-v1").unwrap());
    assert!(!storage.delete("app-shell-v1").unwrap());
    let any = storage.match_any(&key("https://a.test/x")).unwrap().unwrap();
    assert_eq!(any.response.body, b"runtime");
    assert_eq!(storage.keys().unwrap(), vec!["pwa-cache"]);

    // Re-creating a deleted store starts empty
    storage.open("app-shell-v1").unwrap();
    assert!(storage.entry_keys("app-shell-v1").unwrap().is_empty());

    storage
      .put_all(
        "app-shell-v2",
        &[
          (key("https://a.test/"), response("https://a.test/", 200, "root")),
          (
            key("https://a.test/index.html"),
            response("https://a.test/index.html", 200, "index"),
          ),
        ],
      )
      .unwrap();
    let keys = storage.entry_keys("app-shell-v2").unwrap();
    assert_eq!(
      keys,
      vec![key("https://a.test/"), key("https://a.test/index.html")]
    );

    assert_eq!(storage.active_version().unwrap(), None);
    storage.set_active_version("app-shell-v2").unwrap();
    assert_eq!(
      storage.active_version().unwrap().as_deref(),
      Some("app-shell-v2")
    );
  }

  #[test]
  fn test_sqlite_backend() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    exercise_backend(&storage);
  }

  #[test]
  fn test_memory_backend() {
    let storage = MemoryStorage::new();
    exercise_backend(&storage);
  }

  #[test]
  fn test_sqlite_put_replaces_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let k = key("https://a.test/x");
    storage
      .put("pwa-cache", &k, &response("https://a.test/x", 200, "one"))
      .unwrap();
    storage
      .put("pwa-cache", &k, &response("https://a.test/x", 200, "two"))
      .unwrap();

    assert_eq!(storage.entry_keys("pwa-cache").unwrap().len(), 1);
    let hit = storage.match_in("pwa-cache", &k).unwrap().unwrap();
    assert_eq!(hit.response.body, b"two");
  }

  #[test]
  fn test_sqlite_persists_across_connections() {
    let dir = std::env::temp_dir().join(format!("offline-shell-test-{}", std::process::id()));
    let path = dir.join("cache.db");
    let _ = std::fs::remove_file(&path);

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage
        .put(
          "pwa-cache",
          &key("https://a.test/x"),
          &response("https://a.test/x", 200, "kept"),
        )
        .unwrap();
      storage.set_active_version("app-shell-v2").unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let hit = storage
      .match_in("pwa-cache", &key("https://a.test/x"))
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body, b"kept");
    assert_eq!(
      storage.active_version().unwrap().as_deref(),
      Some("app-shell-v2")
    );

    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn test_unavailable_memory_storage_errors() {
    let storage = MemoryStorage::new();
    storage.set_unavailable(true);
    assert!(storage.keys().is_err());
    assert!(storage.match_any(&key("https://a.test/x")).is_err());
    storage.set_unavailable(false);
    assert!(storage.keys().unwrap().is_empty());
  }
}
