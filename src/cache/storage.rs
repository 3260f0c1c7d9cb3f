//! SQLite and in-memory store backends.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{body_digest, CacheEntry, CacheStorage};
use crate::http::{Request, Response};
use crate::retry::{RetryStorage, RetryTask};

/// SQLite-based store backend. One database holds every store and the retry queue.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
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

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per cached response. `seq` orders entries by insertion for eviction.
CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    inserted_at INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (store, key)
);

CREATE INDEX IF NOT EXISTS idx_entries_seq ON entries(store, seq);

CREATE TABLE IF NOT EXISTS retry_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    payload BLOB,
    enqueued_at INTEGER NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;
    Ok(())
  }

  fn list_stores(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE store = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, digest, inserted_at FROM entries
         WHERE store = ? AND key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String, i64)> = stmt
      .query_row(params![store, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read entry {} from {}: {}", key, store, e))?;

    let Some((status, headers, body, digest, inserted_at)) = row else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Corrupt headers for {} in {}: {}", key, store, e))?;

    Ok(Some(CacheEntry {
      key: key.to_string(),
      response: Response {
        status,
        headers,
        body,
      },
      inserted_at: from_millis(inserted_at)?,
      digest,
    }))
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> Result<CacheEntry> {
    let inserted_at = Utc::now();
    let digest = body_digest(&response.body);
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO stores (name) VALUES (?)",
      params![store],
    )
    .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;

    let seq: i64 = tx
      .query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM entries WHERE store = ?",
        params![store],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to allocate sequence in {}: {}", store, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (store, key, status, headers, body, digest, inserted_at, seq)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        store,
        key,
        response.status,
        headers,
        response.body,
        digest,
        inserted_at.timestamp_millis(),
        seq
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {} in {}: {}", key, store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(CacheEntry {
      key: key.to_string(),
      response: response.clone(),
      inserted_at: from_millis(inserted_at.timestamp_millis())?,
      digest,
    })
  }

  fn delete(&self, store: &str, key: &str) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM entries WHERE store = ? AND key = ?",
        params![store, key],
      )
      .map_err(|e| eyre!("Failed to delete entry {} from {}: {}", key, store, e))?;
    Ok(removed > 0)
  }

  fn list_keys(&self, store: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM entries WHERE store = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![store], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn entry_count(&self, store: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE store = ?",
        params![store],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", store, e))?;
    Ok(count as usize)
  }
}

impl RetryStorage for SqliteStorage {
  fn push_task(&self, request: &Request) -> Result<RetryTask> {
    let enqueued_at = from_millis(Utc::now().timestamp_millis())?;
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO retry_queue (method, url, headers, payload, enqueued_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          request.method,
          request.url.as_str(),
          headers,
          request.body,
          enqueued_at.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue retry task: {}", e))?;

    Ok(RetryTask {
      id: conn.last_insert_rowid(),
      method: request.method.clone(),
      url: request.url.clone(),
      headers: request.headers.clone(),
      payload: request.body.clone(),
      enqueued_at,
    })
  }

  fn pending_tasks(&self) -> Result<Vec<RetryTask>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, headers, payload, enqueued_at FROM retry_queue ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<Vec<u8>>>(4)?,
          row.get::<_, i64>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query retry queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read retry task: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, headers, payload, enqueued_at)| {
        Ok(RetryTask {
          id,
          method,
          url: url
            .parse()
            .map_err(|e| eyre!("Corrupt URL in retry task {}: {}", id, e))?,
          headers: serde_json::from_str(&headers)
            .map_err(|e| eyre!("Corrupt headers in retry task {}: {}", id, e))?,
          payload,
          enqueued_at: from_millis(enqueued_at)?,
        })
      })
      .collect()
  }

  fn remove_task(&self, id: i64) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM retry_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove retry task {}: {}", id, e))?;
    Ok(())
  }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| eyre!("Timestamp out of range: {}", ms))
}

#[derive(Default)]
struct MemoryState {
  /// store name -> key -> (entry, insertion sequence)
  stores: BTreeMap<String, HashMap<String, (CacheEntry, u64)>>,
  next_seq: u64,
  tasks: Vec<RetryTask>,
  next_task_id: i64,
}

/// In-process store backend. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    self.state()?.stores.entry(name.to_string()).or_default();
    Ok(())
  }

  fn list_stores(&self) -> Result<Vec<String>> {
    Ok(self.state()?.stores.keys().cloned().collect())
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    Ok(self.state()?.stores.remove(name).is_some())
  }

  fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
    Ok(
      self
        .state()?
        .stores
        .get(store)
        .and_then(|entries| entries.get(key))
        .map(|(entry, _)| entry.clone()),
    )
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> Result<CacheEntry> {
    let entry = CacheEntry {
      key: key.to_string(),
      response: response.clone(),
      inserted_at: Utc::now(),
      digest: body_digest(&response.body),
    };

    let mut state = self.state()?;
    state.next_seq += 1;
    let seq = state.next_seq;
    state
      .stores
      .entry(store.to_string())
      .or_default()
      .insert(key.to_string(), (entry.clone(), seq));

    Ok(entry)
  }

  fn delete(&self, store: &str, key: &str) -> Result<bool> {
    Ok(
      self
        .state()?
        .stores
        .get_mut(store)
        .is_some_and(|entries| entries.remove(key).is_some()),
    )
  }

  fn list_keys(&self, store: &str) -> Result<Vec<String>> {
    let state = self.state()?;
    let Some(entries) = state.stores.get(store) else {
      return Ok(Vec::new());
    };

    let mut keyed: Vec<(&String, u64)> = entries.iter().map(|(k, (_, seq))| (k, *seq)).collect();
    keyed.sort_by_key(|(_, seq)| *seq);
    Ok(keyed.into_iter().map(|(k, _)| k.clone()).collect())
  }

  fn entry_count(&self, store: &str) -> Result<usize> {
    Ok(self.state()?.stores.get(store).map_or(0, HashMap::len))
  }
}

impl RetryStorage for MemoryStorage {
  fn push_task(&self, request: &Request) -> Result<RetryTask> {
    let mut state = self.state()?;
    state.next_task_id += 1;
    let task = RetryTask {
      id: state.next_task_id,
      method: request.method.clone(),
      url: request.url.clone(),
      headers: request.headers.clone(),
      payload: request.body.clone(),
      enqueued_at: Utc::now(),
    };
    state.tasks.push(task.clone());
    Ok(task)
  }

  fn pending_tasks(&self) -> Result<Vec<RetryTask>> {
    Ok(self.state()?.tasks.clone())
  }

  fn remove_task(&self, id: i64) -> Result<()> {
    self.state()?.tasks.retain(|task| task.id != id);
    Ok(())
  }
}
