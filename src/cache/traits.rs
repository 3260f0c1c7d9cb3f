//! Core traits and types for the store registry.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::http::Response;

/// A response held by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Request identity (method + URL)
  pub key: String,
  pub response: Response,
  /// Set by the store on every put; never taken from response headers
  pub inserted_at: DateTime<Utc>,
  /// SHA-256 of the response body, hex encoded
  pub digest: String,
}

impl CacheEntry {
  /// Whether the entry has outlived `max_age` as of `now`.
  ///
  /// A store without a max age never expires its entries.
  pub fn is_expired(&self, max_age: Option<Duration>, now: DateTime<Utc>) -> bool {
    let Some(max_age) = max_age else {
      return false;
    };
    let age = now.signed_duration_since(self.inserted_at);
    match age.to_std() {
      Ok(age) => age > max_age,
      // Inserted "in the future" (clock skew) counts as fresh
      Err(_) => false,
    }
  }
}

/// Hex-encoded SHA-256 of a response body.
pub fn body_digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

/// Trait for store backends.
///
/// A missing key or store is an empty result, never an error; errors are
/// reserved for I/O and corruption. Implementations make each `put`/`get`
/// atomic per key.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the store if it doesn't exist. Idempotent.
  fn open_store(&self, name: &str) -> Result<()>;

  /// Names of every store currently present.
  fn list_stores(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns whether it existed.
  fn delete_store(&self, name: &str) -> Result<bool>;

  fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or overwrite an entry, stamping it with the current time.
  /// Putting into a store that doesn't exist yet creates it.
  fn put(&self, store: &str, key: &str, response: &Response) -> Result<CacheEntry>;

  /// Returns whether the key was present.
  fn delete(&self, store: &str, key: &str) -> Result<bool>;

  /// Keys in insertion order, oldest first.
  fn list_keys(&self, store: &str) -> Result<Vec<String>>;

  fn entry_count(&self, store: &str) -> Result<usize> {
    Ok(self.list_keys(store)?.len())
  }
}
