//! Capacity enforcement.
//!
//! Only entry counts are enforced here. Age is checked lazily when an entry
//! is read, so no sweeper is needed.

use color_eyre::Result;
use tracing::debug;

use super::registry::StoreHandle;
use super::traits::CacheStorage;

/// Delete the oldest entries until the store is within its `max_entries`.
/// Returns the number of entries removed.
pub fn trim<S: CacheStorage>(store: &StoreHandle<S>) -> Result<usize> {
  match store.max_entries() {
    Some(max_entries) => purge(store, max_entries),
    None => Ok(0),
  }
}

/// Delete the oldest entries until at most `soft_limit` remain.
pub fn purge<S: CacheStorage>(store: &StoreHandle<S>, soft_limit: usize) -> Result<usize> {
  // Oldest insertion first
  let keys = store.list_keys()?;
  if keys.len() <= soft_limit {
    return Ok(0);
  }

  let excess = keys.len() - soft_limit;
  for key in keys.iter().take(excess) {
    store.delete(key)?;
  }

  debug!(store = store.name(), removed = excess, "trimmed store");
  Ok(excess)
}
