//! Named, versioned stores.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;

use super::eviction;
use super::traits::{CacheEntry, CacheStorage};
use crate::classify::Category;
use crate::config::Config;
use crate::http::Response;
use crate::strategy::Strategy;

/// Name of the store for `category` in build `version`.
pub fn store_name(category: Category, version: u32) -> String {
  format!("{}-cache-v{}", category.store_prefix(), version)
}

/// Version tag embedded in a store name (`"static-cache-v3"` → 3).
///
/// Names without a trailing `-v{number}` carry no version tag.
pub fn version_tag(name: &str) -> Option<u32> {
  let (_, version) = name.rsplit_once("-v")?;
  if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  version.parse().ok()
}

/// A declared store: one row of the store table, bound to the current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSpec {
  pub name: String,
  pub category: Category,
  pub version: u32,
  pub max_entries: usize,
  pub max_age: Option<Duration>,
  pub strategy: Strategy,
}

/// Owns the declared store table and the backend holding the stores.
pub struct CacheRegistry<S: CacheStorage> {
  storage: Arc<S>,
  version: u32,
  specs: Arc<Vec<StoreSpec>>,
}

impl<S: CacheStorage> CacheRegistry<S> {
  pub fn new(storage: Arc<S>, config: &Config) -> Self {
    let specs = config
      .stores
      .iter()
      .map(|store| StoreSpec {
        name: store_name(store.category, config.version),
        category: store.category,
        version: config.version,
        max_entries: store.max_entries,
        max_age: store.max_age_seconds.map(Duration::from_secs),
        strategy: store.strategy(),
      })
      .collect();

    Self {
      storage,
      version: config.version,
      specs: Arc::new(specs),
    }
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  pub fn specs(&self) -> &[StoreSpec] {
    &self.specs
  }

  pub fn spec_for(&self, category: Category) -> Option<&StoreSpec> {
    self.specs.iter().find(|spec| spec.category == category)
  }

  /// Strategy bound to a category. Categories without a declared store are network-only.
  pub fn strategy_for(&self, category: Category) -> Strategy {
    self
      .spec_for(category)
      .map_or(Strategy::NetworkOnly, |spec| spec.strategy)
  }

  /// Open (creating if needed) a store by name. Idempotent.
  ///
  /// Declared stores carry their capacity and freshness limits; any other
  /// name (e.g. a store left by an older build) gets an unbounded handle.
  pub fn open_store(&self, name: &str) -> Result<StoreHandle<S>> {
    self.storage.open_store(name)?;
    Ok(self.handle(name))
  }

  /// Handle to the declared store for `category`, without touching the backend.
  pub fn store_for(&self, category: Category) -> Option<StoreHandle<S>> {
    self.spec_for(category).map(|spec| self.handle(&spec.name))
  }

  /// Open every declared store.
  pub fn open_all(&self) -> Result<()> {
    for spec in self.specs.iter() {
      self.storage.open_store(&spec.name)?;
    }
    Ok(())
  }

  pub fn list_stores(&self) -> Result<Vec<String>> {
    self.storage.list_stores()
  }

  pub fn delete_store(&self, name: &str) -> Result<bool> {
    self.storage.delete_store(name)
  }

  fn handle(&self, name: &str) -> StoreHandle<S> {
    let spec = self.specs.iter().find(|spec| spec.name == name);
    StoreHandle {
      storage: Arc::clone(&self.storage),
      name: name.to_string(),
      max_entries: spec.map(|s| s.max_entries),
      max_age: spec.and_then(|s| s.max_age),
    }
  }
}

impl<S: CacheStorage> Clone for CacheRegistry<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      version: self.version,
      specs: Arc::clone(&self.specs),
    }
  }
}

/// Access to one store.
pub struct StoreHandle<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
  max_entries: Option<usize>,
  max_age: Option<Duration>,
}

impl<S: CacheStorage> StoreHandle<S> {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn max_entries(&self) -> Option<usize> {
    self.max_entries
  }

  /// Entry as physically stored, regardless of age.
  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.storage.get(&self.name, key)
  }

  /// Entry if present and younger than the store's max age; expired entries are misses.
  pub fn get_fresh(&self, key: &str) -> Result<Option<CacheEntry>> {
    let now = Utc::now();
    Ok(
      self
        .get(key)?
        .filter(|entry| !entry.is_expired(self.max_age, now)),
    )
  }

  pub fn put(&self, key: &str, response: &Response) -> Result<CacheEntry> {
    self.storage.put(&self.name, key, response)
  }

  /// Put followed by a trim pass, so the store never stays over capacity.
  pub fn put_and_trim(&self, key: &str, response: &Response) -> Result<CacheEntry> {
    let entry = self.put(key, response)?;
    eviction::trim(self)?;
    Ok(entry)
  }

  pub fn delete(&self, key: &str) -> Result<bool> {
    self.storage.delete(&self.name, key)
  }

  pub fn list_keys(&self) -> Result<Vec<String>> {
    self.storage.list_keys(&self.name)
  }

  pub fn entry_count(&self) -> Result<usize> {
    self.storage.entry_count(&self.name)
  }
}

impl<S: CacheStorage> Clone for StoreHandle<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      name: self.name.clone(),
      max_entries: self.max_entries,
      max_age: self.max_age,
    }
  }
}
