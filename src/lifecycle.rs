//! Store lifecycle: warm at install, cut over at activation, diagnostics.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::cache::{eviction, version_tag, CacheRegistry, CacheStorage};
use crate::classify::Classifier;
use crate::config::Config;
use crate::http::{fetch_with_timeout, Network};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  /// Constructed, nothing done yet
  Parsed,
  Installing,
  /// Warmed; waiting for activation
  Installed,
  Activating,
  /// Serving, stale generations removed
  Active,
  /// Replaced by a newer build
  Superseded,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Superseded => "superseded",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
  pub warmed: usize,
  pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  pub kept: Vec<String>,
}

pub struct Lifecycle<S: CacheStorage> {
  registry: CacheRegistry<S>,
  network: Arc<dyn Network>,
  classifier: Classifier,
  warm_list: Arc<Vec<Url>>,
  timeout: Duration,
  state: Arc<Mutex<LifecycleState>>,
}

impl<S: CacheStorage> Lifecycle<S> {
  pub fn new(registry: CacheRegistry<S>, network: Arc<dyn Network>, config: &Config) -> Result<Self> {
    let warm_list = config
      .warm_list
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      registry,
      network,
      classifier: config.classifier(),
      warm_list: Arc::new(warm_list),
      timeout: config.fetch_timeout(),
      state: Arc::new(Mutex::new(LifecycleState::Parsed)),
    })
  }

  pub fn state(&self) -> Result<LifecycleState> {
    Ok(*self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?)
  }

  fn set_state(&self, state: LifecycleState) -> Result<()> {
    *self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))? = state;
    Ok(())
  }

  /// Move to `to` if the current state is one of `from`. Returns the previous state.
  fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> Result<LifecycleState> {
    let mut state = self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if !from.contains(&*state) {
      return Err(eyre!("Cannot move from {} to {}", *state, to));
    }
    let previous = *state;
    *state = to;
    Ok(previous)
  }

  /// Open every declared store and warm it from the warm-list.
  ///
  /// A warm-list entry that can't be fetched is logged and counted, not fatal.
  pub async fn install(&self) -> Result<InstallReport> {
    self.transition(&[LifecycleState::Parsed], LifecycleState::Installing)?;
    info!(version = self.registry.version(), "installing");

    if let Err(e) = self.registry.open_all() {
      self.set_state(LifecycleState::Parsed)?;
      return Err(e);
    }

    let results = futures::future::join_all(self.warm_list.iter().map(|url| self.warm(url))).await;
    let mut report = InstallReport::default();
    for warmed in results {
      if warmed {
        report.warmed += 1;
      } else {
        report.failed += 1;
      }
    }

    self.set_state(LifecycleState::Installed)?;
    info!(warmed = report.warmed, failed = report.failed, "installed");
    Ok(report)
  }

  async fn warm(&self, url: &Url) -> bool {
    let request = self.classifier.configured_request(url.clone());
    let category = self.classifier.classify(&request);
    let Some(store) = self.registry.store_for(category) else {
      warn!(url = %url, %category, "no store declared for warm-list entry");
      return false;
    };

    match fetch_with_timeout(self.network.as_ref(), request.clone(), self.timeout).await {
      Ok(response) if response.is_success() => match store.put_and_trim(&request.key(), &response) {
        Ok(_) => true,
        Err(e) => {
          warn!(url = %url, store = store.name(), error = %e, "failed to store warm-list entry");
          false
        }
      },
      Ok(response) => {
        warn!(url = %url, status = response.status, "warm-list fetch rejected");
        false
      }
      Err(e) => {
        warn!(url = %url, error = %e, "warm-list fetch failed");
        false
      }
    }
  }

  /// Delete every store whose version tag differs from the current build.
  ///
  /// Activating straight from `parsed` is allowed: the current generation may
  /// have been installed by an earlier process.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let previous = self.transition(
      &[LifecycleState::Parsed, LifecycleState::Installed],
      LifecycleState::Activating,
    )?;

    match self.cut_over() {
      Ok(report) => {
        self.set_state(LifecycleState::Active)?;
        info!(deleted = ?report.deleted, "activated");
        Ok(report)
      }
      Err(e) => {
        self.set_state(previous)?;
        Err(e)
      }
    }
  }

  fn cut_over(&self) -> Result<ActivationReport> {
    let version = self.registry.version();
    let mut report = ActivationReport::default();

    for name in self.registry.list_stores()? {
      match version_tag(&name) {
        Some(tag) if tag != version => {
          self.registry.delete_store(&name)?;
          info!(store = %name, "deleted superseded store");
          report.deleted.push(name);
        }
        _ => report.kept.push(name),
      }
    }

    self.registry.open_all()?;
    Ok(report)
  }

  /// Activate now if installed. Returns whether an activation happened.
  pub async fn skip_waiting(&self) -> Result<bool> {
    match self.state()? {
      LifecycleState::Installed => {
        self.activate().await?;
        Ok(true)
      }
      LifecycleState::Active => Ok(false),
      other => Err(eyre!("Cannot skip waiting while {}", other)),
    }
  }

  /// Mark this generation as replaced by a newer build.
  pub fn supersede(&self) -> Result<()> {
    self.transition(&[LifecycleState::Active], LifecycleState::Superseded)?;
    info!(version = self.registry.version(), "superseded");
    Ok(())
  }

  /// Entry count of every store present, declared or not.
  pub fn stats(&self) -> Result<BTreeMap<String, usize>> {
    self
      .registry
      .list_stores()?
      .into_iter()
      .map(|name| -> Result<(String, usize)> {
        let count = self.registry.open_store(&name)?.entry_count()?;
        Ok((name, count))
      })
      .collect()
  }

  /// Trim an existing store down to `soft_limit` entries, oldest first.
  pub fn purge(&self, name: &str, soft_limit: usize) -> Result<usize> {
    if !self.registry.list_stores()?.iter().any(|s| s == name) {
      return Err(eyre!("No such store: {}", name));
    }
    let removed = eviction::purge(&self.registry.open_store(name)?, soft_limit)?;
    info!(store = name, removed, soft_limit, "purged store");
    Ok(removed)
  }
}

impl<S: CacheStorage> Clone for Lifecycle<S> {
  fn clone(&self) -> Self {
    Self {
      registry: self.registry.clone(),
      network: Arc::clone(&self.network),
      classifier: self.classifier.clone(),
      warm_list: Arc::clone(&self.warm_list),
      timeout: self.timeout,
      state: Arc::clone(&self.state),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, SqliteStorage};
  use crate::classify::Category;
  use crate::http::mock::MockNetwork;
  use crate::http::{Request, Response};

  fn lifecycle<S: CacheStorage>(
    storage: Arc<S>,
    config: &Config,
    network: &MockNetwork,
  ) -> (Lifecycle<S>, CacheRegistry<S>) {
    let registry = CacheRegistry::new(storage, config);
    let lifecycle = Lifecycle::new(registry.clone(), Arc::new(network.clone()), config).unwrap();
    (lifecycle, registry)
  }

  #[tokio::test]
  async fn test_install_warms_and_tolerates_failures() {
    let network = MockNetwork::new();
    network.route("http://localhost:3000/", Response::new(200, "home"));
    network.fail("http://localhost:3000/offline.html");
    let config = Config::default();
    let (lifecycle, registry) = lifecycle(Arc::new(MemoryStorage::new()), &config, &network);

    let report = lifecycle.install().await.unwrap();
    assert_eq!(report, InstallReport { warmed: 1, failed: 1 });
    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Installed);

    let store = registry.store_for(Category::Page).unwrap();
    let home = Request::get(config.resolve("/").unwrap());
    assert_eq!(store.get(&home.key()).unwrap().unwrap().response.body, b"home");
    // Every declared store exists after install
    assert_eq!(registry.list_stores().unwrap().len(), config.stores.len());
  }

  #[tokio::test]
  async fn test_activation_cutover_by_version_tag() {
    let network = MockNetwork::new();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.open_store("static-v1").unwrap();
    storage.open_store("static-v2").unwrap();
    storage
      .put("static-v1", "GET http://localhost:3000/a.js", &Response::new(200, "old"))
      .unwrap();

    let config = Config {
      version: 2,
      ..Config::default()
    };
    let (lifecycle, registry) = lifecycle(storage, &config, &network);

    let report = lifecycle.activate().await.unwrap();
    assert_eq!(report.deleted, vec!["static-v1"]);
    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Active);

    let stores = registry.list_stores().unwrap();
    assert!(!stores.contains(&"static-v1".to_string()));
    assert!(stores.contains(&"static-v2".to_string()));
    assert!(stores.contains(&"static-cache-v2".to_string()));
  }

  #[tokio::test]
  async fn test_activation_keeps_untagged_stores() {
    let network = MockNetwork::new();
    let storage = Arc::new(MemoryStorage::new());
    storage.open_store("image-cache-v1").unwrap();
    storage.open_store("scratch").unwrap();

    let config = Config {
      version: 3,
      ..Config::default()
    };
    let (lifecycle, _) = lifecycle(storage, &config, &network);
    let report = lifecycle.activate().await.unwrap();
    assert_eq!(report.deleted, vec!["image-cache-v1"]);
    assert!(report.kept.contains(&"scratch".to_string()));
  }

  #[tokio::test]
  async fn test_state_machine() {
    let network = MockNetwork::new();
    network.set_online(false);
    let (lifecycle, _) = lifecycle(Arc::new(MemoryStorage::new()), &Config::default(), &network);

    assert!(lifecycle.skip_waiting().await.is_err());
    assert!(lifecycle.supersede().is_err());

    lifecycle.install().await.unwrap();
    assert!(lifecycle.install().await.is_err());

    assert!(lifecycle.skip_waiting().await.unwrap());
    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Active);
    assert!(!lifecycle.skip_waiting().await.unwrap());

    lifecycle.supersede().unwrap();
    assert_eq!(lifecycle.state().unwrap(), LifecycleState::Superseded);
    assert!(lifecycle.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_stats_and_purge() {
    let network = MockNetwork::new();
    let storage = Arc::new(MemoryStorage::new());
    let (lifecycle, registry) = lifecycle(storage, &Config::default(), &network);
    registry.open_all().unwrap();

    let api = registry.store_for(Category::Api).unwrap();
    for i in 0..5 {
      api.put(&format!("GET /api/{}", i), &Response::new(200, "x")).unwrap();
    }

    let stats = lifecycle.stats().unwrap();
    assert_eq!(stats.get("api-cache-v1"), Some(&5));
    assert_eq!(stats.get("page-cache-v1"), Some(&0));

    assert_eq!(lifecycle.purge("api-cache-v1", 2).unwrap(), 3);
    assert_eq!(api.list_keys().unwrap(), vec!["GET /api/3", "GET /api/4"]);
    assert!(lifecycle.purge("nope-cache-v1", 2).is_err());
  }
}
