//! Strategy dispatch: serves a classified request from the stores and/or the network.
//!
//! Network fetches run in spawned tasks. A caller that goes away does not
//! cancel its fetch; the task completes and still warms the store. Concurrent
//! requests for the same key join the one in-flight task instead of fetching
//! again.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{body_digest, CacheEntry, CacheRegistry, CacheStorage, StoreHandle};
use crate::classify::Category;
use crate::fallback::FallbackChain;
use crate::http::{fetch_with_timeout, FetchError, Network, Request, Response, Source};
use crate::strategy::Strategy;

type SharedFetch = Shared<BoxFuture<'static, Result<Response, FetchError>>>;

/// A response together with where it came from.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub response: Response,
  pub source: Source,
  pub category: Category,
}

impl Delivery {
  fn new(response: Response, source: Source, category: Category) -> Self {
    Self {
      response,
      source,
      category,
    }
  }
}

/// The only hard failure a dispatch can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
  #[error("{key} is not in cache-only store {store}")]
  CacheOnlyMiss { key: String, store: String },
}

pub struct Dispatcher<S: CacheStorage> {
  registry: CacheRegistry<S>,
  network: Arc<dyn Network>,
  fallback: FallbackChain<S>,
  timeout: Duration,
  in_flight: Arc<Mutex<HashMap<String, SharedFetch>>>,
}

impl<S: CacheStorage> Dispatcher<S> {
  pub fn new(
    registry: CacheRegistry<S>,
    network: Arc<dyn Network>,
    fallback: FallbackChain<S>,
    timeout: Duration,
  ) -> Self {
    Self {
      registry,
      network,
      fallback,
      timeout,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Serve `request` with the strategy bound to `category`.
  ///
  /// Every strategy resolves to a response except cache-only, which reports a miss.
  pub async fn dispatch(
    &self,
    request: &Request,
    category: Category,
  ) -> Result<Delivery, DispatchError> {
    let strategy = self.registry.strategy_for(category);
    let store = match self.registry.store_for(category) {
      Some(store) if strategy.uses_store() => store,
      _ => return Ok(self.network_only(request, category).await),
    };

    debug!(key = %request.key(), %category, %strategy, store = store.name(), "dispatching");

    match strategy {
      Strategy::CacheFirst => Ok(self.cache_first(request, category, store).await),
      Strategy::NetworkFirst => Ok(self.network_first(request, category, store).await),
      Strategy::StaleWhileRevalidate => {
        Ok(self.stale_while_revalidate(request, category, store).await)
      }
      Strategy::CacheOnly => self.cache_only(request, category, store).await,
      Strategy::NetworkOnly => Ok(self.network_only(request, category).await),
    }
  }

  async fn cache_first(
    &self,
    request: &Request,
    category: Category,
    store: StoreHandle<S>,
  ) -> Delivery {
    let key = request.key();
    match store.get_fresh(&key) {
      Ok(Some(entry)) => return Delivery::new(entry.response, Source::Cache, category),
      Ok(None) => {}
      Err(e) => return self.degrade(request, category, &store, e).await,
    }

    match self.fetch(request, Some(store)).await {
      Ok(response) => Delivery::new(response, Source::Network, category),
      Err(e) => {
        debug!(key = %key, error = %e, "cache miss and network failed");
        self.fall_back(request, category)
      }
    }
  }

  async fn network_first(
    &self,
    request: &Request,
    category: Category,
    store: StoreHandle<S>,
  ) -> Delivery {
    let key = request.key();
    let fetched = self.fetch(request, Some(store.clone())).await;

    if let Ok(response) = &fetched {
      if response.is_success() {
        return Delivery::new(response.clone(), Source::Network, category);
      }
    }

    let cached = match store.get_fresh(&key) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(store = store.name(), key = %key, error = %e, "store read failed");
        None
      }
    };

    match (fetched, cached) {
      (_, Some(entry)) => Delivery::new(entry.response, Source::Cache, category),
      // An error status with nothing cached is still the best answer available
      (Ok(response), None) => Delivery::new(response, Source::Network, category),
      (Err(e), None) => {
        debug!(key = %key, error = %e, "network failed with nothing cached");
        self.fall_back(request, category)
      }
    }
  }

  async fn stale_while_revalidate(
    &self,
    request: &Request,
    category: Category,
    store: StoreHandle<S>,
  ) -> Delivery {
    let key = request.key();
    match store.get_fresh(&key) {
      Ok(Some(entry)) => {
        self.revalidate_in_background(request, store, entry.clone());
        Delivery::new(entry.response, Source::Cache, category)
      }
      Ok(None) => match self.fetch(request, Some(store)).await {
        Ok(response) => Delivery::new(response, Source::Network, category),
        Err(e) => {
          debug!(key = %key, error = %e, "no cached page and network failed");
          self.fall_back(request, category)
        }
      },
      Err(e) => self.degrade(request, category, &store, e).await,
    }
  }

  async fn cache_only(
    &self,
    request: &Request,
    category: Category,
    store: StoreHandle<S>,
  ) -> Result<Delivery, DispatchError> {
    let key = request.key();
    match store.get(&key) {
      Ok(Some(entry)) => Ok(Delivery::new(entry.response, Source::Cache, category)),
      Ok(None) => Err(DispatchError::CacheOnlyMiss {
        key,
        store: store.name().to_string(),
      }),
      Err(e) => Ok(self.degrade(request, category, &store, e).await),
    }
  }

  async fn network_only(&self, request: &Request, category: Category) -> Delivery {
    match self.fetch(request, None).await {
      Ok(response) => Delivery::new(response, Source::Network, category),
      Err(e) => {
        debug!(key = %request.key(), error = %e, "network-only fetch failed");
        self.fall_back(request, category)
      }
    }
  }

  /// Store I/O failed: answer this one request without the store.
  async fn degrade(
    &self,
    request: &Request,
    category: Category,
    store: &StoreHandle<S>,
    error: color_eyre::Report,
  ) -> Delivery {
    warn!(store = store.name(), key = %request.key(), error = %error, "store read failed, going network-only");
    self.network_only(request, category).await
  }

  fn fall_back(&self, request: &Request, category: Category) -> Delivery {
    let response = self.fallback.resolve(category, &request.url);
    Delivery::new(response, Source::Fallback, category)
  }

  /// Refresh a served entry without making the caller wait. Failures are logged and dropped.
  fn revalidate_in_background(&self, request: &Request, store: StoreHandle<S>, served: CacheEntry) {
    let refresh = self.fetch(request, Some(store));
    let CacheEntry { key, digest, .. } = served;
    tokio::spawn(async move {
      match refresh.await {
        Ok(response) if response.is_success() => {
          if body_digest(&response.body) == digest {
            debug!(key = %key, "background refresh: unchanged");
          } else {
            debug!(key = %key, "background refresh: updated");
          }
        }
        Ok(response) => debug!(key = %key, status = response.status, "background refresh not stored"),
        Err(e) => debug!(key = %key, error = %e, "background refresh failed"),
      }
    });
  }

  /// Fetch `request`, joining an in-flight fetch for the same key and
  /// destination store if one exists.
  ///
  /// With a store, a 2xx response is written to it (and the store trimmed)
  /// before the fetch resolves.
  fn fetch(&self, request: &Request, store: Option<StoreHandle<S>>) -> SharedFetch {
    let key = request.key();
    let flight = match &store {
      Some(store) => format!("{} {}", store.name(), key),
      None => format!("- {}", key),
    };
    let mut in_flight = lock(&self.in_flight);
    if let Some(pending) = in_flight.get(&flight) {
      debug!(key = %key, "joining in-flight fetch");
      return pending.clone();
    }

    let network = Arc::clone(&self.network);
    let table = Arc::clone(&self.in_flight);
    let timeout = self.timeout;
    let request = request.clone();
    let task_key = key;
    let task_flight = flight.clone();

    // The table lock is held until the entry is inserted, so the task can't
    // remove its entry before it exists.
    let task = tokio::spawn(async move {
      let result = fetch_with_timeout(network.as_ref(), request, timeout).await;
      if let (Ok(response), Some(store)) = (&result, &store) {
        if response.is_success() {
          if let Err(e) = store.put_and_trim(&task_key, response) {
            warn!(store = store.name(), key = %task_key, error = %e, "failed to store response");
          }
        }
      }
      lock(&table).remove(&task_flight);
      result
    });

    let shared = async move {
      task
        .await
        .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string())))
    }
    .boxed()
    .shared();

    in_flight.insert(flight, shared.clone());
    shared
  }
}

impl<S: CacheStorage> Clone for Dispatcher<S> {
  fn clone(&self) -> Self {
    Self {
      registry: self.registry.clone(),
      network: Arc::clone(&self.network),
      fallback: self.fallback.clone(),
      timeout: self.timeout,
      in_flight: Arc::clone(&self.in_flight),
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  // The table holds no invariants a panicking holder could break
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
