//! The interception point: every outbound request goes through `Engine::handle`.

use color_eyre::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheRegistry, CacheStorage};
use crate::classify::{Category, Classifier};
use crate::config::Config;
use crate::control::{ControlMessage, ControlReply};
use crate::dispatcher::{Delivery, DispatchError, Dispatcher};
use crate::fallback::FallbackChain;
use crate::http::{fetch_with_timeout, Network, Request, Response, Source};
use crate::lifecycle::{ActivationReport, InstallReport, Lifecycle};
use crate::retry::{DrainReport, RetryQueue, RetryStorage};
use crate::strategy::Strategy;

/// Caching proxy over a store backend and a network.
///
/// Holds its collaborators explicitly; several engines can coexist.
pub struct Engine<S: CacheStorage + RetryStorage> {
  config: Arc<Config>,
  classifier: Classifier,
  registry: CacheRegistry<S>,
  network: Arc<dyn Network>,
  dispatcher: Dispatcher<S>,
  lifecycle: Lifecycle<S>,
  retry: RetryQueue<S>,
}

impl<S: CacheStorage + RetryStorage> Engine<S> {
  pub fn new(config: Config, storage: Arc<S>, network: Arc<dyn Network>) -> Result<Self> {
    config.validate()?;

    let registry = CacheRegistry::new(Arc::clone(&storage), &config);
    let fallback = FallbackChain::new(registry.clone(), &config)?;
    let dispatcher = Dispatcher::new(
      registry.clone(),
      Arc::clone(&network),
      fallback,
      config.fetch_timeout(),
    );
    let lifecycle = Lifecycle::new(registry.clone(), Arc::clone(&network), &config)?;
    let retry = RetryQueue::new(storage, Arc::clone(&network), config.fetch_timeout());

    Ok(Self {
      classifier: config.classifier(),
      config: Arc::new(config),
      registry,
      network,
      dispatcher,
      lifecycle,
      retry,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn lifecycle(&self) -> &Lifecycle<S> {
    &self.lifecycle
  }

  pub fn retry_queue(&self) -> &RetryQueue<S> {
    &self.retry
  }

  pub fn classify(&self, request: &Request) -> Category {
    self.classifier.classify(request)
  }

  pub fn strategy_for(&self, category: Category) -> Strategy {
    self.registry.strategy_for(category)
  }

  /// Serve one intercepted request.
  ///
  /// Always yields a response, possibly a substitute, except when a
  /// cache-only store misses.
  pub async fn handle(&self, request: Request) -> Result<Delivery, DispatchError> {
    let category = self.classifier.classify(&request);
    debug!(method = %request.method, url = %request.url, %category, "intercepted");

    if request.is_mutating() {
      return Ok(self.forward_mutation(&request, category).await);
    }

    self.dispatcher.dispatch(&request, category).await
  }

  /// Pass a mutating request through; if the network is unreachable, queue it for replay.
  async fn forward_mutation(&self, request: &Request, category: Category) -> Delivery {
    match fetch_with_timeout(self.network.as_ref(), request.clone(), self.config.fetch_timeout()).await {
      Ok(response) => Delivery {
        response,
        source: Source::Network,
        category,
      },
      Err(e) => {
        debug!(key = %request.key(), error = %e, "mutating request failed");
        let response = match self.retry.enqueue(request) {
          Ok(task) => Response::new(
            202,
            format!(
              r#"{{"queued":true,"id":{},"message":"Saved offline; will be sent when the connection returns"}}"#,
              task.id
            ),
          )
          .with_header("content-type", "application/json"),
          Err(e) => {
            warn!(key = %request.key(), error = %e, "failed to queue request");
            Response::new(503, r#"{"queued":false,"message":"Offline"}"#)
              .with_header("content-type", "application/json")
          }
        };
        Delivery {
          response,
          source: Source::Queued,
          category,
        }
      }
    }
  }

  /// Install, then activate immediately when `skip_waiting` is configured.
  pub async fn install(&self) -> Result<InstallReport> {
    let report = self.lifecycle.install().await?;
    if self.config.skip_waiting {
      self.lifecycle.activate().await?;
    }
    Ok(report)
  }

  pub async fn activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate().await
  }

  /// Connectivity came back: replay whatever was queued while offline.
  pub async fn connectivity_restored(&self) -> Result<DrainReport> {
    info!("connectivity restored, draining retry queue");
    self.retry.drain_and_replay().await
  }

  pub fn stats(&self) -> Result<BTreeMap<String, usize>> {
    self.lifecycle.stats()
  }

  /// Remove every entry of a store. Declared stores are recreated empty.
  pub fn clean_store(&self, name: &str) -> Result<bool> {
    let existed = self.registry.delete_store(name)?;
    if self.registry.specs().iter().any(|spec| spec.name == name) {
      self.registry.open_store(name)?;
    }
    info!(store = name, existed, "cleaned store");
    Ok(existed)
  }

  /// Answer a control-channel message. Failures become `ControlReply::Error`.
  pub async fn control(&self, message: ControlMessage) -> ControlReply {
    let reply = match message {
      ControlMessage::SkipWaiting => self.lifecycle.skip_waiting().await.and_then(|activated| {
        Ok(ControlReply::SkipWaiting {
          activated,
          state: self.lifecycle.state()?,
        })
      }),
      ControlMessage::GetCacheStats => self
        .stats()
        .map(|stores| ControlReply::CacheStats { stores }),
      ControlMessage::CleanStore { name } => self
        .clean_store(&name)
        .map(|existed| ControlReply::StoreCleaned { name, existed }),
      ControlMessage::PurgeStore { name, soft_limit } => self
        .lifecycle
        .purge(&name, soft_limit)
        .map(|removed| ControlReply::StorePurged { name, removed }),
      ControlMessage::ReplayQueue => self
        .connectivity_restored()
        .await
        .map(|report| ControlReply::QueueReplayed {
          replayed: report.replayed,
          failed: report.failed,
          remaining: report.remaining,
        }),
    };

    reply.unwrap_or_else(|e| ControlReply::Error {
      message: e.to_string(),
    })
  }
}
