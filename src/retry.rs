//! Deferred retry queue for mutating requests that failed while offline.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::{fetch_with_timeout, Network, Request};

/// A captured request waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTask {
  /// Monotonic; replay order follows it
  pub id: i64,
  pub method: String,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub payload: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
}

impl RetryTask {
  pub fn to_request(&self) -> Request {
    Request {
      method: self.method.clone(),
      url: self.url.clone(),
      destination: Default::default(),
      headers: self.headers.clone(),
      body: self.payload.clone(),
    }
  }
}

/// Persistence for the retry queue.
pub trait RetryStorage: Send + Sync + 'static {
  /// Append a task; the store assigns its id and enqueue time.
  fn push_task(&self, request: &Request) -> Result<RetryTask>;

  /// All queued tasks, oldest first.
  fn pending_tasks(&self) -> Result<Vec<RetryTask>>;

  fn remove_task(&self, id: i64) -> Result<()>;
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub replayed: usize,
  pub failed: usize,
  pub remaining: usize,
}

pub struct RetryQueue<S: RetryStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  timeout: Duration,
  /// Serializes drains so a task is never replayed twice concurrently
  draining: Arc<tokio::sync::Mutex<()>>,
}

impl<S: RetryStorage> RetryQueue<S> {
  pub fn new(storage: Arc<S>, network: Arc<dyn Network>, timeout: Duration) -> Self {
    Self {
      storage,
      network,
      timeout,
      draining: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn enqueue(&self, request: &Request) -> Result<RetryTask> {
    let task = self.storage.push_task(request)?;
    info!(id = task.id, method = %task.method, url = %task.url, "queued request for replay");
    Ok(task)
  }

  pub fn pending(&self) -> Result<Vec<RetryTask>> {
    self.storage.pending_tasks()
  }

  /// Replay every queued task in FIFO order.
  ///
  /// A task is removed only after its replay returns a non-error status. A
  /// failing task stays queued and the drain moves on to the next one.
  pub async fn drain_and_replay(&self) -> Result<DrainReport> {
    let _guard = self.draining.lock().await;
    let tasks = self.storage.pending_tasks()?;
    let mut report = DrainReport::default();

    for task in tasks {
      match fetch_with_timeout(self.network.as_ref(), task.to_request(), self.timeout).await {
        Ok(response) if !response.is_error() => match self.storage.remove_task(task.id) {
          Ok(()) => {
            report.replayed += 1;
            debug!(id = task.id, status = response.status, "replayed queued request");
          }
          Err(e) => {
            report.failed += 1;
            warn!(id = task.id, error = %e, "replayed but could not dequeue, keeping task");
          }
        },
        Ok(response) => {
          report.failed += 1;
          warn!(id = task.id, status = response.status, "replay rejected, keeping task");
        }
        Err(e) => {
          report.failed += 1;
          warn!(id = task.id, error = %e, "replay failed, keeping task");
        }
      }
    }

    report.remaining = self.storage.pending_tasks()?.len();
    info!(
      replayed = report.replayed,
      failed = report.failed,
      remaining = report.remaining,
      "retry queue drained"
    );
    Ok(report)
  }
}

impl<S: RetryStorage> Clone for RetryQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      timeout: self.timeout,
      draining: Arc::clone(&self.draining),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, SqliteStorage};
  use crate::http::mock::MockNetwork;
  use crate::http::Response;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicBool, Ordering};

  fn post(path: &str, body: &str) -> Request {
    let url = Url::parse("http://localhost:3000").unwrap().join(path).unwrap();
    Request::new("POST", url)
      .with_header("content-type", "application/json")
      .with_body(body.as_bytes().to_vec())
  }

  fn queue(network: &MockNetwork) -> RetryQueue<MemoryStorage> {
    RetryQueue::new(
      Arc::new(MemoryStorage::new()),
      Arc::new(network.clone()),
      Duration::from_secs(1),
    )
  }

  #[tokio::test]
  async fn test_partial_drain_keeps_only_failed_task() {
    let network = MockNetwork::new();
    for path in ["/api/one", "/api/two", "/api/three"] {
      network.route(
        &format!("http://localhost:3000{}", path),
        Response::new(201, "ok"),
      );
    }
    network.fail("http://localhost:3000/api/two");

    let queue = queue(&network);
    queue.enqueue(&post("/api/one", "1")).unwrap();
    queue.enqueue(&post("/api/two", "2")).unwrap();
    queue.enqueue(&post("/api/three", "3")).unwrap();

    let report = queue.drain_and_replay().await.unwrap();
    assert_eq!(
      report,
      DrainReport {
        replayed: 2,
        failed: 1,
        remaining: 1
      }
    );

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url.path(), "/api/two");
    assert_eq!(pending[0].payload.as_deref(), Some(&b"2"[..]));
    // Task 3 was attempted even though task 2 failed before it
    assert_eq!(network.calls("http://localhost:3000/api/three"), 1);
  }

  #[tokio::test]
  async fn test_error_status_keeps_task() {
    let network = MockNetwork::new();
    network.route(
      "http://localhost:3000/api/contact",
      Response::new(500, "boom"),
    );

    let queue = queue(&network);
    queue.enqueue(&post("/api/contact", "{}")).unwrap();

    let report = queue.drain_and_replay().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(queue.pending().unwrap().len(), 1);

    network.route(
      "http://localhost:3000/api/contact",
      Response::new(200, "ok"),
    );
    let report = queue.drain_and_replay().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(queue.pending().unwrap().is_empty());
  }

  /// Queue whose first dequeue fails.
  struct StickyStorage {
    inner: MemoryStorage,
    fail_next_remove: AtomicBool,
  }

  impl RetryStorage for StickyStorage {
    fn push_task(&self, request: &Request) -> Result<RetryTask> {
      self.inner.push_task(request)
    }

    fn pending_tasks(&self) -> Result<Vec<RetryTask>> {
      self.inner.pending_tasks()
    }

    fn remove_task(&self, id: i64) -> Result<()> {
      if self.fail_next_remove.swap(false, Ordering::SeqCst) {
        return Err(eyre!("database is locked"));
      }
      self.inner.remove_task(id)
    }
  }

  async fn assert_replays_in_enqueue_order<S: RetryStorage>(storage: S) {
    let network = MockNetwork::new();
    let paths = ["/api/a", "/api/b", "/api/c"];
    for path in paths {
      network.route(&format!("http://localhost:3000{}", path), Response::new(200, "ok"));
    }
    let queue = RetryQueue::new(Arc::new(storage), Arc::new(network.clone()), Duration::from_secs(1));

    let mut ids = Vec::new();
    for path in paths {
      ids.push(queue.enqueue(&post(path, path)).unwrap().id);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    let pending = queue.pending().unwrap();
    assert_eq!(pending.iter().map(|t| t.id).collect::<Vec<_>>(), ids);
    assert_eq!(pending[0].to_request().method, "POST");
    assert_eq!(pending[0].to_request().header("content-type"), Some("application/json"));

    let report = queue.drain_and_replay().await.unwrap();
    assert_eq!(report.replayed, 3);
    assert_eq!(
      network.history(),
      paths
        .iter()
        .map(|p| format!("http://localhost:3000{}", p))
        .collect::<Vec<_>>()
    );
  }

  #[tokio::test]
  async fn test_replay_is_fifo() {
    assert_replays_in_enqueue_order(MemoryStorage::new()).await;
    assert_replays_in_enqueue_order(SqliteStorage::open_in_memory().unwrap()).await;
  }

  #[tokio::test]
  async fn test_dequeue_failure_does_not_abort_drain() {
    let network = MockNetwork::new();
    for path in ["/api/one", "/api/two", "/api/three"] {
      network.route(&format!("http://localhost:3000{}", path), Response::new(200, "ok"));
    }
    let storage = StickyStorage {
      inner: MemoryStorage::new(),
      fail_next_remove: AtomicBool::new(true),
    };
    let queue = RetryQueue::new(Arc::new(storage), Arc::new(network.clone()), Duration::from_secs(1));
    queue.enqueue(&post("/api/one", "1")).unwrap();
    queue.enqueue(&post("/api/two", "2")).unwrap();
    queue.enqueue(&post("/api/three", "3")).unwrap();

    let report = queue.drain_and_replay().await.unwrap();
    assert_eq!(
      report,
      DrainReport {
        replayed: 2,
        failed: 1,
        remaining: 1
      }
    );
    assert_eq!(network.history().len(), 3);
    assert_eq!(queue.pending().unwrap()[0].url.path(), "/api/one");
  }
}
