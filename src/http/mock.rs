//! Scriptable in-memory network for tests.

use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::client::{FetchError, Network};
use super::types::{Request, Response};

#[derive(Default)]
struct MockState {
  online: bool,
  routes: HashMap<String, Response>,
  failing: HashSet<String>,
  calls: HashMap<String, usize>,
  /// Every fetched URL, in call order
  history: Vec<String>,
  delay: Option<Duration>,
}

/// Clones share state, so a test can keep a handle after giving one to the engine.
#[derive(Clone)]
pub struct MockNetwork {
  state: Arc<Mutex<MockState>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(MockState {
        online: true,
        ..Default::default()
      })),
    }
  }

  pub fn with_delay(self, delay: Duration) -> Self {
    self.state.lock().unwrap().delay = Some(delay);
    self
  }

  pub fn route(&self, url: &str, response: Response) {
    self
      .state
      .lock()
      .unwrap()
      .routes
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.state.lock().unwrap().online = online;
  }

  /// Make a single URL fail at the transport level.
  pub fn fail(&self, url: &str) {
    self.state.lock().unwrap().failing.insert(url.to_string());
  }

  pub fn calls(&self, url: &str) -> usize {
    self
      .state
      .lock()
      .unwrap()
      .calls
      .get(url)
      .copied()
      .unwrap_or(0)
  }

  pub fn history(&self) -> Vec<String> {
    self.state.lock().unwrap().history.clone()
  }
}

impl Network for MockNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>> {
    let state = Arc::clone(&self.state);
    let url = request.url.to_string();

    async move {
      let delay = state.lock().unwrap().delay;
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }

      let mut guard = state.lock().unwrap();
      *guard.calls.entry(url.clone()).or_insert(0) += 1;
      guard.history.push(url.clone());

      if !guard.online || guard.failing.contains(&url) {
        return Err(FetchError::Transport(format!("unreachable: {}", url)));
      }

      Ok(
        guard
          .routes
          .get(&url)
          .cloned()
          .unwrap_or_else(|| Response::new(404, "not found")),
      )
    }
    .boxed()
  }
}
