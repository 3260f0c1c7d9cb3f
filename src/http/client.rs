use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::time::Duration;

use super::types::{Request, Response};

/// Transport-level failure. HTTP error statuses are responses, not errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("network error: {0}")]
  Transport(String),

  #[error("fetch task aborted: {0}")]
  Aborted(String),
}

/// The outbound side of the engine: origin and cross-origin servers.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>>;
}

/// Run a fetch with an upper bound on how long it may take.
pub async fn fetch_with_timeout(
  network: &dyn Network,
  request: Request,
  limit: Duration,
) -> Result<Response, FetchError> {
  match tokio::time::timeout(limit, network.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(FetchError::Timeout(limit)),
  }
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  timeout: Duration,
}

impl HttpClient {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("cachegate/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, timeout })
  }
}

impl Network for HttpClient {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>> {
    let client = self.client.clone();
    let timeout = self.timeout;

    async move {
      let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| FetchError::Transport(format!("invalid method {}: {}", request.method, e)))?;

      let mut builder = client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
          FetchError::Timeout(timeout)
        } else {
          FetchError::Transport(e.to_string())
        }
      })?;

      let status = response.status().as_u16();
      let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| FetchError::Transport(format!("failed to read body: {}", e)))?;

      Ok(Response {
        status,
        headers,
        body: body.to_vec(),
      })
    }
    .boxed()
  }
}

/// Network that is never reachable. Used to exercise the offline paths from the CLI.
pub struct OfflineNetwork;

impl Network for OfflineNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>> {
    let url = request.url.to_string();
    async move { Err(FetchError::Transport(format!("offline: {}", url))) }.boxed()
  }
}
