use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Declared resource type of a request (what the initiator intends to do with it)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Script,
  Style,
  Image,
  Font,
  Audio,
  #[default]
  Empty,
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "image" => Ok(Self::Image),
      "font" => Ok(Self::Font),
      "audio" => Ok(Self::Audio),
      "" | "empty" => Ok(Self::Empty),
      other => Err(format!("unknown destination '{}'", other)),
    }
  }
}

/// An intercepted outbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
  /// Upper-case HTTP method
  pub method: String,
  pub url: Url,
  #[serde(default)]
  pub destination: Destination,
  /// Header names are stored lower-case
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      destination: Destination::Empty,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Identity of the request inside a store: method plus absolute URL.
  pub fn key(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Methods whose failure offline should be captured for later replay.
  pub fn is_mutating(&self) -> bool {
    matches!(self.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
  }
}

/// A response, either fresh from the network, read back from a store, or synthesized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  /// Neutral response with no payload.
  pub fn empty() -> Self {
    Self::new(204, Vec::new())
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// 2xx status
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// 4xx or 5xx status
  pub fn is_error(&self) -> bool {
    self.status >= 400
  }
}

/// Where a delivered response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
  /// Fresh from the network
  Network,
  /// Served from a store
  Cache,
  /// Substitute produced by the fallback chain
  Fallback,
  /// Mutating request captured by the retry queue
  Queued,
}

impl fmt::Display for Source {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Fallback => "fallback",
      Self::Queued => "queued",
    };
    f.write_str(s)
  }
}
