//! Substitute responses for when neither the cache nor the network can answer.

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheRegistry, CacheStorage};
use crate::classify::{Category, Classifier};
use crate::config::Config;
use crate::http::Response;

/// Marks every response produced here, with the step that produced it.
pub const FALLBACK_HEADER: &str = "x-cachegate-fallback";

/// How many times a substitute may itself be substituted.
const MAX_HOPS: usize = 1;

const OFFLINE_PAGE: &str = "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You're offline</h1><p>This page isn't available offline yet. Reconnect and try again.</p></body></html>\n";

const PLACEHOLDER_SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"200\" height=\"200\" viewBox=\"0 0 200 200\">\
<rect width=\"200\" height=\"200\" fill=\"#e5e7eb\"/>\
<text x=\"100\" y=\"105\" font-family=\"sans-serif\" font-size=\"14\" text-anchor=\"middle\" fill=\"#6b7280\">offline</text></svg>";

pub struct FallbackChain<S: CacheStorage> {
  registry: CacheRegistry<S>,
  classifier: Classifier,
  mapping: Arc<HashMap<Url, Url>>,
  offline_page: Option<Url>,
  placeholder_image: Option<Url>,
}

impl<S: CacheStorage> FallbackChain<S> {
  pub fn new(registry: CacheRegistry<S>, config: &Config) -> Result<Self> {
    let mut mapping = HashMap::new();
    for rule in &config.fallbacks {
      mapping.insert(config.resolve(&rule.primary)?, config.resolve(&rule.substitute)?);
    }

    Ok(Self {
      registry,
      classifier: config.classifier(),
      mapping: Arc::new(mapping),
      offline_page: config.offline_page.as_deref().map(|p| config.resolve(p)).transpose()?,
      placeholder_image: config
        .placeholder_image
        .as_deref()
        .map(|p| config.resolve(p))
        .transpose()?,
    })
  }

  /// Always produces a response:
  /// 1. the mapped substitute, served from its own store (one recursive hop at most)
  /// 2. the category default
  /// 3. a synthetic 503
  pub fn resolve(&self, category: Category, original: &Url) -> Response {
    if let Some(response) = self.mapped_substitute(original) {
      return response.with_header(FALLBACK_HEADER, "substitute");
    }

    if let Some(response) = self.category_default(category) {
      return response;
    }

    debug!(url = %original, %category, "no fallback available");
    Response::new(503, "Service Unavailable: offline and no cached copy")
      .with_header("content-type", "text/plain; charset=utf-8")
      .with_header(FALLBACK_HEADER, "error")
  }

  fn mapped_substitute(&self, original: &Url) -> Option<Response> {
    let mut current = original;
    for _ in 0..=MAX_HOPS {
      let substitute = self.mapping.get(current)?;
      if let Some(response) = self.serve_cached(substitute) {
        debug!(url = %original, substitute = %substitute, "serving mapped substitute");
        return Some(response);
      }
      current = substitute;
    }
    None
  }

  fn category_default(&self, category: Category) -> Option<Response> {
    match category {
      Category::Page => Some(
        self
          .offline_page
          .as_ref()
          .and_then(|url| self.serve_cached(url))
          .unwrap_or_else(|| {
            Response::new(200, OFFLINE_PAGE).with_header("content-type", "text/html; charset=utf-8")
          })
          .with_header(FALLBACK_HEADER, "offline-page"),
      ),
      Category::Image => Some(
        self
          .placeholder_image
          .as_ref()
          .and_then(|url| self.serve_cached(url))
          .unwrap_or_else(|| Response::new(200, PLACEHOLDER_SVG).with_header("content-type", "image/svg+xml"))
          .with_header(FALLBACK_HEADER, "placeholder"),
      ),
      Category::Audio | Category::Font | Category::External => {
        Some(Response::empty().with_header(FALLBACK_HEADER, "empty"))
      }
      Category::Api | Category::StaticAsset => None,
    }
  }

  /// Read a fresh copy of `url` from whichever store its category maps to.
  fn serve_cached(&self, url: &Url) -> Option<Response> {
    let request = self.classifier.configured_request(url.clone());
    let store = self.registry.store_for(self.classifier.classify(&request))?;
    match store.get_fresh(&request.key()) {
      Ok(entry) => entry.map(|e| e.response),
      Err(e) => {
        warn!(store = store.name(), url = %url, error = %e, "fallback lookup failed");
        None
      }
    }
  }
}

impl<S: CacheStorage> Clone for FallbackChain<S> {
  fn clone(&self) -> Self {
    Self {
      registry: self.registry.clone(),
      classifier: self.classifier.clone(),
      mapping: Arc::clone(&self.mapping),
      offline_page: self.offline_page.clone(),
      placeholder_image: self.placeholder_image.clone(),
    }
  }
}
