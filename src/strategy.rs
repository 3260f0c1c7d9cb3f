use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classify::Category;

/// Retrieval/storage algorithm bound to a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Serve a fresh entry, otherwise fetch and store
  CacheFirst,
  /// Fetch and store, otherwise serve a fresh entry
  NetworkFirst,
  /// Serve a fresh entry immediately and refresh it in the background
  StaleWhileRevalidate,
  /// Always fetch, never persist
  NetworkOnly,
  /// Serve precomputed entries only; a miss is an error
  CacheOnly,
}

impl Strategy {
  /// Default binding for a category when the store table doesn't name one.
  pub fn default_for(category: Category) -> Self {
    match category {
      Category::StaticAsset | Category::Image | Category::Font | Category::Audio => {
        Self::CacheFirst
      }
      Category::Api => Self::NetworkFirst,
      Category::Page => Self::StaleWhileRevalidate,
      Category::External => Self::NetworkOnly,
    }
  }

  /// Whether the strategy reads or writes a store.
  pub fn uses_store(&self) -> bool {
    !matches!(self, Self::NetworkOnly)
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
      Self::NetworkOnly => "network-only",
      Self::CacheOnly => "cache-only",
    };
    f.write_str(s)
  }
}
