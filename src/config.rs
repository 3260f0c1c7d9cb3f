use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::classify::{Category, Classifier};
use crate::strategy::Strategy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the engine serves; everything else is cross-origin
  pub origin: Url,
  /// Build identifier embedded in every store name
  #[serde(default = "default_version")]
  pub version: u32,
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Upper bound on every network fetch before falling back
  #[serde(default = "default_fetch_timeout_ms")]
  pub fetch_timeout_ms: u64,
  /// Activate immediately after install instead of waiting for SKIP_WAITING
  #[serde(default)]
  pub skip_waiting: bool,
  #[serde(default = "default_stores")]
  pub stores: Vec<StoreConfig>,
  /// Paths fetched and stored at install time
  #[serde(default)]
  pub warm_list: Vec<String>,
  #[serde(default)]
  pub fallbacks: Vec<FallbackRule>,
  pub offline_page: Option<String>,
  pub placeholder_image: Option<String>,
  /// SQLite database path (default: $XDG_DATA_HOME/cachegate/cache.db)
  pub database: Option<PathBuf>,
}

/// One entry of the store table
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
  pub category: Category,
  pub max_entries: usize,
  /// Entries older than this are misses at read time; unset means no expiry
  pub max_age_seconds: Option<u64>,
  pub strategy: Option<Strategy>,
}

impl StoreConfig {
  fn new(category: Category, max_entries: usize, max_age_seconds: u64) -> Self {
    Self {
      category,
      max_entries,
      max_age_seconds: Some(max_age_seconds),
      strategy: None,
    }
  }

  pub fn strategy(&self) -> Strategy {
    self
      .strategy
      .unwrap_or_else(|| Strategy::default_for(self.category))
  }
}

/// Substitute served for `primary` when cache and network both fail
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FallbackRule {
  pub primary: String,
  pub substitute: String,
}

fn default_version() -> u32 {
  1
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_fetch_timeout_ms() -> u64 {
  5_000
}

const DAY: u64 = 24 * 60 * 60;

fn default_stores() -> Vec<StoreConfig> {
  vec![
    StoreConfig::new(Category::StaticAsset, 200, 30 * DAY),
    StoreConfig::new(Category::Page, 50, DAY),
    StoreConfig::new(Category::Image, 100, 30 * DAY),
    StoreConfig::new(Category::Font, 30, 365 * DAY),
    StoreConfig::new(Category::Api, 100, 5 * 60),
    StoreConfig::new(Category::Audio, 20, 7 * DAY),
  ]
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:3000").expect("static origin is a valid URL"),
      version: default_version(),
      api_prefix: default_api_prefix(),
      fetch_timeout_ms: default_fetch_timeout_ms(),
      skip_waiting: false,
      stores: default_stores(),
      warm_list: vec!["/".to_string(), "/offline.html".to_string()],
      fallbacks: Vec::new(),
      offline_page: Some("/offline.html".to_string()),
      placeholder_image: None,
      database: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cachegate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cachegate/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        tracing::info!("no configuration file found, using built-in defaults");
        Self::default()
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("cachegate.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cachegate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Reject configurations the engine can't honor.
  ///
  /// Every store the configuration refers to (through the warm-list, fallback
  /// substitutes or category defaults) must be declared in the store table.
  pub fn validate(&self) -> Result<()> {
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/': {}", self.api_prefix));
    }
    if self.fetch_timeout_ms == 0 {
      return Err(eyre!("fetch_timeout_ms must be greater than zero"));
    }

    let mut seen = BTreeSet::new();
    for store in &self.stores {
      if !seen.insert(store.category) {
        return Err(eyre!("store for category {} declared twice", store.category));
      }
      if store.category == Category::External {
        return Err(eyre!("external requests are never persisted; remove the external store"));
      }
      if store.max_entries == 0 {
        return Err(eyre!("store {} must allow at least one entry", store.category));
      }
      if !store.strategy().uses_store() {
        return Err(eyre!(
          "store {} is declared with strategy {}, which never uses it",
          store.category,
          store.strategy()
        ));
      }
    }

    let classifier = self.classifier();
    let mut referenced: Vec<(&str, &str)> = self
      .warm_list
      .iter()
      .map(|p| ("warm_list", p.as_str()))
      .collect();
    referenced.extend(
      self
        .fallbacks
        .iter()
        .map(|rule| ("fallback substitute", rule.substitute.as_str())),
    );
    referenced.extend(self.offline_page.iter().map(|p| ("offline_page", p.as_str())));
    referenced.extend(
      self
        .placeholder_image
        .iter()
        .map(|p| ("placeholder_image", p.as_str())),
    );

    for (what, path) in referenced {
      let url = self.resolve(path)?;
      let category = classifier.classify(&classifier.configured_request(url));
      if !seen.contains(&category) {
        return Err(eyre!(
          "{} {} is stored in the {} store, which is not declared",
          what,
          path,
          category
        ));
      }
    }

    for rule in &self.fallbacks {
      self.resolve(&rule.primary)?;
    }

    Ok(())
  }

  /// Resolve a configured path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}' relative to {}: {}", path, self.origin, e))
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.fetch_timeout_ms)
  }

  pub fn classifier(&self) -> Classifier {
    Classifier::new(&self.origin, &self.api_prefix)
  }

  /// Get the database path, honoring the configured override.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cachegate").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.stores.len(), 6);
  }

  #[test]
  fn test_parse_yaml_with_defaults() {
    let config = Config::from_yaml(
      r#"
origin: https://example.com
version: 4
stores:
  - category: static
    max_entries: 10
    max_age_seconds: 60
  - category: page
    max_entries: 5
  - category: image
    max_entries: 3
    strategy: cache-only
warm_list: ["/", "/offline.html"]
fallbacks:
  - primary: /blog
    substitute: /
offline_page: /offline.html
"#,
    )
    .unwrap();

    config.validate().unwrap();
    assert_eq!(config.version, 4);
    assert_eq!(config.api_prefix, "/api/");
    assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
    assert_eq!(config.stores[0].category, Category::StaticAsset);
    assert_eq!(config.stores[1].max_age_seconds, None);
    assert_eq!(config.stores[1].strategy(), Strategy::StaleWhileRevalidate);
    assert_eq!(config.stores[2].strategy(), Strategy::CacheOnly);
    assert_eq!(config.fallbacks[0].substitute, "/");
  }

  #[test]
  fn test_duplicate_store_rejected() {
    let mut config = Config::default();
    config.stores.push(StoreConfig::new(Category::Image, 5, 60));
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_undeclared_store_reference_rejected() {
    let mut config = Config::default();
    config.stores.retain(|s| s.category != Category::Image);
    config.placeholder_image = Some("/placeholder.png".to_string());
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("not declared"), "{}", err);
  }

  #[test]
  fn test_warmed_page_needs_page_store() {
    let mut config = Config::default();
    config.stores.retain(|s| s.category != Category::Page);
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("warm_list /"), "{}", err);
    assert!(err.contains("page store"), "{}", err);
  }

  #[test]
  fn test_external_store_rejected() {
    let mut config = Config::default();
    config.stores.push(StoreConfig::new(Category::External, 5, 60));
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_network_only_store_rejected() {
    let mut config = Config::default();
    config.stores[0].strategy = Some(Strategy::NetworkOnly);
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_zero_capacity_rejected() {
    let mut config = Config::default();
    config.stores[0].max_entries = 0;
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::default();
    assert_eq!(
      config.resolve("/logo.svg").unwrap().as_str(),
      "http://localhost:3000/logo.svg"
    );
    assert_eq!(
      config.resolve("https://cdn.example.com/x.js").unwrap().as_str(),
      "https://cdn.example.com/x.js"
    );
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    let err = Config::load(Some(Path::new("/nonexistent/cachegate.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }
}
