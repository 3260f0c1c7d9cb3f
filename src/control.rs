//! Out-of-band control channel messages.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::lifecycle::LifecycleState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate an installed engine without waiting
  SkipWaiting,
  GetCacheStats,
  /// Drop every entry of a store
  CleanStore { name: String },
  /// Trim a store to `soft_limit` entries
  PurgeStore { name: String, soft_limit: usize },
  /// Replay the deferred retry queue now
  ReplayQueue,
}

impl ControlMessage {
  pub fn parse(json: &str) -> Result<Self> {
    serde_json::from_str(json).map_err(|e| eyre!("Invalid control message '{}': {}", json, e))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  SkipWaiting {
    activated: bool,
    state: LifecycleState,
  },
  CacheStats {
    stores: BTreeMap<String, usize>,
  },
  StoreCleaned {
    name: String,
    existed: bool,
  },
  StorePurged {
    name: String,
    removed: usize,
  },
  QueueReplayed {
    replayed: usize,
    failed: usize,
    remaining: usize,
  },
  Error {
    message: String,
  },
}

impl ControlReply {
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|e| eyre!("Failed to serialize control reply: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_messages() {
    assert_eq!(
      ControlMessage::parse(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
      ControlMessage::SkipWaiting
    );
    assert_eq!(
      ControlMessage::parse(r#"{"type":"GET_CACHE_STATS"}"#).unwrap(),
      ControlMessage::GetCacheStats
    );
    assert_eq!(
      ControlMessage::parse(r#"{"type":"CLEAN_STORE","name":"api-cache-v1"}"#).unwrap(),
      ControlMessage::CleanStore {
        name: "api-cache-v1".to_string()
      }
    );
    assert_eq!(
      ControlMessage::parse(r#"{"type":"PURGE_STORE","name":"image-cache-v1","soft_limit":5}"#)
        .unwrap(),
      ControlMessage::PurgeStore {
        name: "image-cache-v1".to_string(),
        soft_limit: 5
      }
    );
    assert!(ControlMessage::parse(r#"{"type":"CLEAN_STORE"}"#).is_err());
    assert!(ControlMessage::parse(r#"{"type":"REBOOT"}"#).is_err());
  }

  #[test]
  fn test_reply_json_shape() {
    let reply = ControlReply::CacheStats {
      stores: BTreeMap::from([("image-cache-v1".to_string(), 3)]),
    };
    assert_eq!(
      reply.to_json().unwrap(),
      r#"{"type":"CACHE_STATS","stores":{"image-cache-v1":3}}"#
    );

    let reply = ControlReply::SkipWaiting {
      activated: true,
      state: LifecycleState::Active,
    };
    assert_eq!(
      reply.to_json().unwrap(),
      r#"{"type":"SKIP_WAITING","activated":true,"state":"active"}"#
    );
  }
}
