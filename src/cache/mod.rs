//! Local stores for HTTP-like responses.
//!
//! This module provides:
//! - A storage trait with SQLite and in-memory backends
//! - A registry of named stores whose names embed the build version
//! - Capacity-based eviction after writes, with age checked lazily on read

pub mod eviction;
mod registry;
mod storage;
mod traits;

pub use registry::{store_name, version_tag, CacheRegistry, StoreHandle, StoreSpec};
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{body_digest, CacheEntry, CacheStorage};
