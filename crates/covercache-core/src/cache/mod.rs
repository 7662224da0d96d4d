//! Caching layer for covercache-core
//!
//! Provides the TTL key/value store and its on-disk format.

pub mod persist;
pub mod ttl_store;

pub use persist::{default_cache_path, CACHE_FORMAT_VERSION};
pub use ttl_store::{EntrySnapshot, Scope, StoreConfig, StoreStats, TtlStore};
