//! covercache-core - Core library for covercache
//!
//! Provides the TTL key/value store, single-flight byte-stream resources,
//! and a shared registry for remote cover downloads.

pub mod cache;
pub mod clock;
pub mod error;
pub mod event;
pub mod expiration;
pub mod flight;
pub mod http;
pub mod registry;

pub use cache::{StoreConfig, StoreStats, TtlStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FetchError, PersistError};
pub use event::StoreEvent;
pub use expiration::{CacheEntry, ExpirationMode, ExpirationPolicy};
pub use flight::{CoverStream, FetchState, RetryPolicy, SingleFlightResource, Subscription};
pub use http::{HttpConfig, HttpSource};
pub use registry::ResourceRegistry;
