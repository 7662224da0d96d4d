//! Registry of shared single-flight resources
//!
//! Binding the same cover to several views must yield the same resource,
//! otherwise each view would start its own download. Keys are opaque
//! strings, usually the cover URL.

use crate::flight::{FetchState, SingleFlightResource};
use crate::http::HttpSource;
use dashmap::DashMap;
use tracing::debug;

/// Key -> resource map with per-entry locking
pub struct ResourceRegistry {
    resources: DashMap<String, SingleFlightResource>,
    source: Option<HttpSource>,
}

impl ResourceRegistry {
    /// Registry without an HTTP source; resources come from `get_or_insert_with`
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            source: None,
        }
    }

    /// Registry that downloads URLs through `source`
    pub fn with_source(source: HttpSource) -> Self {
        Self {
            resources: DashMap::new(),
            source: Some(source),
        }
    }

    /// Shared resource for `key`, created by `make` on first use
    ///
    /// `make` runs at most once per key while the entry is present.
    pub fn get_or_insert_with<F>(&self, key: &str, make: F) -> SingleFlightResource
    where
        F: FnOnce() -> SingleFlightResource,
    {
        if let Some(existing) = self.resources.get(key) {
            return existing.value().clone();
        }

        self.resources
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, "Registering resource");
                make()
            })
            .value()
            .clone()
    }

    /// Shared download of `url`; `None` without an HTTP source
    pub fn cover(&self, url: &str) -> Option<SingleFlightResource> {
        let source = self.source.as_ref()?;
        Some(self.get_or_insert_with(url, || source.resource(url)))
    }

    pub fn get(&self, key: &str) -> Option<SingleFlightResource> {
        self.resources.get(key).map(|r| r.value().clone())
    }

    /// Forget `key`; holders of the old resource keep its outcome
    pub fn evict(&self, key: &str) -> bool {
        self.resources.remove(key).is_some()
    }

    /// Forget every failed resource so the next lookup fetches again
    pub fn evict_failed(&self) -> usize {
        let before = self.resources.len();
        self.resources
            .retain(|_, resource| !matches!(resource.state(), FetchState::Failed(_)));
        let evicted = before - self.resources.len();
        if evicted > 0 {
            debug!(evicted, "Failed resources evicted");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn clear(&self) {
        self.resources.clear();
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
