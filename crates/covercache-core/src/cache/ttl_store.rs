//! TTL key/value store with a persisted scope and a session scope
//!
//! Two disjoint maps behind one `parking_lot::Mutex`:
//! - persisted: `Short`, `Long` and `NotExpired` entries, flushed to one file
//! - session: `OneSession` entries, never written anywhere
//!
//! Loading:
//! - The file is read once, on the first operation that needs it (`get`,
//!   `remove`, `snapshot`, a flush), never on construction
//! - The read happens with the lock released; `add` keeps working meanwhile
//!   and other readers wait for the load to finish
//! - Keys added before the load completes win over what is on disk
//! - Load failures are logged and the store starts empty
//!
//! Flushing:
//! - Every persisted mutation restarts one debounce timer (10s default) on the
//!   runtime captured at construction, whichever thread made the change
//! - Only the last mutation in a burst writes; snapshot and write happen under
//!   one write lock, so files land in snapshot order
//! - Write failures are logged and counted, never returned from `add`/`get`

use super::persist;
use crate::clock::{Clock, SystemClock};
use crate::error::PersistError;
use crate::event::{EventBus, StoreEvent};
use crate::expiration::{CacheEntry, ExpirationMode, ExpirationPolicy};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Configuration for the TTL store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Cache file holding the persisted map
    pub path: PathBuf,

    /// Quiet period after the last persisted mutation before writing
    pub flush_debounce: Duration,

    /// Lifetimes of `Short` and `Long` entries
    pub expiration: ExpirationPolicy,

    /// Capacity of the persistence event channel
    pub event_capacity: usize,

    /// Runtime that owns the debounce timer
    ///
    /// `None` uses the runtime current at construction, if any.
    pub runtime: Option<Handle>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: persist::default_cache_path(),
            flush_debounce: Duration::from_secs(10),
            expiration: ExpirationPolicy::default(),
            event_capacity: 256,
            runtime: None,
        }
    }
}

impl StoreConfig {
    /// Default settings with a custom cache file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn flush_debounce(mut self, delay: Duration) -> Self {
        self.flush_debounce = delay;
        self
    }

    pub fn short_ttl(mut self, ttl: Duration) -> Self {
        self.expiration.short_ttl = ttl;
        self
    }

    pub fn long_ttl(mut self, ttl: Duration) -> Self {
        self.expiration.long_ttl = ttl;
        self
    }

    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

/// Which map an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Persisted,
    Session,
}

/// Point-in-time copy of one entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot<V> {
    pub key: String,
    pub value: V,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Scope,
}

/// Store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub persisted_entries: usize,
    pub session_entries: usize,
    /// Whether the lazy load from disk has happened
    pub loaded: bool,
    pub flushes: u64,
    pub flush_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Unloaded,
    /// One thread is reading the file with the lock released
    Loading,
    Loaded,
}

struct StoreState<V> {
    persisted: HashMap<String, CacheEntry<V>>,
    session: HashMap<String, CacheEntry<V>>,
    load: LoadState,
    flush_timer: Option<JoinHandle<()>>,
}

struct StoreInner<V> {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    runtime: Option<Handle>,
    state: Mutex<StoreState<V>>,
    /// Signalled when `load` leaves `Loading`
    load_done: Condvar,
    /// Serializes snapshot + write; taken before `state`, never while holding it
    write_lock: Mutex<()>,
    events: EventBus,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    warned_no_runtime: AtomicBool,
}

/// Thread-safe TTL store
///
/// Cloning is cheap and shares the same maps and timer.
pub struct TtlStore<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for TtlStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TtlStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a store; nothing is read from disk yet
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a store with a custom time source
    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::new(config.event_capacity);
        let runtime = config
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok());
        debug!(
            path = %config.path.display(),
            has_runtime = runtime.is_some(),
            "TTL store created"
        );

        Self {
            inner: Arc::new(StoreInner {
                config,
                clock,
                runtime,
                state: Mutex::new(StoreState {
                    persisted: HashMap::new(),
                    session: HashMap::new(),
                    load: LoadState::Unloaded,
                    flush_timer: None,
                }),
                load_done: Condvar::new(),
                write_lock: Mutex::new(()),
                events,
                flushes: AtomicU64::new(0),
                flush_failures: AtomicU64::new(0),
                warned_no_runtime: AtomicBool::new(false),
            }),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Insert or replace `key`
    ///
    /// The key is first removed from whichever map holds it, then inserted
    /// into the map selected by `mode`. Never waits for the lazy load.
    pub fn add(&self, key: impl Into<String>, value: V, mode: ExpirationMode) {
        let key = key.into();
        let now = self.inner.clock.now();
        let entry = CacheEntry::new(value, self.inner.config.expiration.expires_at(mode, now));

        let mut state = self.inner.state.lock();
        let replaced_persisted = state.persisted.remove(&key).is_some();
        let replaced_session = state.session.remove(&key).is_some();

        trace!(
            key = %key,
            %mode,
            replaced = replaced_persisted || replaced_session,
            "Cache entry added"
        );

        if mode.is_persisted() {
            state.persisted.insert(key, entry);
            self.inner.schedule_flush(&mut state);
        } else {
            state.session.insert(key, entry);
            if replaced_persisted {
                self.inner.schedule_flush(&mut state);
            }
        }
    }

    /// Look up `key`; expired entries are removed and reported missing
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.inner.clock.now();
        let mut guard = self.inner.lock_loaded();

        let state = &mut *guard;
        for map in [&mut state.persisted, &mut state.session] {
            let Some(entry) = map.get(key) else {
                continue;
            };

            if entry.is_expired(now) {
                map.remove(key);
                debug!(key, "Cache entry expired");
                return None;
            }

            return Some(entry.value.clone());
        }

        None
    }

    /// Whether `key` holds a live entry
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Read the cache file now instead of on the first lookup
    pub fn preload(&self) {
        drop(self.inner.lock_loaded());
    }

    /// Remove `key` from whichever map holds it
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.inner.lock_loaded();

        if state.persisted.remove(key).is_some() {
            self.inner.schedule_flush(&mut state);
            return true;
        }
        state.session.remove(key).is_some()
    }

    /// Forget every persisted entry held in memory
    ///
    /// The session map and the file on disk are left alone. Entries still on
    /// disk are not loaded afterwards, including by a load already running.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        let dropped = state.persisted.len();
        state.persisted.clear();
        state.load = LoadState::Loaded;
        self.inner.load_done.notify_all();
        info!(dropped, "Persisted cache entries reset");
    }

    /// Drop expired entries from both maps; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock_loaded();

        let before_persisted = state.persisted.len();
        state.persisted.retain(|_, entry| !entry.is_expired(now));
        let purged_persisted = before_persisted - state.persisted.len();

        let before_session = state.session.len();
        state.session.retain(|_, entry| !entry.is_expired(now));
        let purged_session = before_session - state.session.len();

        if purged_persisted > 0 {
            self.inner.schedule_flush(&mut state);
        }

        debug!(purged_persisted, purged_session, "Expired entries purged");
        purged_persisted + purged_session
    }

    /// Copy of every live entry, persisted first, sorted by key
    pub fn snapshot(&self) -> Vec<EntrySnapshot<V>> {
        let now = self.inner.clock.now();
        let state = self.inner.lock_loaded();

        let collect = |map: &HashMap<String, CacheEntry<V>>, scope: Scope| {
            let mut entries: Vec<_> = map
                .iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .map(|(key, entry)| EntrySnapshot {
                    key: key.clone(),
                    value: entry.value.clone(),
                    expires_at: entry.expires_at,
                    scope,
                })
                .collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            entries
        };

        let mut entries = collect(&state.persisted, Scope::Persisted);
        entries.extend(collect(&state.session, Scope::Session));
        entries
    }

    /// Write the persisted map now, cancelling any pending debounce timer
    ///
    /// Blocks the calling thread on disk IO. This is the only operation
    /// that returns a persistence error; it is also logged and counted.
    pub fn flush(&self) -> Result<usize, PersistError> {
        if let Some(timer) = self.inner.state.lock().flush_timer.take() {
            timer.abort();
        }
        self.inner.flush_blocking()
    }

    /// Receive load and flush events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.inner.state.lock();
        StoreStats {
            persisted_entries: state.persisted.len(),
            session_entries: state.session.len(),
            loaded: state.load == LoadState::Loaded,
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            flush_failures: self.inner.flush_failures.load(Ordering::Relaxed),
        }
    }
}

impl<V> StoreInner<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Lock the state once the lazy load is done, performing it if needed
    ///
    /// The file is read with the lock released; concurrent callers wait on
    /// `load_done` instead of reading it a second time.
    fn lock_loaded(&self) -> MutexGuard<'_, StoreState<V>> {
        let mut state = self.state.lock();
        loop {
            match state.load {
                LoadState::Loaded => return state,
                LoadState::Loading => self.load_done.wait(&mut state),
                LoadState::Unloaded => {
                    state.load = LoadState::Loading;
                    let path = &self.config.path;
                    let result = MutexGuard::unlocked(&mut state, || persist::load::<V>(path));
                    self.apply_load(&mut state, result);
                    self.load_done.notify_all();
                    return state;
                }
            }
        }
    }

    fn apply_load(
        &self,
        state: &mut StoreState<V>,
        result: Result<Option<HashMap<String, CacheEntry<V>>>, PersistError>,
    ) {
        if state.load == LoadState::Loaded {
            debug!("Store reset while loading, disk entries discarded");
            return;
        }
        state.load = LoadState::Loaded;

        let path = &self.config.path;
        match result {
            Ok(Some(entries)) => {
                let now = self.clock.now();
                let total = entries.len();
                let mut accepted = 0;
                let mut expired = 0;

                for (key, entry) in entries {
                    if entry.is_expired(now) {
                        expired += 1;
                        continue;
                    }
                    // Entries added before the load are newer than the file
                    if state.persisted.contains_key(&key) || state.session.contains_key(&key) {
                        continue;
                    }
                    state.persisted.insert(key, entry);
                    accepted += 1;
                }

                debug!(path = %path.display(), total, accepted, expired, "Cache file loaded");
                self.events.publish(StoreEvent::Loaded {
                    entries: accepted,
                    expired,
                });
            }
            Ok(None) => {
                self.events.publish(StoreEvent::Loaded {
                    entries: 0,
                    expired: 0,
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to load cache file, starting empty");
                self.events.publish(StoreEvent::LoadFailed(e.to_string()));
            }
        }
    }

    /// Cancel the pending timer and start a new one; caller holds the lock
    fn schedule_flush(self: &Arc<Self>, state: &mut StoreState<V>) {
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }

        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            if !self.warned_no_runtime.swap(true, Ordering::Relaxed) {
                warn!("No tokio runtime, persisted changes wait for an explicit flush");
            }
            return;
        };

        let inner = Arc::clone(self);
        let delay = self.config.flush_debounce;
        state.flush_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let worker = Arc::clone(&inner);
            if let Err(e) = tokio::task::spawn_blocking(move || worker.flush_blocking()).await {
                inner.flush_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Flush worker did not complete");
                inner
                    .events
                    .publish(StoreEvent::FlushFailed(e.to_string()));
            }
        }));
    }

    fn flush_blocking(&self) -> Result<usize, PersistError> {
        // Held across snapshot and write so a newer snapshot is never
        // overwritten by an older one
        let _write = self.write_lock.lock();

        let (encoded, entries) = {
            // Flushing before the lazy load would drop everything on disk
            let state = self.lock_loaded();
            (
                persist::encode(&state.persisted, self.clock.now()),
                state.persisted.len(),
            )
        };

        let path = &self.config.path;
        let result = encoded.and_then(|bytes| persist::write_atomic(path, &bytes));

        match result {
            Ok(()) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), entries, "Cache flushed");
                self.events.publish(StoreEvent::Flushed {
                    path: path.clone(),
                    entries,
                });
                Ok(entries)
            }
            Err(e) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Failed to flush cache file");
                self.events.publish(StoreEvent::FlushFailed(e.to_string()));
                Err(e)
            }
        }
    }
}
