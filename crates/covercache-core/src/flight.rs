//! Single-flight wrapper around an asynchronous byte-stream producer
//!
//! At most one producer invocation runs per resource. Its terminal outcome
//! (bytes or error) is cached for the resource's lifetime and replayed to
//! every later subscriber. Each successful subscriber gets its own
//! [`CoverStream`] over the cached bytes, never the producer's stream.
//!
//! The outcome, the started flag and the waiter set change together under
//! one mutex, so a subscriber either registers before completion (and is
//! notified) or observes the terminal outcome directly.
//!
//! The producer runs on the runtime captured when the resource is built, so
//! any thread may subscribe. If that runtime shuts down before the fetch
//! completes, waiters get `RuntimeUnavailable` and the resource goes back to
//! idle instead of caching the failure.

use crate::error::FetchError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Byte stream handed back by a producer
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Boxed future returned by a producer
pub type ProducerFuture = Pin<Box<dyn Future<Output = Result<ByteStream, FetchError>> + Send>>;

type Producer = Arc<dyn Fn() -> ProducerFuture + Send + Sync>;

/// What happens after a failed fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// The failure is permanent for the resource's lifetime
    #[default]
    Never,
    /// The next subscriber after `cooldown` starts a fresh fetch
    After(Duration),
}

/// Observable state of a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    /// Nobody subscribed yet
    Idle,
    /// Producer running
    InFlight,
    Succeeded { len: usize },
    Failed(FetchError),
}

enum Outcome {
    Pending,
    Success(Arc<[u8]>),
    Failure { error: FetchError, at: Instant },
}

impl Outcome {
    fn terminal(&self) -> Option<Result<Arc<[u8]>, FetchError>> {
        match self {
            Outcome::Pending => None,
            Outcome::Success(bytes) => Some(Ok(Arc::clone(bytes))),
            Outcome::Failure { error, .. } => Some(Err(error.clone())),
        }
    }
}

struct Waiter {
    on_success: Box<dyn FnOnce(CoverStream) + Send>,
    on_error: Box<dyn FnOnce(FetchError) + Send>,
}

impl Waiter {
    fn deliver(self, result: Result<Arc<[u8]>, FetchError>) {
        let Waiter {
            on_success,
            on_error,
        } = self;

        // A panicking consumer must not starve the remaining waiters
        let delivered = catch_unwind(AssertUnwindSafe(move || match result {
            Ok(bytes) => on_success(CoverStream::new(bytes)),
            Err(error) => on_error(error),
        }));

        if delivered.is_err() {
            warn!("Subscriber callback panicked");
        }
    }
}

struct FlightState {
    outcome: Outcome,
    started: bool,
    waiters: HashMap<u64, Waiter>,
    next_waiter: u64,
}

impl FlightState {
    fn register(&mut self, waiter: Waiter) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.waiters.insert(id, waiter);
        id
    }
}

struct FlightInner {
    label: String,
    producer: Producer,
    runtime: Option<Handle>,
    retry: RetryPolicy,
    state: Mutex<FlightState>,
    invocations: AtomicU32,
}

/// Deduplicating wrapper around one remote byte stream
///
/// Cloning shares the same outcome and in-flight fetch.
#[derive(Clone)]
pub struct SingleFlightResource {
    inner: Arc<FlightInner>,
}

impl fmt::Debug for SingleFlightResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightResource")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .field("invocations", &self.invocations())
            .finish()
    }
}

enum Action {
    Deliver(Waiter, Result<Arc<[u8]>, FetchError>),
    Wait(u64),
    Start(Handle, u64),
    Reject(Waiter),
}

impl SingleFlightResource {
    /// Wrap a producer; nothing runs until the first subscriber
    ///
    /// The producer will run on the runtime current at this call. Without
    /// one, the runtime of the first subscriber is used instead.
    pub fn new<F, Fut, S>(producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, FetchError>> + Send + 'static,
        S: AsyncRead + Send + 'static,
    {
        Self::build(Handle::try_current().ok(), producer)
    }

    /// Wrap a producer that always runs on `runtime`
    pub fn new_in<F, Fut, S>(runtime: Handle, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, FetchError>> + Send + 'static,
        S: AsyncRead + Send + 'static,
    {
        Self::build(Some(runtime), producer)
    }

    fn build<F, Fut, S>(runtime: Option<Handle>, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, FetchError>> + Send + 'static,
        S: AsyncRead + Send + 'static,
    {
        let producer: Producer = Arc::new(move || -> ProducerFuture {
            let fut = producer();
            Box::pin(async move {
                let stream: S = fut.await?;
                Ok::<ByteStream, FetchError>(Box::pin(stream))
            })
        });

        Self {
            inner: Arc::new(FlightInner {
                label: String::new(),
                producer,
                runtime,
                retry: RetryPolicy::Never,
                state: Mutex::new(FlightState {
                    outcome: Outcome::Pending,
                    started: false,
                    waiters: HashMap::new(),
                    next_waiter: 0,
                }),
                invocations: AtomicU32::new(0),
            }),
        }
    }

    /// Name used in logs (typically the URL)
    ///
    /// Must be called before the resource is shared.
    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.rebuild(|inner| inner.label = label.into())
    }

    /// Failure handling; must be called before the resource is shared
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        self.rebuild(|inner| inner.retry = retry)
    }

    fn rebuild(self, apply: impl FnOnce(&mut FlightInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                apply(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                warn!("Resource already shared, configuration change ignored");
                Self { inner: shared }
            }
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Register interest in the outcome
    ///
    /// Exactly one of the callbacks runs, once. Terminal outcomes are
    /// delivered on the calling thread before this returns; pending ones on
    /// the runtime worker that completes the fetch.
    pub fn subscribe<S, E>(&self, on_success: S, on_error: E) -> Subscription
    where
        S: FnOnce(CoverStream) + Send + 'static,
        E: FnOnce(FetchError) + Send + 'static,
    {
        let waiter = Waiter {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        };

        let action = {
            let mut state = self.inner.state.lock();
            self.inner.rearm_if_cooled_down(&mut state);

            match state.outcome.terminal() {
                Some(result) => Action::Deliver(waiter, result),
                None if state.started => Action::Wait(state.register(waiter)),
                None => match self.inner.runtime() {
                    Some(handle) => {
                        state.started = true;
                        Action::Start(handle, state.register(waiter))
                    }
                    None => Action::Reject(waiter),
                },
            }
        };

        match action {
            Action::Deliver(waiter, result) => {
                waiter.deliver(result);
                Subscription::delivered()
            }
            Action::Wait(id) => Subscription::pending(&self.inner, id),
            Action::Start(handle, id) => {
                self.inner.start(&handle);
                Subscription::pending(&self.inner, id)
            }
            Action::Reject(waiter) => {
                warn!(resource = %self.inner.label, "No tokio runtime to start the fetch");
                waiter.deliver(Err(FetchError::RuntimeUnavailable));
                Subscription::delivered()
            }
        }
    }

    /// Await the outcome as a fresh stream
    pub async fn fetch(&self) -> Result<CoverStream, FetchError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_err = Arc::clone(&tx);

        self.subscribe(
            move |stream| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(stream));
                }
            },
            move |error| {
                if let Some(tx) = tx_err.lock().take() {
                    let _ = tx.send(Err(error));
                }
            },
        );

        rx.await
            .unwrap_or_else(|_| Err(FetchError::producer("fetch abandoned before completion")))
    }

    /// Await the outcome as an owned byte vector
    pub async fn fetch_bytes(&self) -> Result<Vec<u8>, FetchError> {
        let stream = self.fetch().await?;
        Ok(stream.as_slice().to_vec())
    }

    pub fn state(&self) -> FetchState {
        let state = self.inner.state.lock();
        match &state.outcome {
            Outcome::Pending if state.started => FetchState::InFlight,
            Outcome::Pending => FetchState::Idle,
            Outcome::Success(bytes) => FetchState::Succeeded { len: bytes.len() },
            Outcome::Failure { error, .. } => FetchState::Failed(error.clone()),
        }
    }

    /// Number of times the producer has been started
    pub fn invocations(&self) -> u32 {
        self.inner.invocations.load(Ordering::Relaxed)
    }

    /// Subscribers still waiting on the in-flight fetch
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

impl FlightInner {
    fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }

    fn rearm_if_cooled_down(&self, state: &mut FlightState) {
        let RetryPolicy::After(cooldown) = self.retry else {
            return;
        };
        if let Outcome::Failure { at, .. } = &state.outcome {
            if at.elapsed() >= cooldown {
                debug!(resource = %self.label, "Retry cooldown elapsed, re-arming fetch");
                state.outcome = Outcome::Pending;
                state.started = false;
            }
        }
    }

    fn start(self: &Arc<Self>, handle: &Handle) {
        let attempt = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(resource = %self.label, attempt, "Starting fetch");

        // Moved into the task: dropped unfinished if the runtime goes away
        let completion = Completion {
            inner: Arc::clone(self),
            done: false,
        };
        let fetch_handle = handle.clone();
        handle.spawn(async move {
            // Run the producer in its own task so a panic still completes the outcome
            let producer = Arc::clone(&completion.inner.producer);
            match fetch_handle.spawn(read_all(producer)).await {
                Ok(result) => completion.finish(result),
                Err(e) if e.is_panic() => completion.finish(Err(FetchError::producer(format!(
                    "producer task failed: {}",
                    e
                )))),
                // Cancelled by runtime shutdown; `completion` drops unfinished
                Err(_) => {}
            }
        });
    }

    fn complete(&self, result: Result<Arc<[u8]>, FetchError>) {
        let waiters = {
            let mut state = self.state.lock();
            state.outcome = match &result {
                Ok(bytes) => Outcome::Success(Arc::clone(bytes)),
                Err(error) => Outcome::Failure {
                    error: error.clone(),
                    at: Instant::now(),
                },
            };
            std::mem::take(&mut state.waiters)
        };

        match &result {
            Ok(bytes) => debug!(
                resource = %self.label,
                bytes = bytes.len(),
                waiters = waiters.len(),
                "Fetch succeeded"
            ),
            Err(error) => warn!(
                resource = %self.label,
                error = %error,
                waiters = waiters.len(),
                "Fetch failed"
            ),
        }

        for (_, waiter) in waiters {
            waiter.deliver(result.clone());
        }
    }

    /// The fetch task died with its runtime: notify waiters, cache nothing
    fn abandon(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.started = false;
            std::mem::take(&mut state.waiters)
        };

        warn!(
            resource = %self.label,
            waiters = waiters.len(),
            "Runtime shut down before the fetch completed"
        );
        for (_, waiter) in waiters {
            waiter.deliver(Err(FetchError::RuntimeUnavailable));
        }
    }
}

/// Completes the outcome exactly once, or abandons it when dropped unfinished
struct Completion {
    inner: Arc<FlightInner>,
    done: bool,
}

impl Completion {
    fn finish(mut self, result: Result<Arc<[u8]>, FetchError>) {
        self.done = true;
        self.inner.complete(result);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.done {
            self.inner.abandon();
        }
    }
}

async fn read_all(producer: Producer) -> Result<Arc<[u8]>, FetchError> {
    let mut stream = producer().await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(Arc::from(buf))
}

/// Handle on one subscription
#[derive(Debug)]
pub struct Subscription {
    target: Option<(Weak<FlightInner>, u64)>,
}

impl Subscription {
    fn delivered() -> Self {
        Self { target: None }
    }

    fn pending(inner: &Arc<FlightInner>, id: u64) -> Self {
        Self {
            target: Some((Arc::downgrade(inner), id)),
        }
    }

    /// Whether the callback has not run yet
    pub fn is_pending(&self) -> bool {
        match &self.target {
            Some((inner, id)) => inner
                .upgrade()
                .is_some_and(|inner| inner.state.lock().waiters.contains_key(id)),
            None => false,
        }
    }

    /// Stop waiting; returns false if the outcome was already delivered
    ///
    /// The fetch itself keeps running so later subscribers still share it.
    pub fn cancel(self) -> bool {
        let Some((inner, id)) = self.target else {
            return false;
        };
        inner
            .upgrade()
            .is_some_and(|inner| inner.state.lock().waiters.remove(&id).is_some())
    }
}

/// Independent reader over cached bytes
///
/// Every subscriber gets its own cursor; reading or dropping one never
/// affects another.
#[derive(Debug, Clone)]
pub struct CoverStream {
    cursor: Cursor<Arc<[u8]>>,
}

impl CoverStream {
    pub fn new(bytes: Arc<[u8]>) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    /// Total length, independent of the read position
    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The full payload, independent of the read position
    pub fn as_slice(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }
}

impl Read for CoverStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Read::read(&mut self.cursor, buf)
    }
}

impl Seek for CoverStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl AsyncRead for CoverStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.cursor).poll_read(cx, buf)
    }
}
