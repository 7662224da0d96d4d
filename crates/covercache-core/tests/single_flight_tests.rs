//! Integration tests for single-flight resources
//!
//! Run with:
//! ```bash
//! cargo test --test single_flight_tests
//! ```

use covercache_core::{FetchError, FetchState, RetryPolicy, SingleFlightResource};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

/// Producer that blocks until `gate` is notified, counting invocations
fn gated(
    payload: Result<Vec<u8>, FetchError>,
) -> (SingleFlightResource, Arc<AtomicUsize>, Arc<Notify>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let counter = Arc::clone(&calls);
    let release = Arc::clone(&gate);
    let resource = SingleFlightResource::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let release = Arc::clone(&release);
        let payload = payload.clone();
        async move {
            release.notified().await;
            payload.map(Cursor::new)
        }
    });

    (resource, calls, gate)
}

type Delivery = Result<Vec<u8>, FetchError>;

fn subscribe_into(resource: &SingleFlightResource, tx: mpsc::Sender<Delivery>) {
    let tx_err = tx.clone();
    resource.subscribe(
        move |stream| {
            let _ = tx.send(Ok(stream.as_slice().to_vec()));
        },
        move |error| {
            let _ = tx_err.send(Err(error));
        },
    );
}

async fn collect(rx: mpsc::Receiver<Delivery>, count: usize) -> Vec<Delivery> {
    tokio::task::spawn_blocking(move || {
        (0..count)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect()
    })
    .await
    .unwrap()
}

mod single_flight {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifty_parallel_subscribers_share_one_fetch() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let (resource, calls, gate) = gated(Ok(payload.clone()));
        let (tx, rx) = mpsc::channel();

        // Plain OS threads, no runtime context, racing on the started flag
        let barrier = Arc::new(Barrier::new(50));
        let threads: Vec<_> = (0..50)
            .map(|_| {
                let resource = resource.clone();
                let tx = tx.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    subscribe_into(&resource, tx);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(resource.invocations(), 1);
        assert_eq!(resource.waiting(), 50);
        assert_eq!(resource.state(), FetchState::InFlight);

        gate.notify_one();
        let results = collect(rx, 50).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 50);
        for result in results {
            assert_eq!(result.unwrap(), payload);
        }
        assert_eq!(resource.waiting(), 0);
    }

    #[test]
    fn test_resource_bound_to_runtime_serves_plain_threads() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let resource = SingleFlightResource::new_in(runtime.handle().clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, FetchError>(Cursor::new(b"front.jpg".to_vec())) }
        });
        let (tx, rx) = mpsc::channel();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let resource = resource.clone();
                let tx = tx.clone();
                std::thread::spawn(move || subscribe_into(&resource, tx))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        for _ in 0..8 {
            let delivery = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert_eq!(delivery.unwrap(), b"front.jpg");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_tasks_share_one_fetch() {
        let (resource, calls, gate) = gated(Ok(b"cover".to_vec()));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let resource = resource.clone();
            tasks.spawn(async move { resource.fetch_bytes().await });
        }

        while resource.waiting() < 10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap(), b"cover");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_error_cached_for_every_waiter() {
        let error = FetchError::Status {
            url: "https://covers.example/missing.jpg".into(),
            status: 404,
        };
        let (resource, calls, gate) = gated(Err(error.clone()));
        let (tx, rx) = mpsc::channel();

        for _ in 0..5 {
            subscribe_into(&resource, tx.clone());
        }
        gate.notify_one();
        let early = collect(rx, 5).await;
        for result in early {
            assert_eq!(result.unwrap_err(), error);
        }

        // Late subscribers get the same error without a new fetch
        for _ in 0..3 {
            assert_eq!(resource.fetch().await.unwrap_err(), error);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resource.invocations(), 1);
        assert_eq!(resource.state(), FetchState::Failed(error));
    }

    #[tokio::test]
    async fn test_read_error_is_cached() {
        struct Broken;

        impl tokio::io::AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )))
            }
        }

        let resource = SingleFlightResource::new(|| async { Ok::<_, FetchError>(Broken) });

        let first = resource.fetch().await.unwrap_err();
        assert!(matches!(first, FetchError::Read { .. }));
        assert_eq!(resource.fetch().await.unwrap_err(), first);
        assert_eq!(resource.invocations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_cooldown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let resource = SingleFlightResource::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(FetchError::producer("temporarily offline"))
                } else {
                    Ok(Cursor::new(b"second try".to_vec()))
                }
            }
        })
        .with_retry(RetryPolicy::After(Duration::from_secs(30)));

        assert!(resource.fetch().await.is_err());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(resource.fetch().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(resource.fetch_bytes().await.unwrap(), b"second try");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Success is never re-fetched
        tokio::time::sleep(Duration::from_secs(3600)).await;
        resource.fetch().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_starve_others() {
        let (resource, _calls, gate) = gated(Ok(b"art".to_vec()));
        let (tx, rx) = mpsc::channel();

        resource.subscribe(|_| panic!("view already torn down"), |_| {});
        subscribe_into(&resource, tx);
        gate.notify_one();

        let results = collect(rx, 1).await;
        assert_eq!(results[0].as_deref().unwrap(), b"art");
    }
}

mod shutdown {
    use super::*;

    #[test]
    fn test_runtime_shutdown_notifies_waiters_once() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let resource = SingleFlightResource::new_in(runtime.handle().clone(), || async {
            std::future::pending::<Result<Cursor<Vec<u8>>, FetchError>>().await
        });
        let (tx, rx) = mpsc::channel();

        for _ in 0..3 {
            subscribe_into(&resource, tx.clone());
        }
        assert_eq!(resource.state(), FetchState::InFlight);
        assert_eq!(resource.waiting(), 3);

        drop(runtime);

        for _ in 0..3 {
            let delivery = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert_eq!(delivery.unwrap_err(), FetchError::RuntimeUnavailable);
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Not a producer outcome, so nothing is cached
        assert_eq!(resource.state(), FetchState::Idle);
        assert_eq!(resource.waiting(), 0);
    }
}

mod streams {
    use super::*;

    #[tokio::test]
    async fn test_each_subscriber_reads_from_start() {
        let (resource, _calls, gate) = gated(Ok(b"0123456789".to_vec()));
        gate.notify_one();

        let mut first = resource.fetch().await.unwrap();
        let mut second = resource.fetch().await.unwrap();

        let mut all = Vec::new();
        first.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"0123456789");
        drop(first);

        let mut head = [0u8; 4];
        second.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"0123");

        let mut third = resource.fetch().await.unwrap();
        assert_eq!(third.position(), 0);
        let mut rest = Vec::new();
        third.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"0123456789");
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_waiter_is_not_notified() {
        let (resource, calls, gate) = gated(Ok(b"jpeg".to_vec()));
        let cancelled_called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled_called);
        let flag_err = Arc::clone(&cancelled_called);

        let sub = resource.subscribe(
            move |_| flag.store(true, Ordering::SeqCst),
            move |_| flag_err.store(true, Ordering::SeqCst),
        );
        assert!(sub.is_pending());

        let (tx, rx) = mpsc::channel();
        subscribe_into(&resource, tx);

        assert!(sub.cancel());
        assert_eq!(resource.waiting(), 1);

        gate.notify_one();
        let results = collect(rx, 1).await;
        assert_eq!(results[0].as_deref().unwrap(), b"jpeg");
        assert!(!cancelled_called.load(Ordering::SeqCst));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_delivery_is_noop() {
        let (resource, _calls, gate) = gated(Ok(b"jpeg".to_vec()));
        let (tx, rx) = mpsc::channel();

        let tx_err = tx.clone();
        let sub = resource.subscribe(
            move |s| {
                let _ = tx.send(Ok(s.as_slice().to_vec()));
            },
            move |e| {
                let _ = tx_err.send(Err(e));
            },
        );
        gate.notify_one();
        collect(rx, 1).await;

        assert!(!sub.is_pending());
        assert!(!sub.cancel());
    }

    #[tokio::test]
    async fn test_cancelling_every_waiter_still_caches_outcome() {
        let (resource, calls, gate) = gated(Ok(b"kept".to_vec()));

        let sub = resource.subscribe(|_| {}, |_| {});
        assert!(sub.cancel());
        assert_eq!(resource.state(), FetchState::InFlight);

        gate.notify_one();
        assert_eq!(resource.fetch_bytes().await.unwrap(), b"kept");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
