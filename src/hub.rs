use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::config::DEFAULT_BROADCAST_CONCURRENCY;
use crate::error::{Error, Result};

/// How long one subscriber may block a delivery before it counts as failed.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A long-lived consumer attached to the hub.
///
/// The hub owns the subscriber while attached and calls `close` exactly once
/// on removal.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn send(&self, message: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

struct Entry {
    sink: Arc<dyn Subscriber>,
    /// Set when a send failed; the entry is dropped at the next broadcast.
    failed: bool,
}

struct Registry {
    subscribers: HashMap<String, Entry>,
    /// Monotonic id counter, guarded by the same lock as the table.
    next_id: u64,
}

/// Fan-out registry for result snapshots.
///
/// Broadcasts are serialized; within one broadcast, deliveries run with
/// bounded concurrency and each sink gets its own copy of the message bytes.
/// A failing sink never stops the others.
pub struct Hub {
    registry: RwLock<Registry>,
    broadcast_gate: Mutex<()>,
    concurrency: usize,
    throttle: RwLock<Duration>,
    send_errors: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_concurrency(DEFAULT_BROADCAST_CONCURRENCY)
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            registry: RwLock::new(Registry {
                subscribers: HashMap::new(),
                next_id: 0,
            }),
            broadcast_gate: Mutex::new(()),
            concurrency: concurrency.max(1),
            throttle: RwLock::new(Duration::ZERO),
            send_errors: AtomicU64::new(0),
        }
    }

    /// Attach a subscriber, returning its assigned `conn-<n>` id.
    pub async fn add(&self, sink: Arc<dyn Subscriber>) -> String {
        let mut registry = self.registry.write().await;
        registry.next_id += 1;
        let id = format!("conn-{}", registry.next_id);
        registry.subscribers.insert(
            id.clone(),
            Entry {
                sink,
                failed: false,
            },
        );
        tracing::debug!(id = %id, "subscriber attached");
        id
    }

    /// Detach a subscriber and close it. Returns false for unknown ids.
    pub async fn remove(&self, id: &str) -> bool {
        let entry = {
            let mut registry = self.registry.write().await;
            registry.subscribers.remove(id)
        };
        match entry {
            Some(entry) => {
                if let Err(e) = entry.sink.close().await {
                    tracing::warn!(id = %id, "close failed: {e}");
                }
                tracing::debug!(id = %id, "subscriber detached");
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Subscriber>> {
        self.registry
            .read()
            .await
            .subscribers
            .get(id)
            .map(|e| e.sink.clone())
    }

    pub async fn count(&self) -> usize {
        self.registry.read().await.subscribers.len()
    }

    /// Pause inserted after each broadcast; zero disables throttling.
    pub async fn set_throttle(&self, throttle: Duration) {
        *self.throttle.write().await = throttle;
    }

    /// Total failed sends since the hub was created.
    pub fn send_error_count(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Deliver one message to every current subscriber.
    ///
    /// Completes even when sinks fail; failed sinks are logged, counted, and
    /// removed before the next broadcast. Subscribers attached mid-broadcast
    /// see only later messages.
    pub async fn broadcast(&self, message: &[u8]) {
        let _gate = self.broadcast_gate.lock().await;

        self.sweep_failed().await;

        // Snapshot under the read lock, then deliver without holding it.
        let targets: Vec<(String, Arc<dyn Subscriber>)> = {
            let registry = self.registry.read().await;
            registry
                .subscribers
                .iter()
                .map(|(id, e)| (id.clone(), e.sink.clone()))
                .collect()
        };

        let semaphore = Semaphore::new(self.concurrency);
        let deliveries = targets.into_iter().map(|(id, sink)| {
            let semaphore = &semaphore;
            // Each worker owns its own copy of the message bytes.
            let payload = message.to_vec();
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (id, Err(Error::Other("semaphore closed".into())));
                };
                let result = match tokio::time::timeout(SEND_TIMEOUT, sink.send(&payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Send {
                        id: id.clone(),
                        message: format!("send timed out after {}s", SEND_TIMEOUT.as_secs()),
                    }),
                };
                (id, result)
            }
        });

        for (id, result) in join_all(deliveries).await {
            if let Err(e) = result {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(id = %id, "send failed: {e}");
                let mut registry = self.registry.write().await;
                if let Some(entry) = registry.subscribers.get_mut(&id) {
                    entry.failed = true;
                }
            }
        }

        let throttle = *self.throttle.read().await;
        if !throttle.is_zero() {
            tokio::time::sleep(throttle).await;
        }
    }

    /// Drop subscribers whose previous send failed, closing each once.
    async fn sweep_failed(&self) {
        let failed: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .subscribers
                .iter()
                .filter(|(_, e)| e.failed)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in failed {
            self.remove(&id).await;
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every message it receives.
    struct Recorder {
        messages: StdMutex<Vec<Vec<u8>>>,
        closed: AtomicU64,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: StdMutex::new(Vec::new()),
                closed: AtomicU64::new(0),
            })
        }

        fn last(&self) -> Option<Vec<u8>> {
            self.messages.lock().unwrap().last().cloned()
        }

        fn total(&self) -> usize {
            self.messages.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Subscriber for Recorder {
        async fn send(&self, message: &[u8]) -> Result<()> {
            self.messages.lock().unwrap().push(message.to_vec());
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Always fails to send.
    struct Broken;

    #[async_trait]
    impl Subscriber for Broken {
        async fn send(&self, _message: &[u8]) -> Result<()> {
            Err(Error::Other("connection reset".into()))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let hub = Hub::new();
        let sinks = [Recorder::new(), Recorder::new(), Recorder::new()];
        for sink in &sinks {
            hub.add(sink.clone()).await;
        }

        hub.broadcast(b"test-result").await;

        let mut total = 0;
        for sink in &sinks {
            assert_eq!(sink.last().as_deref(), Some(b"test-result".as_slice()));
            total += sink.total();
        }
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let hub = Hub::new();
        let a = hub.add(Recorder::new()).await;
        let b = hub.add(Recorder::new()).await;
        assert_eq!(a, "conn-1");
        assert_eq!(b, "conn-2");
        // Ids are never reused, even after removal.
        hub.remove(&b).await;
        let c = hub.add(Recorder::new()).await;
        assert_eq!(c, "conn-3");
    }

    #[tokio::test]
    async fn add_remove_leaves_count_unchanged() {
        let hub = Hub::new();
        hub.add(Recorder::new()).await;
        let before = hub.count().await;
        let id = hub.add(Recorder::new()).await;
        assert!(hub.remove(&id).await);
        assert_eq!(hub.count().await, before);
        assert!(!hub.remove(&id).await);
    }

    #[tokio::test]
    async fn close_called_exactly_once_on_removal() {
        let hub = Hub::new();
        let sink = Recorder::new();
        let id = hub.add(sink.clone()).await;
        hub.remove(&id).await;
        hub.remove(&id).await;
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_sink_does_not_stop_others_and_is_swept() {
        let hub = Hub::new();
        let good = Recorder::new();
        hub.add(good.clone()).await;
        hub.add(Arc::new(Broken)).await;

        hub.broadcast(b"one").await;
        assert_eq!(good.last().as_deref(), Some(b"one".as_slice()));
        assert_eq!(hub.send_error_count(), 1);
        assert_eq!(hub.count().await, 2);

        // The failed sink is gone before the next delivery.
        hub.broadcast(b"two").await;
        assert_eq!(hub.count().await, 1);
        assert_eq!(good.total(), 2);
        assert_eq!(hub.send_error_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_delays_next_broadcast() {
        let hub = Hub::new();
        hub.add(Recorder::new()).await;
        hub.set_throttle(Duration::from_millis(200)).await;

        let start = tokio::time::Instant::now();
        hub.broadcast(b"a").await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn bounded_concurrency_still_delivers_to_all() {
        let hub = Hub::with_concurrency(2);
        let sinks: Vec<_> = (0..20).map(|_| Recorder::new()).collect();
        for sink in &sinks {
            hub.add(sink.clone()).await;
        }
        hub.broadcast(b"payload").await;
        for sink in &sinks {
            assert_eq!(sink.total(), 1);
        }
    }
}
