//! Bounded publish buffering with an oldest-drop overflow policy.
//!
//! Producers enqueue without blocking; a single flush task drains the
//! buffer to the backend in FIFO order, which is what preserves
//! per-signature event order across a backend outage. When the backend is
//! unreachable the publisher reports Degraded, keeps buffering under the
//! same bound, and flushes everything on reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{BusError, EventBus};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Maximum buffered messages before the oldest is dropped.
    pub capacity: usize,
    /// Per-attempt publish timeout; the backend must be durable for at
    /// least this long.
    pub publish_timeout: Duration,
    /// Delay between reconnect attempts while Degraded.
    pub retry_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            publish_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherHealth {
    Healthy,
    /// The backend is unreachable; events are buffered.
    Degraded,
}

/// Counters exposed for the metrics contract.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PublisherCounters {
    pub published: u64,
    /// Messages discarded by the oldest-drop policy.
    pub dropped: u64,
}

struct Queued {
    /// Identity tag: the flush task peeks the front, publishes without the
    /// lock held, and must only pop the entry it actually published — the
    /// drop policy may have discarded it in the meantime.
    seq: u64,
    stream: String,
    fields: Vec<(String, String)>,
}

/// Non-blocking producer front-end over an [`EventBus`] backend.
pub struct BufferedPublisher {
    config: PublisherConfig,
    queue: Arc<Mutex<VecDeque<Queued>>>,
    enqueued: Arc<Notify>,
    next_seq: AtomicU64,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    health_tx: watch::Sender<PublisherHealth>,
    health_rx: watch::Receiver<PublisherHealth>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedPublisher {
    pub fn new(bus: Arc<dyn EventBus>, config: PublisherConfig) -> Self {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let enqueued = Arc::new(Notify::new());
        let published = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let (health_tx, health_rx) = watch::channel(PublisherHealth::Healthy);

        let flusher = tokio::spawn(flush_loop(
            bus,
            config.clone(),
            Arc::clone(&queue),
            Arc::clone(&enqueued),
            Arc::clone(&published),
            health_tx.clone(),
        ));

        Self {
            config,
            queue,
            enqueued,
            next_seq: AtomicU64::new(0),
            published,
            dropped,
            health_tx,
            health_rx,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Enqueue a message for publication. Never blocks; when the buffer is
    /// full the oldest entry is discarded and counted.
    pub fn enqueue(&self, stream: &str, fields: Vec<(String, String)>) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.capacity {
            queue.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(stream, dropped_total = total, "publish buffer full, dropped oldest event");
        }
        queue.push_back(Queued {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            stream: stream.to_string(),
            fields,
        });
        drop(queue);
        // notify_one stores a permit when the flusher is not yet parked,
        // so an enqueue racing the empty-queue check is never lost.
        self.enqueued.notify_one();
    }

    pub fn health(&self) -> PublisherHealth {
        *self.health_rx.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<PublisherHealth> {
        self.health_rx.clone()
    }

    pub fn counters(&self) -> PublisherCounters {
        PublisherCounters {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of messages waiting in the buffer.
    pub fn backlog(&self) -> usize {
        self.queue.lock().len()
    }

    /// Stop the flush task. Messages still buffered are abandoned; callers
    /// that care drain via [`backlog`](Self::backlog) first.
    pub async fn shutdown(&self) {
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let _ = self.health_tx.send(PublisherHealth::Healthy);
    }
}

async fn flush_loop(
    bus: Arc<dyn EventBus>,
    config: PublisherConfig,
    queue: Arc<Mutex<VecDeque<Queued>>>,
    enqueued: Arc<Notify>,
    published: Arc<AtomicU64>,
    health_tx: watch::Sender<PublisherHealth>,
) {
    loop {
        // Peek rather than pop: the message stays queued (and subject to
        // the drop bound) until the backend accepts it.
        let next = {
            let queue = queue.lock();
            queue
                .front()
                .map(|q| (q.seq, q.stream.clone(), q.fields.clone()))
        };

        let Some((seq, stream, fields)) = next else {
            enqueued.notified().await;
            continue;
        };

        let attempt = tokio::time::timeout(config.publish_timeout, bus.publish(&stream, &fields));
        match attempt.await {
            Ok(Ok(id)) => {
                {
                    let mut queue = queue.lock();
                    if queue.front().map(|q| q.seq) == Some(seq) {
                        queue.pop_front();
                    }
                }
                published.fetch_add(1, Ordering::Relaxed);
                if *health_tx.borrow() == PublisherHealth::Degraded {
                    info!(stream, "bus reachable again, resuming normal publishing");
                    let _ = health_tx.send(PublisherHealth::Healthy);
                }
                debug!(stream, %id, "published buffered event");
            }
            Ok(Err(BusError::Unavailable(reason))) => {
                if *health_tx.borrow() != PublisherHealth::Degraded {
                    warn!(stream, %reason, "bus unavailable, entering degraded buffering");
                    let _ = health_tx.send(PublisherHealth::Degraded);
                }
                tokio::time::sleep(config.retry_interval).await;
            }
            Ok(Err(BusError::Protocol(reason))) => {
                // A protocol error will not heal by retrying this message.
                warn!(stream, %reason, "dropping message the backend rejected");
                let mut queue = queue.lock();
                if queue.front().map(|q| q.seq) == Some(seq) {
                    queue.pop_front();
                }
            }
            Err(_elapsed) => {
                if *health_tx.borrow() != PublisherHealth::Degraded {
                    warn!(stream, "publish timed out, entering degraded buffering");
                    let _ = health_tx.send(PublisherHealth::Degraded);
                }
                tokio::time::sleep(config.retry_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBus;

    async fn drained(publisher: &BufferedPublisher) {
        for _ in 0..200 {
            if publisher.backlog() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("publisher did not drain");
    }

    #[tokio::test]
    async fn publishes_in_fifo_order() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = BufferedPublisher::new(bus.clone(), PublisherConfig::default());
        for i in 0..10u32 {
            publisher.enqueue("s", vec![("n".into(), i.to_string())]);
        }
        drained(&publisher).await;
        let order: Vec<String> = bus
            .snapshot("s")
            .iter()
            .map(|m| m.fields["n"].clone())
            .collect();
        assert_eq!(order, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn outage_buffers_and_flushes_in_order() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = BufferedPublisher::new(
            bus.clone(),
            PublisherConfig {
                retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        bus.set_available(false);
        for i in 0..20u32 {
            publisher.enqueue("s", vec![("n".into(), i.to_string())]);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.health(), PublisherHealth::Degraded);
        assert_eq!(bus.stream_len("s"), 0);

        bus.set_available(true);
        drained(&publisher).await;
        assert_eq!(publisher.health(), PublisherHealth::Healthy);
        let order: Vec<String> = bus
            .snapshot("s")
            .iter()
            .map(|m| m.fields["n"].clone())
            .collect();
        assert_eq!(order, (0..20).map(|i| i.to_string()).collect::<Vec<_>>());
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_available(false);
        let publisher = BufferedPublisher::new(
            bus.clone(),
            PublisherConfig {
                capacity: 4,
                retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        for i in 0..10u32 {
            publisher.enqueue("s", vec![("n".into(), i.to_string())]);
        }
        assert_eq!(publisher.counters().dropped, 6);

        bus.set_available(true);
        drained(&publisher).await;
        // The newest four survive, still in order.
        let order: Vec<String> = bus
            .snapshot("s")
            .iter()
            .map(|m| m.fields["n"].clone())
            .collect();
        assert_eq!(order, ["6", "7", "8", "9"]);
        publisher.shutdown().await;
    }
}
