//! Asynchronous consumer front.
//!
//! Producers enqueue versioned event batches; a single worker forwards
//! them to the downstream loader. The front exposes the barriers the
//! rest of the pipeline is synchronized against: `flush_events` (queue
//! drained into the loader) and `sync_with_version` (the loader has
//! absorbed a given version into its memory tier).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use crate::error::{FreshetError, Result};
use crate::event::{DataConsumer, Version};
use crate::metrics::IndexingMetrics;

struct ConsumerState<V> {
    queue: Vec<V>,
    /// Highest version enqueued
    version: Version,
    /// Worker is mid-forward
    forwarding: bool,
    stopped: bool,
}

pub struct AsyncConsumer<V> {
    downstream: Arc<dyn DataConsumer<V>>,
    metrics: Arc<IndexingMetrics>,
    /// Backpressure high-water mark on the internal queue
    high_water: AtomicUsize,
    /// Highest version accepted by the downstream loader
    consumed_version: AtomicU64,
    state: Mutex<ConsumerState<V>>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<V> AsyncConsumer<V> {
    pub fn new(
        downstream: Arc<dyn DataConsumer<V>>,
        metrics: Arc<IndexingMetrics>,
        high_water: usize,
    ) -> Self {
        Self {
            downstream,
            metrics,
            high_water: AtomicUsize::new(high_water.max(1)),
            consumed_version: AtomicU64::new(0),
            state: Mutex::new(ConsumerState {
                queue: Vec::new(),
                version: 0,
                forwarding: false,
                stopped: false,
            }),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue an ordered batch. Blocks while the internal queue is at
    /// the high-water mark; fails with `ConsumerClosed` after shutdown.
    pub fn consume(&self, events: Vec<V>, version: Version) -> Result<()> {
        let count = events.len();
        let mut st = self.state.lock();
        if st.stopped {
            return Err(FreshetError::ConsumerClosed);
        }
        while st.queue.len() >= self.high_water.load(Ordering::Acquire) {
            self.cond.notify_all();
            self.cond.wait_for(&mut st, Duration::from_millis(200));
            if st.stopped {
                return Err(FreshetError::ConsumerClosed);
            }
        }
        st.queue.extend(events);
        st.version = st.version.max(version);
        self.cond.notify_all();
        drop(st);
        self.metrics.record_consumed(count);
        Ok(())
    }

    /// Block until every event enqueued before this call has been handed
    /// to the loader.
    pub fn flush_events(&self, timeout_ms: u64) -> Result<()> {
        let start = Instant::now();
        let mut st = self.state.lock();
        loop {
            if st.queue.is_empty() && !st.forwarding {
                return Ok(());
            }
            let elapsed = start.elapsed().as_millis() as u64;
            if elapsed >= timeout_ms {
                return Err(FreshetError::FlushTimeout {
                    elapsed_ms: elapsed,
                });
            }
            self.cond.notify_all();
            let wait = (timeout_ms - elapsed).min(200).max(1);
            self.cond.wait_for(&mut st, Duration::from_millis(wait));
        }
    }

    /// Block until the loader has absorbed some version >= `version`.
    pub fn sync_with_version(&self, timeout_ms: u64, version: Version) -> Result<()> {
        let start = Instant::now();
        let mut st = self.state.lock();
        loop {
            if self.consumed_version.load(Ordering::Acquire) >= version {
                return Ok(());
            }
            let elapsed = start.elapsed().as_millis() as u64;
            if elapsed >= timeout_ms {
                return Err(FreshetError::SyncTimeout {
                    elapsed_ms: elapsed,
                    version,
                });
            }
            self.cond.notify_all();
            let wait = (timeout_ms - elapsed).min(200).max(1);
            self.cond.wait_for(&mut st, Duration::from_millis(wait));
        }
    }

    /// Highest version accepted by the downstream loader.
    pub fn consumed_version(&self) -> Version {
        self.consumed_version.load(Ordering::Acquire)
    }

    /// Events waiting to be forwarded.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Stop accepting events; the worker drains the queue, then exits.
    /// Idempotent.
    pub fn stop(&self) {
        {
            let mut st = self.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            self.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        info!("consumer stopped");
    }
}

impl<V: Send + 'static> AsyncConsumer<V> {
    /// Spawn the forwarding worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let consumer = self.clone();
        let handle = thread::Builder::new()
            .name("freshet-consumer".to_string())
            .spawn(move || consumer.run())
            .expect("spawn consumer worker");
        *worker = Some(handle);
    }

    fn run(self: Arc<Self>) {
        loop {
            let (batch, version) = {
                let mut st = self.state.lock();
                while st.queue.is_empty() && !st.stopped {
                    self.cond.wait_for(&mut st, Duration::from_millis(1000));
                }
                if st.queue.is_empty() && st.stopped {
                    return;
                }
                st.forwarding = true;
                (std::mem::take(&mut st.queue), st.version)
            };
            match self.downstream.consume(batch, version) {
                Ok(()) => {
                    self.consumed_version.fetch_max(version, Ordering::AcqRel);
                }
                Err(e) => {
                    error!(error = %e, version, "downstream consume failed");
                }
            }
            let mut st = self.state.lock();
            st.forwarding = false;
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct Sink {
        received: PlMutex<Vec<(Vec<u64>, Version)>>,
        delay: Duration,
    }

    impl Sink {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                received: PlMutex::new(Vec::new()),
                delay,
            })
        }
    }

    impl DataConsumer<u64> for Sink {
        fn consume(&self, events: Vec<u64>, version: Version) -> Result<()> {
            std::thread::sleep(self.delay);
            self.received.lock().push((events, version));
            Ok(())
        }
    }

    fn consumer(sink: Arc<Sink>, high_water: usize) -> Arc<AsyncConsumer<u64>> {
        Arc::new(AsyncConsumer::new(
            sink,
            Arc::new(IndexingMetrics::default()),
            high_water,
        ))
    }

    #[test]
    fn test_forwarding_preserves_order_and_version() {
        let sink = Sink::new(Duration::ZERO);
        let consumer = consumer(sink.clone(), 100);
        consumer.start();

        consumer.consume(vec![1, 2], 2).unwrap();
        consumer.consume(vec![3], 3).unwrap();
        consumer.flush_events(5_000).unwrap();

        let received = sink.received.lock();
        let flat: Vec<u64> = received.iter().flat_map(|(e, _)| e.clone()).collect();
        assert_eq!(flat, vec![1, 2, 3]);
        assert_eq!(consumer.consumed_version(), 3);
        consumer.stop();
    }

    #[test]
    fn test_consume_after_stop_fails() {
        let sink = Sink::new(Duration::ZERO);
        let consumer = consumer(sink, 100);
        consumer.start();
        consumer.stop();

        let err = consumer.consume(vec![1], 1).unwrap_err();
        assert!(matches!(err, FreshetError::ConsumerClosed));
    }

    #[test]
    fn test_stop_drains_queue() {
        let sink = Sink::new(Duration::ZERO);
        let consumer = consumer(sink.clone(), 100);
        consumer.start();
        consumer.consume(vec![7, 8, 9], 5).unwrap();
        consumer.stop();

        let received = sink.received.lock();
        let flat: Vec<u64> = received.iter().flat_map(|(e, _)| e.clone()).collect();
        assert_eq!(flat, vec![7, 8, 9]);
    }

    #[test]
    fn test_sync_with_version_timeout() {
        let sink = Sink::new(Duration::ZERO);
        let consumer = consumer(sink, 100);
        consumer.start();
        consumer.consume(vec![1], 1).unwrap();

        let err = consumer.sync_with_version(250, 99).unwrap_err();
        assert!(matches!(
            err,
            FreshetError::SyncTimeout { version: 99, .. }
        ));
        consumer.stop();
    }

    #[test]
    fn test_backpressure_blocks_until_drained() {
        // slow sink keeps the queue full long enough to observe blocking
        let sink = Sink::new(Duration::from_millis(50));
        let consumer = consumer(sink.clone(), 2);
        consumer.start();

        for i in 0..10u64 {
            consumer.consume(vec![i], i + 1).unwrap();
        }
        consumer.flush_events(10_000).unwrap();

        let received = sink.received.lock();
        let flat: Vec<u64> = received.iter().flat_map(|(e, _)| e.clone()).collect();
        assert_eq!(flat, (0..10).collect::<Vec<u64>>());
        consumer.stop();
    }
}
