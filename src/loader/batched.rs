//! Batched index data loader.
//!
//! Events are staged until a size or age threshold fires, then a single
//! background worker runs the flush protocol: apply staged events to the
//! active memory partition (batched mode only), retry any partition left
//! frozen by a failed commit, swap the active partition out, and hand the
//! frozen one to the disk loader. Producers block when the staging list
//! reaches the hard cap.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use crate::error::{FreshetError, Result};
use crate::event::{DataConsumer, Indexable, Interpreter, Version};
use crate::health;
use crate::listener::ListenerRegistry;
use crate::loader::disk::DiskLoader;
use crate::manager::SearchIndexManager;
use crate::metrics::IndexingMetrics;

struct Staging {
    staged: Vec<Indexable>,
    /// Highest version staged in the current window
    version: Version,
    /// Set when the first event of a window arrives
    window_start: Option<Instant>,
    flush_requested: bool,
    /// Worker is mid-cycle
    flushing: bool,
    stopped: bool,
}

/// Shared core of the batched and realtime loaders: the staging buffer,
/// its thresholds, and the flush worker.
pub struct LoaderCore {
    manager: Arc<SearchIndexManager>,
    disk_loader: Arc<DiskLoader>,
    listeners: Arc<ListenerRegistry>,
    metrics: Arc<IndexingMetrics>,
    /// Realtime mode applies events at consume time; batched mode applies
    /// the staged window at flush time.
    apply_on_consume: bool,
    batch_size: AtomicUsize,
    max_batch_size: AtomicUsize,
    batch_delay_ms: AtomicU64,
    state: Mutex<Staging>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoaderCore {
    pub fn new(
        manager: Arc<SearchIndexManager>,
        disk_loader: Arc<DiskLoader>,
        listeners: Arc<ListenerRegistry>,
        metrics: Arc<IndexingMetrics>,
        batch_size: usize,
        max_batch_size: usize,
        batch_delay_ms: u64,
        apply_on_consume: bool,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            manager,
            disk_loader,
            listeners,
            metrics,
            apply_on_consume,
            batch_size: AtomicUsize::new(batch_size),
            max_batch_size: AtomicUsize::new(max_batch_size.max(batch_size)),
            batch_delay_ms: AtomicU64::new(batch_delay_ms),
            state: Mutex::new(Staging {
                staged: Vec::new(),
                version: 0,
                window_start: None,
                flush_requested: false,
                flushing: false,
                stopped: false,
            }),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn manager(&self) -> &Arc<SearchIndexManager> {
        &self.manager
    }

    pub(crate) fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Spawn the flush worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let core = self.clone();
        let handle = thread::Builder::new()
            .name("freshet-flush".to_string())
            .spawn(move || core.run())
            .expect("spawn flush worker");
        *worker = Some(handle);
    }

    /// Stage an interpreted batch, blocking while the staging list is at
    /// the hard cap.
    pub fn stage(&self, batch: Vec<Indexable>, version: Version) -> Result<()> {
        let mut st = self.state.lock();
        if st.stopped {
            return Err(FreshetError::ConsumerClosed);
        }
        while st.staged.len() >= self.max_batch_size.load(Ordering::Acquire) {
            st.flush_requested = true;
            self.cond.notify_all();
            self.cond
                .wait_for(&mut st, Duration::from_millis(200));
            if st.stopped {
                return Err(FreshetError::ConsumerClosed);
            }
        }
        if st.window_start.is_none() {
            st.window_start = Some(Instant::now());
        }
        st.version = st.version.max(version);
        st.staged.extend(batch);
        let staged = st.staged.len();
        if staged >= self.batch_size.load(Ordering::Acquire) {
            self.cond.notify_all();
        }
        drop(st);
        self.metrics.set_staged(staged);
        Ok(())
    }

    fn run(self: Arc<Self>) {
        loop {
            let (batch, version) = {
                let mut st = self.state.lock();
                loop {
                    if st.stopped && st.staged.is_empty() {
                        return;
                    }
                    if st.stopped {
                        break;
                    }
                    let delay = Duration::from_millis(self.batch_delay_ms.load(Ordering::Acquire));
                    let size_due =
                        !st.staged.is_empty() && st.staged.len() >= self.batch_size.load(Ordering::Acquire);
                    let time_due = st
                        .window_start
                        .map(|t0| t0.elapsed() >= delay)
                        .unwrap_or(false);
                    if st.flush_requested || size_due || time_due {
                        break;
                    }
                    let wait = match st.window_start {
                        Some(t0) => delay.saturating_sub(t0.elapsed()),
                        None => Duration::from_millis(1000),
                    };
                    let wait = wait.clamp(Duration::from_millis(1), Duration::from_millis(1000));
                    self.cond.wait_for(&mut st, wait);
                }
                st.flush_requested = false;
                st.window_start = None;
                st.flushing = true;
                (std::mem::take(&mut st.staged), st.version)
            };
            self.metrics.set_staged(0);
            self.flush_cycle(batch, version);
            let mut st = self.state.lock();
            st.flushing = false;
            self.cond.notify_all();
        }
    }

    /// One flush cycle. Disk I/O happens here, with no caller locks held.
    fn flush_cycle(&self, batch: Vec<Indexable>, version: Version) {
        if !batch.is_empty() && !self.apply_on_consume {
            match self.manager.apply_to_active(&batch, version) {
                Ok(()) => self.listeners.fire_memory_apply(version),
                Err(e) => {
                    error!(error = %e, "memory apply failed; events dropped from this window");
                    health::set_fatal();
                    self.listeners.fire_error(&e);
                }
            }
        }

        // retry a partition left frozen by an earlier failed commit; the
        // sibling slot stays occupied until this succeeds
        if let Some(slot) = self.manager.flushing_slot() {
            if self.disk_loader.load_from_index(slot).is_err() {
                return;
            }
        }

        if !self.manager.active_is_empty() {
            if let Some(slot) = self.manager.try_swap() {
                let _ = self.disk_loader.load_from_index(slot);
            }
        }
    }

    /// Block until everything staged before this call has been committed
    /// to the disk partition.
    pub fn flush_events(&self, timeout_ms: u64) -> Result<()> {
        let start = Instant::now();
        let mut st = self.state.lock();
        loop {
            let drained = st.staged.is_empty() && !st.flushing && self.manager.mems_empty();
            if drained {
                return Ok(());
            }
            if st.stopped {
                return Err(FreshetError::ConsumerClosed);
            }
            let elapsed = start.elapsed().as_millis() as u64;
            if elapsed >= timeout_ms {
                return Err(FreshetError::FlushTimeout {
                    elapsed_ms: elapsed,
                });
            }
            st.flush_requested = true;
            self.cond.notify_all();
            let wait = (timeout_ms - elapsed).min(200).max(1);
            self.cond.wait_for(&mut st, Duration::from_millis(wait));
        }
    }

    /// Events staged for the next flush.
    pub fn pending(&self) -> usize {
        self.state.lock().staged.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Acquire)
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        let batch_size = batch_size.max(1);
        self.batch_size.store(batch_size, Ordering::Release);
        self.max_batch_size
            .fetch_max(batch_size, Ordering::AcqRel);
        self.cond.notify_all();
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.load(Ordering::Acquire)
    }

    pub fn set_max_batch_size(&self, max_batch_size: usize) {
        let floor = self.batch_size.load(Ordering::Acquire);
        self.max_batch_size
            .store(max_batch_size.max(floor), Ordering::Release);
        self.cond.notify_all();
    }

    pub fn batch_delay_ms(&self) -> u64 {
        self.batch_delay_ms.load(Ordering::Acquire)
    }

    pub fn set_batch_delay_ms(&self, batch_delay_ms: u64) {
        self.batch_delay_ms.store(batch_delay_ms, Ordering::Release);
        self.cond.notify_all();
    }

    /// Stop the worker after it drains whatever is staged. Idempotent.
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
        info!("flush worker stopped");
    }
}

pub(crate) fn interpret_batch<V>(
    interpreter: &dyn Interpreter<V>,
    events: &[V],
) -> Vec<Indexable> {
    events.iter().map(|e| interpreter.interpret(e)).collect()
}

/// Loader for batched (non-realtime) mode: events become visible to
/// readers only once their window is flushed through the memory tier to
/// disk.
pub struct BatchedLoader<V> {
    core: Arc<LoaderCore>,
    interpreter: Arc<dyn Interpreter<V>>,
}

impl<V> BatchedLoader<V> {
    pub fn new(core: Arc<LoaderCore>, interpreter: Arc<dyn Interpreter<V>>) -> Self {
        Self { core, interpreter }
    }

    pub fn core(&self) -> &Arc<LoaderCore> {
        &self.core
    }
}

impl<V: Send + Sync> DataConsumer<V> for BatchedLoader<V> {
    fn consume(&self, events: Vec<V>, version: Version) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let batch = interpret_batch(self.interpreter.as_ref(), &events);
        self.core.stage(batch, version)
    }
}
