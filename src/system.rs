//! The freshet system: consumer front, loaders, reader cache, and the
//! cache maintainer.
//!
//! Searchers never touch the partitions directly: they borrow the cached
//! snapshot under a read lock and return it through a lock-free queue.
//! A single maintainer thread republishes the snapshot every `freshness`
//! interval (or when a refresh barrier pokes it) and performs all
//! deferred reference decrements, keeping both hot paths free of engine
//! work.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::FreshetConfig;
use crate::consumer::AsyncConsumer;
use crate::directory::DirectoryManager;
use crate::docid::{DefaultDocIdMapperFactory, DocIdMapperFactory};
use crate::engine::{Analyzer, SharedReader, SimpleAnalyzer};
use crate::error::{FreshetError, Result};
use crate::event::{DataConsumer, Interpreter, Version};
use crate::listener::{IndexingEventListener, ListenerRegistry};
use crate::loader::{BatchedLoader, DiskLoader, LoaderCore, OptimizeScheduler, RealtimeLoader};
use crate::manager::SearchIndexManager;
use crate::metrics::IndexingMetrics;

pub struct FreshetSystem<V> {
    realtime: bool,
    analyzer: Arc<dyn Analyzer>,
    directory: DirectoryManager,
    manager: Arc<SearchIndexManager>,
    disk_loader: Arc<DiskLoader>,
    loader_core: Arc<LoaderCore>,
    consumer: Arc<AsyncConsumer<V>>,
    listeners: Arc<ListenerRegistry>,
    metrics: Arc<IndexingMetrics>,

    sla_ms: AtomicU64,
    freshness_ms: AtomicU64,
    started: AtomicBool,
    already_shutdown: AtomicBool,
    shutdown_lock: RwLock<()>,

    // reader cache
    epoch: Instant,
    cache: RwLock<Vec<SharedReader>>,
    /// Publication time of the cached snapshot, millis since `epoch`
    cache_timestamp: AtomicU64,
    return_queue: RwLock<Arc<SegQueue<Vec<SharedReader>>>>,
    refresh_monitor: Mutex<()>,
    refresh_cond: Condvar,
    maintainer: Mutex<Option<JoinHandle<()>>>,
    maintainer_stop: AtomicBool,
}

impl<V: Send + Sync + 'static> FreshetSystem<V> {
    /// Create a system with the default analyzer and doc-id mapper.
    pub fn new(
        dir: impl AsRef<Path>,
        interpreter: Arc<dyn Interpreter<V>>,
        config: FreshetConfig,
    ) -> Result<Arc<Self>> {
        Self::with_components(dir, interpreter, None, None, config)
    }

    pub fn with_components(
        dir: impl AsRef<Path>,
        interpreter: Arc<dyn Interpreter<V>>,
        analyzer: Option<Arc<dyn Analyzer>>,
        mapper_factory: Option<Arc<dyn DocIdMapperFactory>>,
        config: FreshetConfig,
    ) -> Result<Arc<Self>> {
        let config = config.normalized();
        let analyzer = analyzer.unwrap_or_else(|| Arc::new(SimpleAnalyzer));
        let mapper_factory =
            mapper_factory.unwrap_or_else(|| Arc::new(DefaultDocIdMapperFactory));

        let directory = DirectoryManager::new(dir.as_ref())?;
        let metrics = Arc::new(IndexingMetrics::default());
        let listeners = Arc::new(ListenerRegistry::new());
        let manager = Arc::new(SearchIndexManager::open(
            dir.as_ref(),
            analyzer.clone(),
            mapper_factory,
        )?);
        let disk_loader = Arc::new(DiskLoader::new(
            manager.clone(),
            listeners.clone(),
            metrics.clone(),
        ));
        let loader_core = Arc::new(LoaderCore::new(
            manager.clone(),
            disk_loader.clone(),
            listeners.clone(),
            metrics.clone(),
            config.batch_size,
            config.max_batch_size,
            config.batch_delay_ms,
            config.rt_indexing,
        ));
        let downstream: Arc<dyn DataConsumer<V>> = if config.rt_indexing {
            Arc::new(RealtimeLoader::new(loader_core.clone(), interpreter))
        } else {
            Arc::new(BatchedLoader::new(loader_core.clone(), interpreter))
        };
        let consumer = Arc::new(AsyncConsumer::new(
            downstream,
            metrics.clone(),
            config.batch_size,
        ));

        info!(
            path = %directory.path().display(),
            batch_size = config.batch_size,
            max_batch_size = config.max_batch_size,
            batch_delay_ms = config.batch_delay_ms,
            realtime = config.rt_indexing,
            freshness_ms = config.freshness_ms,
            "creating freshet system"
        );

        Ok(Arc::new(Self {
            realtime: config.rt_indexing,
            analyzer,
            directory,
            manager,
            disk_loader,
            loader_core,
            consumer,
            listeners,
            metrics,
            sla_ms: AtomicU64::new(config.sla_ms),
            freshness_ms: AtomicU64::new(config.freshness_ms),
            started: AtomicBool::new(false),
            already_shutdown: AtomicBool::new(false),
            shutdown_lock: RwLock::new(()),
            epoch: Instant::now(),
            cache: RwLock::new(Vec::new()),
            cache_timestamp: AtomicU64::new(0),
            return_queue: RwLock::new(Arc::new(SegQueue::new())),
            refresh_monitor: Mutex::new(()),
            refresh_cond: Condvar::new(),
            maintainer: Mutex::new(None),
            maintainer_stop: AtomicBool::new(false),
        }))
    }

    /// Start the consumer front, flush worker, and cache maintainer.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("starting freshet...");
        self.loader_core.start();
        self.consumer.start();
        // the maintainer holds only a weak handle so a dropped system is
        // not kept alive by its own maintenance thread
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("freshet-reader-maintenance".to_string())
            .spawn(move || Self::maintain(weak))
            .expect("spawn reader maintenance");
        *self.maintainer.lock() = Some(handle);
        info!("freshet started");
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn maintain(weak: Weak<Self>) {
        loop {
            let Some(system) = weak.upgrade() else {
                return;
            };
            {
                // stop is flagged under the monitor, so checking here
                // before waiting cannot lose the wake-up
                let mut guard = system.refresh_monitor.lock();
                if system.maintainer_stop.load(Ordering::Acquire) {
                    return;
                }
                let freshness =
                    Duration::from_millis(system.freshness_ms.load(Ordering::Acquire).max(1));
                system.refresh_cond.wait_for(&mut guard, freshness);
            }
            if system.maintainer_stop.load(Ordering::Acquire) {
                return;
            }
            system.tick();
            // releasing the strong handle here may run the system's Drop
            // on this thread once the last caller handle is gone
        }
    }

    /// One maintenance pass: publish a fresh snapshot, wake barrier
    /// waiters, then run all deferred reference decrements.
    fn tick(&self) {
        let new_readers = if self.already_shutdown.load(Ordering::Acquire) {
            Vec::new()
        } else {
            self.manager.get_index_readers()
        };
        let old_readers = {
            let mut cache = self.cache.write();
            std::mem::replace(&mut *cache, new_readers)
        };
        self.cache_timestamp.store(self.now_ms(), Ordering::Release);
        {
            let _guard = self.refresh_monitor.lock();
            self.refresh_cond.notify_all();
        }
        // the cache's own reference to the previous snapshot goes back
        // through the same deferred path as any borrower's
        self.return_index_readers(old_readers);

        let drained = {
            let mut queue = self.return_queue.write();
            std::mem::replace(&mut *queue, Arc::new(SegQueue::new()))
        };
        let mut returned = 0usize;
        while let Some(list) = drained.pop() {
            for reader in list {
                reader.dec_ref();
                returned += 1;
            }
        }
        if returned > 0 {
            debug!(returned, "drained reader return queue");
        }
    }

    /// Borrow the current reader snapshot. Each reader comes
    /// pre-incremented; pass the whole list to
    /// [`FreshetSystem::return_index_readers`] exactly once.
    pub fn get_index_readers(&self) -> Vec<SharedReader> {
        let t0 = Instant::now();
        let readers = {
            let cache = self.cache.read();
            for reader in cache.iter() {
                reader.inc_ref();
            }
            cache.clone()
        };
        let elapsed = t0.elapsed();
        self.metrics.record_reader_acquire(elapsed.as_secs_f64());
        let elapsed_ms = elapsed.as_millis() as u64;
        let sla = self.sla_ms.load(Ordering::Acquire);
        if elapsed_ms > sla {
            warn!(elapsed_ms, sla, "get_index_readers exceeded SLA");
        }
        readers
    }

    /// Return a borrowed snapshot. The decrement itself is deferred to
    /// the maintainer; this path only pushes onto a lock-free queue.
    pub fn return_index_readers(&self, readers: Vec<SharedReader>) {
        if readers.is_empty() {
            return;
        }
        let t0 = Instant::now();
        {
            let queue = self.return_queue.read();
            queue.push(readers);
        }
        let elapsed_ms = t0.elapsed().as_millis() as u64;
        let sla = self.sla_ms.load(Ordering::Acquire);
        if elapsed_ms > sla {
            warn!(elapsed_ms, sla, "return_index_readers exceeded SLA");
        }
    }

    /// Refresh barrier: block until a snapshot published after this call
    /// is visible, waking the maintainer as needed. Bounded 200 ms waits
    /// keep a missed notification from stalling the barrier.
    pub fn refresh_cache(&self, timeout_ms: u64) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let t0 = self.now_ms();
        while self.cache_timestamp.load(Ordering::Acquire) <= t0 {
            let mut guard = self.refresh_monitor.lock();
            self.refresh_cond.notify_all();
            let elapsed = self.now_ms().saturating_sub(t0);
            if elapsed > timeout_ms {
                debug!(elapsed, "refresh_cache timed out");
                return Err(FreshetError::RefreshTimeout {
                    elapsed_ms: elapsed,
                });
            }
            let wait = (timeout_ms - elapsed).min(200).max(1);
            self.refresh_cond
                .wait_for(&mut guard, Duration::from_millis(wait));
        }
        Ok(())
    }

    /// Submit an ordered batch of events at the given version.
    pub fn consume(&self, events: Vec<V>, version: Version) -> Result<()> {
        self.consumer.consume(events, version)
    }

    /// Block until everything submitted before this call is committed to
    /// the disk partition and a fresh snapshot has been published.
    pub fn flush_events(&self, timeout_ms: u64) -> Result<()> {
        self.consumer.flush_events(timeout_ms)?;
        self.loader_core.flush_events(timeout_ms)?;
        self.refresh_cache(timeout_ms)
    }

    /// Drain the consumer front into the memory tier and republish,
    /// without forcing a disk flush.
    pub fn flush_events_to_memory_index(&self, timeout_ms: u64) -> Result<()> {
        self.consumer.flush_events(timeout_ms)?;
        self.refresh_cache(timeout_ms)
    }

    /// Block until the loader has absorbed `version` into its memory
    /// tier, then wait for a snapshot refresh so the caller can observe
    /// it. The disk barrier is [`FreshetSystem::flush_events`].
    pub fn sync_with_version(&self, timeout_ms: u64, version: Version) -> Result<()> {
        self.consumer.sync_with_version(timeout_ms, version)?;
        self.refresh_cache(timeout_ms)
    }

    /// Current disk version watermark. Missing or corrupt on-disk state
    /// degrades to 0 with a logged error.
    pub fn get_version(&self) -> Version {
        self.directory.version()
    }

    /// Smallest uid across all partitions, if any document exists.
    pub fn min_uid(&self) -> Option<u64> {
        let readers = self.get_index_readers();
        let min = readers.iter().filter_map(|r| r.min_uid()).min();
        self.return_index_readers(readers);
        min
    }

    /// Largest uid across all partitions, if any document exists.
    pub fn max_uid(&self) -> Option<u64> {
        let readers = self.get_index_readers();
        let max = readers.iter().filter_map(|r| r.max_uid()).max();
        self.return_index_readers(readers);
        max
    }

    /// Flush, wipe all partitions, republish.
    pub fn purge_index(&self) -> Result<()> {
        if let Err(e) = self.flush_events(20_000) {
            debug!(error = %e, "flush before purge did not complete");
        }
        self.manager.purge()?;
        if let Err(e) = self.refresh_cache(20_000) {
            error!(error = %e, "refresh cache in purge_index");
        }
        Ok(())
    }

    pub fn export_snapshot(&self, out: &mut dyn std::io::Write) -> Result<()> {
        self.disk_loader.export_snapshot(out)
    }

    pub fn import_snapshot(&self, input: &mut dyn std::io::Read) -> Result<()> {
        self.disk_loader.import_snapshot(input)
    }

    pub fn add_indexing_event_listener(&self, listener: Arc<dyn IndexingEventListener>) {
        self.listeners.add(listener);
    }

    pub fn set_optimize_scheduler(&self, scheduler: Arc<dyn OptimizeScheduler>) {
        self.disk_loader.set_optimize_scheduler(scheduler);
    }

    pub fn optimize_scheduler(&self) -> Arc<dyn OptimizeScheduler> {
        self.disk_loader.optimize_scheduler()
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    pub fn analyzer(&self) -> &Arc<dyn Analyzer> {
        &self.analyzer
    }

    pub fn freshness_ms(&self) -> u64 {
        self.freshness_ms.load(Ordering::Acquire)
    }

    pub fn set_freshness_ms(&self, freshness_ms: u64) {
        self.freshness_ms.store(freshness_ms, Ordering::Release);
        let _guard = self.refresh_monitor.lock();
        self.refresh_cond.notify_all();
    }

    pub fn sla_ms(&self) -> u64 {
        self.sla_ms.load(Ordering::Acquire)
    }

    pub fn set_sla_ms(&self, sla_ms: u64) {
        self.sla_ms.store(sla_ms, Ordering::Release);
    }

    /// Events queued at the consumer front.
    pub fn current_mem_batch_size(&self) -> usize {
        self.consumer.pending()
    }

    /// Events staged for the next disk flush.
    pub fn current_disk_batch_size(&self) -> usize {
        self.loader_core.pending()
    }

    pub fn metrics(&self) -> &Arc<IndexingMetrics> {
        &self.metrics
    }

    pub fn already_shutdown(&self) -> bool {
        self.already_shutdown.load(Ordering::Acquire)
    }

    /// The administrative capability bag for this system.
    pub fn admin(self: &Arc<Self>) -> crate::admin::FreshetAdmin<V> {
        crate::admin::FreshetAdmin::new(self.clone())
    }

    pub(crate) fn manager(&self) -> &Arc<SearchIndexManager> {
        &self.manager
    }

    pub(crate) fn disk_loader(&self) -> &Arc<DiskLoader> {
        &self.disk_loader
    }

    pub(crate) fn loader_core(&self) -> &Arc<LoaderCore> {
        &self.loader_core
    }

    pub(crate) fn directory(&self) -> &DirectoryManager {
        &self.directory
    }

    /// Idempotent shutdown: flag first, then flush everything to disk,
    /// stop the pipeline workers, and close the partitions. The
    /// maintainer keeps draining reader returns (at a relaxed cadence)
    /// until the system is dropped.
    pub fn shutdown(&self) {
        {
            let _guard = self.shutdown_lock.write();
            if self.already_shutdown.swap(true, Ordering::AcqRel) {
                warn!("already shut/shutting down; ignoring new shutdown request");
                return;
            }
            self.freshness_ms.store(30_000, Ordering::Release);
        }
        info!("shutting down freshet...");
        if let Err(e) = self.flush_events(u64::MAX) {
            error!(error = %e, "flush during shutdown failed");
        }
        self.loader_core.stop();
        self.consumer.stop();
        self.manager.close();
        info!("freshet shutdown complete");
    }
}

impl<V> Drop for FreshetSystem<V> {
    fn drop(&mut self) {
        {
            let _guard = self.refresh_monitor.lock();
            self.maintainer_stop.store(true, Ordering::Release);
            self.refresh_cond.notify_all();
        }
        if let Some(handle) = self.maintainer.lock().take() {
            // Drop can land on the maintainer thread itself when its
            // iteration releases the final strong handle
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.consumer.stop();
        self.loader_core.stop();
        if !self.already_shutdown.load(Ordering::Acquire) {
            if self.started.load(Ordering::Acquire) {
                warn!("freshet dropped without shutdown");
            }
            self.manager.close();
        }
        // release the cached snapshot and drain any outstanding returns
        let cached = std::mem::take(&mut *self.cache.write());
        for reader in cached {
            reader.dec_ref();
        }
        let queue = {
            let mut queue = self.return_queue.write();
            std::mem::replace(&mut *queue, Arc::new(SegQueue::new()))
        };
        while let Some(list) = queue.pop() {
            for reader in list {
                reader.dec_ref();
            }
        }
    }
}
