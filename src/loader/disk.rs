//! Applies frozen memory partitions to the disk partition.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::event::Version;
use crate::health;
use crate::listener::ListenerRegistry;
use crate::loader::optimize::{DefaultOptimizeScheduler, OptimizeScheduler};
use crate::manager::{MemSlot, SearchIndexManager};
use crate::metrics::IndexingMetrics;

pub struct DiskLoader {
    manager: Arc<SearchIndexManager>,
    listeners: Arc<ListenerRegistry>,
    metrics: Arc<IndexingMetrics>,
    scheduler: RwLock<Arc<dyn OptimizeScheduler>>,
    flushes_since_optimize: AtomicU64,
}

impl DiskLoader {
    pub fn new(
        manager: Arc<SearchIndexManager>,
        listeners: Arc<ListenerRegistry>,
        metrics: Arc<IndexingMetrics>,
    ) -> Self {
        Self {
            manager,
            listeners,
            metrics,
            scheduler: RwLock::new(Arc::new(DefaultOptimizeScheduler::new())),
            flushes_since_optimize: AtomicU64::new(0),
        }
    }

    pub fn set_optimize_scheduler(&self, scheduler: Arc<dyn OptimizeScheduler>) {
        *self.scheduler.write() = scheduler;
    }

    pub fn optimize_scheduler(&self) -> Arc<dyn OptimizeScheduler> {
        self.scheduler.read().clone()
    }

    /// Merge a frozen memory partition into the disk partition and commit
    /// its version watermark. On success the partition is cleared; on
    /// failure it stays FLUSHING and populated so the next cycle retries.
    pub fn load_from_index(&self, slot: MemSlot) -> Result<Version> {
        let (docs, deletes, version) = self.manager.flushing_contents(slot);
        if docs.is_empty() && deletes.is_empty() {
            self.manager.clear_flushing(slot);
            return Ok(version);
        }
        let doc_count = docs.len();
        let started = Instant::now();
        match self.manager.disk_apply_and_commit(docs, deletes, version) {
            Ok(()) => {
                self.manager.clear_flushing(slot);
                self.metrics
                    .record_flush(doc_count, started.elapsed().as_secs_f64());
                self.metrics.set_disk_version(version);
                self.listeners.fire_disk_flush(version);
                info!(partition = %slot, docs = doc_count, version, "flushed to disk");
                self.flushes_since_optimize.fetch_add(1, Ordering::AcqRel);
                self.maybe_optimize();
                Ok(version)
            }
            Err(e) => {
                error!(
                    partition = %slot,
                    error = %e,
                    "disk flush failed; partition retained for retry"
                );
                health::set_fatal();
                self.metrics.record_flush_error();
                self.listeners.fire_error(&e);
                Err(e)
            }
        }
    }

    fn maybe_optimize(&self) {
        let scheduler = self.optimize_scheduler();
        let flushes = self.flushes_since_optimize.load(Ordering::Acquire);
        let due = scheduler.optimize_due(flushes, self.manager.disk_segment_count())
            || self.manager.segment_budget_exceeded();
        if !due {
            return;
        }
        match self.manager.disk_optimize(None) {
            Ok(()) => {
                scheduler.mark_optimized();
                self.flushes_since_optimize.store(0, Ordering::Release);
            }
            Err(e) => {
                warn!(error = %e, "scheduled optimize failed");
                health::set_warn();
            }
        }
    }

    /// Merge the disk partition down to at most `target_segments`.
    pub fn optimize(&self, target_segments: usize) -> Result<()> {
        self.manager.disk_optimize(Some(target_segments))?;
        self.optimize_scheduler().mark_optimized();
        self.flushes_since_optimize.store(0, Ordering::Release);
        Ok(())
    }

    /// Force removal of tombstoned documents from disk segments.
    pub fn expunge_deletes(&self) -> Result<()> {
        self.manager.disk_expunge_deletes()
    }

    pub fn export_snapshot(&self, out: &mut dyn Write) -> Result<()> {
        self.manager.disk_export_snapshot(out)
    }

    pub fn import_snapshot(&self, input: &mut dyn Read) -> Result<()> {
        self.manager.disk_import_snapshot(input)?;
        self.manager.refresh_disk_reader();
        Ok(())
    }

    pub fn last_optimize_time_ms(&self) -> u64 {
        self.optimize_scheduler().last_optimize_time_ms()
    }
}
