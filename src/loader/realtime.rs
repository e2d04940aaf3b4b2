//! Realtime index data loader.
//!
//! Extends the batched loader: each accepted batch is applied to the
//! active memory partition immediately, so readers see it without
//! waiting for a disk flush. The staged copy only drives the flush
//! thresholds and backpressure accounting; it is never re-applied.

use std::sync::Arc;

use crate::error::Result;
use crate::event::{DataConsumer, Interpreter, Version};
use crate::loader::batched::{interpret_batch, LoaderCore};

pub struct RealtimeLoader<V> {
    core: Arc<LoaderCore>,
    interpreter: Arc<dyn Interpreter<V>>,
}

impl<V> RealtimeLoader<V> {
    pub fn new(core: Arc<LoaderCore>, interpreter: Arc<dyn Interpreter<V>>) -> Self {
        Self { core, interpreter }
    }

    pub fn core(&self) -> &Arc<LoaderCore> {
        &self.core
    }
}

impl<V: Send + Sync> DataConsumer<V> for RealtimeLoader<V> {
    fn consume(&self, events: Vec<V>, version: Version) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let batch = interpret_batch(self.interpreter.as_ref(), &events);
        self.core.manager().apply_to_active(&batch, version)?;
        self.core.listeners().fire_memory_apply(version);
        self.core.stage(batch, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docid::DefaultDocIdMapperFactory;
    use crate::engine::analyzer::SimpleAnalyzer;
    use crate::engine::visible_uids;
    use crate::event::Indexable;
    use crate::listener::ListenerRegistry;
    use crate::loader::disk::DiskLoader;
    use crate::manager::SearchIndexManager;
    use crate::metrics::IndexingMetrics;
    use tempfile::TempDir;

    fn realtime(dir: &std::path::Path) -> RealtimeLoader<Indexable> {
        let manager = Arc::new(
            SearchIndexManager::open(
                dir,
                Arc::new(SimpleAnalyzer),
                Arc::new(DefaultDocIdMapperFactory),
            )
            .unwrap(),
        );
        let listeners = Arc::new(ListenerRegistry::new());
        let metrics = Arc::new(IndexingMetrics::default());
        let disk_loader = Arc::new(DiskLoader::new(
            manager.clone(),
            listeners.clone(),
            metrics.clone(),
        ));
        let core = Arc::new(LoaderCore::new(
            manager,
            disk_loader,
            listeners,
            metrics,
            1000,
            2000,
            300_000,
            true,
        ));
        RealtimeLoader::new(core, Arc::new(|e: &Indexable| e.clone()))
    }

    #[test]
    fn test_events_visible_before_flush() {
        let tmp = TempDir::new().unwrap();
        let loader = realtime(tmp.path());

        loader
            .consume(
                vec![Indexable::add(1, "one"), Indexable::add(2, "two")],
                2,
            )
            .unwrap();

        // no flush worker running, nothing on disk
        assert_eq!(loader.core().manager().disk_version(), 0);

        let readers = loader.core().manager().get_index_readers();
        assert_eq!(visible_uids(&readers), vec![1, 2]);
        for reader in readers {
            reader.dec_ref();
        }
        loader.core().manager().close();
    }

    #[test]
    fn test_fifo_within_batch() {
        let tmp = TempDir::new().unwrap();
        let loader = realtime(tmp.path());

        // add then delete the same uid in one batch: the delete wins
        loader
            .consume(vec![Indexable::add(5, "doc"), Indexable::delete(5)], 1)
            .unwrap();

        let readers = loader.core().manager().get_index_readers();
        assert!(visible_uids(&readers).is_empty());
        for reader in readers {
            reader.dec_ref();
        }
        loader.core().manager().close();
    }
}
