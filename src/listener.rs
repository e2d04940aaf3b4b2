use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::FreshetError;
use crate::event::Version;

/// Hook points fired by the indexing pipeline.
///
/// Listeners run on pipeline threads and must return quickly. A panicking
/// listener is logged and never unwinds into the pipeline.
pub trait IndexingEventListener: Send + Sync {
    /// A batch was applied to the active memory partition.
    fn on_memory_apply(&self, _version: Version) {}

    /// A memory partition was committed to the disk partition.
    fn on_disk_flush(&self, _version: Version) {}

    /// A pipeline stage failed.
    fn on_error(&self, _error: &FreshetError) {}
}

/// Append-only listener list, invoked in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn IndexingEventListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn IndexingEventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn fire_memory_apply(&self, version: Version) {
        self.each(|l| l.on_memory_apply(version));
    }

    pub fn fire_disk_flush(&self, version: Version) {
        self.each(|l| l.on_disk_flush(version));
    }

    pub fn fire_error(&self, error: &FreshetError) {
        self.each(|l| l.on_error(error));
    }

    fn each(&self, f: impl Fn(&dyn IndexingEventListener)) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!("indexing event listener panicked; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Recording {
        mem: AtomicU64,
        disk: AtomicU64,
        errors: AtomicU64,
    }

    impl IndexingEventListener for Recording {
        fn on_memory_apply(&self, version: Version) {
            self.mem.store(version, Ordering::SeqCst);
        }

        fn on_disk_flush(&self, version: Version) {
            self.disk.store(version, Ordering::SeqCst);
        }

        fn on_error(&self, _error: &FreshetError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl IndexingEventListener for Panicking {
        fn on_memory_apply(&self, _version: Version) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_fires_in_order_and_records() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(Recording::default());
        registry.add(listener.clone());

        registry.fire_memory_apply(5);
        registry.fire_disk_flush(5);
        registry.fire_error(&FreshetError::ConsumerClosed);

        assert_eq!(listener.mem.load(Ordering::SeqCst), 5);
        assert_eq!(listener.disk.load(Ordering::SeqCst), 5);
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_poison_others() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(Recording::default());
        registry.add(Arc::new(Panicking));
        registry.add(listener.clone());

        registry.fire_memory_apply(9);
        assert_eq!(listener.mem.load(Ordering::SeqCst), 9);
    }
}
