//! The indexing data loaders: staging, flush scheduling, and the
//! memory-to-disk hand-off.

pub mod batched;
pub mod disk;
pub mod optimize;
pub mod realtime;

pub use batched::{BatchedLoader, LoaderCore};
pub use disk::DiskLoader;
pub use optimize::{DefaultOptimizeScheduler, OptimizeScheduler};
pub use realtime::RealtimeLoader;
