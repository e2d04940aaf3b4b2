//! The inverted-index engine: analyzer, memory and disk partitions, and
//! reference-counted readers.

pub mod analyzer;
pub mod disk;
pub mod ram;
pub mod reader;

pub use analyzer::{Analyzer, SimpleAnalyzer, TermFrequencies};
pub use disk::{DiskIndex, Manifest, SegmentMeta};
pub use ram::RamIndex;
pub use reader::{visible_uids, IndexReader, PartitionKind, SharedReader};
