//! Mutable in-memory index partition.
//!
//! One of the two memory partitions behind the search index manager. The
//! active partition absorbs interpreted events; a frozen partition is
//! drained into the disk partition and cleared. Readers are republished
//! lazily when the content has changed since the last publication.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::docid::DocIdMapperFactory;
use crate::engine::analyzer::{Analyzer, TermFrequencies};
use crate::engine::reader::{IndexReader, PartitionKind, SharedReader};
use crate::error::Result;
use crate::event::{IndexOp, Indexable, Version};

struct RamCore {
    /// uid -> analyzed terms of the live document
    docs: HashMap<u64, TermFrequencies>,
    /// uids deleted here but potentially still present on disk
    tombstones: HashSet<u64>,
    /// Highest version absorbed
    version: Version,
    /// Batches applied since the last clear
    batches: usize,
    /// Approximate heap footprint
    size_bytes: usize,
    published: Option<SharedReader>,
    dirty: bool,
}

pub struct RamIndex {
    kind: PartitionKind,
    analyzer: Arc<dyn Analyzer>,
    mapper_factory: Arc<dyn DocIdMapperFactory>,
    inner: RwLock<RamCore>,
}

fn doc_size(freqs: &TermFrequencies) -> usize {
    freqs.iter().map(|(term, _)| term.len() + 12).sum::<usize>() + 24
}

impl RamIndex {
    pub fn new(
        kind: PartitionKind,
        analyzer: Arc<dyn Analyzer>,
        mapper_factory: Arc<dyn DocIdMapperFactory>,
    ) -> Self {
        Self {
            kind,
            analyzer,
            mapper_factory,
            inner: RwLock::new(RamCore {
                docs: HashMap::new(),
                tombstones: HashSet::new(),
                version: 0,
                batches: 0,
                size_bytes: 0,
                published: None,
                dirty: true,
            }),
        }
    }

    /// Apply an interpreted batch in order and advance the absorbed
    /// version watermark.
    pub fn apply(&self, batch: &[Indexable], version: Version) -> Result<()> {
        let mut core = self.inner.write();
        for indexable in batch {
            match indexable.op {
                IndexOp::Add | IndexOp::Update => {
                    let content = indexable.content.as_deref().unwrap_or("");
                    let freqs = self.analyzer.term_frequencies(content);
                    core.size_bytes += doc_size(&freqs);
                    if let Some(old) = core.docs.insert(indexable.uid, freqs) {
                        core.size_bytes = core.size_bytes.saturating_sub(doc_size(&old));
                    }
                    core.tombstones.remove(&indexable.uid);
                }
                IndexOp::Delete => {
                    if let Some(old) = core.docs.remove(&indexable.uid) {
                        core.size_bytes = core.size_bytes.saturating_sub(doc_size(&old));
                    }
                    core.tombstones.insert(indexable.uid);
                }
            }
        }
        core.version = core.version.max(version);
        core.batches += 1;
        core.dirty = true;
        Ok(())
    }

    /// Borrow the current reader, republishing first if content changed.
    /// The returned handle is already `inc_ref`'d for the caller.
    pub fn reader(&self) -> SharedReader {
        let mut core = self.inner.write();
        if core.dirty || core.published.is_none() {
            let uids: Vec<u64> = core.docs.keys().copied().collect();
            let mut postings: HashMap<String, Vec<u64>> = HashMap::new();
            for (uid, freqs) in &core.docs {
                for term in freqs.keys() {
                    postings.entry(term.clone()).or_default().push(*uid);
                }
            }
            for uids in postings.values_mut() {
                uids.sort_unstable();
            }
            let reader = IndexReader::publish(
                self.kind,
                core.version,
                core.batches,
                uids,
                postings,
                core.tombstones.clone(),
                self.mapper_factory.as_ref(),
            );
            if let Some(old) = core.published.replace(reader) {
                old.dec_ref();
            }
            core.dirty = false;
        }
        let reader = core.published.as_ref().expect("reader just published");
        reader.inc_ref();
        reader.clone()
    }

    /// Snapshot the partition contents for the disk hand-off.
    pub fn contents(&self) -> (Vec<(u64, TermFrequencies)>, Vec<u64>, Version) {
        let core = self.inner.read();
        let docs = core.docs.iter().map(|(u, f)| (*u, f.clone())).collect();
        let deletes = core.tombstones.iter().copied().collect();
        (docs, deletes, core.version)
    }

    /// Wipe content after a successful disk commit. The version watermark
    /// is retained.
    pub fn clear(&self) {
        let mut core = self.inner.write();
        core.docs.clear();
        core.tombstones.clear();
        core.batches = 0;
        core.size_bytes = 0;
        core.dirty = true;
    }

    /// Wipe content and the version watermark. Used when the whole index
    /// is purged.
    pub fn reset(&self) {
        self.clear();
        self.inner.write().version = 0;
    }

    /// Carry the given watermark forward when this partition becomes the
    /// active writer: an empty partition has implicitly absorbed
    /// everything up to its predecessor's version.
    pub fn carry_version(&self, version: Version) {
        let mut core = self.inner.write();
        if version > core.version {
            core.version = version;
            core.dirty = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        let core = self.inner.read();
        core.docs.is_empty() && core.tombstones.is_empty()
    }

    pub fn num_docs(&self) -> usize {
        self.inner.read().docs.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.read().size_bytes
    }

    pub fn version(&self) -> Version {
        self.inner.read().version
    }

    /// Batches applied since the last clear.
    pub fn segment_count(&self) -> usize {
        self.inner.read().batches
    }

    /// Release the published reader's owner reference.
    pub fn close(&self) {
        let mut core = self.inner.write();
        if let Some(old) = core.published.take() {
            old.dec_ref();
        }
        core.dirty = true;
    }
}
