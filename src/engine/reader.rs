//! Reference-counted point-in-time index readers.
//!
//! A reader is published with a reference count of 1 held by the owning
//! partition; every borrower pairs `inc_ref` with exactly one `dec_ref`.
//! The count reaching zero closes the reader. Unbalanced calls are logged
//! rather than propagated: a leaked or double-returned reader must not
//! take the pipeline down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use crate::docid::{DocIdMapper, DocIdMapperFactory};
use crate::event::Version;

/// Which index partition a reader was published from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    Disk,
    MemA,
    MemB,
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKind::Disk => write!(f, "disk"),
            PartitionKind::MemA => write!(f, "mem-a"),
            PartitionKind::MemB => write!(f, "mem-b"),
        }
    }
}

/// Shared handle to a published reader
pub type SharedReader = Arc<IndexReader>;

/// Immutable snapshot of one partition's live documents.
pub struct IndexReader {
    kind: PartitionKind,
    version: Version,
    segment_count: usize,
    /// Live uids, sorted ascending
    uids: Vec<u64>,
    /// Term postings over the live docs; uid lists sorted ascending
    postings: HashMap<String, Vec<u64>>,
    /// Uids this partition deletes from partitions earlier in a snapshot
    tombstones: HashSet<u64>,
    mapper: Box<dyn DocIdMapper>,
    refs: AtomicI64,
    closed: AtomicBool,
}

impl IndexReader {
    /// Publish a new reader with a reference count of 1, held by the
    /// owning partition until it republishes.
    pub fn publish(
        kind: PartitionKind,
        version: Version,
        segment_count: usize,
        mut uids: Vec<u64>,
        postings: HashMap<String, Vec<u64>>,
        tombstones: HashSet<u64>,
        mapper_factory: &dyn DocIdMapperFactory,
    ) -> SharedReader {
        uids.sort_unstable();
        uids.dedup();
        let mapper = mapper_factory.build(&uids);
        Arc::new(Self {
            kind,
            version,
            segment_count,
            uids,
            postings,
            tombstones,
            mapper,
            refs: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn num_docs(&self) -> usize {
        self.uids.len()
    }

    pub fn uids(&self) -> &[u64] {
        &self.uids
    }

    pub fn min_uid(&self) -> Option<u64> {
        self.uids.first().copied()
    }

    pub fn max_uid(&self) -> Option<u64> {
        self.uids.last().copied()
    }

    pub fn contains_uid(&self, uid: u64) -> bool {
        self.uids.binary_search(&uid).is_ok()
    }

    /// Uids of documents containing the term, sorted ascending.
    pub fn postings(&self, term: &str) -> Option<&[u64]> {
        self.postings.get(term).map(|v| v.as_slice())
    }

    pub fn doc_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map(|v| v.len()).unwrap_or(0)
    }

    /// Uids this reader deletes from partitions earlier in the snapshot
    /// ordering (documents already flushed to disk, deleted in memory).
    pub fn tombstones(&self) -> &HashSet<u64> {
        &self.tombstones
    }

    pub fn is_tombstoned(&self, uid: u64) -> bool {
        self.tombstones.contains(&uid)
    }

    pub fn doc_id(&self, uid: u64) -> Option<u32> {
        self.mapper.doc_id(uid)
    }

    pub fn uid_for(&self, doc_id: u32) -> Option<u64> {
        self.mapper.uid(doc_id)
    }

    pub fn inc_ref(&self) {
        if self.closed.load(Ordering::Acquire) {
            error!(partition = %self.kind, "inc_ref on closed reader");
        }
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.closed.store(true, Ordering::Release);
            debug!(partition = %self.kind, version = self.version, "reader closed");
        } else if prev <= 0 {
            error!(
                partition = %self.kind,
                "unbalanced dec_ref: reader returned more than once"
            );
        }
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for IndexReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexReader")
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("segment_count", &self.segment_count)
            .field("num_docs", &self.uids.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Uids visible through an ordered reader snapshot: a later reader's
/// documents shadow earlier ones and its tombstones mask them.
pub fn visible_uids(readers: &[SharedReader]) -> Vec<u64> {
    let mut visible: HashSet<u64> = HashSet::new();
    for reader in readers {
        for uid in reader.tombstones() {
            visible.remove(uid);
        }
        visible.extend(reader.uids().iter().copied());
    }
    let mut out: Vec<u64> = visible.into_iter().collect();
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docid::DefaultDocIdMapperFactory;

    fn reader(
        kind: PartitionKind,
        uids: Vec<u64>,
        tombstones: &[u64],
        version: Version,
    ) -> SharedReader {
        IndexReader::publish(
            kind,
            version,
            1,
            uids,
            HashMap::new(),
            tombstones.iter().copied().collect(),
            &DefaultDocIdMapperFactory,
        )
    }

    #[test]
    fn test_refcount_lifecycle() {
        let r = reader(PartitionKind::Disk, vec![1, 2], &[], 1);
        assert_eq!(r.ref_count(), 1);

        r.inc_ref();
        assert_eq!(r.ref_count(), 2);

        r.dec_ref();
        assert!(!r.is_closed());

        r.dec_ref();
        assert_eq!(r.ref_count(), 0);
        assert!(r.is_closed());
    }

    #[test]
    fn test_uid_accessors() {
        let r = reader(PartitionKind::MemA, vec![30, 10, 20, 20], &[], 5);
        assert_eq!(r.num_docs(), 3);
        assert_eq!(r.min_uid(), Some(10));
        assert_eq!(r.max_uid(), Some(30));
        assert!(r.contains_uid(20));
        assert!(!r.contains_uid(25));
        assert_eq!(r.doc_id(20), Some(1));
        assert_eq!(r.uid_for(2), Some(30));
    }

    #[test]
    fn test_visible_uids_masking() {
        // disk holds 1..=3; memory deletes 2 and adds 4
        let disk = reader(PartitionKind::Disk, vec![1, 2, 3], &[], 3);
        let mem = reader(PartitionKind::MemA, vec![4], &[2], 4);

        let visible = visible_uids(&[disk, mem]);
        assert_eq!(visible, vec![1, 3, 4]);
    }

    #[test]
    fn test_visible_uids_shadowing() {
        // update: uid 2 exists on disk and in memory; visible once
        let disk = reader(PartitionKind::Disk, vec![1, 2], &[], 2);
        let mem = reader(PartitionKind::MemB, vec![2], &[], 3);

        let visible = visible_uids(&[disk, mem]);
        assert_eq!(visible, vec![1, 2]);
    }
}
