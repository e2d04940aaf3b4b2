//! Owner of the three index partitions.
//!
//! Exactly one memory partition is the active writer at any instant; the
//! other is either empty or frozen mid-flush. Swaps happen under the
//! exclusive table lock so a reader snapshot can never straddle one: it
//! observes the pre-swap active partition or the post-swap one, never
//! both, never neither.

use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::docid::DocIdMapperFactory;
use crate::engine::analyzer::{Analyzer, TermFrequencies};
use crate::engine::{DiskIndex, PartitionKind, RamIndex, SharedReader};
use crate::error::Result;
use crate::event::{Indexable, Version};

/// Which memory partition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemSlot {
    A,
    B,
}

impl MemSlot {
    pub fn other(self) -> Self {
        match self {
            MemSlot::A => MemSlot::B,
            MemSlot::B => MemSlot::A,
        }
    }
}

impl fmt::Display for MemSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemSlot::A => write!(f, "mem-a"),
            MemSlot::B => write!(f, "mem-b"),
        }
    }
}

/// Memory partition lifecycle: EMPTY -> ACTIVE -> FLUSHING -> EMPTY,
/// with FLUSHING retried in place on a failed commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionState {
    Empty,
    Active,
    Flushing,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Empty => write!(f, "EMPTY"),
            PartitionState::Active => write!(f, "ACTIVE"),
            PartitionState::Flushing => write!(f, "FLUSHING"),
        }
    }
}

/// Pass-through tunables for the engine's segment handling
#[derive(Clone, Debug)]
pub struct SegmentPolicy {
    pub merge_factor: usize,
    pub max_merge_docs: usize,
    pub use_compound_file: bool,
    /// Default optimize target
    pub num_large_segments: usize,
    /// Segments beyond the large budget tolerated before a forced merge
    pub max_small_segments: usize,
}

impl Default for SegmentPolicy {
    fn default() -> Self {
        Self {
            merge_factor: 10,
            max_merge_docs: u32::MAX as usize,
            use_compound_file: true,
            num_large_segments: 8,
            max_small_segments: 16,
        }
    }
}

struct PartitionTable {
    active: MemSlot,
    a: PartitionState,
    b: PartitionState,
}

impl PartitionTable {
    fn state(&self, slot: MemSlot) -> PartitionState {
        match slot {
            MemSlot::A => self.a,
            MemSlot::B => self.b,
        }
    }

    fn set_state(&mut self, slot: MemSlot, state: PartitionState) {
        match slot {
            MemSlot::A => self.a = state,
            MemSlot::B => self.b = state,
        }
    }
}

pub struct SearchIndexManager {
    disk: DiskIndex,
    mem_a: RamIndex,
    mem_b: RamIndex,
    table: RwLock<PartitionTable>,
    /// Swapped wholesale on update so readers of the policy never block
    policy: ArcSwap<SegmentPolicy>,
}

impl SearchIndexManager {
    pub fn open(
        dir: &Path,
        analyzer: Arc<dyn Analyzer>,
        mapper_factory: Arc<dyn DocIdMapperFactory>,
    ) -> Result<Self> {
        let disk = DiskIndex::open(dir, mapper_factory.clone())?;
        Ok(Self {
            disk,
            mem_a: RamIndex::new(PartitionKind::MemA, analyzer.clone(), mapper_factory.clone()),
            mem_b: RamIndex::new(PartitionKind::MemB, analyzer, mapper_factory),
            table: RwLock::new(PartitionTable {
                active: MemSlot::A,
                a: PartitionState::Active,
                b: PartitionState::Empty,
            }),
            policy: ArcSwap::from_pointee(SegmentPolicy::default()),
        })
    }

    fn mem(&self, slot: MemSlot) -> &RamIndex {
        match slot {
            MemSlot::A => &self.mem_a,
            MemSlot::B => &self.mem_b,
        }
    }

    /// Ordered reader snapshot: disk first, then the memory partitions
    /// serving reads, oldest to newest. A partition frozen mid-flush is
    /// included until its disk commit lands, so its events never drop out
    /// of view. Every reader is pre-incremented; the caller owes one
    /// return per element.
    pub fn get_index_readers(&self) -> Vec<SharedReader> {
        let table = self.table.read();
        let mut readers = vec![self.disk.reader()];
        let flushing = table.active.other();
        if table.state(flushing) == PartitionState::Flushing {
            readers.push(self.mem(flushing).reader());
        }
        readers.push(self.mem(table.active).reader());
        readers
    }

    /// Apply an interpreted batch to the active memory partition. The
    /// table read lock is held across the apply so a swap cannot slice a
    /// batch away from the partition it was written to.
    pub fn apply_to_active(&self, batch: &[Indexable], version: Version) -> Result<()> {
        let table = self.table.read();
        self.mem(table.active).apply(batch, version)
    }

    pub fn active_slot(&self) -> MemSlot {
        self.table.read().active
    }

    pub fn active_is_empty(&self) -> bool {
        let table = self.table.read();
        self.mem(table.active).is_empty()
    }

    pub fn active_version(&self) -> Version {
        let table = self.table.read();
        self.mem(table.active).version()
    }

    /// The partition frozen by an earlier swap whose disk commit has not
    /// succeeded yet.
    pub fn flushing_slot(&self) -> Option<MemSlot> {
        let table = self.table.read();
        if table.a == PartitionState::Flushing {
            Some(MemSlot::A)
        } else if table.b == PartitionState::Flushing {
            Some(MemSlot::B)
        } else {
            None
        }
    }

    /// Freeze the active partition for flushing and activate its empty
    /// sibling, carrying the version watermark forward. Returns the slot
    /// now FLUSHING, or `None` when the sibling is still occupied by a
    /// failed flush or the active partition has nothing to hand off.
    pub fn try_swap(&self) -> Option<MemSlot> {
        let mut table = self.table.write();
        let active = table.active;
        let sibling = active.other();
        if table.state(sibling) != PartitionState::Empty {
            return None;
        }
        if self.mem(active).is_empty() {
            return None;
        }
        let version = self.mem(active).version();
        self.mem(sibling).carry_version(version);
        table.set_state(active, PartitionState::Flushing);
        table.set_state(sibling, PartitionState::Active);
        table.active = sibling;
        debug!(frozen = %active, active = %sibling, version, "memory partitions swapped");
        Some(active)
    }

    /// Snapshot a frozen partition's accumulated writes for the disk
    /// hand-off.
    pub fn flushing_contents(
        &self,
        slot: MemSlot,
    ) -> (Vec<(u64, TermFrequencies)>, Vec<u64>, Version) {
        self.mem(slot).contents()
    }

    /// Drop a frozen partition's contents after a successful disk commit.
    pub fn clear_flushing(&self, slot: MemSlot) {
        let mut table = self.table.write();
        self.mem(slot).clear();
        table.set_state(slot, PartitionState::Empty);
    }

    /// Both memory partitions hold nothing to flush.
    pub fn mems_empty(&self) -> bool {
        self.mem_a.is_empty() && self.mem_b.is_empty()
    }

    pub fn mem_version(&self, slot: MemSlot) -> Version {
        self.mem(slot).version()
    }

    pub fn mem_num_docs(&self, slot: MemSlot) -> usize {
        self.mem(slot).num_docs()
    }

    pub fn mem_size_bytes(&self, slot: MemSlot) -> usize {
        self.mem(slot).size_bytes()
    }

    pub fn mem_segment_count(&self, slot: MemSlot) -> usize {
        self.mem(slot).segment_count()
    }

    pub fn partition_state(&self, slot: MemSlot) -> PartitionState {
        self.table.read().state(slot)
    }

    /// Both memory partition states, read atomically.
    pub fn partition_states(&self) -> (PartitionState, PartitionState) {
        let table = self.table.read();
        (table.a, table.b)
    }

    pub fn disk_version(&self) -> Version {
        self.disk.version()
    }

    pub fn disk_segment_count(&self) -> usize {
        self.disk.segment_count()
    }

    pub fn disk_live_doc_count(&self) -> usize {
        self.disk.live_doc_count()
    }

    pub fn disk_size_bytes(&self) -> u64 {
        self.disk.size_bytes()
    }

    /// Write a frozen partition's batch as a disk segment and commit the
    /// version watermark.
    pub fn disk_apply_and_commit(
        &self,
        docs: Vec<(u64, TermFrequencies)>,
        deletes: Vec<u64>,
        version: Version,
    ) -> Result<()> {
        let compound = self.policy.load().use_compound_file;
        self.disk.apply(docs, deletes, version, compound)?;
        self.disk.commit(version)
    }

    /// Merge the disk partition down to `target` segments (policy default
    /// when `None`).
    pub fn disk_optimize(&self, target: Option<usize>) -> Result<()> {
        let policy = self.policy();
        self.disk.optimize(
            target.unwrap_or(policy.num_large_segments),
            policy.merge_factor,
            policy.max_merge_docs,
            policy.use_compound_file,
        )
    }

    pub fn disk_expunge_deletes(&self) -> Result<()> {
        self.disk.expunge_deletes()
    }

    pub fn disk_export_snapshot(&self, out: &mut dyn Write) -> Result<()> {
        self.disk.export_snapshot(out)
    }

    pub fn disk_import_snapshot(&self, input: &mut dyn Read) -> Result<()> {
        self.disk.import_snapshot(input)
    }

    /// Republish the disk partition's reader on the next borrow.
    pub fn refresh_disk_reader(&self) {
        self.disk.republish();
    }

    /// The disk segment count has outgrown the policy budget and a forced
    /// merge is warranted.
    pub fn segment_budget_exceeded(&self) -> bool {
        let policy = self.policy.load();
        self.disk.segment_count() > policy.num_large_segments + policy.max_small_segments
    }

    /// Wipe all three partitions. Version watermarks reset to zero.
    pub fn purge(&self) -> Result<()> {
        let mut table = self.table.write();
        self.mem_a.reset();
        self.mem_b.reset();
        table.a = PartitionState::Active;
        table.b = PartitionState::Empty;
        table.active = MemSlot::A;
        self.disk.purge()?;
        info!("all partitions purged");
        Ok(())
    }

    pub fn policy(&self) -> SegmentPolicy {
        (**self.policy.load()).clone()
    }

    pub fn update_policy(&self, f: impl FnOnce(&mut SegmentPolicy)) {
        let mut policy = self.policy();
        f(&mut policy);
        self.policy.store(Arc::new(policy));
    }

    /// Release every partition's published reader.
    pub fn close(&self) {
        self.disk.close();
        self.mem_a.close();
        self.mem_b.close();
        info!("search index manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docid::DefaultDocIdMapperFactory;
    use crate::engine::analyzer::SimpleAnalyzer;
    use crate::engine::visible_uids;
    use tempfile::TempDir;

    fn manager(dir: &Path) -> SearchIndexManager {
        SearchIndexManager::open(
            dir,
            Arc::new(SimpleAnalyzer),
            Arc::new(DefaultDocIdMapperFactory),
        )
        .unwrap()
    }

    fn return_all(readers: Vec<SharedReader>) {
        for reader in readers {
            reader.dec_ref();
        }
    }

    #[test]
    fn test_initial_states() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        assert_eq!(mgr.active_slot(), MemSlot::A);
        assert_eq!(mgr.partition_state(MemSlot::A), PartitionState::Active);
        assert_eq!(mgr.partition_state(MemSlot::B), PartitionState::Empty);
        assert!(mgr.flushing_slot().is_none());
        mgr.close();
    }

    #[test]
    fn test_readers_are_preincremented() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        let readers = mgr.get_index_readers();
        assert_eq!(readers.len(), 2);
        for reader in &readers {
            // owner ref + this borrow
            assert_eq!(reader.ref_count(), 2);
        }
        return_all(readers);
        mgr.close();
    }

    #[test]
    fn test_swap_freezes_and_carries_version() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.apply_to_active(&[Indexable::add(1, "doc")], 5).unwrap();

        let frozen = mgr.try_swap().unwrap();
        assert_eq!(frozen, MemSlot::A);
        assert_eq!(mgr.active_slot(), MemSlot::B);
        assert_eq!(mgr.partition_state(MemSlot::A), PartitionState::Flushing);
        assert_eq!(mgr.partition_state(MemSlot::B), PartitionState::Active);
        assert_eq!(mgr.mem_version(MemSlot::B), 5);

        // sibling occupied: a second swap is refused until the flush clears
        mgr.apply_to_active(&[Indexable::add(2, "doc")], 6).unwrap();
        assert!(mgr.try_swap().is_none());

        mgr.clear_flushing(MemSlot::A);
        assert_eq!(mgr.partition_state(MemSlot::A), PartitionState::Empty);
        assert_eq!(mgr.try_swap(), Some(MemSlot::B));
        mgr.close();
    }

    #[test]
    fn test_swap_refused_when_active_empty() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        assert!(mgr.try_swap().is_none());
        mgr.close();
    }

    #[test]
    fn test_flush_handoff_to_disk() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.apply_to_active(
            &[Indexable::add(1, "alpha"), Indexable::add(2, "beta")],
            2,
        )
        .unwrap();

        let frozen = mgr.try_swap().unwrap();
        let (docs, deletes, version) = mgr.flushing_contents(frozen);
        mgr.disk_apply_and_commit(docs, deletes, version).unwrap();
        mgr.clear_flushing(frozen);

        assert_eq!(mgr.disk_version(), 2);
        assert_eq!(mgr.disk_live_doc_count(), 2);
        assert!(mgr.mems_empty());

        let readers = mgr.get_index_readers();
        assert_eq!(visible_uids(&readers), vec![1, 2]);
        return_all(readers);
        mgr.close();
    }

    #[test]
    fn test_purge_resets_everything() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.apply_to_active(&[Indexable::add(1, "a")], 3).unwrap();
        let frozen = mgr.try_swap().unwrap();
        let (docs, deletes, version) = mgr.flushing_contents(frozen);
        mgr.disk_apply_and_commit(docs, deletes, version).unwrap();
        mgr.clear_flushing(frozen);

        mgr.purge().unwrap();
        assert_eq!(mgr.disk_version(), 0);
        assert_eq!(mgr.disk_live_doc_count(), 0);
        assert_eq!(mgr.active_slot(), MemSlot::A);
        assert!(mgr.mems_empty());
        assert_eq!(mgr.active_version(), 0);
        mgr.close();
    }

    #[test]
    fn test_policy_updates() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.update_policy(|p| {
            p.merge_factor = 4;
            p.num_large_segments = 2;
            p.max_small_segments = 1;
        });
        let policy = mgr.policy();
        assert_eq!(policy.merge_factor, 4);
        assert!(!mgr.segment_budget_exceeded());
        mgr.close();
    }
}
