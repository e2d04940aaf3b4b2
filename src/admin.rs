//! Administrative surface.
//!
//! A capability bag over a shared system handle: every getter, setter,
//! and command an operator needs, with no transport assumed. Expose it
//! over HTTP, a CLI, or wire it into a metrics endpoint as needed.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::info;

use crate::error::Result;
use crate::event::Version;
use crate::health::{self, HealthCode};
use crate::manager::{MemSlot, PartitionState};
use crate::system::FreshetSystem;

pub struct FreshetAdmin<V> {
    system: Arc<FreshetSystem<V>>,
}

impl<V: Send + Sync + 'static> FreshetAdmin<V> {
    pub fn new(system: Arc<FreshetSystem<V>>) -> Self {
        Self { system }
    }

    // -- getters --------------------------------------------------------

    pub fn current_disk_version(&self) -> Version {
        self.system.get_version()
    }

    pub fn disk_segment_count(&self) -> usize {
        self.system.manager().disk_segment_count()
    }

    pub fn mem_a_segment_count(&self) -> usize {
        self.system.manager().mem_segment_count(MemSlot::A)
    }

    pub fn mem_b_segment_count(&self) -> usize {
        self.system.manager().mem_segment_count(MemSlot::B)
    }

    pub fn mem_a_version(&self) -> Version {
        self.system.manager().mem_version(MemSlot::A)
    }

    pub fn mem_b_version(&self) -> Version {
        self.system.manager().mem_version(MemSlot::B)
    }

    /// Documents currently held in memory partition A.
    pub fn mem_a_index_size(&self) -> usize {
        self.system.manager().mem_num_docs(MemSlot::A)
    }

    /// Documents currently held in memory partition B.
    pub fn mem_b_index_size(&self) -> usize {
        self.system.manager().mem_num_docs(MemSlot::B)
    }

    /// Live documents in the disk partition.
    pub fn disk_index_size(&self) -> usize {
        self.system.manager().disk_live_doc_count()
    }

    /// Bytes occupied by the index directory.
    pub fn disk_index_size_bytes(&self) -> u64 {
        self.system.directory().size_bytes()
    }

    /// Free bytes on the filesystem holding the index; -1 when unknown.
    pub fn disk_free_space_bytes(&self) -> i64 {
        self.system.directory().free_space_bytes()
    }

    pub fn index_dir(&self) -> PathBuf {
        self.system.directory().path().to_path_buf()
    }

    pub fn is_realtime(&self) -> bool {
        self.system.is_realtime()
    }

    pub fn partition_states(&self) -> (PartitionState, PartitionState) {
        self.system.manager().partition_states()
    }

    pub fn last_optimize_time(&self) -> Option<DateTime<Utc>> {
        let ms = self.system.disk_loader().last_optimize_time_ms();
        if ms == 0 {
            return None;
        }
        Utc.timestamp_millis_opt(ms as i64).single()
    }

    pub fn last_index_modified_time(&self) -> Option<DateTime<Utc>> {
        self.system.directory().last_index_modified_time()
    }

    /// Events queued at the consumer front.
    pub fn current_mem_batch_size(&self) -> usize {
        self.system.current_mem_batch_size()
    }

    /// Events staged for the next disk flush.
    pub fn current_disk_batch_size(&self) -> usize {
        self.system.current_disk_batch_size()
    }

    pub fn min_uid(&self) -> Option<u64> {
        self.system.min_uid()
    }

    pub fn max_uid(&self) -> Option<u64> {
        self.system.max_uid()
    }

    pub fn freshness_ms(&self) -> u64 {
        self.system.freshness_ms()
    }

    pub fn sla_ms(&self) -> u64 {
        self.system.sla_ms()
    }

    pub fn health(&self) -> HealthCode {
        health::current()
    }

    pub fn batch_size(&self) -> usize {
        self.system.loader_core().batch_size()
    }

    pub fn max_batch_size(&self) -> usize {
        self.system.loader_core().max_batch_size()
    }

    pub fn batch_delay_ms(&self) -> u64 {
        self.system.loader_core().batch_delay_ms()
    }

    pub fn merge_factor(&self) -> usize {
        self.system.manager().policy().merge_factor
    }

    pub fn max_merge_docs(&self) -> usize {
        self.system.manager().policy().max_merge_docs
    }

    pub fn use_compound_file(&self) -> bool {
        self.system.manager().policy().use_compound_file
    }

    pub fn num_large_segments(&self) -> usize {
        self.system.manager().policy().num_large_segments
    }

    pub fn max_small_segments(&self) -> usize {
        self.system.manager().policy().max_small_segments
    }

    // -- setters --------------------------------------------------------

    pub fn set_batch_size(&self, batch_size: usize) {
        self.system.loader_core().set_batch_size(batch_size);
    }

    pub fn set_max_batch_size(&self, max_batch_size: usize) {
        self.system.loader_core().set_max_batch_size(max_batch_size);
    }

    pub fn set_batch_delay_ms(&self, batch_delay_ms: u64) {
        self.system.loader_core().set_batch_delay_ms(batch_delay_ms);
    }

    pub fn set_merge_factor(&self, merge_factor: usize) {
        self.system
            .manager()
            .update_policy(|p| p.merge_factor = merge_factor.max(2));
    }

    pub fn set_max_merge_docs(&self, max_merge_docs: usize) {
        self.system
            .manager()
            .update_policy(|p| p.max_merge_docs = max_merge_docs.max(1));
    }

    pub fn set_use_compound_file(&self, use_compound_file: bool) {
        self.system
            .manager()
            .update_policy(|p| p.use_compound_file = use_compound_file);
    }

    pub fn set_num_large_segments(&self, num_large_segments: usize) {
        self.system
            .manager()
            .update_policy(|p| p.num_large_segments = num_large_segments.max(1));
    }

    pub fn set_max_small_segments(&self, max_small_segments: usize) {
        self.system
            .manager()
            .update_policy(|p| p.max_small_segments = max_small_segments);
    }

    pub fn set_freshness_ms(&self, freshness_ms: u64) {
        self.system.set_freshness_ms(freshness_ms);
    }

    pub fn set_sla_ms(&self, sla_ms: u64) {
        self.system.set_sla_ms(sla_ms);
    }

    // -- commands -------------------------------------------------------

    /// Republish the disk partition's reader on the next maintenance
    /// tick.
    pub fn refresh_disk_reader(&self) {
        self.system.manager().refresh_disk_reader();
    }

    pub fn flush_to_disk_index(&self) -> Result<()> {
        info!("flushing to disk");
        self.system.flush_events(u64::MAX)?;
        info!("all events flushed to disk");
        Ok(())
    }

    pub fn flush_to_memory_index(&self) -> Result<()> {
        info!("flushing to memory");
        self.system.flush_events_to_memory_index(u64::MAX)?;
        info!("all events flushed to memory");
        Ok(())
    }

    pub fn optimize(&self, target_segments: usize) -> Result<()> {
        self.system.disk_loader().optimize(target_segments)
    }

    pub fn expunge_deletes(&self) -> Result<()> {
        self.system.disk_loader().expunge_deletes()
    }

    pub fn purge_index(&self) -> Result<()> {
        self.system.purge_index()
    }

    pub fn reset_health(&self) {
        health::reset();
    }
}
