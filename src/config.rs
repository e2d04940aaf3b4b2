use serde::{Deserialize, Serialize};

/// Pipeline configuration.
///
/// `batch_size` is the desired staging size before a flush to disk is
/// triggered; `max_batch_size` is the hard cap at which producers block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FreshetConfig {
    /// Desired number of staged events before flushing to disk
    pub batch_size: usize,
    /// Hard cap on staged events; producers block above this
    pub max_batch_size: usize,
    /// Maximum age of the staging window before a flush is forced (ms)
    pub batch_delay_ms: u64,
    /// Apply events to the active memory partition as they arrive, making
    /// them visible to readers before any disk flush
    pub rt_indexing: bool,
    /// Upper bound on reader cache staleness (ms)
    pub freshness_ms: u64,
    /// Reader acquire/return latency budget; exceedances are logged (ms)
    pub sla_ms: u64,
}

impl Default for FreshetConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            max_batch_size: 10_000,
            batch_delay_ms: 300_000,
            rt_indexing: true,
            freshness_ms: 10_000,
            sla_ms: 3,
        }
    }
}

impl FreshetConfig {
    /// Clamp fields into their valid ranges: `batch_size >= 1` and
    /// `max_batch_size >= batch_size`. The caller's batch size is
    /// otherwise authoritative.
    pub fn normalized(&self) -> Self {
        let batch_size = self.batch_size.max(1);
        Self {
            batch_size,
            max_batch_size: self.max_batch_size.max(batch_size),
            ..self.clone()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_batch_delay_ms(mut self, batch_delay_ms: u64) -> Self {
        self.batch_delay_ms = batch_delay_ms;
        self
    }

    pub fn with_rt_indexing(mut self, rt_indexing: bool) -> Self {
        self.rt_indexing = rt_indexing;
        self
    }

    pub fn with_freshness_ms(mut self, freshness_ms: u64) -> Self {
        self.freshness_ms = freshness_ms;
        self
    }

    pub fn with_sla_ms(mut self, sla_ms: u64) -> Self {
        self.sla_ms = sla_ms;
        self
    }
}
