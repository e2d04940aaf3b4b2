use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Prometheus metrics for the indexing pipeline
#[derive(Clone)]
pub struct IndexingMetrics {
    // Counters
    pub events_consumed: Counter,
    pub flushes: Counter,
    pub flush_errors: Counter,

    // Gauges
    pub staged_events: Gauge,
    pub disk_version: Gauge,

    // Histograms
    pub flush_latency: Histogram,
    pub reader_acquire_latency: Histogram,
    pub batch_size: Histogram,

    registry: Arc<Registry>,
}

impl IndexingMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_consumed = Counter::with_opts(Opts::new(
            "freshet_events_consumed_total",
            "Total number of events accepted by the consumer front",
        ))?;
        registry.register(Box::new(events_consumed.clone()))?;

        let flushes = Counter::with_opts(Opts::new(
            "freshet_flushes_total",
            "Total number of successful memory-to-disk flushes",
        ))?;
        registry.register(Box::new(flushes.clone()))?;

        let flush_errors = Counter::with_opts(Opts::new(
            "freshet_flush_errors_total",
            "Total number of failed memory-to-disk flushes",
        ))?;
        registry.register(Box::new(flush_errors.clone()))?;

        let staged_events = Gauge::with_opts(Opts::new(
            "freshet_staged_events",
            "Events currently staged for the next disk flush",
        ))?;
        registry.register(Box::new(staged_events.clone()))?;

        let disk_version = Gauge::with_opts(Opts::new(
            "freshet_disk_version",
            "Version watermark committed to the disk partition",
        ))?;
        registry.register(Box::new(disk_version.clone()))?;

        let flush_latency = Histogram::with_opts(
            HistogramOpts::new(
                "freshet_flush_latency_seconds",
                "Memory-to-disk flush latency",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        registry.register(Box::new(flush_latency.clone()))?;

        let reader_acquire_latency = Histogram::with_opts(
            HistogramOpts::new(
                "freshet_reader_acquire_latency_seconds",
                "Latency of borrowing a reader snapshot from the cache",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.003, 0.01, 0.05, 0.1]),
        )?;
        registry.register(Box::new(reader_acquire_latency.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("freshet_batch_size", "Number of events per flushed batch")
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        Ok(Self {
            events_consumed,
            flushes,
            flush_errors,
            staged_events,
            disk_version,
            flush_latency,
            reader_acquire_latency,
            batch_size,
            registry: Arc::new(registry),
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Record a completed flush cycle
    pub fn record_flush(&self, batch: usize, duration_secs: f64) {
        self.flushes.inc();
        self.batch_size.observe(batch as f64);
        self.flush_latency.observe(duration_secs);
    }

    /// Record a failed flush attempt
    pub fn record_flush_error(&self) {
        self.flush_errors.inc();
    }

    /// Record accepted events
    pub fn record_consumed(&self, count: usize) {
        self.events_consumed.inc_by(count as f64);
    }

    /// Update the staged-events gauge
    pub fn set_staged(&self, staged: usize) {
        self.staged_events.set(staged as f64);
    }

    /// Update the committed disk version gauge
    pub fn set_disk_version(&self, version: u64) {
        self.disk_version.set(version as f64);
    }

    /// Record a reader-cache borrow
    pub fn record_reader_acquire(&self, duration_secs: f64) {
        self.reader_acquire_latency.observe(duration_secs);
    }
}

impl Default for IndexingMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
