//! Prometheus metrics for query execution
//!
//! Metric categories:
//! - Query outcomes and latency
//! - Per-strategy stage latency
//! - Result cache lookups and writes
//! - Backend calls (node store finds and gets, search index queries)

use crate::error::Result;
use prometheus::{CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};

/// Label of a node store `find` call
pub const NODE_STORE_FIND: &str = "node_store_find";
/// Label of a node store point lookup
pub const NODE_STORE_GET: &str = "node_store_get";
/// Label of a search index query
pub const SEARCH_INDEX: &str = "search_index";

/// Prometheus metrics collector for the query engine
pub struct QueryMetrics {
    registry: Registry,

    queries_total: CounterVec,
    query_duration: Histogram,
    stage_duration: HistogramVec,
    cache_lookups: CounterVec,
    cache_writes: CounterVec,
    backend_calls: CounterVec,
}

impl QueryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let queries_total = CounterVec::new(
            Opts::new("lineage_queries_total", "Total number of queries executed"),
            &["outcome"],
        )?;

        let query_duration = Histogram::with_opts(
            HistogramOpts::new("lineage_query_duration_seconds", "Query execution duration")
                .buckets(vec![0.0005, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new("lineage_stage_duration_seconds", "Stage execution duration")
                .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0]),
            &["strategy"],
        )?;

        let cache_lookups = CounterVec::new(
            Opts::new("lineage_cache_lookups_total", "Result cache lookups"),
            &["result"],
        )?;

        let cache_writes = CounterVec::new(
            Opts::new("lineage_cache_writes_total", "Result cache writes"),
            &["status"],
        )?;

        let backend_calls = CounterVec::new(
            Opts::new("lineage_backend_calls_total", "Calls issued to the node store and search index"),
            &["call"],
        )?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(query_duration.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(cache_writes.clone()))?;
        registry.register(Box::new(backend_calls.clone()))?;

        Ok(Self {
            registry,
            queries_total,
            query_duration,
            stage_duration,
            cache_lookups,
            cache_writes,
            backend_calls,
        })
    }

    /// Record a finished query (`done`, `empty`, `no_ancestor`, `error`, ...)
    pub fn record_query(&self, outcome: &str, duration_secs: f64) {
        self.queries_total.with_label_values(&[outcome]).inc();
        self.query_duration.observe(duration_secs);
    }

    pub fn record_stage(&self, strategy: &str, duration_secs: f64) {
        self.stage_duration
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let label = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[label]).inc();
    }

    pub fn record_cache_write(&self, ok: bool) {
        let label = if ok { "ok" } else { "failed" };
        self.cache_writes.with_label_values(&[label]).inc();
    }

    pub fn record_backend_call(&self, call: &str) {
        self.backend_calls.with_label_values(&[call]).inc();
    }

    /// Current value of a backend call counter
    pub fn backend_calls(&self, call: &str) -> u64 {
        self.backend_calls.with_label_values(&[call]).get() as u64
    }

    pub fn cache_lookups(&self, result: &str) -> u64 {
        self.cache_lookups.with_label_values(&[result]).get() as u64
    }

    pub fn queries(&self, outcome: &str) -> u64 {
        self.queries_total.with_label_values(&[outcome]).get() as u64
    }

    /// Get registry for HTTP exposure
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
