//! The builder's metric bundle. Metric names are part of the external
//! contract; dashboards and alerts reference them verbatim.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// All metrics emitted by the builder, registered once at construction.
#[derive(Debug, Clone)]
pub struct BuilderMetrics {
    /// Chunks successfully fetched from the chunk store.
    pub fetched_chunks: IntCounter,
    /// Bytes of chunk data fetched.
    pub fetched_chunks_bytes: IntCounter,
    /// Series accepted into the build.
    pub series_total: IntCounter,
    /// Samples written into blocks.
    pub written_samples: IntCounter,
    /// 1 while a plan is being built, 0 otherwise.
    pub build_in_progress: IntGauge,
    /// Requested chunks the store did not have.
    pub chunks_not_found: IntCounter,
    /// Total bytes of finished blocks.
    pub blocks_size: IntCounter,
    /// Series currently buffered in memory awaiting spill.
    pub series_in_memory: IntGauge,
}

impl BuilderMetrics {
    /// Create the bundle and register every metric with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered();

        registry.register(Box::new(metrics.fetched_chunks.clone()))?;
        registry.register(Box::new(metrics.fetched_chunks_bytes.clone()))?;
        registry.register(Box::new(metrics.series_total.clone()))?;
        registry.register(Box::new(metrics.written_samples.clone()))?;
        registry.register(Box::new(metrics.build_in_progress.clone()))?;
        registry.register(Box::new(metrics.chunks_not_found.clone()))?;
        registry.register(Box::new(metrics.blocks_size.clone()))?;
        registry.register(Box::new(metrics.series_in_memory.clone()))?;

        Ok(metrics)
    }

    /// Create the bundle without registering it, e.g. for tests.
    pub fn unregistered() -> Self {
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help)).expect("valid metric options")
        };
        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(Opts::new(name, help)).expect("valid metric options")
        };

        Self {
            fetched_chunks: counter(
                "chunks2blocks_builder_fetched_chunks_total",
                "Fetched chunks",
            ),
            fetched_chunks_bytes: counter(
                "chunks2blocks_builder_fetched_chunks_bytes_total",
                "Fetched chunks bytes",
            ),
            series_total: counter("chunks2blocks_builder_series_total", "Processed series"),
            written_samples: counter(
                "chunks2blocks_builder_written_samples_total",
                "Written samples",
            ),
            build_in_progress: gauge("chunks2blocks_builder_in_progress", "Build in progress"),
            chunks_not_found: counter(
                "chunks2blocks_builder_chunks_not_found_total",
                "Number of chunks that were not found on the storage",
            ),
            blocks_size: counter(
                "chunks2blocks_builder_block_size_bytes_total",
                "Total size of blocks generated by this builder",
            ),
            series_in_memory: gauge(
                "chunks2blocks_builder_series_in_memory",
                "Number of series kept in memory at the moment",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_metrics() {
        let registry = Registry::new();
        let _metrics = BuilderMetrics::new(&registry).unwrap();

        let names: Vec<_> = registry
            .gather()
            .into_iter()
            .map(|family| family.get_name().to_owned())
            .collect();

        for expected in [
            "chunks2blocks_builder_fetched_chunks_total",
            "chunks2blocks_builder_fetched_chunks_bytes_total",
            "chunks2blocks_builder_series_total",
            "chunks2blocks_builder_written_samples_total",
            "chunks2blocks_builder_in_progress",
            "chunks2blocks_builder_chunks_not_found_total",
            "chunks2blocks_builder_block_size_bytes_total",
            "chunks2blocks_builder_series_in_memory",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        BuilderMetrics::new(&registry).unwrap();
        assert!(BuilderMetrics::new(&registry).is_err());
    }
}
