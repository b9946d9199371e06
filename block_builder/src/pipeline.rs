//! The fetch-and-build pipeline: plan entries in, spilled series out.
//!
//! Entries arrive on a channel and are processed with bounded concurrency.
//! Fetches retry under backoff because a long build should not die to one
//! connection reset; everything else about an entry is fail-fast. The
//! first failing entry aborts the pipeline, dropping whatever is still in
//! flight.

use backoff::{Backoff, BackoffConfig, RetryError};
use data_types::PlanEntry;
use futures::{StreamExt, TryStreamExt};
use prometheus::IntCounter;
use snafu::{ensure, ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    fetcher::{FetchError, Fetcher},
    normalize::{normalize_labels, NormalizeError},
    series_file::{self, SeriesFileWriter},
};

/// Pipeline failures; every variant names the series that caused it.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum BuildError {
    #[snafu(display("failed to fetch chunks for series {series_id}: {source}"))]
    Fetch {
        series_id: String,
        source: RetryError<FetchError>,
    },

    #[snafu(display("chunk for series {series_id} has an invalid metric: {source}"))]
    InvalidMetric {
        series_id: String,
        source: NormalizeError,
    },

    #[snafu(display("chunks for series {series_id} belong to multiple metrics: {first} vs {second}"))]
    InconsistentChunks {
        series_id: String,
        first: data_types::Labels,
        second: data_types::Labels,
    },

    #[snafu(display("failed to spill series {series_id}: {source}"))]
    Spill {
        series_id: String,
        source: series_file::Error,
    },

    #[snafu(display("plan build cancelled"))]
    Cancelled,
}

#[allow(missing_docs)]
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Drain `entries`, processing up to `concurrency` of them at once, and
/// funnel the surviving series into `writer`. Returns once the channel
/// closes and all in-flight entries finished, or on the first error or
/// cancellation.
pub async fn run(
    entries: mpsc::Receiver<PlanEntry>,
    concurrency: usize,
    fetcher: &Fetcher,
    writer: &SeriesFileWriter,
    backoff_config: &BackoffConfig,
    chunks_not_found: &IntCounter,
    cancel: &CancellationToken,
) -> Result<()> {
    let work = ReceiverStream::new(entries)
        .map(|entry| fetch_and_build(entry, fetcher, writer, backoff_config, chunks_not_found))
        .buffer_unordered(concurrency.max(1))
        .try_collect::<()>();

    tokio::select! {
        _ = cancel.cancelled() => CancelledSnafu.fail(),
        result = work => result,
    }
}

/// Process one plan entry end to end.
async fn fetch_and_build(
    entry: PlanEntry,
    fetcher: &Fetcher,
    writer: &SeriesFileWriter,
    backoff_config: &BackoffConfig,
    chunks_not_found: &IntCounter,
) -> Result<()> {
    // Transient storage errors ("connection reset by peer" and friends)
    // must not abort an entire block build; retry the fetch a few times
    // before giving up.
    let chunks = Backoff::new(backoff_config)
        .retry_all_errors("fetch chunks for series", || {
            fetcher.fetch_chunks(&entry.chunks)
        })
        .await
        .context(FetchSnafu {
            series_id: entry.series_id.clone(),
        })?;

    if entry.chunks.len() > chunks.len() {
        let missing = entry.chunks.len() - chunks.len();
        chunks_not_found.inc_by(missing as u64);
        warn!(
            series_id = %entry.series_id,
            expected = entry.chunks.len(),
            got = chunks.len(),
            "chunks for series not found"
        );
    }

    // A series whose chunks are all gone is skipped, not failed.
    if chunks.is_empty() {
        return Ok(());
    }

    let labels = normalize_labels(chunks[0].metric.clone()).context(InvalidMetricSnafu {
        series_id: entry.series_id.clone(),
    })?;

    // Every chunk must agree on the series it belongs to.
    for chunk in &chunks[1..] {
        let normalized = normalize_labels(chunk.metric.clone()).context(InvalidMetricSnafu {
            series_id: entry.series_id.clone(),
        })?;
        ensure!(
            normalized == labels,
            InconsistentChunksSnafu {
                series_id: entry.series_id.clone(),
                first: labels.clone(),
                second: normalized,
            }
        );
    }

    writer.add_series(labels, chunks).context(SpillSnafu {
        series_id: entry.series_id,
    })
}
