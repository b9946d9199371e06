//! Converts per-series chunk objects from an object store into TSDB
//! blocks.
//!
//! A *plan* enumerates the series of one tenant on one UTC day together
//! with the chunk ids materializing each series. [`Builder::process_plan`]
//! consumes the plan's entries and produces exactly one immutable,
//! ULID-named block directory covering that day, optionally uploading it
//! back to the object store.
//!
//! The build runs in two phases. While entries stream in, workers fetch
//! and normalize chunks concurrently and funnel the resulting series into
//! sorted spill files, bounding memory regardless of plan size. Once the
//! plan is drained, the spill files are k-way merged into one
//! `(hash, labels)`-ordered stream and written out as the block.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use backoff::BackoffConfig;
use chrono::NaiveDate;
use data_types::{PlanEntry, TENANT_ID_EXTERNAL_LABEL};
use object_store::DynObjectStore;
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

pub mod cleanup;
pub mod fetcher;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod schema;
pub mod series_file;
pub mod tsdb;
pub mod upload;

use fetcher::{Fetcher, ObjectStoreChunks};
use metrics::BuilderMetrics;
use schema::SchemaConfig;
use series_file::{MergeIterator, SeriesFileWriter};
use tsdb::{BlockMeta, BlockWriter};

/// Recorded as the producing source in every block's metadata.
const SOURCE_NAME: &str = "chunks2blocks";

/// Builder configuration.
#[derive(Debug, Clone, clap::Parser)]
pub struct BuilderConfig {
    /// Local directory used for storing in-progress blocks and series
    /// spill files (created if missing).
    #[clap(long = "output-dir", env = "CHUNKS2BLOCKS_OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Number of concurrently processed plan entries.
    #[clap(
        long = "concurrency",
        env = "CHUNKS2BLOCKS_CONCURRENCY",
        default_value = "128"
    )]
    pub concurrency: usize,

    /// Upload generated blocks to the object store.
    #[clap(
        long = "upload",
        env = "CHUNKS2BLOCKS_UPLOAD",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub upload: bool,

    /// Delete the local block directory after a successful upload.
    #[clap(
        long = "delete-local-blocks",
        env = "CHUNKS2BLOCKS_DELETE_LOCAL_BLOCKS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub delete_local_blocks: bool,

    /// Number of series to keep in memory before spilling a sorted batch
    /// to disk. Lower values decrease memory usage during the build.
    #[clap(
        long = "series-batch-size",
        env = "CHUNKS2BLOCKS_SERIES_BATCH_SIZE",
        default_value = "250000"
    )]
    pub series_batch_size: usize,

    /// Adjust sample timestamps by up to this much to align them an exact
    /// number of seconds apart ("0s" disables the adjustment).
    #[clap(
        long = "timestamp-tolerance",
        env = "CHUNKS2BLOCKS_TIMESTAMP_TOLERANCE",
        default_value = "0s",
        value_parser = humantime::parse_duration
    )]
    pub timestamp_tolerance: Duration,
}

/// Build failures.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("failed to create output directory {}: {source}", path.display()))]
    CreateOutputDir { path: PathBuf, source: io::Error },

    #[snafu(display("failed to register builder metrics: {source}"))]
    Metrics { source: prometheus::Error },

    #[snafu(display("failed to resolve chunk schema: {source}"))]
    Schema { source: schema::SchemaError },

    #[snafu(display("failed to build block: {source}"))]
    Build { source: pipeline::BuildError },

    #[snafu(display("series spill failed: {source}"))]
    Spill { source: series_file::Error },

    #[snafu(display("failed to write block: {source}"))]
    Block { source: tsdb::BlockError },

    #[snafu(display("failed to remove spill directory {}: {source}", path.display()))]
    RemoveSpill { path: PathBuf, source: io::Error },

    #[snafu(display("failed to remove block workspace {}: {source}", path.display()))]
    RemoveWorkspace { path: PathBuf, source: io::Error },

    #[snafu(display(
        "failed to rename block directory {} to {}: {source}",
        from.display(),
        to.display()
    ))]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[snafu(display("failed to compute block size of {}: {source}", path.display()))]
    BlockSize { path: PathBuf, source: io::Error },

    #[snafu(display("failed to upload block: {source}"))]
    Upload {
        source: backoff::RetryError<upload::UploadError>,
    },

    #[snafu(display("block finalization task failed: {source}"))]
    FinalizePanic { source: tokio::task::JoinError },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Converts plans into blocks. One instance serves many plans; all state
/// specific to a plan lives inside [`process_plan`](Self::process_plan).
#[derive(Debug)]
pub struct Builder {
    config: BuilderConfig,
    /// Target store for finished blocks.
    blocks_store: Arc<DynObjectStore>,
    /// Source store holding chunk objects, addressed via the schema's
    /// period prefixes.
    chunks_store: Arc<DynObjectStore>,
    schema: SchemaConfig,
    metrics: BuilderMetrics,
}

impl Builder {
    /// Create a builder, its output directory, and its metrics.
    pub fn new(
        config: BuilderConfig,
        blocks_store: Arc<DynObjectStore>,
        chunks_store: Arc<DynObjectStore>,
        schema: SchemaConfig,
        registry: &prometheus::Registry,
    ) -> Result<Self> {
        fs::create_dir_all(&config.output_dir).context(CreateOutputDirSnafu {
            path: config.output_dir.clone(),
        })?;
        let metrics = BuilderMetrics::new(registry).context(MetricsSnafu)?;

        Ok(Self {
            config,
            blocks_store,
            chunks_store,
            schema,
            metrics,
        })
    }

    /// Process one plan: drain `entries`, build the block, and return its
    /// ULID.
    ///
    /// A plan in which no series survives (empty plan, or every chunk
    /// missing) produces no block and returns `Ok(None)`; nothing is
    /// uploaded and the build workspace is removed.
    ///
    /// On error or cancellation the partial `<ulid>.tmp` directory is left
    /// behind for [`cleanup::cleanup_output_dir`] to reclaim at the next
    /// startup.
    pub async fn process_plan(
        &self,
        tenant: &str,
        day: NaiveDate,
        entries: mpsc::Receiver<PlanEntry>,
        cancel: CancellationToken,
    ) -> Result<Option<Ulid>> {
        self.metrics.build_in_progress.set(1);
        let result = self.build(tenant, day, entries, cancel).await;
        self.metrics.build_in_progress.set(0);
        self.metrics.series_in_memory.set(0);
        result
    }

    async fn build(
        &self,
        tenant: &str,
        day: NaiveDate,
        entries: mpsc::Receiver<PlanEntry>,
        cancel: CancellationToken,
    ) -> Result<Option<Ulid>> {
        let period = self.schema.config_for_day(day).context(SchemaSnafu)?;
        let chunk_client = ObjectStoreChunks::new(
            Arc::clone(&self.chunks_store),
            tenant,
            period.prefix.clone(),
        );
        let fetcher = Fetcher::new(Arc::new(chunk_client), &self.metrics);

        let ulid = Ulid::new();
        let block_tmp = self.config.output_dir.join(format!("{ulid}.tmp"));
        let series_dir = block_tmp.join(upload::SERIES_DIR);
        let writer =
            SeriesFileWriter::new(&series_dir, self.config.series_batch_size, &self.metrics)
                .context(SpillSnafu)?;

        let backoff_config = BackoffConfig::default();
        pipeline::run(
            entries,
            self.config.concurrency,
            &fetcher,
            &writer,
            &backoff_config,
            &self.metrics.chunks_not_found,
            &cancel,
        )
        .await
        .context(BuildSnafu)?;

        let run_files = writer.finish().context(SpillSnafu)?;
        if run_files.is_empty() {
            info!(tenant, %day, "plan contained no series, not producing a block");
            fs::remove_dir_all(&block_tmp).context(RemoveWorkspaceSnafu {
                path: block_tmp.clone(),
            })?;
            return Ok(None);
        }

        let meta = self
            .merge_and_write_block(run_files, block_tmp.clone(), ulid, tenant)
            .await?;

        // The merge unlinked every run file; only the empty spill
        // directory is left and it must not be part of the block.
        fs::remove_dir_all(&series_dir).context(RemoveSpillSnafu {
            path: series_dir.clone(),
        })?;

        let block_dir = self.config.output_dir.join(ulid.to_string());
        fs::rename(&block_tmp, &block_dir).context(RenameSnafu {
            from: block_tmp.clone(),
            to: block_dir.clone(),
        })?;

        let size = upload::block_size(&block_dir).context(BlockSizeSnafu {
            path: block_dir.clone(),
        })?;
        self.metrics.blocks_size.inc_by(size);
        info!(
            tenant,
            ulid = %ulid,
            size,
            series = meta.stats.num_series,
            samples = meta.stats.num_samples,
            "successfully built block for plan"
        );

        if self.config.upload {
            upload::upload_block(
                Arc::clone(&self.blocks_store),
                tenant,
                &block_dir,
                &backoff_config,
            )
            .await
            .context(UploadSnafu)?;
            info!(ulid = %ulid, "block uploaded");

            if self.config.delete_local_blocks {
                if let Err(error) = fs::remove_dir_all(&block_dir) {
                    warn!(%error, dir = %block_dir.display(), "failed to delete local block");
                }
            }
        }

        Ok(Some(ulid))
    }

    /// Merge the run files and write the block, on the blocking pool: the
    /// merge is a tight CPU/disk loop with no suspension points.
    async fn merge_and_write_block(
        &self,
        run_files: Vec<PathBuf>,
        block_tmp: PathBuf,
        ulid: Ulid,
        tenant: &str,
    ) -> Result<BlockMeta> {
        let tolerance = self.config.timestamp_tolerance;
        let written_samples = self.metrics.written_samples.clone();
        let tenant = tenant.to_owned();

        tokio::task::spawn_blocking(move || {
            let mut merger = MergeIterator::open(run_files).context(SpillSnafu)?;
            let mut writer = BlockWriter::create(&block_tmp, ulid, tolerance, written_samples)
                .context(BlockSnafu)?;

            while let Some(series) = merger.next_series().context(SpillSnafu)? {
                writer.append_series(series).context(BlockSnafu)?;
            }

            let mut extra_labels = BTreeMap::new();
            extra_labels.insert(TENANT_ID_EXTERNAL_LABEL.to_owned(), tenant);
            writer.finalize(SOURCE_NAME, extra_labels).context(BlockSnafu)
        })
        .await
        .context(FinalizePanicSnafu)?
    }
}
