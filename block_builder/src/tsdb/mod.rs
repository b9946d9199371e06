//! TSDB block writing.
//!
//! [`BlockWriter`] consumes the merged, totally ordered series stream and
//! materializes a block directory: chunk payloads in rolling segment files
//! under `chunks/`, one framed index record per series in `index`, and a
//! `meta.json` describing the block. The input order contract is strict:
//! `(hash, labels)` must increase with every appended series, which is
//! what the index consumers downstream depend on.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use byteorder::{BigEndian, WriteBytesExt};
use data_types::{Labels, Sample, Series};
use prometheus::IntCounter;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};
use ulid::Ulid;

mod meta;
mod reader;

pub use meta::{BlockCompaction, BlockMeta, BlockStats, Downsample, ThanosMeta};
pub use reader::{read_block, BlockSeries, ReadError};

/// Name of the index file inside a block directory.
pub const INDEX_FILE: &str = "index";
/// Name of the chunk segment directory inside a block directory.
pub const CHUNKS_DIR: &str = "chunks";
/// Name of the metadata file inside a block directory.
pub const META_FILE: &str = "meta.json";

/// Identifies an index file, version 1.
const INDEX_FILE_TYPE_IDENTIFIER: &[u8; 8] = b"C2BINDX1";
/// Identifies a chunk segment file, version 1.
const SEGMENT_FILE_TYPE_IDENTIFIER: &[u8; 8] = b"C2BCHNK1";

/// Chunk segments roll over once they grow past this many bytes.
const MAX_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

/// Metadata format version written to `meta.json`.
const META_VERSION: u32 = 1;

/// Block-writing errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum BlockError {
    #[snafu(display("failed to create {}: {source}", path.display()))]
    Create { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to write {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to encode block record: {source}"))]
    EncodeRecord { source: bincode::Error },

    #[snafu(display("failed to serialize block meta: {source}"))]
    Meta { source: serde_json::Error },

    #[snafu(display(
        "series out of order: {labels} (hash {hash:#018x}) does not follow the previous series"
    ))]
    OutOfOrderSeries { hash: u64, labels: Labels },
}

#[allow(missing_docs)]
pub type Result<T, E = BlockError> = std::result::Result<T, E>;

/// Location of one chunk's payload inside the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Segment file number under `chunks/`.
    pub segment: u64,
    /// Byte offset of the framed payload within the segment.
    pub offset: u64,
    /// Framed payload length in bytes.
    pub length: u32,
    /// First sample timestamp, milliseconds.
    pub min_time: i64,
    /// Last sample timestamp, milliseconds.
    pub max_time: i64,
}

/// One series entry of the index: the label set and where its chunk
/// payloads live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Stable label-set hash, the primary order key.
    pub hash: u64,
    /// Canonical label set.
    pub labels: Labels,
    /// Chunk locations in storage order.
    pub chunks: Vec<ChunkRef>,
}

struct SegmentWriter {
    dir: PathBuf,
    number: u64,
    written: u64,
    out: BufWriter<File>,
}

impl SegmentWriter {
    fn create(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).context(CreateSnafu { path: dir.clone() })?;
        let number = 1;
        let out = Self::open_segment(&dir, number)?;
        Ok(Self {
            dir,
            number,
            written: SEGMENT_FILE_TYPE_IDENTIFIER.len() as u64,
            out,
        })
    }

    fn segment_path(dir: &Path, number: u64) -> PathBuf {
        dir.join(format!("{number:06}"))
    }

    fn open_segment(dir: &Path, number: u64) -> Result<BufWriter<File>> {
        let path = Self::segment_path(dir, number);
        let file = File::create(&path).context(CreateSnafu { path: path.clone() })?;
        let mut out = BufWriter::new(file);
        out.write_all(SEGMENT_FILE_TYPE_IDENTIFIER)
            .context(IoSnafu { path })?;
        Ok(out)
    }

    fn roll(&mut self) -> Result<()> {
        self.number += 1;
        self.out = Self::open_segment(&self.dir, self.number)?;
        self.written = SEGMENT_FILE_TYPE_IDENTIFIER.len() as u64;
        Ok(())
    }

    /// Append one framed chunk payload, rolling to a new segment first if
    /// the current one is full. Returns where the payload landed.
    fn append(&mut self, samples: &[Sample]) -> Result<ChunkRef> {
        if self.written >= MAX_SEGMENT_SIZE {
            self.finish_current()?;
            self.roll()?;
        }

        let payload = bincode::serialize(samples).context(EncodeRecordSnafu)?;
        let path = Self::segment_path(&self.dir, self.number);
        let offset = self.written;

        self.out
            .write_u32::<BigEndian>(payload.len() as u32)
            .context(IoSnafu { path: path.clone() })?;
        self.out
            .write_u32::<BigEndian>(crc32fast::hash(&payload))
            .context(IoSnafu { path: path.clone() })?;
        self.out
            .write_all(&payload)
            .context(IoSnafu { path })?;

        let length = 8 + payload.len() as u32;
        self.written += length as u64;

        Ok(ChunkRef {
            segment: self.number,
            offset,
            length,
            min_time: samples.first().map(|s| s.timestamp).unwrap_or(0),
            max_time: samples.last().map(|s| s.timestamp).unwrap_or(0),
        })
    }

    fn finish_current(&mut self) -> Result<()> {
        let path = Self::segment_path(&self.dir, self.number);
        self.out.flush().context(IoSnafu { path: path.clone() })?;
        self.out
            .get_ref()
            .sync_all()
            .context(IoSnafu { path })?;
        Ok(())
    }
}

/// Writes one block directory from an ordered series stream.
pub struct BlockWriter {
    block_dir: PathBuf,
    ulid: Ulid,
    timestamp_tolerance_ms: i64,

    index_path: PathBuf,
    index: BufWriter<File>,
    segments: SegmentWriter,

    last: Option<(u64, Labels)>,
    min_time: i64,
    max_time: i64,
    stats: BlockStats,
    written_samples: IntCounter,
}

impl std::fmt::Debug for BlockWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWriter")
            .field("block_dir", &self.block_dir)
            .field("ulid", &self.ulid)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl BlockWriter {
    /// Open index and chunk writers under `block_dir` (the `.tmp` block
    /// directory) for a block that will be named `ulid`.
    pub fn create(
        block_dir: impl Into<PathBuf>,
        ulid: Ulid,
        timestamp_tolerance: Duration,
        written_samples: IntCounter,
    ) -> Result<Self> {
        let block_dir = block_dir.into();
        fs::create_dir_all(&block_dir).context(CreateSnafu {
            path: block_dir.clone(),
        })?;

        let index_path = block_dir.join(INDEX_FILE);
        let index_file = File::create(&index_path).context(CreateSnafu {
            path: index_path.clone(),
        })?;
        let mut index = BufWriter::new(index_file);
        index
            .write_all(INDEX_FILE_TYPE_IDENTIFIER)
            .context(IoSnafu {
                path: index_path.clone(),
            })?;

        let segments = SegmentWriter::create(block_dir.join(CHUNKS_DIR))?;

        Ok(Self {
            block_dir,
            ulid,
            timestamp_tolerance_ms: timestamp_tolerance.as_millis() as i64,
            index_path,
            index,
            segments,
            last: None,
            min_time: i64::MAX,
            max_time: i64::MIN,
            stats: BlockStats::default(),
            written_samples,
        })
    }

    /// Append the next series. Input must be strictly increasing by
    /// `(hash, labels)`.
    pub fn append_series(&mut self, series: Series) -> Result<()> {
        if let Some((last_hash, last_labels)) = &self.last {
            let in_order = series.hash > *last_hash
                || (series.hash == *last_hash && series.labels > *last_labels);
            ensure!(
                in_order,
                OutOfOrderSeriesSnafu {
                    hash: series.hash,
                    labels: series.labels.clone(),
                }
            );
        }

        let mut refs = Vec::with_capacity(series.chunks.len());
        for chunk in &series.chunks {
            let mut samples = chunk.samples.clone();
            if self.timestamp_tolerance_ms > 0 {
                align_timestamps(&mut samples, self.timestamp_tolerance_ms);
            }

            let chunk_ref = self.segments.append(&samples)?;
            if !samples.is_empty() {
                self.min_time = self.min_time.min(chunk_ref.min_time);
                self.max_time = self.max_time.max(chunk_ref.max_time);
            }
            self.stats.num_chunks += 1;
            self.stats.num_samples += samples.len() as u64;
            self.written_samples.inc_by(samples.len() as u64);
            refs.push(chunk_ref);
        }

        let record = IndexRecord {
            hash: series.hash,
            labels: series.labels.clone(),
            chunks: refs,
        };
        let payload = bincode::serialize(&record).context(EncodeRecordSnafu)?;
        self.index
            .write_u32::<BigEndian>(payload.len() as u32)
            .context(IoSnafu {
                path: self.index_path.clone(),
            })?;
        self.index
            .write_u32::<BigEndian>(crc32fast::hash(&payload))
            .context(IoSnafu {
                path: self.index_path.clone(),
            })?;
        self.index.write_all(&payload).context(IoSnafu {
            path: self.index_path.clone(),
        })?;

        self.stats.num_series += 1;
        self.last = Some((series.hash, series.labels));
        Ok(())
    }

    /// Flush and sync everything, write `meta.json`, and return the block
    /// metadata. The caller strips the directory's `.tmp` suffix.
    pub fn finalize(
        mut self,
        source: &str,
        extra_labels: BTreeMap<String, String>,
    ) -> Result<BlockMeta> {
        self.index.flush().context(IoSnafu {
            path: self.index_path.clone(),
        })?;
        self.index.get_ref().sync_all().context(IoSnafu {
            path: self.index_path.clone(),
        })?;
        self.segments.finish_current()?;

        let (min_time, max_time) = if self.stats.num_samples == 0 {
            (0, 0)
        } else {
            // The block's time range end is exclusive.
            (self.min_time, self.max_time + 1)
        };

        let meta = BlockMeta {
            ulid: self.ulid.to_string(),
            min_time,
            max_time,
            stats: self.stats,
            compaction: BlockCompaction {
                level: 1,
                sources: vec![self.ulid.to_string()],
            },
            version: META_VERSION,
            thanos: ThanosMeta {
                labels: extra_labels,
                downsample: Downsample::default(),
                source: source.to_owned(),
            },
        };

        let meta_path = self.block_dir.join(META_FILE);
        let data = serde_json::to_vec_pretty(&meta).context(MetaSnafu)?;
        let mut file = File::create(&meta_path).context(CreateSnafu {
            path: meta_path.clone(),
        })?;
        file.write_all(&data).context(IoSnafu {
            path: meta_path.clone(),
        })?;
        file.sync_all().context(IoSnafu { path: meta_path })?;

        Ok(meta)
    }
}

/// Shift sample timestamps so deltas between consecutive samples land on
/// whole-second multiples, moving no sample by more than `tolerance_ms`.
/// Sample count, order, and value association never change.
fn align_timestamps(samples: &mut [Sample], tolerance_ms: i64) {
    for ix in 1..samples.len() {
        let prev = samples[ix - 1].timestamp;
        let delta = samples[ix].timestamp - prev;
        if delta <= 0 {
            continue;
        }

        let rounded = (delta + 500) / 1000 * 1000;
        if rounded == delta || rounded <= 0 {
            continue;
        }

        let aligned = prev + rounded;
        if (aligned - samples[ix].timestamp).abs() <= tolerance_ms {
            samples[ix].timestamp = aligned;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::{Chunk, TENANT_ID_EXTERNAL_LABEL};

    fn labels(job: &str) -> Labels {
        Labels::from_pairs(&[("__name__", "up"), ("job", job)])
    }

    fn series(job: &str, timestamps: &[i64]) -> Series {
        let labels = labels(job);
        let samples: Vec<Sample> = timestamps
            .iter()
            .map(|&t| Sample {
                timestamp: t,
                value: 1.0,
            })
            .collect();
        Series {
            hash: labels.hash64(),
            labels: labels.clone(),
            chunks: vec![Chunk::new(labels, samples)],
        }
    }

    fn writer(dir: &Path, ulid: Ulid) -> BlockWriter {
        BlockWriter::create(
            dir,
            ulid,
            Duration::ZERO,
            crate::metrics::BuilderMetrics::unregistered().written_samples,
        )
        .unwrap()
    }

    fn ordered(mut items: Vec<Series>) -> Vec<Series> {
        items.sort_unstable_by(Series::cmp_key);
        items
    }

    #[test]
    fn writes_block_files_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let block_dir = dir.path().join("block.tmp");
        let ulid = Ulid::new();
        let mut w = writer(&block_dir, ulid);

        for s in ordered(vec![series("api", &[0, 10]), series("web", &[20, 30])]) {
            w.append_series(s).unwrap();
        }

        let mut extra = BTreeMap::new();
        extra.insert(TENANT_ID_EXTERNAL_LABEL.to_owned(), "tenant-1".to_owned());
        let meta = w.finalize("chunks2blocks", extra).unwrap();

        assert_eq!(meta.ulid, ulid.to_string());
        assert_eq!(meta.min_time, 0);
        assert_eq!(meta.max_time, 31);
        assert_eq!(meta.stats.num_series, 2);
        assert_eq!(meta.stats.num_chunks, 2);
        assert_eq!(meta.stats.num_samples, 4);
        assert_eq!(
            meta.thanos.labels.get(TENANT_ID_EXTERNAL_LABEL).unwrap(),
            "tenant-1"
        );

        assert!(block_dir.join(INDEX_FILE).is_file());
        assert!(block_dir.join(CHUNKS_DIR).join("000001").is_file());
        let parsed: BlockMeta =
            serde_json::from_slice(&fs::read(block_dir.join(META_FILE)).unwrap()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn rejects_out_of_order_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir.path().join("block.tmp"), Ulid::new());

        let both = ordered(vec![series("api", &[0]), series("web", &[0])]);
        w.append_series(both[1].clone()).unwrap();
        assert_matches!(
            w.append_series(both[0].clone()),
            Err(BlockError::OutOfOrderSeries { .. })
        );
    }

    #[test]
    fn rejects_duplicate_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir.path().join("block.tmp"), Ulid::new());

        w.append_series(series("api", &[0])).unwrap();
        assert_matches!(
            w.append_series(series("api", &[10])),
            Err(BlockError::OutOfOrderSeries { .. })
        );
    }

    #[test]
    fn counts_written_samples() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = crate::metrics::BuilderMetrics::unregistered();
        let mut w = BlockWriter::create(
            dir.path().join("block.tmp"),
            Ulid::new(),
            Duration::ZERO,
            metrics.written_samples.clone(),
        )
        .unwrap();

        w.append_series(series("api", &[0, 10, 20])).unwrap();
        assert_eq!(metrics.written_samples.get(), 3);
    }

    #[test]
    fn align_shifts_near_second_deltas() {
        let mut samples = vec![
            Sample {
                timestamp: 0,
                value: 1.0,
            },
            Sample {
                timestamp: 1004,
                value: 2.0,
            },
            Sample {
                timestamp: 2001,
                value: 3.0,
            },
        ];
        align_timestamps(&mut samples, 5);
        assert_eq!(samples[0].timestamp, 0);
        assert_eq!(samples[1].timestamp, 1000);
        assert_eq!(samples[2].timestamp, 2000);
        // Values stay with their samples.
        assert_eq!(samples[1].value, 2.0);
        assert_eq!(samples[2].value, 3.0);
    }

    #[test]
    fn align_leaves_samples_outside_tolerance_alone() {
        let mut samples = vec![
            Sample {
                timestamp: 0,
                value: 1.0,
            },
            Sample {
                timestamp: 1400,
                value: 2.0,
            },
        ];
        align_timestamps(&mut samples, 5);
        assert_eq!(samples[1].timestamp, 1400);
    }

    #[test]
    fn align_never_collapses_close_samples() {
        let mut samples = vec![
            Sample {
                timestamp: 0,
                value: 1.0,
            },
            Sample {
                timestamp: 200,
                value: 2.0,
            },
        ];
        // Delta rounds to zero, which would break ordering; must not move.
        align_timestamps(&mut samples, 1000);
        assert_eq!(samples[1].timestamp, 200);
    }
}
