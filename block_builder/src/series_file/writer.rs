use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::PathBuf,
};

use byteorder::{BigEndian, WriteBytesExt};
use data_types::{Chunk, Labels, Series};
use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use snafu::ResultExt;

use super::{
    CreateSnafu, EncodeRecordSnafu, Result, WriteSnafu, FILE_TYPE_IDENTIFIER,
};
use crate::metrics::BuilderMetrics;

/// Writes one run file: framed, pre-sorted series records.
struct RunFileWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl RunFileWriter {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).context(CreateSnafu { path: path.clone() })?;
        let mut out = BufWriter::new(file);
        out.write_all(FILE_TYPE_IDENTIFIER)
            .context(WriteSnafu { path: path.clone() })?;
        Ok(Self { path, out })
    }

    fn append(&mut self, series: &Series) -> Result<()> {
        let payload = bincode::serialize(series).context(EncodeRecordSnafu)?;

        let path = &self.path;
        self.out
            .write_u32::<BigEndian>(payload.len() as u32)
            .context(WriteSnafu { path: path.clone() })?;
        self.out
            .write_u32::<BigEndian>(crc32fast::hash(&payload))
            .context(WriteSnafu { path: path.clone() })?;
        self.out
            .write_all(&payload)
            .context(WriteSnafu { path: path.clone() })?;
        Ok(())
    }

    fn finish(self) -> Result<PathBuf> {
        let Self { path, out } = self;
        let file = out
            .into_inner()
            .map_err(|e| e.into_error())
            .context(WriteSnafu { path: path.clone() })?;
        file.sync_all().context(WriteSnafu { path: path.clone() })?;
        Ok(path)
    }
}

#[derive(Debug, Default)]
struct Buffer {
    series: Vec<Series>,
    next_file: u64,
    files: Vec<PathBuf>,
}

/// Accumulates series and spills them as sorted run files.
///
/// Safe to call from many workers at once; one mutex covers both append
/// and flush. Fetch latency dominates the build, so contention here is
/// negligible.
pub struct SeriesFileWriter {
    dir: PathBuf,
    batch_size: usize,
    buffer: Mutex<Buffer>,
    series_total: IntCounter,
    series_in_memory: IntGauge,
}

impl std::fmt::Debug for SeriesFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesFileWriter")
            .field("dir", &self.dir)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl SeriesFileWriter {
    /// Create a writer spilling into `dir` (created if missing) whenever
    /// `batch_size` series are buffered.
    pub fn new(dir: impl Into<PathBuf>, batch_size: usize, metrics: &BuilderMetrics) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context(CreateSnafu { path: dir.clone() })?;
        Ok(Self {
            dir,
            batch_size: batch_size.max(1),
            buffer: Mutex::new(Buffer::default()),
            series_total: metrics.series_total.clone(),
            series_in_memory: metrics.series_in_memory.clone(),
        })
    }

    /// Add one series. `labels` must already be canonical; the stable
    /// label hash is computed here, once, as the primary sort key.
    pub fn add_series(&self, labels: Labels, chunks: Vec<Chunk>) -> Result<()> {
        let series = Series {
            hash: labels.hash64(),
            labels,
            chunks,
        };

        let mut buffer = self.buffer.lock();
        buffer.series.push(series);
        self.series_total.inc();
        self.series_in_memory.set(buffer.series.len() as i64);

        if buffer.series.len() >= self.batch_size {
            self.flush(&mut buffer)?;
        }
        Ok(())
    }

    /// Sort the buffered batch and stream it out as the next run file.
    fn flush(&self, buffer: &mut Buffer) -> Result<()> {
        if buffer.series.is_empty() {
            return Ok(());
        }

        buffer.series.sort_unstable_by(Series::cmp_key);

        let path = self.dir.join(format!("{:06}", buffer.next_file));
        buffer.next_file += 1;

        let mut out = RunFileWriter::create(path)?;
        for series in buffer.series.drain(..) {
            out.append(&series)?;
        }
        buffer.files.push(out.finish()?);

        self.series_in_memory.set(0);
        Ok(())
    }

    /// Flush the residual buffer and return all run files in creation
    /// order. The writer is consumed; nothing may be added afterwards.
    pub fn finish(self) -> Result<Vec<PathBuf>> {
        let mut buffer = self.buffer.lock();
        self.flush(&mut buffer)?;
        Ok(std::mem::take(&mut buffer.files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series_file::SeriesFileReader;
    use data_types::Sample;
    use std::path::Path;

    fn labels(job: &str) -> Labels {
        Labels::from_pairs(&[("__name__", "up"), ("job", job)])
    }

    fn chunks(t0: i64) -> Vec<Chunk> {
        vec![Chunk::new(
            labels("x"),
            vec![Sample {
                timestamp: t0,
                value: 1.0,
            }],
        )]
    }

    fn read_all(path: &Path) -> Vec<Series> {
        let mut reader = SeriesFileReader::open(path).unwrap();
        let mut out = vec![];
        while let Some(series) = reader.next_series().unwrap() {
            out.push(series);
        }
        out
    }

    #[test]
    fn spills_sorted_run_files_at_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = BuilderMetrics::unregistered();
        let writer = SeriesFileWriter::new(dir.path().join("series"), 2, &metrics).unwrap();

        writer.add_series(labels("c"), chunks(0)).unwrap();
        writer.add_series(labels("a"), chunks(0)).unwrap();
        writer.add_series(labels("b"), chunks(0)).unwrap();

        let files = writer.finish().unwrap();
        assert_eq!(files.len(), 2);

        // The first run file holds the first batch, sorted by (hash, labels).
        let first = read_all(&files[0]);
        assert_eq!(first.len(), 2);
        assert!(first[0].cmp_key(&first[1]).is_lt());

        // The residue flushed by finish.
        let second = read_all(&files[1]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].labels, labels("b"));
    }

    #[test]
    fn batch_records_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = BuilderMetrics::unregistered();
        let writer = SeriesFileWriter::new(dir.path().join("series"), 100, &metrics).unwrap();

        writer.add_series(labels("api"), chunks(1000)).unwrap();
        let files = writer.finish().unwrap();
        assert_eq!(files.len(), 1);

        let got = read_all(&files[0]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].hash, labels("api").hash64());
        assert_eq!(got[0].labels, labels("api"));
        assert_eq!(got[0].chunks, chunks(1000));
    }

    #[test]
    fn series_in_memory_gauge_tracks_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = BuilderMetrics::unregistered();
        let writer = SeriesFileWriter::new(dir.path().join("series"), 3, &metrics).unwrap();

        writer.add_series(labels("a"), chunks(0)).unwrap();
        writer.add_series(labels("b"), chunks(0)).unwrap();
        assert_eq!(metrics.series_in_memory.get(), 2);

        // Third series triggers the flush, which resets the gauge.
        writer.add_series(labels("c"), chunks(0)).unwrap();
        assert_eq!(metrics.series_in_memory.get(), 0);
        assert_eq!(metrics.series_total.get(), 3);
    }

    #[test]
    fn empty_writer_produces_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = BuilderMetrics::unregistered();
        let writer = SeriesFileWriter::new(dir.path().join("series"), 10, &metrics).unwrap();
        assert!(writer.finish().unwrap().is_empty());
    }
}
