use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fs,
    path::PathBuf,
};

use data_types::{Labels, Series};
use snafu::{ensure, ResultExt};

use super::{InternalDuplicateSeriesSnafu, RemoveSnafu, Result, SeriesFileReader};

/// One source's current head.
#[derive(Debug)]
struct HeapEntry {
    series: Series,
    source: usize,
}

impl HeapEntry {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.series
            .cmp_key(&other.series)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key(other)
    }
}

/// K-way merge over run files by `(hash, labels)`.
///
/// Every source is already sorted, so a min-heap of one head per source
/// yields the global order. Sources are unlinked from disk the moment they
/// drain; after the merge completes no run file remains. Single-consumer
/// and not restartable.
#[derive(Debug)]
pub struct MergeIterator {
    sources: Vec<Option<SeriesFileReader>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    last: Option<(u64, Labels)>,
}

impl MergeIterator {
    /// Open all run files and prime the heap. Empty files are unlinked
    /// right away.
    pub fn open(files: Vec<PathBuf>) -> Result<Self> {
        let mut merger = Self {
            sources: Vec::with_capacity(files.len()),
            heap: BinaryHeap::with_capacity(files.len()),
            last: None,
        };

        for path in files {
            let reader = SeriesFileReader::open(path)?;
            merger.sources.push(Some(reader));
            merger.pull(merger.sources.len() - 1)?;
        }

        Ok(merger)
    }

    /// Refill the heap from `source`, unlinking it once drained.
    fn pull(&mut self, source: usize) -> Result<()> {
        let Some(reader) = self.sources[source].as_mut() else {
            return Ok(());
        };

        match reader.next_series()? {
            Some(series) => self.heap.push(Reverse(HeapEntry { series, source })),
            None => {
                let reader = self.sources[source].take().expect("source checked above");
                let path = reader.path().to_path_buf();
                drop(reader);
                fs::remove_file(&path).context(RemoveSnafu { path })?;
            }
        }
        Ok(())
    }

    /// The next series in `(hash, labels)` order, or `None` once all
    /// sources are drained.
    ///
    /// Two sources producing the same `(hash, labels)` means the plan
    /// contained the same series twice; that is a bug upstream and fails
    /// the merge.
    pub fn next_series(&mut self) -> Result<Option<Series>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        self.pull(entry.source)?;

        if let Some((last_hash, last_labels)) = &self.last {
            ensure!(
                *last_hash != entry.series.hash || *last_labels != entry.series.labels,
                InternalDuplicateSeriesSnafu {
                    labels: entry.series.labels.clone(),
                }
            );
        }
        self.last = Some((entry.series.hash, entry.series.labels.clone()));

        Ok(Some(entry.series))
    }
}
