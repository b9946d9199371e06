//! Plan file reading.
//!
//! A plan file is JSON lines: the first line is the header naming the
//! tenant and the UTC day, every further line is one plan entry. Entries
//! are streamed into a channel rather than read up front; plans can hold
//! tens of millions of series.

use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use data_types::PlanEntry;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Entries buffered between the file reader and the build pipeline.
const PLAN_CHANNEL_CAPACITY: usize = 1024;

/// Plan file errors.
#[derive(Debug, Snafu)]
pub enum PlanError {
    #[snafu(display("failed to open plan file {}: {source}", path.display()))]
    #[allow(missing_docs)]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("failed to read plan file: {source}"))]
    #[allow(missing_docs)]
    Read { source: io::Error },

    #[snafu(display("plan file is empty"))]
    Empty,

    #[snafu(display("invalid plan header: {source}"))]
    #[allow(missing_docs)]
    Header { source: serde_json::Error },

    #[snafu(display("invalid plan entry on line {line}: {source}"))]
    #[allow(missing_docs)]
    Entry {
        line: usize,
        source: serde_json::Error,
    },
}

/// The plan file's first line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlanHeader {
    /// Tenant owning every series in the plan.
    pub tenant: String,
    /// UTC day the plan covers.
    pub day: NaiveDate,
}

/// Open a plan file, parse its header, and spawn a task streaming the
/// entries into the returned channel.
///
/// The feeder task resolves to the number of entries fed, or to the first
/// parse/read error; on error it cancels `cancel` so the build aborts
/// instead of silently finishing on a truncated plan.
pub async fn stream_plan_file(
    path: &Path,
    cancel: CancellationToken,
) -> Result<
    (
        PlanHeader,
        mpsc::Receiver<PlanEntry>,
        JoinHandle<Result<usize, PlanError>>,
    ),
    PlanError,
> {
    let file = tokio::fs::File::open(path).await.context(OpenSnafu { path })?;
    let mut lines = BufReader::new(file).lines();

    let header_line = lines
        .next_line()
        .await
        .context(ReadSnafu)?
        .context(EmptySnafu)?;
    let header: PlanHeader = serde_json::from_str(&header_line).context(HeaderSnafu)?;

    let (tx, rx) = mpsc::channel(PLAN_CHANNEL_CAPACITY);
    let feeder = tokio::spawn(async move {
        let result = feed_entries(&mut lines, &tx).await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    });

    Ok((header, rx, feeder))
}

async fn feed_entries(
    lines: &mut tokio::io::Lines<BufReader<tokio::fs::File>>,
    tx: &mpsc::Sender<PlanEntry>,
) -> Result<usize, PlanError> {
    let mut entry_count = 0;
    // The header was line 1.
    let mut line_number: usize = 1;

    while let Some(line) = lines.next_line().await.context(ReadSnafu)? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let entry: PlanEntry = serde_json::from_str(&line).context(EntrySnafu {
            line: line_number,
        })?;

        // A closed receiver means the build ended; that is its story to
        // tell, not an error here.
        if tx.send(entry).await.is_err() {
            break;
        }
        entry_count += 1;
    }

    Ok(entry_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::ChunkId;
    use std::io::Write;

    fn plan_file(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("plan.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    async fn drain(mut rx: mpsc::Receiver<PlanEntry>) -> Vec<PlanEntry> {
        let mut out = vec![];
        while let Some(entry) = rx.recv().await {
            out.push(entry);
        }
        out
    }

    #[tokio::test]
    async fn streams_header_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = plan_file(
            dir.path(),
            concat!(
                "{\"tenant\": \"tenant-1\", \"day\": \"2020-03-15\"}\n",
                "{\"series_id\": \"s1\", \"chunks\": [\"c1\", \"c2\"]}\n",
                "\n",
                "{\"series_id\": \"s2\", \"chunks\": [\"c3\"]}\n",
            ),
        );

        let (header, rx, feeder) = stream_plan_file(&path, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(header.tenant, "tenant-1");
        assert_eq!(header.day, "2020-03-15".parse::<NaiveDate>().unwrap());

        let entries = drain(rx).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].series_id, "s1");
        assert_eq!(
            entries[0].chunks,
            vec![ChunkId::new("c1"), ChunkId::new("c2")]
        );

        assert_eq!(feeder.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = plan_file(dir.path(), "");

        let result = stream_plan_file(&path, CancellationToken::new()).await;
        assert!(matches!(result, Err(PlanError::Empty)));
    }

    #[tokio::test]
    async fn bad_entry_cancels_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = plan_file(
            dir.path(),
            concat!(
                "{\"tenant\": \"tenant-1\", \"day\": \"2020-03-15\"}\n",
                "not json\n",
            ),
        );

        let cancel = CancellationToken::new();
        let (_header, rx, feeder) = stream_plan_file(&path, cancel.clone()).await.unwrap();
        drop(rx);

        let err = feeder.await.unwrap().unwrap_err();
        assert!(matches!(err, PlanError::Entry { line: 2, .. }));
        assert!(cancel.is_cancelled());
    }
}
