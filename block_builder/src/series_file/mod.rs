//! Sorted on-disk spill files for series records.
//!
//! Incoming series are buffered in memory; when the buffer reaches the
//! configured batch size it is sorted by `(hash, labels)` and written out
//! as a numbered *run file* under the block's `series/` directory. At
//! finalize time all run files are k-way merged back into one ordered
//! stream.
//!
//! Run files are sequences of framed records after an 8-byte file type
//! identifier: a big-endian `u32` payload length, a big-endian `u32` CRC32
//! of the payload, then the bincode-encoded [`Series`](data_types::Series)
//! payload.

use std::{io, path::PathBuf};

use data_types::Labels;
use snafu::Snafu;

mod merge;
mod reader;
mod writer;

pub use merge::MergeIterator;
pub use reader::SeriesFileReader;
pub use writer::SeriesFileWriter;

/// Identifies a series run file, version 1.
pub(crate) const FILE_TYPE_IDENTIFIER: &[u8; 8] = b"C2BSERI1";

/// Spill-file errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("failed to create series file {}: {source}", path.display()))]
    Create { path: PathBuf, source: io::Error },

    #[snafu(display("failed to open series file {}: {source}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("failed to write series file {}: {source}", path.display()))]
    Write { path: PathBuf, source: io::Error },

    #[snafu(display("failed to read series file {}: {source}", path.display()))]
    Read { path: PathBuf, source: io::Error },

    #[snafu(display("failed to remove drained series file {}: {source}", path.display()))]
    Remove { path: PathBuf, source: io::Error },

    #[snafu(display("series file {} has an unknown file type identifier", path.display()))]
    FileType { path: PathBuf },

    #[snafu(display(
        "series record checksum mismatch (expected {expected:#010x}, got {actual:#010x})"
    ))]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[snafu(display("failed to encode series record: {source}"))]
    EncodeRecord { source: bincode::Error },

    #[snafu(display("failed to decode series record: {source}"))]
    DecodeRecord { source: bincode::Error },

    #[snafu(display("duplicate series in merge input: {labels}"))]
    InternalDuplicateSeries { labels: Labels },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;
