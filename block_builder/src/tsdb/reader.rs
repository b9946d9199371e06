use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use data_types::Sample;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use super::{ChunkRef, IndexRecord, CHUNKS_DIR, INDEX_FILE};

/// Block read-back errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ReadError {
    #[snafu(display("failed to read {}: {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("{} has an unknown file type identifier", path.display()))]
    FileType { path: PathBuf },

    #[snafu(display("checksum mismatch in {} (expected {expected:#010x}, got {actual:#010x})", path.display()))]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[snafu(display("failed to decode record in {}: {source}", path.display()))]
    Decode {
        path: PathBuf,
        source: bincode::Error,
    },

    #[snafu(display("chunk reference points outside segment {segment} ({offset}+{length})"))]
    BadChunkRef {
        segment: u64,
        offset: u64,
        length: u32,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = ReadError> = std::result::Result<T, E>;

/// One series read back from a block: its index entry plus the decoded
/// samples of each chunk, in storage order.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSeries {
    /// The series' index record.
    pub index: IndexRecord,
    /// Decoded samples, one vector per chunk.
    pub chunk_samples: Vec<Vec<Sample>>,
}

/// Read a finished block back into memory, verifying all framing and
/// checksums on the way. Intended for tests and integrity checks, not for
/// serving queries.
pub fn read_block(block_dir: &Path) -> Result<Vec<BlockSeries>> {
    let index_path = block_dir.join(INDEX_FILE);
    let records = read_index(&index_path)?;

    // Segments are small enough to slurp whole for verification purposes.
    let mut segments: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut out = Vec::with_capacity(records.len());

    for record in records {
        let mut chunk_samples = Vec::with_capacity(record.chunks.len());
        for chunk_ref in &record.chunks {
            let segment = match segments.entry(chunk_ref.segment) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(slot) => {
                    let path = block_dir
                        .join(CHUNKS_DIR)
                        .join(format!("{:06}", chunk_ref.segment));
                    slot.insert(read_segment(&path)?)
                }
            };
            chunk_samples.push(decode_chunk(segment, chunk_ref, block_dir)?);
        }
        out.push(BlockSeries {
            index: record,
            chunk_samples,
        });
    }

    Ok(out)
}

fn read_index(path: &Path) -> Result<Vec<IndexRecord>> {
    let file = File::open(path).context(IoSnafu { path })?;
    let mut input = BufReader::new(file);

    let mut identifier = [0u8; super::INDEX_FILE_TYPE_IDENTIFIER.len()];
    input
        .read_exact(&mut identifier)
        .context(IoSnafu { path })?;
    ensure!(
        &identifier == super::INDEX_FILE_TYPE_IDENTIFIER,
        FileTypeSnafu { path }
    );

    let mut records = vec![];
    loop {
        let len = match input.read_u32::<BigEndian>() {
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            other => other.context(IoSnafu { path })?,
        };
        let expected = input.read_u32::<BigEndian>().context(IoSnafu { path })?;

        let mut payload = vec![0u8; len as usize];
        input.read_exact(&mut payload).context(IoSnafu { path })?;

        let actual = crc32fast::hash(&payload);
        ensure!(
            expected == actual,
            ChecksumMismatchSnafu {
                path,
                expected,
                actual,
            }
        );

        records.push(bincode::deserialize(&payload).context(DecodeSnafu { path })?);
    }
    Ok(records)
}

fn read_segment(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).context(IoSnafu { path })?;
    ensure!(
        data.len() >= super::SEGMENT_FILE_TYPE_IDENTIFIER.len()
            && data.starts_with(super::SEGMENT_FILE_TYPE_IDENTIFIER),
        FileTypeSnafu { path }
    );
    Ok(data)
}

fn decode_chunk(segment: &[u8], chunk_ref: &ChunkRef, block_dir: &Path) -> Result<Vec<Sample>> {
    let start = chunk_ref.offset as usize;
    let end = start + chunk_ref.length as usize;
    let frame = segment.get(start..end).context(BadChunkRefSnafu {
        segment: chunk_ref.segment,
        offset: chunk_ref.offset,
        length: chunk_ref.length,
    })?;
    ensure!(
        frame.len() >= 8,
        BadChunkRefSnafu {
            segment: chunk_ref.segment,
            offset: chunk_ref.offset,
            length: chunk_ref.length,
        }
    );

    let len = BigEndian::read_u32(&frame[..4]) as usize;
    ensure!(
        frame.len() == 8 + len,
        BadChunkRefSnafu {
            segment: chunk_ref.segment,
            offset: chunk_ref.offset,
            length: chunk_ref.length,
        }
    );
    let expected = BigEndian::read_u32(&frame[4..8]);
    let payload = &frame[8..];

    let actual = crc32fast::hash(payload);
    let path = block_dir
        .join(CHUNKS_DIR)
        .join(format!("{:06}", chunk_ref.segment));
    ensure!(
        expected == actual,
        ChecksumMismatchSnafu {
            path: path.clone(),
            expected,
            actual,
        }
    );

    bincode::deserialize(payload).context(DecodeSnafu { path })
}
