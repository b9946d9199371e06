use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::Labels;

/// Magic bytes opening every encoded chunk object.
const CHUNK_MAGIC: &[u8; 4] = b"c2bc";

/// Bytes of framing around the bincode payload: magic, payload length,
/// trailing checksum.
const FRAME_LEN: usize = CHUNK_MAGIC.len() + 4 + 4;

/// Errors produced by the chunk wire codec.
#[derive(Debug, Snafu)]
pub enum CodecError {
    #[snafu(display("chunk object too short ({len} bytes)"))]
    Truncated {
        /// Observed object length.
        len: usize,
    },

    #[snafu(display("chunk object has invalid magic bytes"))]
    Magic,

    #[snafu(display("chunk payload length {declared} disagrees with object size {actual}"))]
    LengthMismatch {
        /// Length declared in the frame header.
        declared: usize,
        /// Payload bytes actually present.
        actual: usize,
    },

    #[snafu(display("chunk checksum mismatch (expected {expected:#010x}, got {actual:#010x})"))]
    ChecksumMismatch {
        /// Checksum stored in the object.
        expected: u32,
        /// Checksum of the received payload.
        actual: u32,
    },

    #[snafu(display("failed to serialize chunk: {source}"))]
    Serialize {
        /// Underlying encoding error.
        source: bincode::Error,
    },

    #[snafu(display("failed to deserialize chunk: {source}"))]
    Deserialize {
        /// Underlying decoding error.
        source: bincode::Error,
    },
}

/// Identifier of a chunk object in the chunk store. Opaque to the builder;
/// the store maps it to an object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Wrap a chunk identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One timestamped value. Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Millisecond timestamp.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
}

/// A storage-resident run of samples carrying its own copy of the series
/// label set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Label set as recorded by the producer; may need normalization.
    pub metric: Labels,
    /// Timestamp of the first sample, milliseconds.
    pub from: i64,
    /// Timestamp of the last sample, milliseconds.
    pub through: i64,
    /// Samples in timestamp order.
    pub samples: Vec<Sample>,
}

impl Chunk {
    /// Build a chunk over `samples`, deriving the time range from the first
    /// and last sample.
    pub fn new(metric: Labels, samples: Vec<Sample>) -> Self {
        let from = samples.first().map(|s| s.timestamp).unwrap_or(0);
        let through = samples.last().map(|s| s.timestamp).unwrap_or(0);
        Self {
            metric,
            from,
            through,
            samples,
        }
    }

    /// Approximate in-memory size, used for the fetched-bytes accounting.
    pub fn size_bytes(&self) -> usize {
        self.metric.size_bytes() + self.samples.len() * std::mem::size_of::<Sample>() + 16
    }

    /// Encode to the chunk store wire format: magic, payload length,
    /// bincode payload, CRC32 of the payload.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(self).context(SerializeSnafu)?;

        let mut out = Vec::with_capacity(FRAME_LEN + payload.len());
        out.extend_from_slice(CHUNK_MAGIC);
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, payload.len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(&payload);
        let mut crc = [0u8; 4];
        BigEndian::write_u32(&mut crc, crc32fast::hash(&payload));
        out.extend_from_slice(&crc);

        Ok(out.into())
    }

    /// Decode from the wire format, verifying magic and checksum.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        ensure!(data.len() >= FRAME_LEN, TruncatedSnafu { len: data.len() });
        let (magic, rest) = data.split_at(CHUNK_MAGIC.len());
        ensure!(magic == CHUNK_MAGIC, MagicSnafu);

        let declared = BigEndian::read_u32(&rest[..4]) as usize;
        let rest = &rest[4..];
        ensure!(
            rest.len() == declared + 4,
            LengthMismatchSnafu {
                declared,
                actual: rest.len().saturating_sub(4),
            }
        );
        let (payload, crc) = rest.split_at(declared);

        let expected = BigEndian::read_u32(crc);
        let actual = crc32fast::hash(payload);
        ensure!(
            expected == actual,
            ChecksumMismatchSnafu { expected, actual }
        );

        bincode::deserialize(payload).context(DeserializeSnafu)
    }
}
