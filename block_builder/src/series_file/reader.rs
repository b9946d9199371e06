use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ReadBytesExt};
use data_types::Series;
use snafu::{ensure, ResultExt};

use super::{
    ChecksumMismatchSnafu, DecodeRecordSnafu, FileTypeSnafu, OpenSnafu, ReadSnafu, Result,
    FILE_TYPE_IDENTIFIER,
};

/// Streams the records of one run file in stored (sorted) order.
#[derive(Debug)]
pub struct SeriesFileReader {
    path: PathBuf,
    input: BufReader<File>,
}

impl SeriesFileReader {
    /// Open a run file and verify its file type identifier.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).context(OpenSnafu { path: path.clone() })?;
        let mut input = BufReader::new(file);

        let mut identifier = [0u8; FILE_TYPE_IDENTIFIER.len()];
        input
            .read_exact(&mut identifier)
            .context(ReadSnafu { path: path.clone() })?;
        ensure!(
            &identifier == FILE_TYPE_IDENTIFIER,
            FileTypeSnafu { path: path.clone() }
        );

        Ok(Self { path, input })
    }

    /// Read the next record; `None` at a clean end of file.
    pub fn next_series(&mut self) -> Result<Option<Series>> {
        let len = match self.input.read_u32::<BigEndian>() {
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            other => other.context(ReadSnafu {
                path: self.path.clone(),
            })?,
        };
        let expected = self.input.read_u32::<BigEndian>().context(ReadSnafu {
            path: self.path.clone(),
        })?;

        let mut payload = vec![0u8; len as usize];
        self.input.read_exact(&mut payload).context(ReadSnafu {
            path: self.path.clone(),
        })?;

        let actual = crc32fast::hash(&payload);
        ensure!(expected == actual, ChecksumMismatchSnafu { expected, actual });

        let series = bincode::deserialize(&payload).context(DecodeRecordSnafu)?;
        Ok(Some(series))
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
