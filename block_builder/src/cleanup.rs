//! Crash recovery: reclaiming unfinished block directories.
//!
//! A build that dies or is cancelled leaves its `<ulid>.tmp` directory
//! behind. The supervisor calls [`cleanup_output_dir`] before taking any
//! new plan, so stale workspaces never accumulate. Finished block
//! directories (no `.tmp` suffix) are never touched.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use tracing::info;

/// Startup cleanup errors. Any failure here is fatal: building on a
/// workspace that cannot be reclaimed risks mixing two builds' state.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum CleanupError {
    #[snafu(display("failed to list output directory {}: {source}", path.display()))]
    List { path: PathBuf, source: io::Error },

    #[snafu(display("failed to remove unfinished block {}: {source}", path.display()))]
    Remove { path: PathBuf, source: io::Error },
}

/// Remove every directory under `output_dir` whose name ends in `.tmp`.
pub fn cleanup_output_dir(output_dir: &Path) -> Result<(), CleanupError> {
    let entries = fs::read_dir(output_dir).context(ListSnafu { path: output_dir })?;

    for entry in entries {
        let entry = entry.context(ListSnafu { path: output_dir })?;
        let is_dir = entry
            .file_type()
            .context(ListSnafu { path: output_dir })?
            .is_dir();
        let name = entry.file_name();

        if is_dir && name.to_string_lossy().ends_with(".tmp") {
            let path = entry.path();
            info!(dir = %path.display(), "removing unfinished block");
            fs::remove_dir_all(&path).context(RemoveSnafu { path })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_only_tmp_directories() {
        let dir = tempfile::tempdir().unwrap();

        fs::create_dir(dir.path().join("01ABC.tmp")).unwrap();
        fs::write(dir.path().join("01ABC.tmp/index"), b"partial").unwrap();
        fs::create_dir(dir.path().join("01DEF")).unwrap();
        fs::write(dir.path().join("01DEF/index"), b"finished").unwrap();
        // A stray file ending in .tmp is not a block directory.
        fs::write(dir.path().join("stray.tmp"), b"file").unwrap();

        cleanup_output_dir(dir.path()).unwrap();

        assert!(!dir.path().join("01ABC.tmp").exists());
        assert!(dir.path().join("01DEF/index").exists());
        assert!(dir.path().join("stray.tmp").exists());
    }

    #[test]
    fn empty_output_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        cleanup_output_dir(dir.path()).unwrap();
    }

    #[test]
    fn missing_output_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(cleanup_output_dir(&missing).is_err());
    }
}
