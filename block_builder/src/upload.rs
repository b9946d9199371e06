//! Block size accounting and object-store upload.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use backoff::{Backoff, BackoffConfig, RetryError};
use object_store::{path::Path as ObjectPath, DynObjectStore};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

/// Name of the spill subdirectory excluded from block size accounting.
pub(crate) const SERIES_DIR: &str = "series";

/// Upload errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum UploadError {
    #[snafu(display("block path {} has no directory name", path.display()))]
    BlockName { path: PathBuf },

    #[snafu(display("failed to walk block directory {}: {source}", path.display()))]
    Walk { path: PathBuf, source: io::Error },

    #[snafu(display("failed to read block file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: io::Error },

    #[snafu(display("failed to upload {location}: {source}"))]
    Put {
        location: ObjectPath,
        source: object_store::Error,
    },
}

/// Recursive size of all files under `dir`, skipping the series spill
/// subdirectory (deleted before the block is finished, but a crash may
/// leave it behind).
pub fn block_size(dir: &Path) -> Result<u64, io::Error> {
    let mut size = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if entry.file_name() == SERIES_DIR {
                continue;
            }
            size += block_size(&entry.path())?;
        } else {
            size += entry.metadata()?.len();
        }
    }
    Ok(size)
}

/// Upload every file under `block_dir` to `<tenant>/<block name>/…`,
/// retrying the whole directory under `backoff_config`. Object stores are
/// content-addressed by full key here, so re-uploading an already present
/// block simply overwrites identical objects.
pub async fn upload_block(
    store: Arc<DynObjectStore>,
    tenant: &str,
    block_dir: &Path,
    backoff_config: &BackoffConfig,
) -> Result<(), RetryError<UploadError>> {
    Backoff::new(backoff_config)
        .retry_all_errors("upload block", || {
            upload_block_once(Arc::clone(&store), tenant, block_dir)
        })
        .await
}

async fn upload_block_once(
    store: Arc<DynObjectStore>,
    tenant: &str,
    block_dir: &Path,
) -> Result<(), UploadError> {
    let block_name = block_dir
        .file_name()
        .and_then(|n| n.to_str())
        .context(BlockNameSnafu { path: block_dir })?;

    let mut files = vec![];
    collect_files(block_dir, &mut files).context(WalkSnafu { path: block_dir })?;

    for file in files {
        let relative = file
            .strip_prefix(block_dir)
            .expect("walked file is under the block directory");
        let location = ObjectPath::from(format!(
            "{tenant}/{block_name}/{}",
            relative.display()
        ));

        let data = tokio::fs::read(&file)
            .await
            .context(ReadFileSnafu { path: &file })?;
        debug!(%location, bytes = data.len(), "uploading block file");
        store
            .put(&location, data.into())
            .await
            .context(PutSnafu { location })?;
    }

    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), out)?;
        } else {
            out.push(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;
    use std::fs;

    fn write_fake_block(dir: &Path) {
        fs::create_dir_all(dir.join("chunks")).unwrap();
        fs::write(dir.join("index"), b"0123456789").unwrap();
        fs::write(dir.join("chunks/000001"), b"0123456789abcdef").unwrap();
        fs::write(dir.join("meta.json"), b"{}").unwrap();
    }

    #[test]
    fn block_size_sums_files_and_skips_series_dir() {
        let dir = tempfile::tempdir().unwrap();
        let block = dir.path().join("block");
        write_fake_block(&block);
        fs::create_dir_all(block.join("series")).unwrap();
        fs::write(block.join("series/000000"), b"spilled data").unwrap();

        assert_eq!(block_size(&block).unwrap(), 10 + 16 + 2);
    }

    #[tokio::test]
    async fn uploads_every_file_under_the_tenant_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let block = dir.path().join("01TESTULID");
        write_fake_block(&block);

        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        upload_block(
            Arc::clone(&store),
            "tenant-1",
            &block,
            &BackoffConfig::default(),
        )
        .await
        .unwrap();

        let mut locations: Vec<String> = store
            .list(None)
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .unwrap();
        locations.sort();
        assert_eq!(
            locations,
            vec![
                "tenant-1/01TESTULID/chunks/000001",
                "tenant-1/01TESTULID/index",
                "tenant-1/01TESTULID/meta.json",
            ]
        );
    }

    #[tokio::test]
    async fn re_upload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let block = dir.path().join("01TESTULID");
        write_fake_block(&block);

        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        for _ in 0..2 {
            upload_block(
                Arc::clone(&store),
                "tenant-1",
                &block,
                &BackoffConfig::default(),
            )
            .await
            .unwrap();
        }

        let count = store.list(None).try_fold(0, |n, _| async move { Ok(n + 1) });
        assert_eq!(count.await.unwrap(), 3);
    }
}
