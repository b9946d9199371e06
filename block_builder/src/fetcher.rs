//! Chunk retrieval from the object store.
//!
//! The store seam is the [`ChunkStore`] trait so the pipeline can be
//! exercised against in-memory and failure-injecting implementations. The
//! production implementation maps chunk ids to object keys under a
//! tenant-scoped prefix fixed at construction.

use std::sync::Arc;

use async_trait::async_trait;
use data_types::{Chunk, ChunkId, CodecError};
use futures::{stream, StreamExt, TryStreamExt};
use object_store::{path::Path as ObjectPath, DynObjectStore};
use prometheus::IntCounter;
use snafu::{ResultExt, Snafu};

use crate::metrics::BuilderMetrics;

/// How many chunk objects of one batch are requested concurrently.
const FETCH_CONCURRENCY: usize = 16;

/// Chunk retrieval errors. Missing objects are not errors; they shrink the
/// returned batch instead.
#[derive(Debug, Snafu)]
pub enum FetchError {
    #[snafu(display("chunk store request failed: {source}"))]
    #[allow(missing_docs)]
    Store { source: object_store::Error },

    #[snafu(display("failed to decode chunk {id}: {source}"))]
    #[allow(missing_docs)]
    Decode { id: ChunkId, source: CodecError },
}

/// Tenant-scoped chunk retrieval.
#[async_trait]
pub trait ChunkStore: std::fmt::Debug + Send + Sync {
    /// Fetch the given chunks, preserving request order. Chunks the store
    /// does not have are silently omitted, so the result may be shorter
    /// than the request; callers account for the difference.
    async fn fetch_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, FetchError>;
}

/// [`ChunkStore`] over an [`object_store`] backend. Chunk `id` for tenant
/// `t` under period prefix `p` lives at object key `p/t/id`.
#[derive(Debug)]
pub struct ObjectStoreChunks {
    store: Arc<DynObjectStore>,
    tenant: String,
    prefix: String,
}

impl ObjectStoreChunks {
    /// Bind a chunk client to one tenant and one period prefix.
    pub fn new(
        store: Arc<DynObjectStore>,
        tenant: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tenant: tenant.into(),
            prefix: prefix.into(),
        }
    }

    fn chunk_path(&self, id: &ChunkId) -> ObjectPath {
        // Path parsing drops empty segments, so an empty prefix is fine.
        ObjectPath::from(format!("{}/{}/{}", self.prefix, self.tenant, id))
    }
}

#[async_trait]
impl ChunkStore for ObjectStoreChunks {
    async fn fetch_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, FetchError> {
        let fetched = stream::iter(ids.iter().cloned())
            .map(|id| {
                let store = Arc::clone(&self.store);
                let path = self.chunk_path(&id);
                async move {
                    match store.get(&path).await {
                        Ok(response) => {
                            let data = response.bytes().await.context(StoreSnafu)?;
                            let chunk = Chunk::decode(&data).context(DecodeSnafu { id })?;
                            Ok(Some(chunk))
                        }
                        Err(object_store::Error::NotFound { .. }) => Ok(None),
                        Err(source) => Err(FetchError::Store { source }),
                    }
                }
            })
            // `buffered`, not `buffer_unordered`: the chunk order within a
            // series is the storage order and must be preserved.
            .buffered(FETCH_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;

        Ok(fetched.into_iter().flatten().collect())
    }
}

/// Metric-counting wrapper around a [`ChunkStore`].
#[derive(Debug)]
pub struct Fetcher {
    store: Arc<dyn ChunkStore>,
    fetched_chunks: IntCounter,
    fetched_chunks_bytes: IntCounter,
}

impl Fetcher {
    /// Wrap `store`, recording fetch volume on `metrics`.
    pub fn new(store: Arc<dyn ChunkStore>, metrics: &BuilderMetrics) -> Self {
        Self {
            store,
            fetched_chunks: metrics.fetched_chunks.clone(),
            fetched_chunks_bytes: metrics.fetched_chunks_bytes.clone(),
        }
    }

    /// Fetch chunks and record how many chunks and bytes came back.
    pub async fn fetch_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, FetchError> {
        let chunks = self.store.fetch_chunks(ids).await?;

        self.fetched_chunks.inc_by(chunks.len() as u64);
        let bytes: usize = chunks.iter().map(Chunk::size_bytes).sum();
        self.fetched_chunks_bytes.inc_by(bytes as u64);

        Ok(chunks)
    }
}
