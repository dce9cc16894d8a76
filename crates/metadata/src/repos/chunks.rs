//! Chunk repository.

use crate::error::MetadataResult;
use crate::models::ChunkRow;
use async_trait::async_trait;

/// Repository for chunk lookups.
#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// List chunks of a datastore, ordered by digest.
    async fn list_chunks(
        &self,
        datastore_id: i64,
        include_deleted: bool,
    ) -> MetadataResult<Vec<ChunkRow>>;

    /// Get a chunk by hex digest, preferring the live row.
    async fn get_chunk(&self, datastore_id: i64, digest: &str) -> MetadataResult<Option<ChunkRow>>;
}
