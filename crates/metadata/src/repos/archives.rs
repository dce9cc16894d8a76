//! Archive repository.

use crate::error::MetadataResult;
use crate::models::{ArchiveChunkRow, ArchiveRow};
use async_trait::async_trait;

/// Repository for file and image archives and their chunk links.
#[async_trait]
pub trait ArchiveRepo: Send + Sync {
    /// List archives of a snapshot, both kinds.
    async fn list_archives(
        &self,
        snapshot_id: i64,
        include_deleted: bool,
    ) -> MetadataResult<Vec<ArchiveRow>>;

    /// Chunk links of an archive with per-chunk reference counts.
    ///
    /// Links are rewritten only by scans that decoded the archive's index,
    /// so they reflect the most recent decoded content.
    async fn list_archive_chunks(&self, archive_id: i64) -> MetadataResult<Vec<ArchiveChunkRow>>;
}
