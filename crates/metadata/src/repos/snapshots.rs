//! Snapshot repository.

use crate::error::MetadataResult;
use crate::models::SnapshotRow;
use async_trait::async_trait;

#[async_trait]
pub trait SnapshotRepo: Send + Sync {
    /// List snapshots of a group, oldest first.
    async fn list_snapshots(
        &self,
        group_id: i64,
        include_deleted: bool,
    ) -> MetadataResult<Vec<SnapshotRow>>;
}
