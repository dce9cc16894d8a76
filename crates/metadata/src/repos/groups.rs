//! Backup group repository.

use crate::error::MetadataResult;
use crate::models::GroupRow;
use async_trait::async_trait;

#[async_trait]
pub trait GroupRepo: Send + Sync {
    /// List backup groups of a datastore across all namespaces.
    async fn list_groups(
        &self,
        datastore_id: i64,
        include_deleted: bool,
    ) -> MetadataResult<Vec<GroupRow>>;
}
