//! Datastore repository.

use crate::error::MetadataResult;
use crate::models::DatastoreRow;
use async_trait::async_trait;

#[async_trait]
pub trait DatastoreRepo: Send + Sync {
    /// List the datastores of a host, ordered by mountpoint.
    async fn list_datastores(
        &self,
        host_id: i64,
        include_deleted: bool,
    ) -> MetadataResult<Vec<DatastoreRow>>;
}
