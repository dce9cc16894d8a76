//! Namespace repository.

use crate::error::MetadataResult;
use crate::models::NamespaceRow;
use async_trait::async_trait;

/// Repository for the per-datastore namespace tree.
#[async_trait]
pub trait NamespaceRepo: Send + Sync {
    /// List namespaces of a datastore, ordered by path so parents come first.
    async fn list_namespaces(
        &self,
        datastore_id: i64,
        include_deleted: bool,
    ) -> MetadataResult<Vec<NamespaceRow>>;
}
