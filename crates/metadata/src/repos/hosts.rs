//! Host repository.

use crate::error::MetadataResult;
use crate::models::HostRow;
use async_trait::async_trait;

/// Repository for hosts owning datastores.
#[async_trait]
pub trait HostRepo: Send + Sync {
    /// Get the host row for `name`, creating it on first use.
    async fn ensure_host(&self, name: &str) -> MetadataResult<HostRow>;

    /// Get a host by name.
    async fn get_host(&self, name: &str) -> MetadataResult<Option<HostRow>>;

    /// List all hosts.
    async fn list_hosts(&self) -> MetadataResult<Vec<HostRow>>;
}
