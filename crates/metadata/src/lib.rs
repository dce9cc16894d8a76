//! Persistent inventory of backup datastores for Stockroom.
//!
//! This crate turns scanned raw records into the stored entity graph:
//! - SQLite schema, row models and read repositories
//! - The generic reconciliation engine and one adapter per hierarchy level
//! - Scan orchestration in a single transaction

pub mod error;
pub mod models;
pub mod reconcile;
pub mod repos;
pub mod scan;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use reconcile::{ReconcileOptions, ReconcileStats};
pub use scan::ScanReport;
pub use store::{InventoryStore, SqliteStore};

use std::sync::Arc;
use stockroom_core::config::MetadataConfig;

/// Create an inventory store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn InventoryStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *busy_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn InventoryStore>)
        }
    }
}
