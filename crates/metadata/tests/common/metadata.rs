//! Inventory store test utilities.

use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use stockroom_metadata::{InventoryStore, MetadataResult, SqliteStore};
use tempfile::TempDir;

/// A test inventory store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn InventoryStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: Option<TempDir>,
}

#[allow(dead_code)]
impl TestMetadata {
    /// Create a store backed by a database file in a temp directory.
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("inventory.db");
        let store = Arc::new(SqliteStore::new(&db_path, 5).await?);
        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            _temp_dir: Some(temp_dir),
        })
    }

    /// Create a new in-memory SQLite store (faster for tests).
    pub async fn in_memory() -> MetadataResult<Self> {
        let store = Arc::new(SqliteStore::new(":memory:", 5).await?);
        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            _temp_dir: None,
        })
    }

    pub fn store(&self) -> Arc<dyn InventoryStore> {
        self.store.clone()
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}
