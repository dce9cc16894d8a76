//! Inventory store trait and the SQLite implementation.

use crate::error::MetadataResult;
use crate::models::{HostRow, normalize_timestamp};
use crate::reconcile::ReconcileOptions;
use crate::repos::{
    ArchiveRepo, ChunkRepo, DatastoreRepo, GroupRepo, HostRepo, NamespaceRepo, SnapshotRepo,
};
use crate::scan::{ScanReport, run_scan};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use stockroom_core::Inventory;
use time::OffsetDateTime;

/// Combined inventory store trait.
#[async_trait]
pub trait InventoryStore:
    HostRepo
    + DatastoreRepo
    + NamespaceRepo
    + GroupRepo
    + SnapshotRepo
    + ArchiveRepo
    + ChunkRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Reconcile one scan of `host` in a single transaction.
    ///
    /// On error nothing from the scan is persisted.
    async fn apply_scan(
        &self,
        host: &str,
        inventory: &Inventory,
        as_of: OffsetDateTime,
        options: &ReconcileOptions,
    ) -> MetadataResult<ScanReport>;
}

/// SQLite-based inventory store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) a SQLite store and run migrations.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: u64) -> MetadataResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs));

        // One connection serialises scans; the reconciler assumes it is the
        // only writer for the scope it loads.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // An in-memory database lives only as long as its connection.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite inventory store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Insert the host if it is new and return its row.
pub(crate) async fn ensure_host_on(
    conn: &mut SqliteConnection,
    name: &str,
    at: OffsetDateTime,
) -> MetadataResult<HostRow> {
    sqlx::query("INSERT INTO hosts (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .bind(normalize_timestamp(at))
        .execute(&mut *conn)
        .await?;
    let row = sqlx::query_as::<_, HostRow>("SELECT * FROM hosts WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row)
}

#[async_trait]
impl InventoryStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn apply_scan(
        &self,
        host: &str,
        inventory: &Inventory,
        as_of: OffsetDateTime,
        options: &ReconcileOptions,
    ) -> MetadataResult<ScanReport> {
        let mut tx = self.pool.begin().await?;
        let host_row = ensure_host_on(&mut *tx, host, as_of).await?;
        let mut report = run_scan(&mut *tx, host_row.id, inventory, as_of, options).await?;
        tx.commit().await?;
        report.host = host_row.name;
        Ok(report)
    }
}

// Implement the read repositories for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;

    #[async_trait]
    impl HostRepo for SqliteStore {
        async fn ensure_host(&self, name: &str) -> MetadataResult<HostRow> {
            let mut conn = self.pool.acquire().await?;
            ensure_host_on(&mut *conn, name, OffsetDateTime::now_utc()).await
        }

        async fn get_host(&self, name: &str) -> MetadataResult<Option<HostRow>> {
            let row = sqlx::query_as::<_, HostRow>("SELECT * FROM hosts WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_hosts(&self) -> MetadataResult<Vec<HostRow>> {
            let rows = sqlx::query_as::<_, HostRow>("SELECT * FROM hosts ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl DatastoreRepo for SqliteStore {
        async fn list_datastores(
            &self,
            host_id: i64,
            include_deleted: bool,
        ) -> MetadataResult<Vec<DatastoreRow>> {
            let rows = sqlx::query_as::<_, DatastoreRow>(
                "SELECT * FROM datastores WHERE host_id = ? AND (? OR deleted_at IS NULL) \
                 ORDER BY mountpoint, id",
            )
            .bind(host_id)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl NamespaceRepo for SqliteStore {
        async fn list_namespaces(
            &self,
            datastore_id: i64,
            include_deleted: bool,
        ) -> MetadataResult<Vec<NamespaceRow>> {
            let rows = sqlx::query_as::<_, NamespaceRow>(
                "SELECT * FROM namespaces WHERE datastore_id = ? AND (? OR deleted_at IS NULL) \
                 ORDER BY path, id",
            )
            .bind(datastore_id)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl GroupRepo for SqliteStore {
        async fn list_groups(
            &self,
            datastore_id: i64,
            include_deleted: bool,
        ) -> MetadataResult<Vec<GroupRow>> {
            let rows = sqlx::query_as::<_, GroupRow>(
                "SELECT * FROM backup_groups WHERE datastore_id = ? AND (? OR deleted_at IS NULL) \
                 ORDER BY namespace_id, backup_type, backup_id, id",
            )
            .bind(datastore_id)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl SnapshotRepo for SqliteStore {
        async fn list_snapshots(
            &self,
            group_id: i64,
            include_deleted: bool,
        ) -> MetadataResult<Vec<SnapshotRow>> {
            let rows = sqlx::query_as::<_, SnapshotRow>(
                "SELECT * FROM snapshots WHERE group_id = ? AND (? OR deleted_at IS NULL) \
                 ORDER BY backup_time, id",
            )
            .bind(group_id)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl ArchiveRepo for SqliteStore {
        async fn list_archives(
            &self,
            snapshot_id: i64,
            include_deleted: bool,
        ) -> MetadataResult<Vec<ArchiveRow>> {
            let rows = sqlx::query_as::<_, ArchiveRow>(
                "SELECT * FROM archives WHERE snapshot_id = ? AND (? OR deleted_at IS NULL) \
                 ORDER BY kind, name, id",
            )
            .bind(snapshot_id)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_archive_chunks(&self, archive_id: i64) -> MetadataResult<Vec<ArchiveChunkRow>> {
            let rows = sqlx::query_as::<_, ArchiveChunkRow>(
                "SELECT * FROM archive_chunks WHERE archive_id = ? ORDER BY chunk_id",
            )
            .bind(archive_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl ChunkRepo for SqliteStore {
        async fn list_chunks(
            &self,
            datastore_id: i64,
            include_deleted: bool,
        ) -> MetadataResult<Vec<ChunkRow>> {
            let rows = sqlx::query_as::<_, ChunkRow>(
                "SELECT * FROM chunks WHERE datastore_id = ? AND (? OR deleted_at IS NULL) \
                 ORDER BY digest, id",
            )
            .bind(datastore_id)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_chunk(&self, datastore_id: i64, digest: &str) -> MetadataResult<Option<ChunkRow>> {
            // Prefer the live row over older soft-deleted ones.
            let row = sqlx::query_as::<_, ChunkRow>(
                "SELECT * FROM chunks WHERE datastore_id = ? AND digest = ? \
                 ORDER BY deleted_at IS NOT NULL, id DESC LIMIT 1",
            )
            .bind(datastore_id)
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }
    }
}

/// SQLite schema.
///
/// Every reconciled table has one unique index over its identity, the
/// conflict target of its upsert. Soft-deleted rows keep their identity and
/// are revived in place.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS datastores (
    id INTEGER PRIMARY KEY,
    host_id INTEGER NOT NULL REFERENCES hosts(id),
    name TEXT NOT NULL,
    mountpoint TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_datastores_identity
    ON datastores(host_id, mountpoint);

CREATE TABLE IF NOT EXISTS namespaces (
    id INTEGER PRIMARY KEY,
    datastore_id INTEGER NOT NULL REFERENCES datastores(id),
    parent_id INTEGER REFERENCES namespaces(id),
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_namespaces_identity
    ON namespaces(datastore_id, path);
CREATE INDEX IF NOT EXISTS idx_namespaces_parent ON namespaces(parent_id);

CREATE TABLE IF NOT EXISTS backup_groups (
    id INTEGER PRIMARY KEY,
    datastore_id INTEGER NOT NULL REFERENCES datastores(id),
    namespace_id INTEGER REFERENCES namespaces(id),
    backup_type TEXT NOT NULL CHECK (backup_type IN ('vm', 'ct', 'host')),
    backup_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
-- NULL namespaces must collide with each other, which a plain column would
-- not do. Namespace ids start at 1, so 0 stands for the root.
CREATE UNIQUE INDEX IF NOT EXISTS idx_backup_groups_identity
    ON backup_groups(datastore_id, coalesce(namespace_id, 0), backup_type, backup_id);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY,
    group_id INTEGER NOT NULL REFERENCES backup_groups(id),
    backup_time TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_identity
    ON snapshots(group_id, backup_time);

CREATE TABLE IF NOT EXISTS archives (
    id INTEGER PRIMARY KEY,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
    kind TEXT NOT NULL CHECK (kind IN ('file', 'image')),
    name TEXT NOT NULL,
    uuid TEXT,
    index_created_at TEXT,
    checksum TEXT,
    total_size INTEGER,
    chunk_size INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_archives_identity
    ON archives(snapshot_id, kind, name);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY,
    datastore_id INTEGER NOT NULL REFERENCES datastores(id),
    digest TEXT NOT NULL,
    size_bytes INTEGER,
    unused INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_identity
    ON chunks(datastore_id, digest);

CREATE TABLE IF NOT EXISTS archive_chunks (
    archive_id INTEGER NOT NULL REFERENCES archives(id),
    chunk_id INTEGER NOT NULL REFERENCES chunks(id),
    refcount INTEGER NOT NULL CHECK (refcount > 0),
    PRIMARY KEY (archive_id, chunk_id)
);
CREATE INDEX IF NOT EXISTS idx_archive_chunks_chunk ON archive_chunks(chunk_id);
"#;
