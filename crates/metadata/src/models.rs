//! Database models mapping to the inventory schema.

use serde::Serialize;
use sqlx::FromRow;
use time::{OffsetDateTime, UtcOffset};

/// Normalise a timestamp to UTC whole seconds, the precision stored for
/// every envelope field so that stored values order correctly as text.
pub fn normalize_timestamp(at: OffsetDateTime) -> OffsetDateTime {
    let utc = at.to_offset(UtcOffset::UTC);
    utc.replace_nanosecond(0).unwrap_or(utc)
}

// =============================================================================
// Metadata envelope
// =============================================================================

/// Lifecycle fields carried by every reconciled row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Envelope {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last time a scan observed the row.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Soft-delete marker.
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    /// Bumped on field changes and revivals, never on a plain touch.
    pub version: i64,
}

impl Envelope {
    pub fn new(at: OffsetDateTime) -> Self {
        let at = normalize_timestamp(at);
        Self {
            created_at: at,
            updated_at: at,
            deleted_at: None,
            version: 1,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether the row was observed or deleted after `as_of`. An observation
    /// at `as_of` is then stale and must not overwrite stored values.
    pub fn is_newer_than(&self, as_of: OffsetDateTime) -> bool {
        self.updated_at > as_of || self.deleted_at.is_some_and(|deleted_at| deleted_at > as_of)
    }

    /// Record an observation at `as_of`. Clears a deletion marker that is not
    /// newer than the observation and bumps the version once if the row was
    /// revived or `changed`. Touch time never moves backwards. Returns
    /// whether the row was revived.
    pub fn stamp(&mut self, as_of: OffsetDateTime, changed: bool) -> bool {
        let revived = match self.deleted_at {
            Some(deleted_at) if deleted_at <= as_of => {
                self.deleted_at = None;
                true
            }
            _ => false,
        };
        if revived || changed {
            self.version += 1;
        }
        if as_of > self.updated_at {
            self.updated_at = as_of;
        }
        revived
    }
}

/// A row the reconciliation engine can track.
pub trait Reconcilable: Clone + Send + Sync {
    /// Storage-assigned id, absent until inserted.
    fn id(&self) -> Option<i64>;
    fn set_id(&mut self, id: i64);
    fn meta(&self) -> &Envelope;
    fn meta_mut(&mut self) -> &mut Envelope;
}

macro_rules! impl_reconcilable {
    ($($row:ty),* $(,)?) => {
        $(
            impl Reconcilable for $row {
                fn id(&self) -> Option<i64> {
                    self.id
                }

                fn set_id(&mut self, id: i64) {
                    self.id = Some(id);
                }

                fn meta(&self) -> &Envelope {
                    &self.meta
                }

                fn meta_mut(&mut self) -> &mut Envelope {
                    &mut self.meta
                }
            }
        )*
    };
}

impl_reconcilable!(
    DatastoreRow,
    NamespaceRow,
    GroupRow,
    SnapshotRow,
    ArchiveRow,
    ChunkRow,
);

// =============================================================================
// Hosts
// =============================================================================

/// Host that owns datastores.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HostRow {
    pub id: i64,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Backup hierarchy
// =============================================================================

/// Datastore record.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DatastoreRow {
    pub id: Option<i64>,
    pub host_id: i64,
    pub name: String,
    pub mountpoint: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: Envelope,
}

/// Namespace tree node. `parent_id` is null for top-level namespaces.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NamespaceRow {
    pub id: Option<i64>,
    pub datastore_id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    /// Full slash-joined path, denormalised from the parent chain.
    pub path: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: Envelope,
}

/// Backup group record.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GroupRow {
    pub id: Option<i64>,
    pub datastore_id: i64,
    pub namespace_id: Option<i64>,
    pub backup_type: String, // "vm", "ct", "host"
    pub backup_id: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: Envelope,
}

/// Snapshot record.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SnapshotRow {
    pub id: Option<i64>,
    pub group_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub backup_time: OffsetDateTime,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: Envelope,
}

/// Archive record for both file and image archives.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ArchiveRow {
    pub id: Option<i64>,
    pub snapshot_id: i64,
    pub kind: String, // "file", "image"
    pub name: String,
    pub uuid: Option<String>,
    /// Creation time from the index header.
    #[serde(with = "time::serde::rfc3339::option")]
    pub index_created_at: Option<OffsetDateTime>,
    pub checksum: Option<String>,
    // Image archives only
    pub total_size: Option<i64>,
    pub chunk_size: Option<i64>,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: Envelope,
}

/// Chunk record.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChunkRow {
    pub id: Option<i64>,
    pub datastore_id: i64,
    pub digest: String,
    pub size_bytes: Option<i64>,
    pub unused: bool,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: Envelope,
}

/// Archive to chunk mapping with the number of index references.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct ArchiveChunkRow {
    pub archive_id: i64,
    pub chunk_id: i64,
    pub refcount: i64,
}
