//! File and image archive levels, plus archive-to-chunk linking.

use super::snapshot::record_snapshot_key;
use super::{ENVELOPE_COLUMNS, KeyIndex, LevelAdapter, push_envelope, unresolved, upsert_clause};
use crate::error::{MetadataError, MetadataResult, stored_size};
use crate::models::{ArchiveRow, ChunkRow, Envelope};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;
use stockroom_core::key::{archive_key, chunk_key};
use stockroom_core::{ArchiveKind, ArchiveRecord, ChunkDigest, ChunkIndex, Key};
use time::OffsetDateTime;

/// Archive key of `record` as if it lived under `mountpoint`.
pub(crate) fn record_archive_key(mountpoint: &str, record: &ArchiveRecord) -> Key {
    archive_key(
        &record_snapshot_key(mountpoint, &record.snapshot),
        record.kind,
        &record.name,
    )
}

/// Header-derived archive columns.
#[derive(Debug, Default)]
struct IndexFields {
    uuid: Option<String>,
    created_at: Option<OffsetDateTime>,
    checksum: Option<String>,
    total_size: Option<i64>,
    chunk_size: Option<i64>,
}

impl IndexFields {
    fn from_index(
        level: &'static str,
        key: &Key,
        kind: ArchiveKind,
        index: &ChunkIndex,
    ) -> MetadataResult<Self> {
        let (total_size, chunk_size) = match kind {
            ArchiveKind::Image => (
                Some(stored_size(level, key, "total size", index.total_size())?),
                index
                    .chunk_size()
                    .map(|size| stored_size(level, key, "chunk size", size))
                    .transpose()?,
            ),
            ArchiveKind::File => (None, None),
        };
        Ok(Self {
            uuid: Some(index.header.uuid_string()),
            created_at: index.header.created_at(),
            checksum: Some(index.header.checksum_hex()),
            total_size,
            chunk_size,
        })
    }
}

/// Overwrite `slot` with an explicit `value`. Returns whether it changed.
fn set_if_changed<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(value) if slot.as_ref() != Some(&value) => {
            *slot = Some(value);
            true
        }
        _ => false,
    }
}

/// One adapter per archive kind; each sweeps only its own kind.
pub struct ArchiveAdapter {
    kind: ArchiveKind,
    datastore_id: i64,
    mountpoint: String,
    snapshots: KeyIndex,
}

impl ArchiveAdapter {
    pub fn new(
        kind: ArchiveKind,
        datastore_id: i64,
        mountpoint: impl Into<String>,
        snapshots: KeyIndex,
    ) -> Self {
        Self {
            kind,
            datastore_id,
            mountpoint: mountpoint.into(),
            snapshots,
        }
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    fn index_fields(&self, key: &Key, record: &ArchiveRecord) -> MetadataResult<Option<IndexFields>> {
        record
            .index
            .as_ref()
            .map(|index| IndexFields::from_index(self.level(), key, self.kind, index))
            .transpose()
    }
}

#[async_trait]
impl LevelAdapter for ArchiveAdapter {
    type Entity = ArchiveRow;
    type Record = ArchiveRecord;

    fn level(&self) -> &'static str {
        match self.kind {
            ArchiveKind::File => "file archive",
            ArchiveKind::Image => "image archive",
        }
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["snapshot_id", "kind", "name"]
    }

    async fn load(&self, conn: &mut SqliteConnection) -> MetadataResult<Vec<ArchiveRow>> {
        let rows = sqlx::query_as::<_, ArchiveRow>(
            "SELECT a.* FROM archives a \
             JOIN snapshots s ON s.id = a.snapshot_id \
             JOIN backup_groups g ON g.id = s.group_id \
             WHERE g.datastore_id = ? AND a.kind = ?",
        )
        .bind(self.datastore_id)
        .bind(self.kind.as_str())
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    fn entity_key(&self, entity: &ArchiveRow) -> MetadataResult<Key> {
        let snapshot = self.snapshots.by_id.get(&entity.snapshot_id).ok_or_else(|| {
            MetadataError::referential(
                self.level(),
                &entity.name,
                format!("stored snapshot id {} is not in this datastore", entity.snapshot_id),
            )
        })?;
        Ok(archive_key(
            snapshot,
            entity.kind.parse::<ArchiveKind>()?,
            &entity.name,
        ))
    }

    fn record_key(&self, record: &ArchiveRecord) -> MetadataResult<Key> {
        if record.kind != self.kind {
            return Err(MetadataError::Internal(format!(
                "{} record handed to the {} adapter",
                record.kind,
                self.level()
            )));
        }
        let key = record_archive_key(&self.mountpoint, record);
        // Every record passes through here first, so apply sees only storable sizes.
        self.index_fields(&key, record)?;
        Ok(key)
    }

    fn create(&self, record: &ArchiveRecord, as_of: OffsetDateTime) -> MetadataResult<ArchiveRow> {
        let snapshot = record_snapshot_key(&self.mountpoint, &record.snapshot);
        let snapshot_id = *self
            .snapshots
            .by_key
            .get(&snapshot)
            .ok_or_else(|| unresolved(self.level(), &snapshot, "snapshot"))?;
        let key = record_archive_key(&self.mountpoint, record);
        let fields = self.index_fields(&key, record)?.unwrap_or_default();
        Ok(ArchiveRow {
            id: None,
            snapshot_id,
            kind: self.kind.as_str().to_string(),
            name: record.name.clone(),
            uuid: fields.uuid,
            index_created_at: fields.created_at,
            checksum: fields.checksum,
            total_size: fields.total_size,
            chunk_size: fields.chunk_size,
            meta: Envelope::new(as_of),
        })
    }

    fn apply(&self, entity: &mut ArchiveRow, record: &ArchiveRecord) -> bool {
        let key = record_archive_key(&self.mountpoint, record);
        let Ok(Some(fields)) = self.index_fields(&key, record) else {
            return false;
        };
        let mut changed = set_if_changed(&mut entity.uuid, fields.uuid);
        changed |= set_if_changed(&mut entity.index_created_at, fields.created_at);
        changed |= set_if_changed(&mut entity.checksum, fields.checksum);
        changed |= set_if_changed(&mut entity.total_size, fields.total_size);
        changed |= set_if_changed(&mut entity.chunk_size, fields.chunk_size);
        changed
    }

    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&ArchiveRow],
    ) -> MetadataResult<Vec<i64>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO archives (snapshot_id, kind, name, uuid, index_created_at, checksum, \
             total_size, chunk_size, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, a| {
            b.push_bind(a.snapshot_id)
                .push_bind(a.kind.clone())
                .push_bind(a.name.clone())
                .push_bind(a.uuid.clone())
                .push_bind(a.index_created_at)
                .push_bind(a.checksum.clone())
                .push_bind(a.total_size)
                .push_bind(a.chunk_size);
            push_envelope(&mut b, &a.meta);
        });
        qb.push(" RETURNING id");
        let ids = qb.build_query_scalar::<i64>().fetch_all(&mut *conn).await?;
        Ok(ids)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, entities: &[&ArchiveRow]) -> MetadataResult<()> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO archives (snapshot_id, kind, name, uuid, index_created_at, checksum, \
             total_size, chunk_size, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, a| {
            b.push_bind(a.snapshot_id)
                .push_bind(a.kind.clone())
                .push_bind(a.name.clone())
                .push_bind(a.uuid.clone())
                .push_bind(a.index_created_at)
                .push_bind(a.checksum.clone())
                .push_bind(a.total_size)
                .push_bind(a.chunk_size);
            push_envelope(&mut b, &a.meta);
        });
        qb.push(upsert_clause(
            self.key_columns(),
            &["uuid", "index_created_at", "checksum", "total_size", "chunk_size"],
        ));
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }

    async fn sweep(&self, conn: &mut SqliteConnection, as_of: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE archives SET deleted_at = ? \
             WHERE kind = ? AND updated_at < ? AND deleted_at IS NULL \
             AND snapshot_id IN ( \
                 SELECT s.id FROM snapshots s \
                 JOIN backup_groups g ON g.id = s.group_id \
                 WHERE g.datastore_id = ?)",
        )
        .bind(as_of)
        .bind(self.kind.as_str())
        .bind(as_of)
        .bind(self.datastore_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Outcome of [`link_archive_chunks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Archives whose chunk links were rewritten.
    pub linked_archives: usize,
    /// Join rows written.
    pub links: usize,
    /// Distinct referenced digests, per archive, with no live chunk row.
    pub missing_chunks: usize,
}

/// Replace the chunk links of every archive whose index was decoded.
///
/// Each distinct digest becomes one join row whose refcount is the number
/// of times the digest occurs in the index. Archives observed without index
/// content keep their previous links.
pub async fn link_archive_chunks<'a>(
    conn: &mut SqliteConnection,
    datastore_id: i64,
    mountpoint: &str,
    archives: impl IntoIterator<Item = &'a ArchiveRecord>,
    archive_ids: &HashMap<Key, i64>,
    chunks: &HashMap<Key, ChunkRow>,
    batch_size: usize,
) -> MetadataResult<LinkStats> {
    let mut stats = LinkStats::default();
    for record in archives {
        let Some(index) = &record.index else {
            continue;
        };
        let key = record_archive_key(mountpoint, record);
        let archive_id = *archive_ids
            .get(&key)
            .ok_or_else(|| unresolved("archive chunk", &key, "archive"))?;

        let mut order: Vec<ChunkDigest> = Vec::new();
        let mut counts: HashMap<ChunkDigest, i64> = HashMap::new();
        for digest in &index.digests {
            let count = counts.entry(*digest).or_insert(0);
            if *count == 0 {
                order.push(*digest);
            }
            *count += 1;
        }

        let mut links: Vec<(i64, i64)> = Vec::with_capacity(order.len());
        for digest in &order {
            let chunk_id = chunks
                .get(&chunk_key(datastore_id, digest))
                .filter(|chunk| !chunk.meta.is_deleted())
                .and_then(|chunk| chunk.id);
            match chunk_id {
                Some(chunk_id) => links.push((chunk_id, counts[digest])),
                None => {
                    tracing::warn!(archive = %key, digest = %digest, "index references a chunk missing from the datastore");
                    stats.missing_chunks += 1;
                }
            }
        }

        sqlx::query("DELETE FROM archive_chunks WHERE archive_id = ?")
            .bind(archive_id)
            .execute(&mut *conn)
            .await?;
        for batch in links.chunks(batch_size.max(1)) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO archive_chunks (archive_id, chunk_id, refcount) ",
            );
            qb.push_values(batch, |mut b, (chunk_id, refcount)| {
                b.push_bind(archive_id)
                    .push_bind(*chunk_id)
                    .push_bind(*refcount);
            });
            qb.build().execute(&mut *conn).await?;
        }
        stats.linked_archives += 1;
        stats.links += links.len();
    }
    tracing::info!(
        datastore_id,
        linked_archives = stats.linked_archives,
        links = stats.links,
        missing_chunks = stats.missing_chunks,
        "linked archive chunks"
    );
    Ok(stats)
}
