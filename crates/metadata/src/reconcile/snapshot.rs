//! Snapshot level, scoped to the groups of one datastore.

use super::group::record_group_key;
use super::{ENVELOPE_COLUMNS, KeyIndex, LevelAdapter, push_envelope, unresolved, upsert_clause};
use crate::error::{MetadataError, MetadataResult};
use crate::models::{Envelope, SnapshotRow, normalize_timestamp};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use stockroom_core::key::snapshot_key;
use stockroom_core::{Key, SnapshotRecord};
use time::OffsetDateTime;

/// Snapshot key of `record` as if it lived under `mountpoint`.
pub(crate) fn record_snapshot_key(mountpoint: &str, record: &SnapshotRecord) -> Key {
    snapshot_key(&record_group_key(mountpoint, &record.group), record.backup_time)
}

pub struct SnapshotAdapter {
    datastore_id: i64,
    mountpoint: String,
    groups: KeyIndex,
}

impl SnapshotAdapter {
    pub fn new(datastore_id: i64, mountpoint: impl Into<String>, groups: KeyIndex) -> Self {
        Self {
            datastore_id,
            mountpoint: mountpoint.into(),
            groups,
        }
    }
}

#[async_trait]
impl LevelAdapter for SnapshotAdapter {
    type Entity = SnapshotRow;
    type Record = SnapshotRecord;

    fn level(&self) -> &'static str {
        "snapshot"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["group_id", "backup_time"]
    }

    async fn load(&self, conn: &mut SqliteConnection) -> MetadataResult<Vec<SnapshotRow>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT s.* FROM snapshots s \
             JOIN backup_groups g ON g.id = s.group_id \
             WHERE g.datastore_id = ?",
        )
        .bind(self.datastore_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    fn entity_key(&self, entity: &SnapshotRow) -> MetadataResult<Key> {
        let group = self.groups.by_id.get(&entity.group_id).ok_or_else(|| {
            MetadataError::referential(
                "snapshot",
                entity.group_id,
                "stored group id is not in this datastore",
            )
        })?;
        Ok(snapshot_key(group, entity.backup_time))
    }

    fn record_key(&self, record: &SnapshotRecord) -> MetadataResult<Key> {
        Ok(record_snapshot_key(&self.mountpoint, record))
    }

    fn create(&self, record: &SnapshotRecord, as_of: OffsetDateTime) -> MetadataResult<SnapshotRow> {
        let group = record_group_key(&self.mountpoint, &record.group);
        let group_id = *self
            .groups
            .by_key
            .get(&group)
            .ok_or_else(|| unresolved("snapshot", &group, "backup group"))?;
        Ok(SnapshotRow {
            id: None,
            group_id,
            backup_time: normalize_timestamp(record.backup_time),
            meta: Envelope::new(as_of),
        })
    }

    fn apply(&self, _entity: &mut SnapshotRow, _record: &SnapshotRecord) -> bool {
        false
    }

    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&SnapshotRow],
    ) -> MetadataResult<Vec<i64>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO snapshots (group_id, backup_time, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, s| {
            b.push_bind(s.group_id).push_bind(s.backup_time);
            push_envelope(&mut b, &s.meta);
        });
        qb.push(" RETURNING id");
        let ids = qb.build_query_scalar::<i64>().fetch_all(&mut *conn).await?;
        Ok(ids)
    }

    async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&SnapshotRow],
    ) -> MetadataResult<()> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO snapshots (group_id, backup_time, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, s| {
            b.push_bind(s.group_id).push_bind(s.backup_time);
            push_envelope(&mut b, &s.meta);
        });
        qb.push(upsert_clause(self.key_columns(), &[]));
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }

    async fn sweep(&self, conn: &mut SqliteConnection, as_of: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE snapshots SET deleted_at = ? \
             WHERE updated_at < ? AND deleted_at IS NULL \
             AND group_id IN (SELECT id FROM backup_groups WHERE datastore_id = ?)",
        )
        .bind(as_of)
        .bind(as_of)
        .bind(self.datastore_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}
