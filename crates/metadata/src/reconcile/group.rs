//! Backup group level, scoped to one datastore.

use super::{ENVELOPE_COLUMNS, LevelAdapter, push_envelope, upsert_clause};
use crate::error::{MetadataError, MetadataResult};
use crate::models::{DatastoreRow, Envelope, GroupRow, NamespaceRow};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;
use stockroom_core::key::group_key;
use stockroom_core::{BackupType, GroupRecord, Key};
use time::OffsetDateTime;

/// Group key of `record` as if it lived under `mountpoint`.
pub(crate) fn record_group_key(mountpoint: &str, record: &GroupRecord) -> Key {
    group_key(
        mountpoint,
        record.namespace.as_deref(),
        record.backup_type,
        &record.backup_id,
    )
}

pub struct GroupAdapter {
    datastore_id: i64,
    mountpoint: String,
    namespace_paths: HashMap<i64, String>,
    namespace_ids: HashMap<String, i64>,
}

impl GroupAdapter {
    /// Build from the datastore row and its reconciled namespaces.
    pub fn new<'a>(
        datastore: &DatastoreRow,
        namespaces: impl IntoIterator<Item = &'a NamespaceRow>,
    ) -> MetadataResult<Self> {
        let datastore_id = datastore.id.ok_or_else(|| {
            MetadataError::Internal(format!("datastore {} has no id", datastore.mountpoint))
        })?;
        let mut namespace_paths = HashMap::new();
        let mut namespace_ids = HashMap::new();
        for ns in namespaces {
            let Some(id) = ns.id else {
                continue;
            };
            namespace_paths.insert(id, ns.path.clone());
            if !ns.meta.is_deleted() || !namespace_ids.contains_key(&ns.path) {
                namespace_ids.insert(ns.path.clone(), id);
            }
        }
        Ok(Self {
            datastore_id,
            mountpoint: datastore.mountpoint.clone(),
            namespace_paths,
            namespace_ids,
        })
    }
}

#[async_trait]
impl LevelAdapter for GroupAdapter {
    type Entity = GroupRow;
    type Record = GroupRecord;

    fn level(&self) -> &'static str {
        "group"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        // Root groups have no namespace; the identity index reads it as 0.
        &["datastore_id", "coalesce(namespace_id, 0)", "backup_type", "backup_id"]
    }

    async fn load(&self, conn: &mut SqliteConnection) -> MetadataResult<Vec<GroupRow>> {
        let rows =
            sqlx::query_as::<_, GroupRow>("SELECT * FROM backup_groups WHERE datastore_id = ?")
                .bind(self.datastore_id)
                .fetch_all(&mut *conn)
                .await?;
        Ok(rows)
    }

    fn entity_key(&self, entity: &GroupRow) -> MetadataResult<Key> {
        let namespace = match entity.namespace_id {
            None => None,
            Some(id) => Some(self.namespace_paths.get(&id).ok_or_else(|| {
                MetadataError::referential(
                    "group",
                    format!("{}/{}", entity.backup_type, entity.backup_id),
                    format!("stored namespace id {id} is not in datastore {}", self.datastore_id),
                )
            })?),
        };
        let backup_type: BackupType = entity.backup_type.parse()?;
        Ok(group_key(
            &self.mountpoint,
            namespace.map(String::as_str),
            backup_type,
            &entity.backup_id,
        ))
    }

    fn record_key(&self, record: &GroupRecord) -> MetadataResult<Key> {
        Ok(record_group_key(&self.mountpoint, record))
    }

    fn create(&self, record: &GroupRecord, as_of: OffsetDateTime) -> MetadataResult<GroupRow> {
        let namespace_id = match &record.namespace {
            None => None,
            Some(path) => Some(*self.namespace_ids.get(path).ok_or_else(|| {
                MetadataError::referential(
                    "group",
                    record_group_key(&self.mountpoint, record),
                    format!("namespace '{path}' was not reconciled in this scan"),
                )
            })?),
        };
        Ok(GroupRow {
            id: None,
            datastore_id: self.datastore_id,
            namespace_id,
            backup_type: record.backup_type.as_str().to_string(),
            backup_id: record.backup_id.clone(),
            meta: Envelope::new(as_of),
        })
    }

    fn apply(&self, _entity: &mut GroupRow, _record: &GroupRecord) -> bool {
        false
    }

    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&GroupRow],
    ) -> MetadataResult<Vec<i64>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO backup_groups (datastore_id, namespace_id, backup_type, backup_id, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, g| {
            b.push_bind(g.datastore_id)
                .push_bind(g.namespace_id)
                .push_bind(g.backup_type.clone())
                .push_bind(g.backup_id.clone());
            push_envelope(&mut b, &g.meta);
        });
        qb.push(" RETURNING id");
        let ids = qb.build_query_scalar::<i64>().fetch_all(&mut *conn).await?;
        Ok(ids)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, entities: &[&GroupRow]) -> MetadataResult<()> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO backup_groups (datastore_id, namespace_id, backup_type, backup_id, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, g| {
            b.push_bind(g.datastore_id)
                .push_bind(g.namespace_id)
                .push_bind(g.backup_type.clone())
                .push_bind(g.backup_id.clone());
            push_envelope(&mut b, &g.meta);
        });
        qb.push(upsert_clause(self.key_columns(), &[]));
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }

    async fn sweep(&self, conn: &mut SqliteConnection, as_of: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE backup_groups SET deleted_at = ? \
             WHERE datastore_id = ? AND updated_at < ? AND deleted_at IS NULL",
        )
        .bind(as_of)
        .bind(self.datastore_id)
        .bind(as_of)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}
