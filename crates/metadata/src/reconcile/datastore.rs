//! Datastore level, scoped to one host.

use super::{ENVELOPE_COLUMNS, LevelAdapter, push_envelope, upsert_clause};
use crate::error::MetadataResult;
use crate::models::{DatastoreRow, Envelope};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use stockroom_core::key::datastore_key;
use stockroom_core::{DatastoreRecord, Key};
use time::OffsetDateTime;

pub struct DatastoreAdapter {
    host_id: i64,
}

impl DatastoreAdapter {
    pub fn new(host_id: i64) -> Self {
        Self { host_id }
    }
}

#[async_trait]
impl LevelAdapter for DatastoreAdapter {
    type Entity = DatastoreRow;
    type Record = DatastoreRecord;

    fn level(&self) -> &'static str {
        "datastore"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["host_id", "mountpoint"]
    }

    async fn load(&self, conn: &mut SqliteConnection) -> MetadataResult<Vec<DatastoreRow>> {
        let rows = sqlx::query_as::<_, DatastoreRow>("SELECT * FROM datastores WHERE host_id = ?")
            .bind(self.host_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows)
    }

    fn entity_key(&self, entity: &DatastoreRow) -> MetadataResult<Key> {
        Ok(datastore_key(entity.host_id, &entity.mountpoint))
    }

    fn record_key(&self, record: &DatastoreRecord) -> MetadataResult<Key> {
        Ok(datastore_key(self.host_id, &record.mountpoint))
    }

    fn create(&self, record: &DatastoreRecord, as_of: OffsetDateTime) -> MetadataResult<DatastoreRow> {
        Ok(DatastoreRow {
            id: None,
            host_id: self.host_id,
            name: record.name.clone(),
            mountpoint: record.mountpoint.clone(),
            meta: Envelope::new(as_of),
        })
    }

    fn apply(&self, entity: &mut DatastoreRow, record: &DatastoreRecord) -> bool {
        if entity.name == record.name {
            return false;
        }
        entity.name = record.name.clone();
        true
    }

    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&DatastoreRow],
    ) -> MetadataResult<Vec<i64>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO datastores (host_id, name, mountpoint, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, ds| {
            b.push_bind(ds.host_id)
                .push_bind(ds.name.clone())
                .push_bind(ds.mountpoint.clone());
            push_envelope(&mut b, &ds.meta);
        });
        qb.push(" RETURNING id");
        let ids = qb.build_query_scalar::<i64>().fetch_all(&mut *conn).await?;
        Ok(ids)
    }

    async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&DatastoreRow],
    ) -> MetadataResult<()> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO datastores (host_id, name, mountpoint, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, ds| {
            b.push_bind(ds.host_id)
                .push_bind(ds.name.clone())
                .push_bind(ds.mountpoint.clone());
            push_envelope(&mut b, &ds.meta);
        });
        qb.push(upsert_clause(self.key_columns(), &["name"]));
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }

    async fn sweep(&self, conn: &mut SqliteConnection, as_of: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE datastores SET deleted_at = ? \
             WHERE host_id = ? AND updated_at < ? AND deleted_at IS NULL",
        )
        .bind(as_of)
        .bind(self.host_id)
        .bind(as_of)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}
