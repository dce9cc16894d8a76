//! Chunk level, scoped to one datastore.

use super::{ENVELOPE_COLUMNS, LevelAdapter, push_envelope, upsert_clause};
use crate::error::{MetadataResult, stored_size};
use crate::models::{ChunkRow, Envelope};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use stockroom_core::key::chunk_key;
use stockroom_core::{ChunkDigest, ChunkRecord, Key};
use time::OffsetDateTime;

pub struct ChunkAdapter {
    datastore_id: i64,
}

impl ChunkAdapter {
    pub fn new(datastore_id: i64) -> Self {
        Self { datastore_id }
    }

    fn size_bytes(&self, record: &ChunkRecord) -> MetadataResult<Option<i64>> {
        record
            .size
            .map(|size| {
                let key = chunk_key(self.datastore_id, &record.digest);
                stored_size("chunk", key, "size", size)
            })
            .transpose()
    }
}

#[async_trait]
impl LevelAdapter for ChunkAdapter {
    type Entity = ChunkRow;
    type Record = ChunkRecord;

    fn level(&self) -> &'static str {
        "chunk"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["datastore_id", "digest"]
    }

    async fn load(&self, conn: &mut SqliteConnection) -> MetadataResult<Vec<ChunkRow>> {
        let rows = sqlx::query_as::<_, ChunkRow>("SELECT * FROM chunks WHERE datastore_id = ?")
            .bind(self.datastore_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows)
    }

    fn entity_key(&self, entity: &ChunkRow) -> MetadataResult<Key> {
        let digest = ChunkDigest::from_hex(&entity.digest)?;
        Ok(chunk_key(entity.datastore_id, &digest))
    }

    fn record_key(&self, record: &ChunkRecord) -> MetadataResult<Key> {
        // Every record passes through here first, so apply sees only storable sizes.
        self.size_bytes(record)?;
        Ok(chunk_key(self.datastore_id, &record.digest))
    }

    fn create(&self, record: &ChunkRecord, as_of: OffsetDateTime) -> MetadataResult<ChunkRow> {
        Ok(ChunkRow {
            id: None,
            datastore_id: self.datastore_id,
            digest: record.digest.to_hex(),
            size_bytes: self.size_bytes(record)?,
            unused: record.unused.unwrap_or(false),
            meta: Envelope::new(as_of),
        })
    }

    fn apply(&self, entity: &mut ChunkRow, record: &ChunkRecord) -> bool {
        let mut changed = false;
        if let Ok(Some(size)) = self.size_bytes(record) {
            if entity.size_bytes != Some(size) {
                entity.size_bytes = Some(size);
                changed = true;
            }
        }
        if let Some(unused) = record.unused {
            if entity.unused != unused {
                entity.unused = unused;
                changed = true;
            }
        }
        changed
    }

    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&ChunkRow],
    ) -> MetadataResult<Vec<i64>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO chunks (datastore_id, digest, size_bytes, unused, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, c| {
            b.push_bind(c.datastore_id)
                .push_bind(c.digest.clone())
                .push_bind(c.size_bytes)
                .push_bind(c.unused);
            push_envelope(&mut b, &c.meta);
        });
        qb.push(" RETURNING id");
        let ids = qb.build_query_scalar::<i64>().fetch_all(&mut *conn).await?;
        Ok(ids)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, entities: &[&ChunkRow]) -> MetadataResult<()> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO chunks (datastore_id, digest, size_bytes, unused, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, c| {
            b.push_bind(c.datastore_id)
                .push_bind(c.digest.clone())
                .push_bind(c.size_bytes)
                .push_bind(c.unused);
            push_envelope(&mut b, &c.meta);
        });
        qb.push(upsert_clause(self.key_columns(), &["size_bytes", "unused"]));
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }

    async fn sweep(&self, conn: &mut SqliteConnection, as_of: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE chunks SET deleted_at = ? \
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
