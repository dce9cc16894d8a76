//! Namespace level and the parent wiring pass for the namespace tree.

use super::{ENVELOPE_COLUMNS, LevelAdapter, push_envelope, upsert_clause};
use crate::error::{MetadataError, MetadataResult};
use crate::models::{Envelope, NamespaceRow, Reconcilable};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;
use stockroom_core::key::namespace_key;
use stockroom_core::{Key, NamespaceRecord};
use time::OffsetDateTime;

/// Parent path of a slash-joined namespace path, `None` at the tree root.
fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

pub struct NamespaceAdapter {
    datastore_id: i64,
}

impl NamespaceAdapter {
    pub fn new(datastore_id: i64) -> Self {
        Self { datastore_id }
    }
}

#[async_trait]
impl LevelAdapter for NamespaceAdapter {
    type Entity = NamespaceRow;
    type Record = NamespaceRecord;

    fn level(&self) -> &'static str {
        "namespace"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["datastore_id", "path"]
    }

    async fn load(&self, conn: &mut SqliteConnection) -> MetadataResult<Vec<NamespaceRow>> {
        let rows =
            sqlx::query_as::<_, NamespaceRow>("SELECT * FROM namespaces WHERE datastore_id = ?")
                .bind(self.datastore_id)
                .fetch_all(&mut *conn)
                .await?;
        Ok(rows)
    }

    fn entity_key(&self, entity: &NamespaceRow) -> MetadataResult<Key> {
        Ok(namespace_key(entity.datastore_id, &entity.path))
    }

    fn record_key(&self, record: &NamespaceRecord) -> MetadataResult<Key> {
        Ok(namespace_key(self.datastore_id, &record.path))
    }

    fn create(&self, record: &NamespaceRecord, as_of: OffsetDateTime) -> MetadataResult<NamespaceRow> {
        let name = record.path.rsplit('/').next().unwrap_or(&record.path);
        Ok(NamespaceRow {
            id: None,
            datastore_id: self.datastore_id,
            parent_id: None,
            name: name.to_string(),
            path: record.path.clone(),
            meta: Envelope::new(as_of),
        })
    }

    fn apply(&self, _entity: &mut NamespaceRow, _record: &NamespaceRecord) -> bool {
        // The path is the identity and the name derives from it.
        false
    }

    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&NamespaceRow],
    ) -> MetadataResult<Vec<i64>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO namespaces (datastore_id, parent_id, name, path, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, ns| {
            b.push_bind(ns.datastore_id)
                .push_bind(ns.parent_id)
                .push_bind(ns.name.clone())
                .push_bind(ns.path.clone());
            push_envelope(&mut b, &ns.meta);
        });
        qb.push(" RETURNING id");
        let ids = qb.build_query_scalar::<i64>().fetch_all(&mut *conn).await?;
        Ok(ids)
    }

    async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&NamespaceRow],
    ) -> MetadataResult<()> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO namespaces (datastore_id, parent_id, name, path, {ENVELOPE_COLUMNS}) "
        ));
        qb.push_values(entities, |mut b, ns| {
            b.push_bind(ns.datastore_id)
                .push_bind(ns.parent_id)
                .push_bind(ns.name.clone())
                .push_bind(ns.path.clone());
            push_envelope(&mut b, &ns.meta);
        });
        qb.push(upsert_clause(self.key_columns(), &["parent_id", "name"]));
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }

    async fn sweep(&self, conn: &mut SqliteConnection, as_of: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE namespaces SET deleted_at = ? \
             WHERE datastore_id = ? AND updated_at < ? AND deleted_at IS NULL",
        )
        .bind(as_of)
        .bind(self.datastore_id)
        .bind(as_of)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    fn self_reference(&self, entity: &NamespaceRow) -> Option<Key> {
        parent_path(&entity.path).map(|parent| namespace_key(entity.datastore_id, parent))
    }

    fn set_self_reference(&self, entity: &mut NamespaceRow, id: i64) -> bool {
        if entity.parent_id == Some(id) {
            return false;
        }
        entity.parent_id = Some(id);
        true
    }
}

/// Assign every namespace its parent id from its path.
///
/// Namespaces are visited by ascending path length and a parent must have
/// been visited before its children, so the set has to be prefix-closed.
/// Returns the keys whose `parent_id` changed.
pub fn wire_namespace_tree(namespaces: &mut HashMap<Key, NamespaceRow>) -> MetadataResult<Vec<Key>> {
    let mut order: Vec<(Key, usize, String)> = namespaces
        .iter()
        .map(|(key, ns)| (key.clone(), ns.path.len(), ns.path.clone()))
        .collect();
    order.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.cmp(&b.2)));

    let mut assigned: HashMap<String, i64> = HashMap::with_capacity(order.len());
    let mut changed = Vec::new();
    for (key, _, path) in order {
        let Some(ns) = namespaces.get_mut(&key) else {
            continue;
        };
        let id = ns.id().ok_or_else(|| {
            MetadataError::Internal(format!("namespace '{path}' has no id during tree wiring"))
        })?;
        let parent_id = match parent_path(&path) {
            None => None,
            Some(parent) => Some(*assigned.get(parent).ok_or_else(|| {
                MetadataError::TreeInconsistency {
                    path: path.clone(),
                    parent: parent.to_string(),
                }
            })?),
        };
        if ns.parent_id != parent_id {
            tracing::debug!(path = %path, ?parent_id, "rewired namespace parent");
            ns.parent_id = parent_id;
            changed.push(key);
        }
        assigned.insert(path, id);
    }
    Ok(changed)
}
