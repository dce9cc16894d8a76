//! Generic reconciliation of observed records against persisted entities.
//!
//! One [`reconcile`] call handles one hierarchy level within one scope (a
//! host, a datastore, ...). The level-specific parts live behind
//! [`LevelAdapter`]; the engine itself never looks at entity fields beyond
//! the id and the metadata envelope.

pub mod archive;
pub mod chunk;
pub mod datastore;
pub mod group;
pub mod namespace;
pub mod snapshot;

pub use archive::{ArchiveAdapter, LinkStats, link_archive_chunks};
pub use chunk::ChunkAdapter;
pub use datastore::DatastoreAdapter;
pub use group::GroupAdapter;
pub use namespace::{NamespaceAdapter, wire_namespace_tree};
pub use snapshot::SnapshotAdapter;

use crate::error::{MetadataError, MetadataResult};
use crate::models::{Envelope, Reconcilable, normalize_timestamp};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::query_builder::Separated;
use sqlx::{Sqlite, SqliteConnection};
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use stockroom_core::Key;
use time::OffsetDateTime;

/// Level-specific behaviour plugged into [`reconcile`].
#[async_trait]
pub trait LevelAdapter: Send + Sync {
    type Entity: Reconcilable;
    type Record: Send + Sync;

    /// Level name used in logs and errors.
    fn level(&self) -> &'static str;

    /// Columns of the table's unique identity index. Upserts conflict on them.
    fn key_columns(&self) -> &'static [&'static str];

    /// Load every entity in scope, soft-deleted ones included.
    async fn load(&self, conn: &mut SqliteConnection) -> MetadataResult<Vec<Self::Entity>>;

    fn entity_key(&self, entity: &Self::Entity) -> MetadataResult<Key>;

    fn record_key(&self, record: &Self::Record) -> MetadataResult<Key>;

    /// Build a not-yet-inserted entity. Parent references are resolved here.
    fn create(&self, record: &Self::Record, as_of: OffsetDateTime)
    -> MetadataResult<Self::Entity>;

    /// Copy explicit record values onto `entity`. Returns whether any stored
    /// value changed; absent record values never clear stored ones.
    fn apply(&self, entity: &mut Self::Entity, record: &Self::Record) -> bool;

    /// Stamp the envelope for an observation. Returns whether the entity was revived.
    fn mark(&self, entity: &mut Self::Entity, as_of: OffsetDateTime, changed: bool) -> bool {
        entity.meta_mut().stamp(as_of, changed)
    }

    /// Insert entities, returning their ids in input order.
    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&Self::Entity],
    ) -> MetadataResult<Vec<i64>>;

    /// Write back entities that already have ids.
    async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        entities: &[&Self::Entity],
    ) -> MetadataResult<()>;

    /// Soft-delete everything in scope not touched since `as_of`.
    async fn sweep(&self, conn: &mut SqliteConnection, as_of: OffsetDateTime)
    -> MetadataResult<u64>;

    /// Key of the entity this one points at through its own table, if any.
    fn self_reference(&self, _entity: &Self::Entity) -> Option<Key> {
        None
    }

    /// Store the resolved self-reference id. Returns whether it changed.
    fn set_self_reference(&self, _entity: &mut Self::Entity, _id: i64) -> bool {
        false
    }

    /// Whether an entity belongs in the returned mapping.
    fn retain(&self, _entity: &Self::Entity) -> bool {
        true
    }
}

/// Tuning for one reconciliation call.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Rows per multi-row statement.
    pub batch_size: usize,
    /// Drop soft-deleted entities from the returned mapping.
    pub only_existing: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            only_existing: false,
        }
    }
}

/// Per-level outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub updated: usize,
    pub revived: usize,
    pub unchanged: usize,
    pub swept: u64,
}

impl ReconcileStats {
    pub fn merge(&mut self, other: ReconcileStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.revived += other.revived;
        self.unchanged += other.unchanged;
        self.swept += other.swept;
    }
}

/// Result of one reconciliation call.
#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    pub entities: HashMap<Key, T>,
    pub stats: ReconcileStats,
}

impl<T: Reconcilable> Reconciled<T> {
    /// Entities that are not soft-deleted.
    pub fn existing(&self) -> impl Iterator<Item = (&Key, &T)> {
        self.entities.iter().filter(|(_, e)| !e.meta().is_deleted())
    }
}

/// Two-way key/id lookup over a reconciled mapping.
#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    pub by_key: HashMap<Key, i64>,
    pub by_id: HashMap<i64, Key>,
}

impl KeyIndex {
    pub fn new<T: Reconcilable>(level: &'static str, entities: &HashMap<Key, T>) -> MetadataResult<Self> {
        let mut index = Self::default();
        for (key, entity) in entities {
            let id = entity.id().ok_or_else(|| {
                MetadataError::Internal(format!("{level} entity {key} has no id after reconcile"))
            })?;
            index.by_key.insert(key.clone(), id);
            index.by_id.insert(id, key.clone());
        }
        Ok(index)
    }
}

/// How an entity was first seen during the current call.
enum Seen {
    Created,
    Existing { revived: bool, bumped: bool },
}

/// Reconcile observed `records` for one level and scope as of `as_of`.
///
/// Runs load, merge, batched insert, self-reference wiring, batched upsert
/// and sweep in that order on `conn`. The caller owns the transaction.
pub async fn reconcile<A, I>(
    conn: &mut SqliteConnection,
    records: I,
    as_of: OffsetDateTime,
    adapter: &A,
    options: &ReconcileOptions,
) -> MetadataResult<Reconciled<A::Entity>>
where
    A: LevelAdapter,
    I: IntoIterator,
    I::Item: Borrow<A::Record>,
{
    let level = adapter.level();
    let as_of = normalize_timestamp(as_of);
    let batch_size = options.batch_size.max(1);

    // 1. Load
    let mut entities: HashMap<Key, A::Entity> = HashMap::new();
    for entity in adapter.load(conn).await? {
        let key = adapter.entity_key(&entity)?;
        match entities.get(&key) {
            Some(current) if !current.meta().is_deleted() => {
                if !entity.meta().is_deleted() {
                    tracing::warn!(level, key = %key, "duplicate live rows for key");
                }
            }
            _ => {
                entities.insert(key, entity);
            }
        }
    }
    let loaded = entities.len();

    // 2. Merge
    let mut seen: HashMap<Key, Seen> = HashMap::new();
    let mut inserts: Vec<Key> = Vec::new();
    let mut updates: Vec<Key> = Vec::new();
    let mut queued: HashSet<Key> = HashSet::new();

    for record in records {
        let record = record.borrow();
        let key = adapter.record_key(record)?;
        match entities.get_mut(&key) {
            Some(entity) => {
                // A stale observation only touches; stored values stay.
                let changed = !entity.meta().is_newer_than(as_of) && adapter.apply(entity, record);
                match seen.get_mut(&key) {
                    Some(Seen::Created) => {}
                    Some(Seen::Existing { bumped, .. }) => {
                        adapter.mark(entity, as_of, changed && !*bumped);
                        *bumped |= changed;
                    }
                    None => {
                        let revived = adapter.mark(entity, as_of, changed);
                        tracing::trace!(level, key = %key, changed, revived, "observed existing");
                        seen.insert(
                            key.clone(),
                            Seen::Existing {
                                revived,
                                bumped: changed || revived,
                            },
                        );
                        if queued.insert(key.clone()) {
                            updates.push(key);
                        }
                    }
                }
            }
            None => {
                let entity = adapter.create(record, as_of)?;
                tracing::trace!(level, key = %key, "observed new");
                entities.insert(key.clone(), entity);
                seen.insert(key.clone(), Seen::Created);
                inserts.push(key);
            }
        }
    }

    // 3. Batched insert
    for batch in inserts.chunks(batch_size) {
        let rows: Vec<&A::Entity> = batch.iter().filter_map(|k| entities.get(k)).collect();
        let ids = adapter.insert(conn, &rows).await?;
        if ids.len() != batch.len() {
            return Err(MetadataError::Consistency {
                level,
                expected: batch.len(),
                actual: ids.len(),
            });
        }
        for (key, id) in batch.iter().zip(ids) {
            if let Some(entity) = entities.get_mut(key) {
                entity.set_id(id);
            }
        }
    }

    // 4. Self-reference wiring for new entities
    let mut wiring = Vec::new();
    for key in &inserts {
        let Some(entity) = entities.get(key) else {
            continue;
        };
        let target = adapter
            .self_reference(entity)
            .and_then(|target| entities.get(&target))
            .and_then(|target| target.id());
        if let Some(id) = target {
            wiring.push((key.clone(), id));
        }
    }
    for (key, id) in wiring {
        let Some(entity) = entities.get_mut(&key) else {
            continue;
        };
        if adapter.set_self_reference(entity, id) && queued.insert(key.clone()) {
            updates.push(key);
        }
    }

    // 5. Batched upsert
    for batch in updates.chunks(batch_size) {
        let rows: Vec<&A::Entity> = batch.iter().filter_map(|k| entities.get(k)).collect();
        adapter.upsert(conn, &rows).await?;
    }

    // 6. Sweep
    let swept = adapter.sweep(conn, as_of).await?;
    for entity in entities.values_mut() {
        let meta = entity.meta_mut();
        if meta.deleted_at.is_none() && meta.updated_at < as_of {
            meta.deleted_at = Some(as_of);
        }
    }

    let mut stats = ReconcileStats {
        swept,
        ..ReconcileStats::default()
    };
    for state in seen.values() {
        match state {
            Seen::Created => stats.inserted += 1,
            Seen::Existing { revived: true, .. } => stats.revived += 1,
            Seen::Existing { bumped: true, .. } => stats.updated += 1,
            Seen::Existing { .. } => stats.unchanged += 1,
        }
    }
    tracing::info!(
        level,
        loaded,
        inserted = stats.inserted,
        updated = stats.updated,
        revived = stats.revived,
        unchanged = stats.unchanged,
        swept = stats.swept,
        "reconciled level"
    );

    // 7. Filter
    entities.retain(|_, e| {
        (!options.only_existing || !e.meta().is_deleted()) && adapter.retain(e)
    });

    Ok(Reconciled { entities, stats })
}

/// Bind the four envelope columns in schema order.
pub(crate) fn push_envelope(b: &mut Separated<'_, '_, Sqlite, &'static str>, meta: &Envelope) {
    b.push_bind(meta.created_at)
        .push_bind(meta.updated_at)
        .push_bind(meta.deleted_at)
        .push_bind(meta.version);
}

/// Column list shared by every reconciled table.
pub(crate) const ENVELOPE_COLUMNS: &str = "created_at, updated_at, deleted_at, version";

/// `ON CONFLICT` clause on the identity `keys`, updating `columns` plus the envelope.
pub(crate) fn upsert_clause(keys: &[&str], columns: &[&str]) -> String {
    let sets: Vec<String> = columns
        .iter()
        .copied()
        .chain(["updated_at", "deleted_at", "version"])
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    format!(
        " ON CONFLICT({}) DO UPDATE SET {}",
        keys.join(", "),
        sets.join(", ")
    )
}

/// Missing parent reference for `key` at `level`.
pub(crate) fn unresolved(level: &'static str, key: &Key, what: &str) -> MetadataError {
    MetadataError::referential(level, key, format!("{what} was not reconciled in this scan"))
}
