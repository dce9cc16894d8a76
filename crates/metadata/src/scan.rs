//! Scan orchestration across all hierarchy levels.
//!
//! Levels run strictly parent before child, each one resolving its foreign
//! keys through the previous level's reconciled mapping:
//! datastore, then per datastore namespace (plus tree wiring), group,
//! snapshot, file and image archives, chunks and archive-chunk links.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{DatastoreRow, normalize_timestamp};
use crate::reconcile::{
    ArchiveAdapter, ChunkAdapter, DatastoreAdapter, GroupAdapter, KeyIndex, LevelAdapter,
    NamespaceAdapter, ReconcileOptions, ReconcileStats, SnapshotAdapter, link_archive_chunks,
    reconcile, wire_namespace_tree,
};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use stockroom_core::key::datastore_key;
use stockroom_core::{
    ArchiveKind, ArchiveRecord, ChunkRecord, GroupRecord, Inventory, Key, MountpointScoped,
    NamespaceRecord, SnapshotRecord,
};
use time::OffsetDateTime;
use tracing::Instrument;

/// Summary of one scan, summed over datastores.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub host: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
    pub datastores: ReconcileStats,
    pub namespaces: ReconcileStats,
    pub groups: ReconcileStats,
    pub snapshots: ReconcileStats,
    pub file_archives: ReconcileStats,
    pub image_archives: ReconcileStats,
    pub chunks: ReconcileStats,
    /// Namespaces whose parent pointer the tree pass changed.
    pub rewired_namespaces: usize,
    pub linked_archives: usize,
    pub archive_chunk_links: usize,
    pub missing_chunks: usize,
}

/// Raw records of one datastore.
#[derive(Debug)]
struct Partition<'a> {
    namespaces: Vec<&'a NamespaceRecord>,
    groups: Vec<&'a GroupRecord>,
    snapshots: Vec<&'a SnapshotRecord>,
    archives: Vec<&'a ArchiveRecord>,
    chunks: Vec<&'a ChunkRecord>,
}

/// Split records by datastore mountpoint, in `mountpoints` order.
///
/// With a single datastore in scope every record belongs to it regardless
/// of the mountpoint it declares.
fn split_by_datastore<'a, R: MountpointScoped>(
    level: &'static str,
    records: &'a [R],
    mountpoints: &[&str],
) -> MetadataResult<Vec<Vec<&'a R>>> {
    let mut parts: Vec<Vec<&'a R>> = vec![Vec::new(); mountpoints.len()];
    if mountpoints.len() == 1 {
        parts[0].extend(records.iter());
        return Ok(parts);
    }
    let slots: HashMap<&str, usize> = mountpoints
        .iter()
        .enumerate()
        .map(|(i, mp)| (*mp, i))
        .collect();
    for record in records {
        let slot = slots.get(record.mountpoint()).ok_or_else(|| {
            MetadataError::referential(
                level,
                record.mountpoint(),
                "no datastore in scope has this mountpoint",
            )
        })?;
        parts[*slot].push(record);
    }
    Ok(parts)
}

fn partition(inventory: &Inventory) -> MetadataResult<Vec<Partition<'_>>> {
    let mountpoints: Vec<&str> = inventory
        .datastores
        .iter()
        .map(|ds| ds.mountpoint.as_str())
        .collect();
    let namespaces = split_by_datastore("namespace", &inventory.namespaces, &mountpoints)?;
    let groups = split_by_datastore("group", &inventory.groups, &mountpoints)?;
    let snapshots = split_by_datastore("snapshot", &inventory.snapshots, &mountpoints)?;
    let archives = split_by_datastore("archive", &inventory.archives, &mountpoints)?;
    let chunks = split_by_datastore("chunk", &inventory.chunks, &mountpoints)?;

    Ok(namespaces
        .into_iter()
        .zip(groups)
        .zip(snapshots)
        .zip(archives)
        .zip(chunks)
        .map(
            |((((namespaces, groups), snapshots), archives), chunks)| Partition {
                namespaces,
                groups,
                snapshots,
                archives,
                chunks,
            },
        )
        .collect())
}

/// Reconcile a whole inventory for `host_id` as of `as_of`.
///
/// Everything runs on `conn`; the caller wraps the call in one transaction
/// so a failure at any level leaves the stored graph untouched.
pub async fn run_scan(
    conn: &mut SqliteConnection,
    host_id: i64,
    inventory: &Inventory,
    as_of: OffsetDateTime,
    options: &ReconcileOptions,
) -> MetadataResult<ScanReport> {
    let as_of = normalize_timestamp(as_of);
    // Child levels resolve keys of deleted parents too.
    let options = ReconcileOptions {
        only_existing: false,
        ..options.clone()
    };
    let parts = partition(inventory)?;

    let mut report = ScanReport {
        as_of: Some(as_of),
        ..ScanReport::default()
    };

    let datastores = reconcile(
        conn,
        &inventory.datastores,
        as_of,
        &DatastoreAdapter::new(host_id),
        &options,
    )
    .await?;
    report.datastores = datastores.stats;

    for (record, part) in inventory.datastores.iter().zip(parts) {
        let key = datastore_key(host_id, &record.mountpoint);
        let datastore = datastores.entities.get(&key).ok_or_else(|| {
            MetadataError::Internal(format!("datastore {key} missing after reconcile"))
        })?;
        scan_datastore(conn, datastore, part, as_of, &options, &mut report)
            .instrument(tracing::info_span!(
                "datastore",
                mountpoint = %record.mountpoint
            ))
            .await?;
    }

    tracing::info!(
        host_id,
        datastores = inventory.datastores.len(),
        linked_archives = report.linked_archives,
        missing_chunks = report.missing_chunks,
        "scan reconciled"
    );
    Ok(report)
}

async fn scan_datastore(
    conn: &mut SqliteConnection,
    datastore: &DatastoreRow,
    part: Partition<'_>,
    as_of: OffsetDateTime,
    options: &ReconcileOptions,
    report: &mut ScanReport,
) -> MetadataResult<()> {
    let datastore_id = datastore.id.ok_or_else(|| {
        MetadataError::Internal(format!("datastore {} has no id", datastore.mountpoint))
    })?;
    let mountpoint = datastore.mountpoint.as_str();

    // Namespaces and their tree
    let namespace_adapter = NamespaceAdapter::new(datastore_id);
    let mut namespaces = reconcile(conn, part.namespaces, as_of, &namespace_adapter, options).await?;
    report.namespaces.merge(namespaces.stats);
    let rewired = wire_namespace_tree(&mut namespaces.entities)?;
    for batch in rewired.chunks(options.batch_size.max(1)) {
        let rows: Vec<_> = batch
            .iter()
            .filter_map(|key| namespaces.entities.get(key))
            .collect();
        namespace_adapter.upsert(conn, &rows).await?;
    }
    report.rewired_namespaces += rewired.len();

    // Groups
    let group_adapter = GroupAdapter::new(datastore, namespaces.entities.values())?;
    let groups = reconcile(conn, part.groups, as_of, &group_adapter, options).await?;
    report.groups.merge(groups.stats);

    // Snapshots
    let snapshot_adapter =
        SnapshotAdapter::new(datastore_id, mountpoint, KeyIndex::new("group", &groups.entities)?);
    let snapshots = reconcile(conn, part.snapshots, as_of, &snapshot_adapter, options).await?;
    report.snapshots.merge(snapshots.stats);
    let snapshot_index = KeyIndex::new("snapshot", &snapshots.entities)?;

    // Archives, one pass per kind
    let mut archive_ids: HashMap<Key, i64> = HashMap::new();
    for kind in [ArchiveKind::File, ArchiveKind::Image] {
        let adapter = ArchiveAdapter::new(kind, datastore_id, mountpoint, snapshot_index.clone());
        let records: Vec<&ArchiveRecord> = part
            .archives
            .iter()
            .copied()
            .filter(|a| a.kind == kind)
            .collect();
        let archives = reconcile(conn, records, as_of, &adapter, options).await?;
        match kind {
            ArchiveKind::File => report.file_archives.merge(archives.stats),
            ArchiveKind::Image => report.image_archives.merge(archives.stats),
        }
        archive_ids.extend(KeyIndex::new(adapter.level(), &archives.entities)?.by_key);
    }

    // Chunks and links
    let chunks = reconcile(
        conn,
        part.chunks,
        as_of,
        &ChunkAdapter::new(datastore_id),
        options,
    )
    .await?;
    report.chunks.merge(chunks.stats);

    let links = link_archive_chunks(
        conn,
        datastore_id,
        mountpoint,
        part.archives.clone(),
        &archive_ids,
        &chunks.entities,
        options.batch_size,
    )
    .await?;
    report.linked_archives += links.linked_archives;
    report.archive_chunk_links += links.links;
    report.missing_chunks += links.missing_chunks;
    Ok(())
}
