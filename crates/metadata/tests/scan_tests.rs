//! End-to-end scans through the inventory store.

mod common;

use common::*;
use std::collections::HashMap;
use stockroom_core::{BackupType, GroupRecord, Inventory, NamespaceRecord};
use stockroom_metadata::models::*;
use stockroom_metadata::{
    InventoryStore, MetadataError, MetadataResult, ReconcileOptions, ScanReport,
};
use time::OffsetDateTime;

const DS1: &str = "/mnt/ds1";
const DS2: &str = "/mnt/ds2";
const IMG: &str = "/mnt/ds1/vm/100/2024-01-01T00:00:00Z/drive-scsi0.img.fidx";
const PXAR: &str = "/mnt/ds1/ct/7/2024-01-02T00:00:00Z/root.pxar.didx";

async fn scan(
    metadata: &TestMetadata,
    inventory: &Inventory,
    at: OffsetDateTime,
) -> MetadataResult<ScanReport> {
    metadata
        .store
        .apply_scan("pbs1", inventory, at, &ReconcileOptions::default())
        .await
}

async fn datastores(metadata: &TestMetadata) -> Vec<DatastoreRow> {
    let store = metadata.store();
    let host = store.get_host("pbs1").await.unwrap().expect("host exists");
    store.list_datastores(host.id, true).await.unwrap()
}

async fn datastore_id(metadata: &TestMetadata, mountpoint: &str) -> i64 {
    datastores(metadata)
        .await
        .into_iter()
        .find(|ds| ds.mountpoint == mountpoint)
        .and_then(|ds| ds.id)
        .expect("datastore exists")
}

async fn group(metadata: &TestMetadata, datastore_id: i64, backup_id: &str) -> GroupRow {
    metadata
        .store
        .list_groups(datastore_id, true)
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.backup_id == backup_id)
        .expect("group exists")
}

async fn chunk(metadata: &TestMetadata, datastore_id: i64, seed: u64) -> ChunkRow {
    metadata
        .store
        .get_chunk(datastore_id, &chunk_digest(seed).to_hex())
        .await
        .unwrap()
        .expect("chunk exists")
}

fn single(indexes: &[IndexFile<'_>], chunks: &[u64]) -> Inventory {
    let digests: Vec<_> = chunks.iter().map(|s| chunk_digest(*s)).collect();
    inventory(
        vec![datastore("main", DS1)],
        &[chunk_listing(DS1, &digests)],
        indexes,
    )
}

#[tokio::test]
async fn test_end_to_end_scan_builds_graph() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let (a, b, c) = (chunk_digest(1), chunk_digest(2), chunk_digest(3));
    let inv = single(
        &[
            IndexFile::decoded(IMG, fixed_index(9, &[a, a, b])),
            IndexFile::decoded(PXAR, dynamic_index(8, &[c])),
        ],
        &[1, 2, 3, 4],
    );

    let report = scan(&metadata, &inv, day(2)).await.unwrap();
    assert_eq!(report.host, "pbs1");
    assert_eq!(report.datastores.inserted, 1);
    assert_eq!(report.groups.inserted, 2);
    assert_eq!(report.snapshots.inserted, 2);
    assert_eq!(report.image_archives.inserted, 1);
    assert_eq!(report.file_archives.inserted, 1);
    assert_eq!(report.chunks.inserted, 4);
    assert_eq!(report.linked_archives, 2);
    assert_eq!(report.archive_chunk_links, 3);
    assert_eq!(report.missing_chunks, 0);

    let ds = datastore_id(&metadata, DS1).await;
    let vm = group(&metadata, ds, "100").await;
    assert_eq!(vm.backup_type, "vm");
    assert_eq!(vm.namespace_id, None);

    let snapshots = metadata.store.list_snapshots(vm.id.unwrap(), false).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].backup_time, day(1));

    let archives = metadata
        .store
        .list_archives(snapshots[0].id.unwrap(), false)
        .await
        .unwrap();
    assert_eq!(archives.len(), 1);
    let image = &archives[0];
    assert_eq!(image.kind, "image");
    assert_eq!(image.name, "drive-scsi0.img");
    assert_eq!(image.total_size, Some(3 * 4096));
    assert_eq!(image.chunk_size, Some(4096));
    assert_eq!(
        image.uuid.as_deref(),
        Some("09090909-0909-0909-0909-090909090909")
    );
    assert_eq!(image.checksum.as_deref(), Some("09".repeat(32).as_str()));
    assert_eq!(image.index_created_at, Some(day(1)));

    let links: HashMap<i64, i64> = metadata
        .store
        .list_archive_chunks(image.id.unwrap())
        .await
        .unwrap()
        .into_iter()
        .map(|l| (l.chunk_id, l.refcount))
        .collect();
    let chunk_a = chunk(&metadata, ds, 1).await;
    let chunk_b = chunk(&metadata, ds, 2).await;
    assert_eq!(links.len(), 2);
    assert_eq!(links[&chunk_a.id.unwrap()], 2);
    assert_eq!(links[&chunk_b.id.unwrap()], 1);

    assert!(!chunk_a.unused);
    assert_eq!(chunk_a.size_bytes, Some(4096));
    assert!(!chunk(&metadata, ds, 3).await.unused);
    assert!(chunk(&metadata, ds, 4).await.unused);

    let ct = group(&metadata, ds, "7").await;
    let snapshot = metadata.store.list_snapshots(ct.id.unwrap(), false).await.unwrap().remove(0);
    let file = metadata.store.list_archives(snapshot.id.unwrap(), false).await.unwrap().remove(0);
    assert_eq!(file.kind, "file");
    assert_eq!(file.name, "root.pxar");
    assert_eq!(file.total_size, None);
}

#[tokio::test]
async fn test_rescan_is_idempotent() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let inv = single(
        &[IndexFile::decoded(IMG, fixed_index(9, &[chunk_digest(1)]))],
        &[1, 2],
    );
    scan(&metadata, &inv, day(2)).await.unwrap();
    let report = scan(&metadata, &inv, day(3)).await.unwrap();

    assert_eq!(report.groups.inserted, 0);
    assert_eq!(report.groups.unchanged, 1);
    assert_eq!(report.image_archives.unchanged, 1);
    assert_eq!(report.chunks.unchanged, 2);
    assert_eq!(report.chunks.swept, 0);

    let ds = datastore_id(&metadata, DS1).await;
    let vm = group(&metadata, ds, "100").await;
    assert_eq!(vm.meta.version, 1);
    assert_eq!(vm.meta.created_at, day(2));
    assert_eq!(vm.meta.updated_at, day(3));
    for seed in [1, 2] {
        let row = chunk(&metadata, ds, seed).await;
        assert_eq!(row.meta.version, 1);
        assert_eq!(row.meta.updated_at, day(3));
        assert!(row.meta.deleted_at.is_none());
    }
}

#[tokio::test]
async fn test_disjoint_rescan_sweeps_unobserved() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let first = single(
        &[
            IndexFile::path_only("/mnt/ds1/vm/100/2024-01-01T00:00:00Z/a.img.fidx"),
            IndexFile::path_only("/mnt/ds1/vm/101/2024-01-01T00:00:00Z/a.img.fidx"),
        ],
        &[],
    );
    let second = single(
        &[
            IndexFile::path_only("/mnt/ds1/vm/101/2024-01-01T00:00:00Z/a.img.fidx"),
            IndexFile::path_only("/mnt/ds1/vm/102/2024-01-01T00:00:00Z/a.img.fidx"),
        ],
        &[],
    );
    scan(&metadata, &first, day(2)).await.unwrap();
    let report = scan(&metadata, &second, day(3)).await.unwrap();
    assert_eq!(report.groups.swept, 1);
    assert_eq!(report.snapshots.swept, 1);
    assert_eq!(report.image_archives.swept, 1);

    let ds = datastore_id(&metadata, DS1).await;
    let gone = group(&metadata, ds, "100").await;
    assert_eq!(gone.meta.deleted_at, Some(day(3)));
    let snapshot = metadata.store.list_snapshots(gone.id.unwrap(), true).await.unwrap().remove(0);
    assert_eq!(snapshot.meta.deleted_at, Some(day(3)));

    let kept = group(&metadata, ds, "101").await;
    assert!(kept.meta.deleted_at.is_none());
    assert_eq!(kept.meta.updated_at, day(3));

    let new = group(&metadata, ds, "102").await;
    assert_eq!(new.meta.created_at, day(3));
    assert_eq!(metadata.store.list_groups(ds, false).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_reappearance_revives_with_one_version_bump() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let full = single(
        &[IndexFile::decoded(IMG, fixed_index(9, &[chunk_digest(1)]))],
        &[1],
    );
    let empty = single(&[], &[]);

    scan(&metadata, &full, day(2)).await.unwrap();
    scan(&metadata, &empty, day(3)).await.unwrap();

    let ds = datastore_id(&metadata, DS1).await;
    let swept = group(&metadata, ds, "100").await;
    assert_eq!(swept.meta.deleted_at, Some(day(3)));
    assert_eq!(chunk(&metadata, ds, 1).await.meta.deleted_at, Some(day(3)));

    let report = scan(&metadata, &full, day(4)).await.unwrap();
    assert_eq!(report.groups.revived, 1);
    assert_eq!(report.snapshots.revived, 1);
    assert_eq!(report.image_archives.revived, 1);
    assert_eq!(report.chunks.revived, 1);

    let vm = group(&metadata, ds, "100").await;
    assert!(vm.meta.deleted_at.is_none());
    assert_eq!(vm.meta.version, 2);
    assert_eq!(vm.meta.updated_at, day(4));
    // The root group was revived in place through its identity.
    assert_eq!(vm.id, swept.id);
    assert_eq!(metadata.store.list_groups(ds, true).await.unwrap().len(), 1);
    let revived = chunk(&metadata, ds, 1).await;
    assert!(revived.meta.deleted_at.is_none());
    assert_eq!(revived.meta.version, 2);

    // The datastore itself was observed every time.
    assert_eq!(datastores(&metadata).await[0].meta.version, 1);
}

#[tokio::test]
async fn test_namespace_tree_is_wired() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let inv = single(
        &[
            IndexFile::path_only("/mnt/ds1/ns/a/ns/b/ns/c/vm/100/2024-01-01T00:00:00Z/x.img.fidx"),
            IndexFile::path_only("/mnt/ds1/ns/a/ct/5/2024-01-01T00:00:00Z/root.pxar.didx"),
        ],
        &[],
    );
    let report = scan(&metadata, &inv, day(2)).await.unwrap();
    assert_eq!(report.namespaces.inserted, 3);

    let ds = datastore_id(&metadata, DS1).await;
    let namespaces = metadata.store.list_namespaces(ds, false).await.unwrap();
    let by_path: HashMap<&str, &NamespaceRow> =
        namespaces.iter().map(|ns| (ns.path.as_str(), ns)).collect();
    assert_eq!(by_path.len(), 3);
    assert_eq!(by_path["a"].parent_id, None);
    assert_eq!(by_path["a/b"].parent_id, by_path["a"].id);
    assert_eq!(by_path["a/b/c"].parent_id, by_path["a/b"].id);
    assert_eq!(by_path["a/b/c"].name, "c");

    assert_eq!(group(&metadata, ds, "100").await.namespace_id, by_path["a/b/c"].id);
    assert_eq!(group(&metadata, ds, "5").await.namespace_id, by_path["a"].id);

    let again = scan(&metadata, &inv, day(3)).await.unwrap();
    assert_eq!(again.namespaces.unchanged, 3);
    assert_eq!(again.rewired_namespaces, 0);
}

#[tokio::test]
async fn test_same_identity_in_two_namespaces() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let inv = single(
        &[
            IndexFile::path_only("/mnt/ds1/vm/100/2024-01-01T00:00:00Z/x.img.fidx"),
            IndexFile::path_only("/mnt/ds1/ns/prod/vm/100/2024-01-01T00:00:00Z/x.img.fidx"),
        ],
        &[],
    );
    let report = scan(&metadata, &inv, day(2)).await.unwrap();
    assert_eq!(report.groups.inserted, 2);

    let again = scan(&metadata, &inv, day(3)).await.unwrap();
    assert_eq!(again.groups.unchanged, 2);
    assert_eq!(again.groups.inserted, 0);
}

#[tokio::test]
async fn test_records_partitioned_across_datastores() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let a = chunk_digest(1);
    let inv = inventory(
        vec![datastore("main", DS1), datastore("aux", DS2)],
        &[chunk_listing(DS1, &[a]), chunk_listing(DS2, &[a])],
        &[
            IndexFile::decoded(IMG, fixed_index(1, &[a])),
            IndexFile::decoded(
                "/mnt/ds2/vm/100/2024-01-01T00:00:00Z/drive-scsi0.img.fidx",
                fixed_index(2, &[a]),
            ),
        ],
    );
    let report = scan(&metadata, &inv, day(2)).await.unwrap();
    assert_eq!(report.datastores.inserted, 2);
    assert_eq!(report.groups.inserted, 2);
    assert_eq!(report.chunks.inserted, 2);
    assert_eq!(report.linked_archives, 2);

    let ds1 = datastore_id(&metadata, DS1).await;
    let ds2 = datastore_id(&metadata, DS2).await;
    assert_eq!(metadata.store.list_groups(ds1, false).await.unwrap().len(), 1);
    assert_eq!(metadata.store.list_groups(ds2, false).await.unwrap().len(), 1);
    assert_ne!(chunk(&metadata, ds1, 1).await.id, chunk(&metadata, ds2, 1).await.id);

    // Dropping one datastore from the scan sweeps only the datastore row.
    let shrunk = inventory(vec![datastore("main", DS1)], &[chunk_listing(DS1, &[a])], &[
        IndexFile::decoded(IMG, fixed_index(1, &[a])),
    ]);
    let report = scan(&metadata, &shrunk, day(3)).await.unwrap();
    assert_eq!(report.datastores.swept, 1);
    let aux = datastores(&metadata)
        .await
        .into_iter()
        .find(|ds| ds.mountpoint == DS2)
        .unwrap();
    assert_eq!(aux.meta.deleted_at, Some(day(3)));
    assert!(group(&metadata, ds2, "100").await.meta.deleted_at.is_none());
}

#[tokio::test]
async fn test_unknown_mountpoint_fails_without_writes() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let mut inv = inventory(vec![datastore("main", DS1), datastore("aux", DS2)], &[], &[]);
    inv.groups.push(GroupRecord {
        mountpoint: "/mnt/ds9".to_string(),
        namespace: None,
        backup_type: BackupType::Host,
        backup_id: "web".to_string(),
    });
    let err = scan(&metadata, &inv, day(2)).await.unwrap_err();
    assert!(matches!(err, MetadataError::Referential { level: "group", .. }));
    assert!(metadata.store.get_host("pbs1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_level_rolls_back_earlier_levels() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let first = single(
        &[IndexFile::path_only("/mnt/ds1/ns/a/vm/100/2024-01-01T00:00:00Z/x.img.fidx")],
        &[],
    );
    scan(&metadata, &first, day(2)).await.unwrap();

    // A group in a namespace nobody declared: namespaces are reconciled
    // (and "a" swept) before the group level fails.
    let mut broken = single(&[], &[]);
    broken.groups.push(GroupRecord {
        mountpoint: DS1.to_string(),
        namespace: Some("ghost".to_string()),
        backup_type: BackupType::Vm,
        backup_id: "100".to_string(),
    });
    let err = scan(&metadata, &broken, day(3)).await.unwrap_err();
    assert!(matches!(err, MetadataError::Referential { level: "group", .. }));
    assert!(err.to_string().contains("ghost"));

    let ds = datastore_id(&metadata, DS1).await;
    let namespaces = metadata.store.list_namespaces(ds, true).await.unwrap();
    assert_eq!(namespaces.len(), 1);
    assert!(namespaces[0].meta.deleted_at.is_none());
    assert_eq!(namespaces[0].meta.updated_at, day(2));
}

#[tokio::test]
async fn test_namespace_gap_is_tree_inconsistency() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let mut inv = single(&[], &[]);
    for path in ["a", "a/b/c"] {
        inv.namespaces.push(NamespaceRecord {
            mountpoint: DS1.to_string(),
            path: path.to_string(),
        });
    }
    let err = scan(&metadata, &inv, day(2)).await.unwrap_err();
    assert!(matches!(err, MetadataError::TreeInconsistency { .. }));
    assert!(metadata.store.get_host("pbs1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_chunks_are_counted_not_fatal() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let inv = single(
        &[IndexFile::decoded(
            IMG,
            fixed_index(9, &[chunk_digest(1), chunk_digest(2)]),
        )],
        &[1],
    );
    let report = scan(&metadata, &inv, day(2)).await.unwrap();
    assert_eq!(report.missing_chunks, 1);
    assert_eq!(report.archive_chunk_links, 1);
}

#[tokio::test]
async fn test_undecoded_index_keeps_unused_flags() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let decoded = single(
        &[IndexFile::decoded(IMG, fixed_index(9, &[chunk_digest(1)]))],
        &[1, 2],
    );
    scan(&metadata, &decoded, day(2)).await.unwrap();

    let ds = datastore_id(&metadata, DS1).await;
    assert!(chunk(&metadata, ds, 2).await.unused);

    let undecoded = single(&[IndexFile::path_only(IMG)], &[1, 2]);
    let report = scan(&metadata, &undecoded, day(3)).await.unwrap();
    assert_eq!(report.linked_archives, 0);

    let orphan = chunk(&metadata, ds, 2).await;
    assert!(orphan.unused);
    assert_eq!(orphan.meta.version, 1);
    assert_eq!(orphan.meta.updated_at, day(3));

    // Links from the decoded scan survive.
    let vm = group(&metadata, ds, "100").await;
    let snapshot = metadata.store.list_snapshots(vm.id.unwrap(), false).await.unwrap().remove(0);
    let archive = metadata.store.list_archives(snapshot.id.unwrap(), false).await.unwrap().remove(0);
    let links = metadata.store.list_archive_chunks(archive.id.unwrap()).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].chunk_id, chunk(&metadata, ds, 1).await.id.unwrap());
}

#[tokio::test]
async fn test_changed_index_replaces_links() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let (a, b, c) = (chunk_digest(1), chunk_digest(2), chunk_digest(3));
    let before = single(&[IndexFile::decoded(IMG, fixed_index(9, &[a, b]))], &[1, 2, 3]);
    let after = single(&[IndexFile::decoded(IMG, fixed_index(10, &[b, b, c]))], &[1, 2, 3]);
    scan(&metadata, &before, day(2)).await.unwrap();
    let report = scan(&metadata, &after, day(3)).await.unwrap();
    assert_eq!(report.image_archives.updated, 1);

    let ds = datastore_id(&metadata, DS1).await;
    let vm = group(&metadata, ds, "100").await;
    let snapshot = metadata.store.list_snapshots(vm.id.unwrap(), false).await.unwrap().remove(0);
    let archive = metadata.store.list_archives(snapshot.id.unwrap(), false).await.unwrap().remove(0);
    assert_eq!(archive.meta.version, 2);
    assert_eq!(archive.total_size, Some(3 * 4096));

    let links: HashMap<i64, i64> = metadata
        .store
        .list_archive_chunks(archive.id.unwrap())
        .await
        .unwrap()
        .into_iter()
        .map(|l| (l.chunk_id, l.refcount))
        .collect();
    assert_eq!(links.len(), 2);
    assert_eq!(links[&chunk(&metadata, ds, 2).await.id.unwrap()], 2);
    assert_eq!(links[&chunk(&metadata, ds, 3).await.id.unwrap()], 1);
    assert!(chunk(&metadata, ds, 1).await.unused);
}

#[tokio::test]
async fn test_older_scan_does_not_undo_newer() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let newer = single(
        &[IndexFile::path_only("/mnt/ds1/vm/100/2024-01-01T00:00:00Z/x.img.fidx")],
        &[],
    );
    let older = single(
        &[IndexFile::path_only("/mnt/ds1/vm/101/2024-01-01T00:00:00Z/x.img.fidx")],
        &[],
    );
    scan(&metadata, &newer, day(5)).await.unwrap();
    let report = scan(&metadata, &older, day(3)).await.unwrap();
    assert_eq!(report.groups.swept, 0);

    let ds = datastore_id(&metadata, DS1).await;
    let kept = group(&metadata, ds, "100").await;
    assert!(kept.meta.deleted_at.is_none());
    assert_eq!(kept.meta.updated_at, day(5));
    assert_eq!(datastores(&metadata).await[0].meta.updated_at, day(5));

    scan(&metadata, &older, day(6)).await.unwrap();
    assert_eq!(group(&metadata, ds, "100").await.meta.deleted_at, Some(day(6)));
}

#[tokio::test]
async fn test_older_scan_does_not_revive_newer_deletion() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let both = single(
        &[
            IndexFile::path_only("/mnt/ds1/vm/100/2024-01-01T00:00:00Z/x.img.fidx"),
            IndexFile::path_only("/mnt/ds1/vm/101/2024-01-01T00:00:00Z/x.img.fidx"),
        ],
        &[],
    );
    let only_first = single(
        &[IndexFile::path_only("/mnt/ds1/vm/100/2024-01-01T00:00:00Z/x.img.fidx")],
        &[],
    );
    scan(&metadata, &both, day(1)).await.unwrap();
    scan(&metadata, &only_first, day(5)).await.unwrap();

    let report = scan(&metadata, &both, day(3)).await.unwrap();
    assert_eq!(report.groups.revived, 0);
    assert_eq!(report.snapshots.revived, 0);

    let ds = datastore_id(&metadata, DS1).await;
    let removed = group(&metadata, ds, "101").await;
    assert_eq!(removed.meta.deleted_at, Some(day(5)));
    assert_eq!(removed.meta.version, 1);
    let snapshot = metadata
        .store
        .list_snapshots(removed.id.unwrap(), true)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(snapshot.meta.deleted_at, Some(day(5)));

    let kept = group(&metadata, ds, "100").await;
    assert!(kept.meta.deleted_at.is_none());
    assert_eq!(kept.meta.updated_at, day(5));
}

#[tokio::test]
async fn test_report_serializes() {
    let metadata = TestMetadata::in_memory().await.expect("Failed to create metadata");
    let inv = single(&[IndexFile::path_only(IMG)], &[]);
    let report = scan(&metadata, &inv, day(2)).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["host"], "pbs1");
    assert_eq!(json["as_of"], "2024-01-02T00:00:00Z");
    assert_eq!(json["groups"]["inserted"], 1);
}
