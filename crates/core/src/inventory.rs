//! Raw per-level records derived from a discovery pass.
//!
//! The discovery collaborator hands over NUL-delimited path listings and the
//! bytes of each index file. [`InventoryBuilder`] runs them through the path
//! grammar and the index codec and groups the result by hierarchy level,
//! deduplicated by composite key.

use crate::digest::ChunkDigest;
use crate::index::ChunkIndex;
use crate::key::{Key, archive_key, group_key, snapshot_key};
use crate::path::{ArchiveKind, BackupType, ChunkPath, IndexPath};
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;

/// Records that belong to one datastore, identified by its mountpoint.
pub trait MountpointScoped {
    fn mountpoint(&self) -> &str;
}

/// A datastore known to exist on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreRecord {
    pub name: String,
    pub mountpoint: String,
}

/// A namespace node. `path` is the slash-joined segment list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub mountpoint: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub mountpoint: String,
    pub namespace: Option<String>,
    pub backup_type: BackupType,
    pub backup_id: String,
}

impl GroupRecord {
    pub fn key(&self) -> Key {
        group_key(
            &self.mountpoint,
            self.namespace.as_deref(),
            self.backup_type,
            &self.backup_id,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub group: GroupRecord,
    pub backup_time: OffsetDateTime,
}

impl SnapshotRecord {
    pub fn key(&self) -> Key {
        snapshot_key(&self.group.key(), self.backup_time)
    }
}

/// An archive observed as an index file, with its decoded content when the
/// file bytes were available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub snapshot: SnapshotRecord,
    pub kind: ArchiveKind,
    pub name: String,
    pub index: Option<ChunkIndex>,
}

impl ArchiveRecord {
    pub fn key(&self) -> Key {
        archive_key(&self.snapshot.key(), self.kind, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub mountpoint: String,
    pub digest: ChunkDigest,
    pub size: Option<u64>,
    /// Whether no decoded index references the chunk. Unset unless every
    /// index of the datastore was decoded.
    pub unused: Option<bool>,
}

impl MountpointScoped for DatastoreRecord {
    fn mountpoint(&self) -> &str {
        &self.mountpoint
    }
}

impl MountpointScoped for NamespaceRecord {
    fn mountpoint(&self) -> &str {
        &self.mountpoint
    }
}

impl MountpointScoped for GroupRecord {
    fn mountpoint(&self) -> &str {
        &self.mountpoint
    }
}

impl MountpointScoped for SnapshotRecord {
    fn mountpoint(&self) -> &str {
        &self.group.mountpoint
    }
}

impl MountpointScoped for ArchiveRecord {
    fn mountpoint(&self) -> &str {
        &self.snapshot.group.mountpoint
    }
}

impl MountpointScoped for ChunkRecord {
    fn mountpoint(&self) -> &str {
        &self.mountpoint
    }
}

/// All raw records of one scan, grouped by level.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub datastores: Vec<DatastoreRecord>,
    pub namespaces: Vec<NamespaceRecord>,
    pub groups: Vec<GroupRecord>,
    pub snapshots: Vec<SnapshotRecord>,
    pub archives: Vec<ArchiveRecord>,
    pub chunks: Vec<ChunkRecord>,
}

impl Inventory {
    pub fn builder(datastores: Vec<DatastoreRecord>) -> InventoryBuilder {
        InventoryBuilder::new(datastores)
    }
}

/// Split a NUL-delimited listing into entries, skipping empty ones.
pub fn split_listing(listing: &[u8]) -> crate::Result<Vec<&str>> {
    listing
        .split(|b| *b == 0)
        .map(|entry| entry.strip_suffix(b"\n").unwrap_or(entry))
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            std::str::from_utf8(entry)
                .map_err(|e| crate::Error::Listing(format!("entry is not UTF-8: {e}")))
        })
        .collect()
}

/// Parse a chunk listing entry: either `<path>` or `<size> <path>`.
pub fn parse_chunk_entry(entry: &str) -> crate::Result<(Option<u64>, &str)> {
    if entry.starts_with('/') {
        return Ok((None, entry));
    }
    let (size, path) = entry
        .split_once(' ')
        .ok_or_else(|| crate::Error::Listing(format!("unrecognised chunk entry: {entry}")))?;
    let size = size
        .parse::<u64>()
        .map_err(|e| crate::Error::Listing(format!("bad size in chunk entry {entry}: {e}")))?;
    Ok((Some(size), path))
}

/// Accumulates discovery output into an [`Inventory`].
#[derive(Debug)]
pub struct InventoryBuilder {
    datastores: Vec<DatastoreRecord>,
    namespaces: Vec<NamespaceRecord>,
    groups: Vec<GroupRecord>,
    snapshots: Vec<SnapshotRecord>,
    archives: Vec<ArchiveRecord>,
    archive_slots: HashMap<Key, usize>,
    chunks: Vec<ChunkRecord>,
    chunk_slots: HashMap<(String, ChunkDigest), usize>,
    seen: HashSet<Key>,
}

impl InventoryBuilder {
    fn new(datastores: Vec<DatastoreRecord>) -> Self {
        Self {
            datastores,
            namespaces: Vec::new(),
            groups: Vec::new(),
            snapshots: Vec::new(),
            archives: Vec::new(),
            archive_slots: HashMap::new(),
            chunks: Vec::new(),
            chunk_slots: HashMap::new(),
            seen: HashSet::new(),
        }
    }

    /// Longest known mountpoint that is a directory prefix of `path`.
    fn mountpoint_hint(&self, path: &str) -> Option<&str> {
        self.datastores
            .iter()
            .map(|ds| ds.mountpoint.trim_end_matches('/'))
            .filter(|mp| {
                path.strip_prefix(mp)
                    .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|mp| mp.len())
    }

    /// Add every entry of a NUL-delimited chunk listing.
    pub fn add_chunk_listing(&mut self, listing: &[u8]) -> crate::Result<()> {
        for entry in split_listing(listing)? {
            let (size, path) = parse_chunk_entry(entry)?;
            self.add_chunk_path(path, size)?;
        }
        Ok(())
    }

    /// Add one chunk file path.
    pub fn add_chunk_path(&mut self, path: &str, size: Option<u64>) -> crate::Result<()> {
        let parsed = ChunkPath::parse(path, self.mountpoint_hint(path))?;
        let slot = (parsed.mountpoint.clone(), parsed.digest);
        match self.chunk_slots.get(&slot) {
            Some(&i) => {
                if size.is_some() {
                    self.chunks[i].size = size;
                }
            }
            None => {
                self.chunk_slots.insert(slot, self.chunks.len());
                self.chunks.push(ChunkRecord {
                    mountpoint: parsed.mountpoint,
                    digest: parsed.digest,
                    size,
                    unused: None,
                });
            }
        }
        Ok(())
    }

    /// Add one index file path with its bytes, if they were fetched.
    pub fn add_index(&mut self, path: &str, content: Option<&[u8]>) -> crate::Result<()> {
        let parsed = IndexPath::parse(path, self.mountpoint_hint(path))?;
        let index = content
            .map(|bytes| ChunkIndex::decode(bytes, Some(path)))
            .transpose()?;
        if let Some(index) = &index {
            let found = index.variant().archive_kind();
            if found != parsed.kind {
                return Err(crate::Error::decode(
                    Some(path),
                    format!(
                        "{} index content in a .{} file",
                        found.as_str(),
                        parsed.kind.extension()
                    ),
                ));
            }
        }

        let namespace = parsed.namespace_path();
        for depth in 1..=parsed.namespace.len() {
            let record = NamespaceRecord {
                mountpoint: parsed.mountpoint.clone(),
                path: parsed.namespace[..depth].join("/"),
            };
            let key = Key::from_parts(["ns".into(), (&record.mountpoint).into(), (&record.path).into()]);
            if self.seen.insert(key) {
                self.namespaces.push(record);
            }
        }

        let group = GroupRecord {
            mountpoint: parsed.mountpoint,
            namespace,
            backup_type: parsed.backup_type,
            backup_id: parsed.backup_id,
        };
        if self.seen.insert(group.key()) {
            self.groups.push(group.clone());
        }

        let snapshot = SnapshotRecord {
            group,
            backup_time: parsed.backup_time,
        };
        if self.seen.insert(snapshot.key()) {
            self.snapshots.push(snapshot.clone());
        }

        let archive = ArchiveRecord {
            snapshot,
            kind: parsed.kind,
            name: parsed.name,
            index,
        };
        let key = archive.key();
        match self.archive_slots.get(&key) {
            Some(&i) => {
                if archive.index.is_some() {
                    self.archives[i] = archive;
                }
            }
            None => {
                self.archive_slots.insert(key, self.archives.len());
                self.archives.push(archive);
            }
        }
        tracing::trace!(path, "added index file");
        Ok(())
    }

    /// Add every entry of a NUL-delimited index listing, taking file bytes from `fetch`.
    pub fn add_index_listing<'a, F>(&mut self, listing: &[u8], mut fetch: F) -> crate::Result<()>
    where
        F: FnMut(&str) -> Option<&'a [u8]>,
    {
        for path in split_listing(listing)? {
            let content = fetch(path);
            self.add_index(path, content)?;
        }
        Ok(())
    }

    /// Finish the inventory, deriving the chunk `unused` flags.
    pub fn build(mut self) -> Inventory {
        mark_unused_chunks(&self.archives, &mut self.chunks);
        tracing::debug!(
            datastores = self.datastores.len(),
            namespaces = self.namespaces.len(),
            groups = self.groups.len(),
            snapshots = self.snapshots.len(),
            archives = self.archives.len(),
            chunks = self.chunks.len(),
            "built inventory"
        );
        Inventory {
            datastores: self.datastores,
            namespaces: self.namespaces,
            groups: self.groups,
            snapshots: self.snapshots,
            archives: self.archives,
            chunks: self.chunks,
        }
    }
}

/// Set `unused` on chunks of every datastore whose index files were all decoded.
fn mark_unused_chunks(archives: &[ArchiveRecord], chunks: &mut [ChunkRecord]) {
    let mut complete: HashMap<&str, bool> = HashMap::new();
    let mut referenced: HashMap<&str, HashSet<ChunkDigest>> = HashMap::new();
    for archive in archives {
        let mountpoint = archive.mountpoint();
        let entry = complete.entry(mountpoint).or_insert(true);
        match &archive.index {
            Some(index) => referenced
                .entry(mountpoint)
                .or_default()
                .extend(index.digests.iter().copied()),
            None => *entry = false,
        }
    }

    let empty = HashSet::new();
    for chunk in chunks.iter_mut() {
        if complete.get(chunk.mountpoint.as_str()).copied().unwrap_or(true) {
            let used = referenced.get(chunk.mountpoint.as_str()).unwrap_or(&empty);
            chunk.unused = Some(!used.contains(&chunk.digest));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexHeader, IndexLayout, IndexVariant};
    use uuid::Uuid;

    fn fixed_index(digests: Vec<ChunkDigest>) -> Vec<u8> {
        ChunkIndex {
            header: IndexHeader {
                variant: IndexVariant::Fixed,
                uuid: Uuid::from_bytes([1; 16]),
                ctime: 1_704_067_200,
                checksum: [0; 32],
            },
            layout: IndexLayout::Fixed {
                total_size: digests.len() as u64 * 4096,
                chunk_size: 4096,
            },
            digests,
        }
        .to_bytes()
    }

    fn chunk_path(mountpoint: &str, digest: &ChunkDigest) -> String {
        format!("{mountpoint}/.chunks/{}/{digest}", digest.bucket())
    }

    fn datastore(mountpoint: &str) -> DatastoreRecord {
        DatastoreRecord {
            name: "ds".to_string(),
            mountpoint: mountpoint.to_string(),
        }
    }

    #[test]
    fn test_split_listing() {
        let listing = b"/a\0/b\0\0/c\n\0";
        assert_eq!(split_listing(listing).unwrap(), vec!["/a", "/b", "/c"]);
        assert!(split_listing(b"/a\0\xff\xfe\0").is_err());
    }

    #[test]
    fn test_parse_chunk_entry() {
        assert_eq!(parse_chunk_entry("/x/y").unwrap(), (None, "/x/y"));
        assert_eq!(parse_chunk_entry("4096 /x/y").unwrap(), (Some(4096), "/x/y"));
        assert!(parse_chunk_entry("big /x/y").is_err());
        assert!(parse_chunk_entry("nonsense").is_err());
    }

    #[test]
    fn test_namespaces_are_prefix_closed() {
        let mut builder = Inventory::builder(vec![datastore("/mnt/ds1")]);
        builder
            .add_index(
                "/mnt/ds1/ns/a/ns/b/ns/c/vm/100/2024-01-01T00:00:00Z/drive-scsi0.img.fidx",
                None,
            )
            .unwrap();
        builder
            .add_index(
                "/mnt/ds1/ns/a/vm/100/2024-01-01T00:00:00Z/drive-scsi0.img.fidx",
                None,
            )
            .unwrap();
        let inventory = builder.build();
        let paths: Vec<_> = inventory.namespaces.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c"]);
        assert_eq!(inventory.groups.len(), 2);
        assert_eq!(inventory.snapshots.len(), 2);
        assert_eq!(inventory.archives.len(), 2);
    }

    #[test]
    fn test_duplicate_index_keeps_decoded_copy() {
        let path = "/mnt/ds1/vm/100/2024-01-01T00:00:00Z/drive-scsi0.img.fidx";
        let bytes = fixed_index(vec![ChunkDigest::compute(b"x")]);
        let mut builder = Inventory::builder(vec![datastore("/mnt/ds1")]);
        builder.add_index(path, Some(&bytes)).unwrap();
        builder.add_index(path, None).unwrap();
        let inventory = builder.build();
        assert_eq!(inventory.archives.len(), 1);
        assert!(inventory.archives[0].index.is_some());
    }

    #[test]
    fn test_decode_error_names_path() {
        let path = "/mnt/ds1/vm/100/2024-01-01T00:00:00Z/drive-scsi0.img.fidx";
        let mut builder = Inventory::builder(vec![datastore("/mnt/ds1")]);
        let err = builder.add_index(path, Some(&[0u8; 10])).unwrap_err();
        assert!(err.to_string().contains(path));
    }

    #[test]
    fn test_index_variant_must_match_extension() {
        let path = "/mnt/ds1/vm/100/2024-01-01T00:00:00Z/drive-scsi0.img.fidx";
        let dynamic = ChunkIndex {
            header: IndexHeader {
                variant: IndexVariant::Dynamic,
                uuid: Uuid::from_bytes([2; 16]),
                ctime: 1_704_067_200,
                checksum: [0; 32],
            },
            layout: IndexLayout::Dynamic {
                offsets: vec![1000],
            },
            digests: vec![ChunkDigest::compute(b"x")],
        }
        .to_bytes();
        let mut builder = Inventory::builder(vec![datastore("/mnt/ds1")]);
        let err = builder.add_index(path, Some(&dynamic)).unwrap_err();
        assert!(matches!(err, crate::Error::Decode { .. }));
        assert!(err.to_string().contains(path));

        let didx = "/mnt/ds1/ct/7/2024-01-01T00:00:00Z/root.pxar.didx";
        builder.add_index(didx, Some(&dynamic)).unwrap();
    }

    #[test]
    fn test_unused_flags_require_complete_decode() {
        let used = ChunkDigest::compute(b"used");
        let orphan = ChunkDigest::compute(b"orphan");
        let mut builder = Inventory::builder(vec![datastore("/mnt/ds1"), datastore("/mnt/ds2")]);

        let listing = format!(
            "{}\0123 {}\0{}\0",
            chunk_path("/mnt/ds1", &used),
            chunk_path("/mnt/ds1", &orphan),
            chunk_path("/mnt/ds2", &used),
        );
        builder.add_chunk_listing(listing.as_bytes()).unwrap();

        let bytes = fixed_index(vec![used, used]);
        builder
            .add_index(
                "/mnt/ds1/vm/100/2024-01-01T00:00:00Z/drive-scsi0.img.fidx",
                Some(&bytes),
            )
            .unwrap();
        // ds2 has an index whose bytes were not fetched.
        builder
            .add_index("/mnt/ds2/ct/7/2024-01-01T00:00:00Z/root.pxar.didx", None)
            .unwrap();

        let inventory = builder.build();
        let find = |mp: &str, d: &ChunkDigest| {
            inventory
                .chunks
                .iter()
                .find(|c| c.mountpoint == mp && &c.digest == d)
                .cloned()
                .unwrap()
        };
        assert_eq!(find("/mnt/ds1", &used).unused, Some(false));
        let orphan_rec = find("/mnt/ds1", &orphan);
        assert_eq!(orphan_rec.unused, Some(true));
        assert_eq!(orphan_rec.size, Some(123));
        assert_eq!(find("/mnt/ds2", &used).unused, None);
    }

    #[test]
    fn test_index_listing_uses_fetch() {
        let bytes = fixed_index(vec![]);
        let listing = b"/mnt/ds1/vm/1/2024-01-01T00:00:00Z/a.img.fidx\0/mnt/ds1/vm/1/2024-01-01T00:00:00Z/b.img.fidx\0";
        let mut builder = Inventory::builder(vec![datastore("/mnt/ds1")]);
        builder
            .add_index_listing(listing, |p| p.ends_with("a.img.fidx").then_some(bytes.as_slice()))
            .unwrap();
        let inventory = builder.build();
        assert_eq!(inventory.archives.len(), 2);
        assert!(inventory.archives[0].index.is_some());
        assert!(inventory.archives[1].index.is_none());
    }
}
