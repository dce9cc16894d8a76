//! Test fixtures: chunk contents, index blobs and discovery listings.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use stockroom_core::index::{ChunkIndex, IndexHeader, IndexLayout, IndexVariant};
use stockroom_core::{ChunkDigest, DatastoreRecord, Inventory};
use time::OffsetDateTime;
use uuid::Uuid;

/// Generate deterministic test data based on a seed.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Digest of a seeded chunk body.
#[allow(dead_code)]
pub fn chunk_digest(seed: u64) -> ChunkDigest {
    let body = seeded_bytes(seed, 4096);
    let hash: [u8; 32] = Sha256::digest(&body).into();
    ChunkDigest::from_bytes(hash)
}

/// Day `n` of January 2024, midnight UTC.
#[allow(dead_code)]
pub fn day(n: u8) -> OffsetDateTime {
    time::Date::from_calendar_date(2024, time::Month::January, n)
        .expect("valid test date")
        .midnight()
        .assume_utc()
}

#[allow(dead_code)]
pub fn datastore(name: &str, mountpoint: &str) -> DatastoreRecord {
    DatastoreRecord {
        name: name.to_string(),
        mountpoint: mountpoint.to_string(),
    }
}

fn header(variant: IndexVariant, seed: u8) -> IndexHeader {
    IndexHeader {
        variant,
        uuid: Uuid::from_bytes([seed; 16]),
        ctime: day(1).unix_timestamp(),
        checksum: [seed; 32],
    }
}

/// A fixed (image) index over 4 KiB chunks.
#[allow(dead_code)]
pub fn fixed_index(seed: u8, digests: &[ChunkDigest]) -> Vec<u8> {
    ChunkIndex {
        header: header(IndexVariant::Fixed, seed),
        digests: digests.to_vec(),
        layout: IndexLayout::Fixed {
            total_size: digests.len() as u64 * 4096,
            chunk_size: 4096,
        },
    }
    .to_bytes()
}

/// A dynamic (file) index with 1000-byte chunks.
#[allow(dead_code)]
pub fn dynamic_index(seed: u8, digests: &[ChunkDigest]) -> Vec<u8> {
    ChunkIndex {
        header: header(IndexVariant::Dynamic, seed),
        digests: digests.to_vec(),
        layout: IndexLayout::Dynamic {
            offsets: (1..=digests.len() as u64).map(|i| i * 1000).collect(),
        },
    }
    .to_bytes()
}

/// Path of a chunk file below `mountpoint`.
#[allow(dead_code)]
pub fn chunk_path(mountpoint: &str, digest: &ChunkDigest) -> String {
    format!("{mountpoint}/.chunks/{}/{digest}", digest.bucket())
}

/// NUL-delimited `<size> <path>` chunk listing.
#[allow(dead_code)]
pub fn chunk_listing(mountpoint: &str, digests: &[ChunkDigest]) -> Vec<u8> {
    let mut out = Vec::new();
    for digest in digests {
        out.extend_from_slice(format!("4096 {}", chunk_path(mountpoint, digest)).as_bytes());
        out.push(0);
    }
    out
}

/// Builder-side description of one index file.
#[allow(dead_code)]
pub struct IndexFile<'a> {
    pub path: &'a str,
    pub content: Option<Vec<u8>>,
}

#[allow(dead_code)]
impl<'a> IndexFile<'a> {
    pub fn decoded(path: &'a str, content: Vec<u8>) -> Self {
        Self {
            path,
            content: Some(content),
        }
    }

    pub fn path_only(path: &'a str) -> Self {
        Self {
            path,
            content: None,
        }
    }
}

/// Build an inventory from datastores, chunk listings and index files.
#[allow(dead_code)]
pub fn inventory(
    datastores: Vec<DatastoreRecord>,
    chunk_listings: &[Vec<u8>],
    indexes: &[IndexFile<'_>],
) -> Inventory {
    let mut builder = Inventory::builder(datastores);
    for listing in chunk_listings {
        builder
            .add_chunk_listing(listing)
            .expect("chunk listing parses");
    }
    for index in indexes {
        builder
            .add_index(index.path, index.content.as_deref())
            .expect("index file parses");
    }
    builder.build()
}
