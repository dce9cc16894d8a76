//! Binary chunk index files (`.fidx` / `.didx`).
//!
//! Both variants share a 4096 byte header followed by a homogeneous record
//! table. All integers are little-endian.
//!
//! ```text
//! [0, 8)      magic
//! [8, 24)     uuid
//! [24, 32)    ctime (i64, seconds since epoch)
//! [32, 64)    index checksum
//! [64, 72)    fixed only: total size (u64)
//! [72, 80)    fixed only: chunk size (u64)
//! [.., 4096)  reserved
//! [4096, ..)  fixed: 32 byte digests; dynamic: 8 byte end offset + 32 byte digest
//! ```

use crate::digest::{ChunkDigest, to_hex};
use crate::path::ArchiveKind;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Magic number of fixed-size chunk indexes (image archives).
pub const FIXED_INDEX_MAGIC: [u8; 8] = [47, 127, 65, 237, 145, 253, 15, 205];

/// Magic number of dynamic-size chunk indexes (file archives).
pub const DYNAMIC_INDEX_MAGIC: [u8; 8] = [28, 145, 78, 165, 25, 186, 179, 205];

/// Size of the header preceding the record table.
pub const HEADER_SIZE: usize = 4096;

const DIGEST_SIZE: usize = 32;
const DYNAMIC_RECORD_SIZE: usize = 8 + DIGEST_SIZE;

const UUID_OFFSET: usize = 8;
const CTIME_OFFSET: usize = 24;
const CSUM_OFFSET: usize = 32;
const TOTAL_SIZE_OFFSET: usize = 64;
const CHUNK_SIZE_OFFSET: usize = 72;

/// Index variant selected by the magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexVariant {
    Fixed,
    Dynamic,
}

impl IndexVariant {
    /// Select the variant for a magic number.
    pub fn from_magic(magic: &[u8]) -> Option<Self> {
        if magic == FIXED_INDEX_MAGIC {
            Some(Self::Fixed)
        } else if magic == DYNAMIC_INDEX_MAGIC {
            Some(Self::Dynamic)
        } else {
            None
        }
    }

    /// Magic number for this variant.
    pub fn magic(&self) -> [u8; 8] {
        match self {
            Self::Fixed => FIXED_INDEX_MAGIC,
            Self::Dynamic => DYNAMIC_INDEX_MAGIC,
        }
    }

    /// Archive kind whose index files carry this variant.
    pub fn archive_kind(&self) -> ArchiveKind {
        match self {
            Self::Fixed => ArchiveKind::Image,
            Self::Dynamic => ArchiveKind::File,
        }
    }

    /// Size of one record in the table.
    pub fn record_size(&self) -> usize {
        match self {
            Self::Fixed => DIGEST_SIZE,
            Self::Dynamic => DYNAMIC_RECORD_SIZE,
        }
    }
}

/// Fields common to both index variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub variant: IndexVariant,
    pub uuid: Uuid,
    /// Creation time in whole seconds since the epoch.
    pub ctime: i64,
    pub checksum: [u8; 32],
}

impl IndexHeader {
    /// UUID in 8-4-4-4-12 hex form.
    pub fn uuid_string(&self) -> String {
        self.uuid.hyphenated().to_string()
    }

    /// Hex-encoded index checksum.
    pub fn checksum_hex(&self) -> String {
        to_hex(&self.checksum)
    }

    /// Creation time, if it is representable.
    pub fn created_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.ctime).ok()
    }
}

/// Variant-specific part of a decoded index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLayout {
    Fixed { total_size: u64, chunk_size: u64 },
    /// End offset of each chunk, parallel to the digest list.
    Dynamic { offsets: Vec<u64> },
}

/// A decoded chunk index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndex {
    pub header: IndexHeader,
    /// Chunk digests in file order.
    pub digests: Vec<ChunkDigest>,
    pub layout: IndexLayout,
}

impl ChunkIndex {
    /// Decode an index file. `source` is only used for error messages.
    pub fn decode(bytes: &[u8], source: Option<&str>) -> crate::Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(crate::Error::decode(
                source,
                format!(
                    "truncated header: {} bytes, need {HEADER_SIZE}",
                    bytes.len()
                ),
            ));
        }

        let variant = IndexVariant::from_magic(&bytes[..UUID_OFFSET]).ok_or_else(|| {
            crate::Error::decode(
                source,
                format!("bad magic number {:?}", &bytes[..UUID_OFFSET]),
            )
        })?;

        let uuid_bytes: [u8; 16] = field(bytes, UUID_OFFSET, source)?;
        let ctime = i64::from_le_bytes(field(bytes, CTIME_OFFSET, source)?);
        let checksum: [u8; 32] = field(bytes, CSUM_OFFSET, source)?;

        let header = IndexHeader {
            variant,
            uuid: Uuid::from_bytes(uuid_bytes),
            ctime,
            checksum,
        };

        let table = &bytes[HEADER_SIZE..];
        let record_size = variant.record_size();
        if table.len() % record_size != 0 {
            return Err(crate::Error::decode(
                source,
                format!(
                    "record table of {} bytes is not a multiple of {record_size}",
                    table.len()
                ),
            ));
        }

        let count = table.len() / record_size;
        let mut digests = Vec::with_capacity(count);
        let layout = match variant {
            IndexVariant::Fixed => {
                for record in table.chunks_exact(DIGEST_SIZE) {
                    digests.push(ChunkDigest::from_bytes(field(record, 0, source)?));
                }
                IndexLayout::Fixed {
                    total_size: u64::from_le_bytes(field(bytes, TOTAL_SIZE_OFFSET, source)?),
                    chunk_size: u64::from_le_bytes(field(bytes, CHUNK_SIZE_OFFSET, source)?),
                }
            }
            IndexVariant::Dynamic => {
                let mut offsets = Vec::with_capacity(count);
                for record in table.chunks_exact(DYNAMIC_RECORD_SIZE) {
                    offsets.push(u64::from_le_bytes(field(record, 0, source)?));
                    digests.push(ChunkDigest::from_bytes(field(record, 8, source)?));
                }
                IndexLayout::Dynamic { offsets }
            }
        };

        Ok(Self {
            header,
            digests,
            layout,
        })
    }

    /// Encode back into the on-disk layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let variant = self.header.variant;
        let mut out = vec![0u8; HEADER_SIZE];
        out[..UUID_OFFSET].copy_from_slice(&variant.magic());
        out[UUID_OFFSET..CTIME_OFFSET].copy_from_slice(self.header.uuid.as_bytes());
        out[CTIME_OFFSET..CSUM_OFFSET].copy_from_slice(&self.header.ctime.to_le_bytes());
        out[CSUM_OFFSET..TOTAL_SIZE_OFFSET].copy_from_slice(&self.header.checksum);
        out.reserve(self.digests.len() * variant.record_size());

        match &self.layout {
            IndexLayout::Fixed {
                total_size,
                chunk_size,
            } => {
                out[TOTAL_SIZE_OFFSET..CHUNK_SIZE_OFFSET].copy_from_slice(&total_size.to_le_bytes());
                out[CHUNK_SIZE_OFFSET..CHUNK_SIZE_OFFSET + 8]
                    .copy_from_slice(&chunk_size.to_le_bytes());
                for digest in &self.digests {
                    out.extend_from_slice(digest.as_bytes());
                }
            }
            IndexLayout::Dynamic { offsets } => {
                for (offset, digest) in offsets.iter().zip(&self.digests) {
                    out.extend_from_slice(&offset.to_le_bytes());
                    out.extend_from_slice(digest.as_bytes());
                }
            }
        }
        out
    }

    /// Which variant this index is.
    pub fn variant(&self) -> IndexVariant {
        self.header.variant
    }

    /// Total logical size: the header field for fixed indexes, the last end
    /// offset for dynamic ones.
    pub fn total_size(&self) -> u64 {
        match &self.layout {
            IndexLayout::Fixed { total_size, .. } => *total_size,
            IndexLayout::Dynamic { offsets } => offsets.last().copied().unwrap_or(0),
        }
    }

    /// Chunk size of a fixed index.
    pub fn chunk_size(&self) -> Option<u64> {
        match &self.layout {
            IndexLayout::Fixed { chunk_size, .. } => Some(*chunk_size),
            IndexLayout::Dynamic { .. } => None,
        }
    }
}

/// Copy a fixed-width field out of `buf` at `offset`.
fn field<const N: usize>(buf: &[u8], offset: usize, source: Option<&str>) -> crate::Result<[u8; N]> {
    buf.get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| crate::Error::decode(source, format!("truncated field at offset {offset}")))
}
