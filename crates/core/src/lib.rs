//! Core domain types for backup datastore inventory scans.
//!
//! This crate covers everything that does not touch the database:
//! - Chunk digests and the binary chunk index codec
//! - The datastore path grammar for chunk and index files
//! - Composite reconciliation keys
//! - Raw per-level records built from a discovery pass
//! - Shared configuration types

pub mod config;
pub mod digest;
pub mod error;
pub mod index;
pub mod inventory;
pub mod key;
pub mod path;

pub use digest::ChunkDigest;
pub use error::{Error, Result};
pub use index::{ChunkIndex, IndexHeader, IndexLayout, IndexVariant};
pub use inventory::{
    ArchiveRecord, ChunkRecord, DatastoreRecord, GroupRecord, Inventory, InventoryBuilder,
    MountpointScoped, NamespaceRecord, SnapshotRecord,
};
pub use key::{Key, KeyPart};
pub use path::{ArchiveKind, BackupType, ChunkPath, IndexPath};
