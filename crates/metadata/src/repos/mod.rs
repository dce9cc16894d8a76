//! Repository traits for reading the inventory.

pub mod archives;
pub mod chunks;
pub mod datastores;
pub mod groups;
pub mod hosts;
pub mod namespaces;
pub mod snapshots;

pub use archives::ArchiveRepo;
pub use chunks::ChunkRepo;
pub use datastores::DatastoreRepo;
pub use groups::GroupRepo;
pub use hosts::HostRepo;
pub use namespaces::NamespaceRepo;
pub use snapshots::SnapshotRepo;
