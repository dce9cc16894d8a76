//! Composite reconciliation keys.
//!
//! A [`Key`] identifies an entity by its ancestor chain and local
//! discriminators, independent of any storage-assigned id. Parts are escaped
//! and joined with a separator that never survives escaping, so distinct
//! tuples cannot produce the same string.

use crate::digest::ChunkDigest;
use crate::path::{ArchiveKind, BackupType};
use std::fmt;
use time::OffsetDateTime;

const SEPARATOR: char = '\u{1f}';
const NULL_MARK: char = '\u{0}';
const ESCAPE: char = '\\';

/// Opaque composite key. Only equality and hashing are meaningful.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key(String);

/// One component of a composite key.
#[derive(Debug, Clone, Copy)]
pub enum KeyPart<'a> {
    Str(&'a str),
    Int(i64),
    Time(OffsetDateTime),
    Key(&'a Key),
    /// An absent component. Distinct from every string, including `""`.
    Null,
}

impl Key {
    /// Join parts, in order, into a key.
    pub fn from_parts<'a>(parts: impl IntoIterator<Item = KeyPart<'a>>) -> Self {
        let mut out = String::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            match part {
                KeyPart::Str(s) => escape_into(&mut out, s),
                KeyPart::Int(n) => out.push_str(&n.to_string()),
                KeyPart::Time(t) => out.push_str(&t.unix_timestamp_nanos().to_string()),
                KeyPart::Key(k) => escape_into(&mut out, &k.0),
                KeyPart::Null => out.push(NULL_MARK),
            }
        }
        Self(out)
    }

    /// Raw joined representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            ESCAPE => out.push_str("\\\\"),
            SEPARATOR => out.push_str("\\s"),
            NULL_MARK => out.push_str("\\0"),
            c => out.push(c),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                SEPARATOR => f.write_str("|")?,
                NULL_MARK => f.write_str("<null>")?,
                c => write!(f, "{c}")?,
            }
        }
        Ok(())
    }
}

impl<'a> From<&'a str> for KeyPart<'a> {
    fn from(s: &'a str) -> Self {
        Self::Str(s)
    }
}

impl<'a> From<&'a String> for KeyPart<'a> {
    fn from(s: &'a String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for KeyPart<'_> {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<OffsetDateTime> for KeyPart<'_> {
    fn from(t: OffsetDateTime) -> Self {
        Self::Time(t)
    }
}

impl<'a> From<&'a Key> for KeyPart<'a> {
    fn from(k: &'a Key) -> Self {
        Self::Key(k)
    }
}

impl<'a, T: Into<KeyPart<'a>>> From<Option<T>> for KeyPart<'a> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Datastore identity within a host.
pub fn datastore_key(host_id: i64, mountpoint: &str) -> Key {
    Key::from_parts([host_id.into(), mountpoint.into()])
}

/// Namespace identity: datastore id plus full slash-joined path.
pub fn namespace_key(datastore_id: i64, path: &str) -> Key {
    Key::from_parts([datastore_id.into(), path.into()])
}

/// Backup group identity. A root-namespace group uses a null component.
pub fn group_key(
    mountpoint: &str,
    namespace: Option<&str>,
    backup_type: BackupType,
    backup_id: &str,
) -> Key {
    Key::from_parts([
        mountpoint.into(),
        namespace.into(),
        backup_type.as_str().into(),
        backup_id.into(),
    ])
}

/// Snapshot identity: group key plus backup time.
pub fn snapshot_key(group: &Key, backup_time: OffsetDateTime) -> Key {
    Key::from_parts([group.into(), backup_time.into()])
}

/// Archive identity: snapshot key plus kind and name.
pub fn archive_key(snapshot: &Key, kind: ArchiveKind, name: &str) -> Key {
    Key::from_parts([snapshot.into(), kind.as_str().into(), name.into()])
}

/// Chunk identity within a datastore.
pub fn chunk_key(datastore_id: i64, digest: &ChunkDigest) -> Key {
    Key::from_parts([datastore_id.into(), KeyPart::Str(&digest.to_hex())])
}
