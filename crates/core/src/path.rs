//! Remote datastore path grammar.
//!
//! Two layouts are recognised below a datastore mountpoint:
//!
//! ```text
//! <mountpoint>/.chunks/<bucket>/<digest>
//! <mountpoint>[/ns/<seg>]*/<type>/<backup-id>/<YYYY-MM-DDTHH:MM:SSZ>/<name>.<fidx|didx>
//! ```

use crate::digest::ChunkDigest;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

static CHUNK_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<mountpoint>.*)/\.chunks/(?P<bucket>[0-9a-fA-F]{4})/(?P<digest>[0-9a-fA-F]{64})$")
        .expect("chunk path pattern is valid")
});

static INDEX_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?P<mountpoint>(?:/[^/]+)*?)",
        r"(?P<namespace>(?:/ns/[^/]+)*)",
        r"/(?P<type>vm|ct|host)",
        r"/(?P<id>[^/]+)",
        r"/(?P<time>[0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{2}Z)",
        r"/(?P<name>[^/]+)\.(?P<ext>[^./]+)$",
    ))
    .expect("index path pattern is valid")
});

const BACKUP_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// Parse a snapshot directory timestamp (`2024-01-01T00:00:00Z`).
pub fn parse_backup_time(s: &str) -> crate::Result<OffsetDateTime> {
    PrimitiveDateTime::parse(s, BACKUP_TIME_FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| crate::Error::InvalidTimestamp(format!("{s}: {e}")))
}

/// Format a timestamp the way snapshot directories are named.
pub fn format_backup_time(time: OffsetDateTime) -> String {
    let utc = time.to_offset(time::UtcOffset::UTC);
    utc.format(BACKUP_TIME_FORMAT)
        .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}

/// Backup type of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Vm,
    Ct,
    Host,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Ct => "ct",
            Self::Host => "host",
        }
    }
}

impl FromStr for BackupType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "vm" => Ok(Self::Vm),
            "ct" => Ok(Self::Ct),
            "host" => Ok(Self::Host),
            other => Err(crate::Error::Grammar {
                grammar: "backup type",
                path: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Archive kind, selected by the index file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// Dynamic index (`.didx`), e.g. `root.pxar`.
    File,
    /// Fixed index (`.fidx`), e.g. `drive-scsi0.img`.
    Image,
}

impl ArchiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Image => "image",
        }
    }

    /// Index file extension for this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::File => "didx",
            Self::Image => "fidx",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "didx" => Some(Self::File),
            "fidx" => Some(Self::Image),
            _ => None,
        }
    }
}

impl FromStr for ArchiveKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "file" => Ok(Self::File),
            "image" => Ok(Self::Image),
            other => Err(crate::Error::Grammar {
                grammar: "archive kind",
                path: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip a known mountpoint, leaving a remainder that still starts with `/`.
fn strip_mountpoint<'a>(path: &'a str, mountpoint: &str) -> Option<&'a str> {
    let mountpoint = mountpoint.trim_end_matches('/');
    path.strip_prefix(mountpoint)
        .filter(|rest| rest.starts_with('/'))
}

/// A chunk file below `<mountpoint>/.chunks/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPath {
    pub mountpoint: String,
    pub digest: ChunkDigest,
}

impl ChunkPath {
    const GRAMMAR: &'static str = "chunk";

    /// Parse a chunk path. When the mountpoint is already known it must
    /// match the captured one.
    pub fn parse(path: &str, mountpoint: Option<&str>) -> crate::Result<Self> {
        let mismatch = || crate::Error::Grammar {
            grammar: Self::GRAMMAR,
            path: path.to_string(),
        };
        let caps = CHUNK_PATH.captures(path).ok_or_else(mismatch)?;
        let captured = &caps["mountpoint"];
        if captured.is_empty() {
            return Err(mismatch());
        }
        if let Some(known) = mountpoint
            && captured != known.trim_end_matches('/')
        {
            return Err(mismatch());
        }

        let digest = ChunkDigest::from_hex(&caps["digest"])?;
        if !caps["bucket"].eq_ignore_ascii_case(&digest.bucket()) {
            return Err(mismatch());
        }

        Ok(Self {
            mountpoint: captured.to_string(),
            digest,
        })
    }

    /// Rebuild the on-disk path.
    pub fn to_path_string(&self) -> String {
        format!(
            "{}/.chunks/{}/{}",
            self.mountpoint,
            self.digest.bucket(),
            self.digest
        )
    }
}

/// An index file inside a snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPath {
    pub mountpoint: String,
    /// Namespace segments, outermost first. Empty for the root namespace.
    pub namespace: Vec<String>,
    pub backup_type: BackupType,
    pub backup_id: String,
    pub backup_time: OffsetDateTime,
    /// Archive name without the index extension.
    pub name: String,
    pub kind: ArchiveKind,
}

impl IndexPath {
    const GRAMMAR: &'static str = "index";

    /// Parse an index path. A known mountpoint is stripped first so that
    /// mountpoints containing layout-like segments are not misread.
    pub fn parse(path: &str, mountpoint: Option<&str>) -> crate::Result<Self> {
        let mismatch = || crate::Error::Grammar {
            grammar: Self::GRAMMAR,
            path: path.to_string(),
        };

        let (subject, known) = match mountpoint {
            Some(mp) => (
                strip_mountpoint(path, mp).ok_or_else(mismatch)?,
                Some(mp.trim_end_matches('/')),
            ),
            None => (path, None),
        };

        let caps = INDEX_PATH.captures(subject).ok_or_else(mismatch)?;
        let mountpoint = match known {
            Some(known) if caps["mountpoint"].is_empty() => known.to_string(),
            Some(_) => return Err(mismatch()),
            None if caps["mountpoint"].is_empty() => return Err(mismatch()),
            None => caps["mountpoint"].to_string(),
        };

        Self::from_captures(path, mountpoint, &caps)
    }

    fn from_captures(path: &str, mountpoint: String, caps: &Captures<'_>) -> crate::Result<Self> {
        let extension = &caps["ext"];
        let kind =
            ArchiveKind::from_extension(extension).ok_or_else(|| crate::Error::UnknownArchiveExtension {
                path: path.to_string(),
                extension: extension.to_string(),
            })?;

        let namespace = caps["namespace"]
            .split("/ns/")
            .filter(|seg| !seg.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            mountpoint,
            namespace,
            backup_type: caps["type"].parse()?,
            backup_id: caps["id"].to_string(),
            backup_time: parse_backup_time(&caps["time"])?,
            name: caps["name"].to_string(),
            kind,
        })
    }

    /// Slash-joined namespace path, `None` for the root namespace.
    pub fn namespace_path(&self) -> Option<String> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace.join("/"))
        }
    }

    /// Rebuild the on-disk path.
    pub fn to_path_string(&self) -> String {
        let mut out = self.mountpoint.clone();
        for seg in &self.namespace {
            out.push_str("/ns/");
            out.push_str(seg);
        }
        out.push_str(&format!(
            "/{}/{}/{}/{}.{}",
            self.backup_type,
            self.backup_id,
            format_backup_time(self.backup_time),
            self.name,
            self.kind.extension()
        ));
        out
    }
}
