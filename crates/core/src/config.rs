//! Configuration types shared across crates.

use crate::inventory::DatastoreRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.scan.validate()
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file.
    Sqlite {
        /// Database file path (`:memory:` for a throwaway store).
        path: PathBuf,
        /// How long a writer waits on a locked database before failing.
        #[serde(default = "default_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/inventory.db"),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("sqlite config requires a non-empty 'path'".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// A datastore on the scanned host.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatastoreConfig {
    /// Datastore name as configured on the backup server.
    pub name: String,
    /// Absolute mountpoint of the datastore.
    pub path: String,
}

impl From<&DatastoreConfig> for DatastoreRecord {
    fn from(ds: &DatastoreConfig) -> Self {
        DatastoreRecord {
            name: ds.name.clone(),
            mountpoint: ds.path.trim_end_matches('/').to_string(),
        }
    }
}

/// Scan configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Host name the datastores belong to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Datastores expected on the host.
    #[serde(default)]
    pub datastores: Vec<DatastoreConfig>,
    /// Rows per multi-row INSERT statement.
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_insert_batch_size() -> usize {
    100
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            datastores: Vec::new(),
            insert_batch_size: default_insert_batch_size(),
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("scan.host must not be empty".to_string());
        }
        if self.insert_batch_size == 0 {
            return Err("scan.insert_batch_size must be at least 1".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for ds in &self.datastores {
            if !ds.path.starts_with('/') {
                return Err(format!(
                    "datastore '{}' path must be absolute, got '{}'",
                    ds.name, ds.path
                ));
            }
            if !seen.insert(ds.path.trim_end_matches('/')) {
                return Err(format!("datastore path '{}' configured twice", ds.path));
            }
        }
        Ok(())
    }

    /// Datastore records for the inventory builder.
    pub fn datastore_records(&self) -> Vec<DatastoreRecord> {
        self.datastores.iter().map(DatastoreRecord::from).collect()
    }
}
