// pgsnapshot/src/storage/mod.rs
//! On-disk layout of the backup area.
//!
//! Every cluster owns a folder below the base path:
//!
//! ```text
//! <base>/<cluster>/base                       snapshot repository root
//! <base>/<cluster>/.kopia.config              repository config file
//! <base>/<cluster>/.kopia.cache               repository cache directory
//! <base>/<cluster>/wals/<shard>/<wal-name>    archived WAL segments
//! ```
//!
//! The shard is the first [`WAL_SHARD_KEY_LEN`] characters of the WAL file
//! name. Changing it breaks every archive already written.
use std::path::{Path, PathBuf};

use crate::errors::{AppError, Result};

pub const DEFAULT_BASE_PATH: &str = "/backup";
pub const WAL_SHARD_KEY_LEN: usize = 16;

const WALS_DIRECTORY: &str = "wals";
const BASE_DIRECTORY: &str = "base";
const KOPIA_CONFIG_FILE: &str = ".kopia.config";
const KOPIA_CACHE_DIRECTORY: &str = ".kopia.cache";

/// Maps cluster names and WAL file names to paths below a base folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScheme {
    base_root: PathBuf,
}

impl Default for PathScheme {
    fn default() -> Self {
        PathScheme::new(DEFAULT_BASE_PATH)
    }
}

impl PathScheme {
    pub fn new(base_root: impl Into<PathBuf>) -> Self {
        PathScheme {
            base_root: base_root.into(),
        }
    }

    pub fn base_root(&self) -> &Path {
        &self.base_root
    }

    /// Folder holding everything related to one cluster.
    pub fn cluster_path(&self, cluster: &str) -> PathBuf {
        self.base_root.join(cluster)
    }

    pub fn base_path(&self, cluster: &str) -> PathBuf {
        self.cluster_path(cluster).join(BASE_DIRECTORY)
    }

    pub fn config_path(&self, cluster: &str) -> PathBuf {
        self.cluster_path(cluster).join(KOPIA_CONFIG_FILE)
    }

    pub fn cache_path(&self, cluster: &str) -> PathBuf {
        self.cluster_path(cluster).join(KOPIA_CACHE_DIRECTORY)
    }

    pub fn wal_root(&self, cluster: &str) -> PathBuf {
        self.cluster_path(cluster).join(WALS_DIRECTORY)
    }

    /// Where the WAL file `wal_name` of `cluster` is archived.
    pub fn wal_file_path(&self, cluster: &str, wal_name: &str) -> Result<PathBuf> {
        let shard = shard_key(wal_name)?;
        Ok(self.wal_root(cluster).join(shard).join(wal_name))
    }
}

/// Returns the shard directory name for a WAL file.
pub fn shard_key(wal_name: &str) -> Result<&str> {
    if wal_name.contains('/') {
        return Err(AppError::InvalidWalName(wal_name.to_string()));
    }
    wal_name
        .get(..WAL_SHARD_KEY_LEN)
        .ok_or_else(|| AppError::InvalidWalName(wal_name.to_string()))
}
