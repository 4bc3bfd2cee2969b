// pgsnapshot/src/repository/mod.rs
pub mod kopia;
pub mod provider;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::storage::PathScheme;
pub use provider::StorageProvider;

/// Sub folder of PGDATA holding the WAL segments.
pub const WAL_FOLDER: &str = "pg_wal";
/// Sub folder of PGDATA holding one symlink per tablespace.
pub const TABLESPACES_FOLDER: &str = "pg_tblspc";

/// Coordinates of a snapshot repository. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryHandle {
    provider: StorageProvider,
    path: PathBuf,
    config_file: PathBuf,
    cache_directory: PathBuf,
}

impl RepositoryHandle {
    /// Builds a handle, rejecting unknown provider names.
    pub fn new(
        provider: &str,
        path: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
        cache_directory: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(RepositoryHandle {
            provider: provider.parse()?,
            path: path.into(),
            config_file: config_file.into(),
            cache_directory: cache_directory.into(),
        })
    }

    /// The repository of `cluster` as laid out by `scheme`.
    pub fn for_cluster(provider: &str, scheme: &PathScheme, cluster: &str) -> Result<Self> {
        RepositoryHandle::new(
            provider,
            scheme.base_path(cluster),
            scheme.config_path(cluster),
            scheme.cache_path(cluster),
        )
    }

    pub fn provider(&self) -> StorageProvider {
        self.provider
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn cache_directory(&self) -> &Path {
        &self.cache_directory
    }

    pub fn log_directory(&self) -> PathBuf {
        self.cache_directory.join("log")
    }
}

/// Tags attached to one snapshot. Keys are unique and keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotTags(Vec<(String, String)>);

impl SnapshotTags {
    pub fn new() -> Self {
        SnapshotTags::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets `key`, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `k1:v1,k2:v2`, or `None` when there is nothing to attach.
    pub fn joined(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
        Some(parts.join(","))
    }
}

/// The content addressable store that physically holds the snapshots.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn create_repository(
        &self,
        handle: &RepositoryHandle,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Makes every future snapshot skip the content of `folder`.
    async fn set_ignore_policy(
        &self,
        handle: &RepositoryHandle,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn create_snapshot(
        &self,
        handle: &RepositoryHandle,
        path: &Path,
        tags: &SnapshotTags,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// A repository bound to its backend and to the PGDATA it protects.
#[derive(Clone)]
pub struct SnapshotRepository {
    handle: RepositoryHandle,
    backend: Arc<dyn SnapshotBackend>,
    pgdata: PathBuf,
}

impl SnapshotRepository {
    pub fn new(
        handle: RepositoryHandle,
        backend: Arc<dyn SnapshotBackend>,
        pgdata: impl Into<PathBuf>,
    ) -> Self {
        SnapshotRepository {
            handle,
            backend,
            pgdata: pgdata.into(),
        }
    }

    pub fn handle(&self) -> &RepositoryHandle {
        &self.handle
    }

    /// Creates the repository and installs the ignore rules.
    ///
    /// Running this against an existing repository is left to the backend,
    /// which usually refuses.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(
            provider = %self.handle.provider(),
            path = %self.handle.path().display(),
            "Creating snapshot repository"
        );
        self.backend.create_repository(&self.handle, cancel).await?;
        self.configure_ignore_folders(cancel).await
    }

    /// Takes a snapshot of `path` tagged with `tags`.
    pub async fn snapshot(
        &self,
        path: &Path,
        tags: &SnapshotTags,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::debug!(path = %path.display(), tags = ?tags.joined(), "Creating snapshot");
        self.backend
            .create_snapshot(&self.handle, path, tags, cancel)
            .await
    }

    // Tablespaces are snapshotted through their real location, and WALs are
    // archived on their own, so base snapshots must skip both folders.
    async fn configure_ignore_folders(&self, cancel: &CancellationToken) -> Result<()> {
        for folder in [WAL_FOLDER, TABLESPACES_FOLDER] {
            let folder = self.pgdata.join(folder);
            self.backend
                .set_ignore_policy(&self.handle, &folder, cancel)
                .await?;
        }
        Ok(())
    }
}
