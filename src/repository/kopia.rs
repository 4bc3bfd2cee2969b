// pgsnapshot/src/repository/kopia.rs
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{RepositoryHandle, SnapshotBackend, SnapshotTags};
use crate::errors::Result;
use crate::utils::run_command;

/// Snapshot backend driving the `kopia` command line tool.
#[derive(Debug, Clone)]
pub struct KopiaCli {
    binary: PathBuf,
}

impl KopiaCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        KopiaCli {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>, cancel: &CancellationToken) -> Result<()> {
        let output = run_command(&self.binary, &args, cancel).await?;
        tracing::debug!(?args, %output, "kopia command completed");
        Ok(())
    }
}

fn log_dir_arg(handle: &RepositoryHandle) -> String {
    format!("--log-dir={}", handle.log_directory().display())
}

fn config_file_arg(handle: &RepositoryHandle) -> String {
    format!("--config-file={}", handle.config_file().display())
}

pub(crate) fn repository_create_args(handle: &RepositoryHandle) -> Vec<String> {
    vec![
        "repository".to_string(),
        "create".to_string(),
        handle.provider().to_string(),
        format!("--path={}", handle.path().display()),
        config_file_arg(handle),
        log_dir_arg(handle),
        format!("--cache-directory={}", handle.cache_directory().display()),
    ]
}

pub(crate) fn policy_set_ignore_args(handle: &RepositoryHandle, folder: &Path) -> Vec<String> {
    vec![
        "policy".to_string(),
        "set".to_string(),
        folder.display().to_string(),
        "--add-ignore=.".to_string(),
        config_file_arg(handle),
        log_dir_arg(handle),
    ]
}

pub(crate) fn snapshot_create_args(
    handle: &RepositoryHandle,
    path: &Path,
    tags: &SnapshotTags,
) -> Vec<String> {
    let mut args = vec![
        "snapshot".to_string(),
        "create".to_string(),
        config_file_arg(handle),
        log_dir_arg(handle),
    ];
    if let Some(joined) = tags.joined() {
        args.push(format!("--tags={}", joined));
    }
    args.push(path.display().to_string());
    args
}

#[async_trait]
impl SnapshotBackend for KopiaCli {
    async fn create_repository(
        &self,
        handle: &RepositoryHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(repository_create_args(handle), cancel).await
    }

    async fn set_ignore_policy(
        &self,
        handle: &RepositoryHandle,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(policy_set_ignore_args(handle, folder), cancel).await
    }

    async fn create_snapshot(
        &self,
        handle: &RepositoryHandle,
        path: &Path,
        tags: &SnapshotTags,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(snapshot_create_args(handle, path, tags), cancel)
            .await
    }
}
