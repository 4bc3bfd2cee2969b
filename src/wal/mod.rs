// pgsnapshot/src/wal/mod.rs
//! WAL archive: one file per segment under `<cluster>/wals/<shard>/`.
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::errors::{AppError, Result};
use crate::storage::PathScheme;

/// Oldest and newest WAL file found in an archive. Empty when unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalArchiveStatus {
    pub first_wal: String,
    pub last_wal: String,
}

#[derive(Debug, Clone, Copy)]
enum Pick {
    First,
    Last,
}

/// Copies WAL files in and out of the archive of a cluster.
#[derive(Debug, Clone, Default)]
pub struct WalArchiveStore {
    scheme: PathScheme,
}

impl WalArchiveStore {
    pub fn new(scheme: PathScheme) -> Self {
        WalArchiveStore { scheme }
    }

    /// Archives `source_file` under its base name.
    pub fn archive(&self, source_file: &Path, cluster: &str) -> Result<PathBuf> {
        let wal_name = source_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::InvalidWalName(source_file.display().to_string()))?;
        let destination = self.scheme.wal_file_path(cluster, wal_name)?;

        tracing::info!(
            cluster,
            source = %source_file.display(),
            destination = %destination.display(),
            "Archiving WAL file"
        );
        copy_file(source_file, &destination).inspect_err(|e| {
            tracing::error!(cluster, wal = wal_name, error = %e, "Error archiving WAL file");
        })?;
        Ok(destination)
    }

    /// Copies the archived `wal_name` to `destination_file`.
    pub fn restore(&self, wal_name: &str, destination_file: &Path, cluster: &str) -> Result<()> {
        let source = self.scheme.wal_file_path(cluster, wal_name)?;

        tracing::info!(
            cluster,
            wal = wal_name,
            source = %source.display(),
            destination = %destination_file.display(),
            "Restoring WAL file"
        );
        copy_file(&source, destination_file).inspect_err(|e| {
            tracing::info!(cluster, wal = wal_name, error = %e, "WAL file not restored");
        })
    }

    /// First and last archived WAL file of `cluster`.
    ///
    /// Entries are ordered by file name, which for standard WAL naming is
    /// also chronological order.
    pub fn status(&self, cluster: &str) -> Result<WalArchiveStatus> {
        let wal_root = self.scheme.wal_root(cluster);
        let shards = sorted_entries(&wal_root)?;

        let status = WalArchiveStatus {
            first_wal: pick_wal(&wal_root, &shards, Pick::First)?,
            last_wal: pick_wal(&wal_root, &shards, Pick::Last)?,
        };
        tracing::debug!(cluster, wal_root = %wal_root.display(), ?status, "WAL archive status");
        Ok(status)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .and_then(|entries| entries.collect::<io::Result<Vec<_>>>())
        .map_err(|e| AppError::io(dir, e))?;
    entries.sort_by_key(|entry| entry.file_name());
    Ok(entries)
}

fn pick(entries: &[fs::DirEntry], which: Pick) -> Option<&fs::DirEntry> {
    match which {
        Pick::First => entries.first(),
        Pick::Last => entries.last(),
    }
}

fn pick_wal(wal_root: &Path, shards: &[fs::DirEntry], which: Pick) -> Result<String> {
    let Some(shard) = pick(shards, which) else {
        return Ok(String::new());
    };

    let shard_path = wal_root.join(shard.file_name());
    let is_dir = shard
        .file_type()
        .map_err(|e| AppError::io(&shard_path, e))?
        .is_dir();
    if !is_dir {
        return Err(AppError::io(
            &shard_path,
            io::Error::new(io::ErrorKind::InvalidData, "not a directory"),
        ));
    }

    let wals = sorted_entries(&shard_path)?;
    Ok(pick(&wals, which)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .unwrap_or_default())
}

// Writes into a temporary sibling first so `destination` is either absent
// or complete.
fn copy_file(source: &Path, destination: &Path) -> Result<()> {
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| AppError::io(&parent, e))?;

    let mut input = File::open(source).map_err(|e| AppError::io(source, e))?;
    let mut staged = NamedTempFile::new_in(&parent).map_err(|e| AppError::io(&parent, e))?;
    io::copy(&mut input, &mut staged).map_err(|e| AppError::io(staged.path(), e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| AppError::io(staged.path(), e))?;
    staged
        .persist(destination)
        .map_err(|e| AppError::io(destination, e.error))?;
    Ok(())
}
