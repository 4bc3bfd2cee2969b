// pgsnapshot/src/backup/tablespaces.rs
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, Result};
use crate::repository::TABLESPACES_FOLDER;

/// A tablespace location found while preparing a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablespace {
    /// OID of the tablespace, which is the name of its link.
    pub oid: String,
    /// Where the tablespace data actually lives.
    pub path: PathBuf,
}

/// Lists the tablespaces linked from `<data_directory>/pg_tblspc`.
///
/// Only symbolic links are considered; anything else in the folder is
/// skipped. Entries come back in directory listing order.
pub fn discover_tablespaces(data_directory: &Path) -> Result<Vec<Tablespace>> {
    let folder = data_directory.join(TABLESPACES_FOLDER);
    let entries = fs::read_dir(&folder).map_err(|e| AppError::io(&folder, e))?;

    let mut result = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| AppError::io(&folder, e))?;
        let link = entry.path();
        let file_type = entry.file_type().map_err(|e| AppError::io(&link, e))?;
        if !file_type.is_symlink() {
            tracing::debug!(entry = %link.display(), "Skipping non symlink entry in tablespace folder");
            continue;
        }

        let target = fs::read_link(&link).map_err(|e| {
            tracing::error!(link = %link.display(), error = %e, "Error while reading tablespace link");
            AppError::io(&link, e)
        })?;

        result.push(Tablespace {
            oid: entry.file_name().to_string_lossy().into_owned(),
            path: target,
        });
    }

    Ok(result)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn pgdata() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(TABLESPACES_FOLDER)).unwrap();
        dir
    }

    #[test]
    fn test_discover_returns_symlinks_with_targets() -> Result<()> {
        let data = pgdata();
        let tblspc = data.path().join(TABLESPACES_FOLDER);
        symlink("/data/ts1", tblspc.join("16384")).unwrap();
        symlink("/data/ts2", tblspc.join("16385")).unwrap();
        fs::write(tblspc.join("PG_VERSION"), "16").unwrap();
        fs::create_dir(tblspc.join("not-a-link")).unwrap();

        let mut found = discover_tablespaces(data.path())?;
        found.sort_by(|a, b| a.oid.cmp(&b.oid));

        assert_eq!(
            found,
            vec![
                Tablespace { oid: "16384".into(), path: PathBuf::from("/data/ts1") },
                Tablespace { oid: "16385".into(), path: PathBuf::from("/data/ts2") },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_discover_empty_folder() -> Result<()> {
        let data = pgdata();
        assert!(discover_tablespaces(data.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_folder_is_fatal() {
        let data = TempDir::new().unwrap();
        let err = discover_tablespaces(data.path()).unwrap_err();
        assert!(matches!(err, AppError::Io { path, .. } if path.ends_with(TABLESPACES_FOLDER)));
    }

    #[test]
    fn test_link_target_need_not_exist() -> Result<()> {
        // read_link does not require the target to exist
        let data = pgdata();
        symlink("/does/not/exist", data.path().join(TABLESPACES_FOLDER).join("16390")).unwrap();
        let found = discover_tablespaces(data.path())?;
        assert_eq!(found[0].path, PathBuf::from("/does/not/exist"));
        Ok(())
    }
}
