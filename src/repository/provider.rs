// pgsnapshot/src/repository/provider.rs
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

/// Storage kinds a snapshot repository can be created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    S3,
    Filesystem,
}

impl StorageProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "s3",
            StorageProvider::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageProvider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(StorageProvider::S3),
            "filesystem" => Ok(StorageProvider::Filesystem),
            other => Err(AppError::UnsupportedProvider(other.to_string())),
        }
    }
}
