// pgsnapshot/src/errors.rs
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported storage provider: {0}")]
    UnsupportedProvider(String),

    #[error("Backup mode not started (last observed phase: {last_phase})")]
    BackupNotStarted { last_phase: String },

    #[error("Backup mode not stopped (last observed phase: {last_phase})")]
    BackupNotStopped { last_phase: String },

    #[error("Command `{program} {}` failed with {status}: {output}", .args.join(" "))]
    Command {
        program: String,
        args: Vec<String>,
        status: ExitStatus,
        output: String,
    },

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Error while querying the pg_controldata endpoint: {status}: {body}")]
    ControlData { status: u16, body: String },

    #[error("Backup control plane error: {0}")]
    ControlPlane(String),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}: please run the backup before trying to access this value")]
    NotYetExecuted(&'static str),

    #[error("{0}: the backup ended before this value was recorded")]
    WalBoundaryUnavailable(&'static str),

    #[error("Backup executor already ran a job")]
    AlreadyExecuted,

    #[error("Invalid WAL file name: {0:?}")]
    InvalidWalName(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AppError {
    /// Wraps an `std::io::Error` with the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
