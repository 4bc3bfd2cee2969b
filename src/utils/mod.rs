// pgsnapshot/src/utils/mod.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use which::which;

use crate::errors::{AppError, Result};

/// Finds the kopia executable in the system PATH.
pub fn find_kopia_executable() -> Result<PathBuf> {
    which("kopia").map_err(|e| {
        AppError::Config(format!(
            "kopia executable not found in PATH ({}). Please install kopia or set kopia_binary in config.json.",
            e
        ))
    })
}

/// Runs `program` with `args` and returns its combined stdout and stderr.
///
/// A non-zero exit is an [`AppError::Command`] carrying the arguments and
/// the output. Cancelling `cancel` kills the child.
pub async fn run_command(
    program: &Path,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<String> {
    let program_name = program.display().to_string();
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| AppError::Spawn {
            program: program_name.clone(),
            source,
        })?;

    let output = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::warn!(program = %program_name, ?args, "Cancelling running command");
            return Err(AppError::Cancelled(format!("{} {}", program_name, args.join(" "))));
        }
        output = child.wait_with_output() => output.map_err(|source| AppError::Spawn {
            program: program_name.clone(),
            source,
        })?,
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        tracing::error!(
            program = %program_name,
            ?args,
            status = %output.status,
            output = %combined,
            "Command failed"
        );
        return Err(AppError::Command {
            program: program_name,
            args: args.to_vec(),
            status: output.status,
            output: combined,
        });
    }

    Ok(combined)
}

/// Runs blocking filesystem work on the blocking pool.
///
/// Returns [`AppError::Cancelled`] as soon as `cancel` fires. The work
/// itself is not interrupted and finishes in the background.
pub async fn run_blocking<T, F>(operation: &str, cancel: &CancellationToken, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!(operation, "Cancelling blocking operation");
            Err(AppError::Cancelled(operation.to_string()))
        }
        joined = task => joined?,
    }
}
