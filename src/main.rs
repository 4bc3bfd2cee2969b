//! PostgreSQL physical backup tool
//!
//! Takes online backups into a kopia repository and archives WAL files
//! for point-in-time recovery.

// pgsnapshot/src/main.rs
use anyhow::{Context, Result};
use pgsnapshot::backup;
use pgsnapshot::config::{AppConfig, PluginMetadata};
use pgsnapshot::utils::run_blocking;
use pgsnapshot::wal::WalArchiveStore;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.json";
const CONFIG_PATH_ENV: &str = "PGSNAPSHOT_CONFIG";

const USAGE: &str = "usage:
  pgsnapshot init <cluster>
  pgsnapshot backup <job-name> <cluster>
  pgsnapshot wal-archive <source-file> <cluster>
  pgsnapshot wal-restore <wal-name> <destination> <cluster>
  pgsnapshot wal-status <cluster>";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let metadata = PluginMetadata::current();
    tracing::info!(name = metadata.name, version = metadata.version, "{}", metadata.display_name);

    let config_path = env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let args: Vec<String> = env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["init", cluster] => {
            backup::initialize_repository(&app_config, cluster, &cancel)
                .await
                .with_context(|| format!("Repository initialization failed for cluster {}", cluster))?;
            println!("Repository initialized for cluster {}", cluster);
        }
        ["backup", job_name, cluster] => {
            let outcome = backup::run_backup_flow(&app_config, job_name, cluster, &cancel)
                .await
                .context("Backup process failed")?;
            println!("{}", outcome_json(&outcome));
        }
        ["wal-archive", source, cluster] => {
            let store = WalArchiveStore::new(app_config.paths.clone());
            let (source_file, cluster_name) = (PathBuf::from(source), cluster.to_string());
            run_blocking("wal-archive", &cancel, move || store.archive(&source_file, &cluster_name))
                .await
                .with_context(|| format!("Failed to archive WAL file {}", source))?;
        }
        ["wal-restore", wal_name, destination, cluster] => {
            let store = WalArchiveStore::new(app_config.paths.clone());
            let (wal, destination_file, cluster_name) =
                (wal_name.to_string(), PathBuf::from(destination), cluster.to_string());
            run_blocking("wal-restore", &cancel, move || {
                store.restore(&wal, &destination_file, &cluster_name)
            })
            .await
            .with_context(|| format!("Failed to restore WAL file {}", wal_name))?;
        }
        ["wal-status", cluster] => {
            let store = WalArchiveStore::new(app_config.paths.clone());
            let cluster_name = cluster.to_string();
            let status = run_blocking("wal-status", &cancel, move || store.status(&cluster_name))
                .await
                .context("Failed to read the WAL archive status")?;
            println!(
                "{}",
                serde_json::json!({ "firstWal": status.first_wal, "lastWal": status.last_wal })
            );
        }
        _ => {
            eprintln!("{}", USAGE);
            anyhow::bail!("Invalid operation: {:?}", args);
        }
    }
    Ok(())
}

fn outcome_json(outcome: &backup::BackupOutcome) -> serde_json::Value {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    serde_json::json!({
        "backupId": outcome.backup_id,
        "backupName": outcome.backup_name,
        "startedAt": outcome.started_at,
        "stoppedAt": outcome.stopped_at,
        "beginWal": outcome.begin_wal,
        "endWal": outcome.end_wal,
        "beginLsn": outcome.begin_lsn,
        "endLsn": outcome.end_lsn,
        "backupLabelFile": BASE64.encode(&outcome.backup_label_file),
        "tablespaceMapFile": BASE64.encode(&outcome.tablespace_map_file),
        "online": outcome.online,
    })
}
