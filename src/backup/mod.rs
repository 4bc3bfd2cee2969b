// pgsnapshot/src/backup/mod.rs
pub mod control;
pub mod orchestrator;
pub mod retry;
pub mod tablespaces;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::errors::Result;
use crate::repository::kopia::KopiaCli;
use crate::repository::{RepositoryHandle, SnapshotRepository};
pub use control::{HttpInstanceClient, InstanceEndpoint};
pub use orchestrator::{BackupJob, BackupOrchestrator, BackupOutcome};
pub use retry::RetryPolicy;

/// Public entry point for the backup process.
///
/// Builds the job for `cluster` from the configured layout and drives it
/// against the local instance and the kopia repository.
pub async fn run_backup_flow(
    app_config: &AppConfig,
    job_name: &str,
    cluster: &str,
    cancel: &CancellationToken,
) -> Result<BackupOutcome> {
    let job = BackupJob {
        name: job_name.to_string(),
        cluster: cluster.to_string(),
        repository: RepositoryHandle::for_cluster(
            app_config.storage_provider.as_str(),
            &app_config.paths,
            cluster,
        )?,
    };

    let instance = Arc::new(HttpInstanceClient::new(&app_config.instance)?);
    let backend = Arc::new(KopiaCli::new(app_config.kopia_binary()?));
    let mut orchestrator = BackupOrchestrator::new(
        instance.clone(),
        instance,
        backend,
        &app_config.pgdata,
        app_config.retry,
    );

    orchestrator.run_backup(&job, cancel).await
}

/// Creates the kopia repository of `cluster` with its ignore rules.
pub async fn initialize_repository(
    app_config: &AppConfig,
    cluster: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let handle = RepositoryHandle::for_cluster(
        app_config.storage_provider.as_str(),
        &app_config.paths,
        cluster,
    )?;
    let backend = Arc::new(KopiaCli::new(app_config.kopia_binary()?));
    SnapshotRepository::new(handle, backend, &app_config.pgdata)
        .initialize(cancel)
        .await
}
