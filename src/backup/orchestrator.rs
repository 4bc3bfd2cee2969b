// pgsnapshot/src/backup/orchestrator.rs
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::control::{
    BackupControlClient, BackupPhase, BackupResultData, ControlDataSource, StartBackupRequest,
    StopBackupRequest,
};
use super::retry::{Attempt, RetryPolicy};
use super::tablespaces::{Tablespace, discover_tablespaces};
use crate::errors::{AppError, Result};
use crate::repository::{RepositoryHandle, SnapshotBackend, SnapshotRepository, SnapshotTags};

const SNAPSHOT_TYPE_TAG: &str = "type";
const SNAPSHOT_TYPE_BASE: &str = "base";
const SNAPSHOT_TYPE_TABLESPACE: &str = "tablespace";
const SNAPSHOT_TABLESPACE_OID_TAG: &str = "oid";

/// One backup request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub name: String,
    pub cluster: String,
    pub repository: RepositoryHandle,
}

/// What a completed backup hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub backup_id: String,
    pub backup_name: String,
    /// Unix timestamps, seconds.
    pub started_at: i64,
    pub stopped_at: i64,
    pub begin_wal: String,
    pub end_wal: String,
    pub begin_lsn: String,
    pub end_lsn: String,
    pub backup_label_file: Vec<u8>,
    pub tablespace_map_file: Vec<u8>,
    /// Only hot backups are taken.
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    DiscoveringTablespaces,
    RequestingStart,
    AwaitingStarted,
    Snapshotting,
    RequestingStop,
    AwaitingStopped,
    Completed,
    Failed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives one online backup from start to finish.
///
/// The orchestrator is single use: after `run_backup` returned, whether
/// successfully or not, further runs fail with [`AppError::AlreadyExecuted`].
pub struct BackupOrchestrator {
    control: Arc<dyn BackupControlClient>,
    control_data: Arc<dyn ControlDataSource>,
    backend: Arc<dyn SnapshotBackend>,
    pgdata: PathBuf,
    retry: RetryPolicy,

    state: OrchestratorState,
    begin_wal: Option<String>,
    end_wal: Option<String>,
}

impl BackupOrchestrator {
    pub fn new(
        control: Arc<dyn BackupControlClient>,
        control_data: Arc<dyn ControlDataSource>,
        backend: Arc<dyn SnapshotBackend>,
        pgdata: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        BackupOrchestrator {
            control,
            control_data,
            backend,
            pgdata: pgdata.into(),
            retry,
            state: OrchestratorState::Idle,
            begin_wal: None,
            end_wal: None,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    fn executed(&self) -> bool {
        matches!(self.state, OrchestratorState::Completed | OrchestratorState::Failed)
    }

    /// WAL file current when the backup started.
    pub fn begin_wal(&self) -> Result<&str> {
        self.wal_boundary(&self.begin_wal, "beginWal")
    }

    /// WAL file current when the backup stopped.
    pub fn end_wal(&self) -> Result<&str> {
        self.wal_boundary(&self.end_wal, "endWal")
    }

    fn wal_boundary<'a>(&self, value: &'a Option<String>, field: &'static str) -> Result<&'a str> {
        if !self.executed() {
            return Err(AppError::NotYetExecuted(field));
        }
        value
            .as_deref()
            .ok_or(AppError::WalBoundaryUnavailable(field))
    }

    fn enter(&mut self, job: &BackupJob, next: OrchestratorState) {
        tracing::debug!(job = %job.name, from = %self.state, to = %next, "Backup state transition");
        self.state = next;
    }

    /// Runs `job` to completion.
    pub async fn run_backup(&mut self, job: &BackupJob, cancel: &CancellationToken) -> Result<BackupOutcome> {
        if self.state != OrchestratorState::Idle {
            return Err(AppError::AlreadyExecuted);
        }

        let (result, started_at, stopped_at) = match self.execute(job, cancel).await {
            Ok(completed) => completed,
            Err(e) => {
                tracing::error!(job = %job.name, cluster = %job.cluster, state = %self.state, error = %e, "Backup failed");
                self.enter(job, OrchestratorState::Failed);
                return Err(e);
            }
        };
        self.enter(job, OrchestratorState::Completed);

        let backup_name = if result.backup_name.is_empty() {
            job.name.clone()
        } else {
            result.backup_name
        };
        let outcome = BackupOutcome {
            backup_id: backup_name.clone(),
            backup_name,
            started_at,
            stopped_at,
            begin_wal: self.begin_wal()?.to_string(),
            end_wal: self.end_wal()?.to_string(),
            begin_lsn: result.begin_lsn,
            end_lsn: result.end_lsn,
            backup_label_file: result.label_file,
            tablespace_map_file: result.spcmap_file,
            online: true,
        };
        tracing::info!(
            job = %job.name,
            cluster = %job.cluster,
            begin_wal = %outcome.begin_wal,
            end_wal = %outcome.end_wal,
            "Backup completed"
        );
        Ok(outcome)
    }

    // Returns the final backup status with the start and stop timestamps.
    async fn execute(
        &mut self,
        job: &BackupJob,
        cancel: &CancellationToken,
    ) -> Result<(BackupResultData, i64, i64)> {
        self.enter(job, OrchestratorState::DiscoveringTablespaces);
        let tablespaces = discover_tablespaces(&self.pgdata)?;
        tracing::info!(job = %job.name, count = tablespaces.len(), "Preparing physical backup");

        let started_at = Utc::now().timestamp();
        self.enter(job, OrchestratorState::RequestingStart);
        self.begin_wal = Some(self.control_data.current_wal_file(cancel).await?);
        self.request_start(job, cancel).await?;

        self.enter(job, OrchestratorState::AwaitingStarted);
        self.await_phase(BackupPhase::Started, cancel).await?;
        tracing::info!(job = %job.name, "Backup mode started");

        self.enter(job, OrchestratorState::Snapshotting);
        self.take_snapshots(job, &tablespaces, cancel).await?;

        self.enter(job, OrchestratorState::RequestingStop);
        let stop = StopBackupRequest {
            backup_name: job.name.clone(),
        };
        self.control.stop_backup(&stop, cancel).await.inspect_err(|e| {
            tracing::error!(job = %job.name, error = %e, "Error while requesting backup stop");
        })?;

        self.enter(job, OrchestratorState::AwaitingStopped);
        let result = self.await_phase(BackupPhase::Completed, cancel).await?;
        tracing::info!(job = %job.name, "Backup mode stopped");

        self.end_wal = Some(self.control_data.current_wal_file(cancel).await?);
        let stopped_at = Utc::now().timestamp();

        Ok((result, started_at, stopped_at))
    }

    async fn request_start(&self, job: &BackupJob, cancel: &CancellationToken) -> Result<()> {
        let request = StartBackupRequest {
            immediate_checkpoint: true,
            wait_for_archive: true,
            backup_name: job.name.clone(),
            force: true,
        };
        self.control.start_backup(&request, cancel).await.inspect_err(|e| {
            tracing::error!(job = %job.name, error = %e, "Error while requesting new backup on PostgreSQL");
        })
    }

    // Polls the instance until it reports `target`. Any other phase is
    // retried; running out of attempts tells which half of the protocol
    // stalled.
    async fn await_phase(&self, target: BackupPhase, cancel: &CancellationToken) -> Result<BackupResultData> {
        let control = &self.control;
        let wanted = &target;
        let stopping = target == BackupPhase::Completed;
        self.retry
            .retry(
                cancel,
                |_| async move {
                    let status = control.status(cancel).await?;
                    if status.phase == *wanted {
                        Ok::<_, AppError>(Attempt::Ready(status))
                    } else {
                        tracing::trace!(phase = %status.phase, expected = %wanted, "Backup phase not reached yet");
                        Ok(Attempt::Pending(status.phase.to_string()))
                    }
                },
                |last_phase| {
                    if stopping {
                        AppError::BackupNotStopped { last_phase }
                    } else {
                        AppError::BackupNotStarted { last_phase }
                    }
                },
            )
            .await
    }

    async fn take_snapshots(
        &self,
        job: &BackupJob,
        tablespaces: &[Tablespace],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let repository = SnapshotRepository::new(job.repository.clone(), self.backend.clone(), &self.pgdata);

        tracing::info!(job = %job.name, path = %self.pgdata.display(), "Taking snapshot of data directory");
        let base_tags = SnapshotTags::new().with(SNAPSHOT_TYPE_TAG, SNAPSHOT_TYPE_BASE);
        repository.snapshot(&self.pgdata, &base_tags, cancel).await?;

        for tablespace in tablespaces {
            tracing::info!(job = %job.name, oid = %tablespace.oid, path = %tablespace.path.display(), "Taking snapshot of tablespace");
            let tags = SnapshotTags::new()
                .with(SNAPSHOT_TYPE_TAG, SNAPSHOT_TYPE_TABLESPACE)
                .with(SNAPSHOT_TABLESPACE_OID_TAG, tablespace.oid.as_str());
            repository.snapshot(&tablespace.path, &tags, cancel).await?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    use crate::backup::control::CURRENT_WAL_FILE_KEY;
    use crate::repository::TABLESPACES_FOLDER;

    type Events = Arc<Mutex<Vec<String>>>;

    fn status(phase: &str) -> BackupResultData {
        BackupResultData {
            backup_name: "backup-1".into(),
            phase: BackupPhase::from(phase.to_string()),
            ..BackupResultData::default()
        }
    }

    fn completed() -> BackupResultData {
        BackupResultData {
            begin_lsn: "0/3000028".into(),
            end_lsn: "0/5000100".into(),
            label_file: b"START WAL LOCATION: 0/3000028".to_vec(),
            spcmap_file: b"16384 /data/ts1".to_vec(),
            ..status("completed")
        }
    }

    struct FakeControl {
        events: Events,
        statuses: Mutex<VecDeque<BackupResultData>>,
        fail_start: bool,
    }

    #[async_trait]
    impl BackupControlClient for FakeControl {
        async fn start_backup(&self, request: &StartBackupRequest, _cancel: &CancellationToken) -> Result<()> {
            assert!(request.immediate_checkpoint && request.wait_for_archive && request.force);
            self.events.lock().unwrap().push(format!("start:{}", request.backup_name));
            if self.fail_start {
                return Err(AppError::ControlPlane("connection refused".into()));
            }
            Ok(())
        }

        async fn stop_backup(&self, request: &StopBackupRequest, _cancel: &CancellationToken) -> Result<()> {
            self.events.lock().unwrap().push(format!("stop:{}", request.backup_name));
            Ok(())
        }

        async fn status(&self, _cancel: &CancellationToken) -> Result<BackupResultData> {
            self.events.lock().unwrap().push("status".into());
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| status("starting")))
        }
    }

    struct FakeControlData {
        events: Events,
        wals: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl ControlDataSource for FakeControlData {
        async fn control_data(&self, _cancel: &CancellationToken) -> Result<HashMap<String, String>> {
            self.events.lock().unwrap().push("controldata".into());
            let wal = self.wals.lock().unwrap().pop_front().unwrap_or_default();
            Ok(HashMap::from([(CURRENT_WAL_FILE_KEY.to_string(), wal)]))
        }
    }

    struct FakeBackend {
        events: Events,
        snapshots: Mutex<Vec<(PathBuf, SnapshotTags)>>,
        fail: bool,
    }

    #[async_trait]
    impl SnapshotBackend for FakeBackend {
        async fn create_repository(&self, _h: &RepositoryHandle, _c: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn set_ignore_policy(&self, _h: &RepositoryHandle, _f: &Path, _c: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn create_snapshot(
            &self,
            _handle: &RepositoryHandle,
            path: &Path,
            tags: &SnapshotTags,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.events.lock().unwrap().push(format!("snapshot:{}", tags.joined().unwrap_or_default()));
            if self.fail {
                return Err(AppError::Config("disk full".into()));
            }
            self.snapshots.lock().unwrap().push((path.to_path_buf(), tags.clone()));
            Ok(())
        }
    }

    struct Harness {
        events: Events,
        backend: Arc<FakeBackend>,
        orchestrator: BackupOrchestrator,
        _pgdata: TempDir,
        pgdata: PathBuf,
    }

    fn harness(statuses: Vec<BackupResultData>, fail_start: bool, fail_snapshot: bool) -> Harness {
        let pgdata = TempDir::new().unwrap();
        fs::create_dir(pgdata.path().join(TABLESPACES_FOLDER)).unwrap();
        let events: Events = Arc::default();

        let control = Arc::new(FakeControl {
            events: events.clone(),
            statuses: Mutex::new(statuses.into()),
            fail_start,
        });
        let control_data = Arc::new(FakeControlData {
            events: events.clone(),
            wals: Mutex::new(
                vec![
                    "000000010000000000000003".to_string(),
                    "000000010000000000000005".to_string(),
                ]
                .into(),
            ),
        });
        let backend = Arc::new(FakeBackend {
            events: events.clone(),
            snapshots: Mutex::default(),
            fail: fail_snapshot,
        });
        let orchestrator = BackupOrchestrator::new(
            control,
            control_data,
            backend.clone(),
            pgdata.path(),
            RetryPolicy::immediate(10),
        );
        Harness {
            events,
            backend,
            orchestrator,
            pgdata: pgdata.path().to_path_buf(),
            _pgdata: pgdata,
        }
    }

    fn job() -> BackupJob {
        BackupJob {
            name: "backup-1".into(),
            cluster: "cluster-example".into(),
            repository: RepositoryHandle::new("s3", "/backup/c/base", "/backup/c/.kopia.config", "/backup/c/.kopia.cache")
                .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_backup_without_tablespaces() -> Result<()> {
        let mut h = harness(vec![status("starting"), status("started"), status("closing"), completed()], false, false);

        let outcome = h.orchestrator.run_backup(&job(), &CancellationToken::new()).await?;

        let snapshots = h.backend.snapshots.lock().unwrap().clone();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].0, h.pgdata);
        assert_eq!(snapshots[0].1.joined().as_deref(), Some("type:base"));

        assert_eq!(outcome.begin_wal, "000000010000000000000003");
        assert_eq!(outcome.end_wal, "000000010000000000000005");
        assert_ne!(outcome.begin_wal, outcome.end_wal);
        assert_eq!(outcome.begin_lsn, "0/3000028");
        assert_eq!(outcome.end_lsn, "0/5000100");
        assert_eq!(outcome.backup_name, "backup-1");
        assert_eq!(outcome.backup_label_file, b"START WAL LOCATION: 0/3000028");
        assert!(outcome.online);
        assert!(outcome.started_at <= outcome.stopped_at);

        assert_eq!(h.orchestrator.state(), OrchestratorState::Completed);
        assert_eq!(h.orchestrator.begin_wal()?, "000000010000000000000003");
        assert_eq!(h.orchestrator.end_wal()?, "000000010000000000000005");
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_steps_run_in_order() -> Result<()> {
        let mut h = harness(vec![status("started"), completed()], false, false);
        h.orchestrator.run_backup(&job(), &CancellationToken::new()).await?;

        assert_eq!(
            h.events.lock().unwrap().clone(),
            vec![
                "controldata",
                "start:backup-1",
                "status",
                "snapshot:type:base",
                "stop:backup-1",
                "status",
                "controldata",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_with_tablespaces() -> Result<()> {
        let mut h = harness(vec![status("started"), completed()], false, false);
        let tblspc = h.pgdata.join(TABLESPACES_FOLDER);
        symlink("/data/ts1", tblspc.join("16384")).unwrap();
        symlink("/data/ts2", tblspc.join("16385")).unwrap();

        h.orchestrator.run_backup(&job(), &CancellationToken::new()).await?;

        let snapshots = h.backend.snapshots.lock().unwrap().clone();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].1.get("type"), Some("base"));

        let mut tablespaces: Vec<(String, PathBuf)> = snapshots[1..]
            .iter()
            .map(|(path, tags)| {
                assert_eq!(tags.get("type"), Some("tablespace"));
                (tags.get("oid").unwrap_or_default().to_string(), path.clone())
            })
            .collect();
        tablespaces.sort();
        assert_eq!(
            tablespaces,
            vec![
                ("16384".to_string(), PathBuf::from("/data/ts1")),
                ("16385".to_string(), PathBuf::from("/data/ts2")),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_never_started() {
        let mut h = harness(vec![], false, false);

        let err = h.orchestrator.run_backup(&job(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AppError::BackupNotStarted { ref last_phase } if last_phase == "starting"));
        let polls = h.events.lock().unwrap().iter().filter(|e| *e == "status").count();
        assert_eq!(polls, 10);
        assert!(h.backend.snapshots.lock().unwrap().is_empty());
        assert_eq!(h.orchestrator.state(), OrchestratorState::Failed);
    }

    #[tokio::test]
    async fn test_backup_never_stopped() {
        let mut statuses = vec![status("started")];
        statuses.extend((0..10).map(|_| status("closing")));
        let mut h = harness(statuses, false, false);

        let err = h.orchestrator.run_backup(&job(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AppError::BackupNotStopped { ref last_phase } if last_phase == "closing"));
        // begin was recorded, end never was
        assert_eq!(h.orchestrator.begin_wal().ok(), Some("000000010000000000000003"));
        assert!(matches!(h.orchestrator.end_wal(), Err(AppError::WalBoundaryUnavailable(_))));
    }

    #[tokio::test]
    async fn test_snapshot_failure_aborts_before_stop() {
        let mut h = harness(vec![status("started"), completed()], false, true);

        let result = h.orchestrator.run_backup(&job(), &CancellationToken::new()).await;

        assert!(result.is_err());
        let events = h.events.lock().unwrap().clone();
        assert!(!events.iter().any(|e| e.starts_with("stop:")));
    }

    #[tokio::test]
    async fn test_start_request_failure_is_fatal() {
        let mut h = harness(vec![status("started"), completed()], true, false);

        let err = h.orchestrator.run_backup(&job(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AppError::ControlPlane(_)));
        assert!(!h.events.lock().unwrap().iter().any(|e| e == "status"));
    }

    #[tokio::test]
    async fn test_missing_tablespace_folder_fails_before_start() {
        let mut h = harness(vec![status("started"), completed()], false, false);
        fs::remove_dir(h.pgdata.join(TABLESPACES_FOLDER)).unwrap();

        let err = h.orchestrator.run_backup(&job(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AppError::Io { .. }));
        assert!(h.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wal_accessors_fail_before_run() {
        let h = harness(vec![], false, false);
        assert!(matches!(h.orchestrator.begin_wal(), Err(AppError::NotYetExecuted("beginWal"))));
        assert!(matches!(h.orchestrator.end_wal(), Err(AppError::NotYetExecuted("endWal"))));
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_orchestrator_is_single_use() -> Result<()> {
        let mut h = harness(vec![status("started"), completed()], false, false);
        h.orchestrator.run_backup(&job(), &CancellationToken::new()).await?;

        let err = h.orchestrator.run_backup(&job(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExecuted));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_backup_reports_cancellation() {
        let mut h = harness(vec![], false, false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.orchestrator.run_backup(&job(), &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)));
    }
}
