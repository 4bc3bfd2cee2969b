// pgsnapshot/src/backup/control.rs
//! Clients for the HTTP endpoints the PostgreSQL instance manager exposes:
//! the backup mode switch and the `pg_controldata` dump.
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::{AppError, Result};

const PATH_BACKUP_MODE: &str = "/pg/mode/backup";
const PATH_PG_CONTROLDATA: &str = "/pg/controldata";

/// The control data label naming the WAL file of the last checkpoint.
pub const CURRENT_WAL_FILE_KEY: &str = "Latest checkpoint's REDO WAL file";

/// Phase of the backup mode as reported by the instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum BackupPhase {
    #[default]
    NotStarted,
    Starting,
    Started,
    Closing,
    Completed,
    Other(String),
}

impl From<String> for BackupPhase {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" => BackupPhase::NotStarted,
            "starting" => BackupPhase::Starting,
            "started" => BackupPhase::Started,
            "closing" => BackupPhase::Closing,
            "completed" => BackupPhase::Completed,
            _ => BackupPhase::Other(value),
        }
    }
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupPhase::NotStarted => f.write_str("not-started"),
            BackupPhase::Starting => f.write_str("starting"),
            BackupPhase::Started => f.write_str("started"),
            BackupPhase::Closing => f.write_str("closing"),
            BackupPhase::Completed => f.write_str("completed"),
            BackupPhase::Other(phase) => f.write_str(phase),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBackupRequest {
    pub immediate_checkpoint: bool,
    pub wait_for_archive: bool,
    pub backup_name: String,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBackupRequest {
    pub backup_name: String,
}

/// Backup mode status, including the result once completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackupResultData {
    pub backup_name: String,
    #[serde(rename = "beginLSN")]
    pub begin_lsn: String,
    #[serde(rename = "endLSN")]
    pub end_lsn: String,
    #[serde(deserialize_with = "base64_bytes")]
    pub label_file: Vec<u8>,
    #[serde(deserialize_with = "base64_bytes")]
    pub spcmap_file: Vec<u8>,
    pub phase: BackupPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

// byte slices travel as base64 strings, or null when unset
fn base64_bytes<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
    match Option::<String>::deserialize(d)? {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom),
        None => Ok(Vec::new()),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    data: Option<BackupResultData>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ControlDataResponse {
    #[serde(default)]
    data: String,
    error: Option<serde_json::Value>,
}

/// Drives the backup mode of one instance.
#[async_trait]
pub trait BackupControlClient: Send + Sync {
    async fn start_backup(&self, request: &StartBackupRequest, cancel: &CancellationToken) -> Result<()>;

    async fn stop_backup(&self, request: &StopBackupRequest, cancel: &CancellationToken) -> Result<()>;

    async fn status(&self, cancel: &CancellationToken) -> Result<BackupResultData>;
}

/// Source of the parsed `pg_controldata` output.
#[async_trait]
pub trait ControlDataSource: Send + Sync {
    async fn control_data(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>>;

    /// WAL file holding the REDO point of the latest checkpoint.
    async fn current_wal_file(&self, cancel: &CancellationToken) -> Result<String> {
        let mut data = self.control_data(cancel).await?;
        match data.remove(CURRENT_WAL_FILE_KEY) {
            Some(wal) if !wal.is_empty() => Ok(wal),
            _ => Err(AppError::ControlPlane(format!(
                "pg_controldata output has no \"{}\" entry",
                CURRENT_WAL_FILE_KEY
            ))),
        }
    }
}

/// Where and how to reach the local instance manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEndpoint {
    pub host: String,
    pub status_port: u16,
    pub webserver_port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for InstanceEndpoint {
    fn default() -> Self {
        InstanceEndpoint {
            host: "127.0.0.1".to_string(),
            status_port: 8000,
            webserver_port: 8010,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn endpoint_url(host: &str, port: u16, path: &str) -> Result<Url> {
    Url::parse(&format!("http://{}:{}", host, port))
        .and_then(|base| base.join(path))
        .map_err(|e| AppError::Config(format!("Invalid instance endpoint {}:{}: {}", host, port, e)))
}

/// HTTP implementation of both [`BackupControlClient`] and [`ControlDataSource`].
#[derive(Debug, Clone)]
pub struct HttpInstanceClient {
    client: reqwest::Client,
    backup_url: Url,
    controldata_url: Url,
}

impl HttpInstanceClient {
    pub fn new(endpoint: &InstanceEndpoint) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(endpoint.connect_timeout)
            .timeout(endpoint.request_timeout)
            .build()?;
        Ok(HttpInstanceClient {
            client,
            backup_url: endpoint_url(&endpoint.host, endpoint.webserver_port, PATH_BACKUP_MODE)?,
            controldata_url: endpoint_url(&endpoint.host, endpoint.status_port, PATH_PG_CONTROLDATA)?,
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
        cancel: &CancellationToken,
    ) -> Result<(StatusCode, String)> {
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, AppError>((status, body))
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled(what.to_string())),
            result = exchange => result,
        }
    }

    async fn send_backup_mode(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupResultData> {
        let (status, body) = self.send(request, what, cancel).await?;
        if !status.is_success() {
            return Err(AppError::ControlPlane(format!(
                "{} returned {}: {}",
                what, status, body
            )));
        }
        decode_status_body(&body)
    }
}

/// Decodes a backup mode response, turning an embedded error into `Err`.
pub(crate) fn decode_status_body(body: &str) -> Result<BackupResultData> {
    if body.trim().is_empty() {
        return Ok(BackupResultData::default());
    }
    let response: StatusResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        return Err(AppError::ControlPlane(format!(
            "encountered an error while handling the backup request: {} ({})",
            error.message, error.code
        )));
    }
    Ok(response.data.unwrap_or_default())
}

pub(crate) fn decode_controldata_body(status: StatusCode, body: &str) -> Result<HashMap<String, String>> {
    if status != StatusCode::OK {
        tracing::info!(status = status.as_u16(), %body, "Error while querying the pg_controldata endpoint");
        return Err(AppError::ControlData {
            status: status.as_u16(),
            body: body.to_string(),
        });
    }
    let response: ControlDataResponse = serde_json::from_str(body)?;
    match response.error {
        Some(serde_json::Value::Null) | None => {}
        Some(serde_json::Value::String(ref s)) if s.is_empty() => {}
        Some(serde_json::Value::Object(ref map)) if map.is_empty() => {}
        Some(error) => {
            return Err(AppError::ControlPlane(format!("pg_controldata failed: {}", error)));
        }
    }
    Ok(parse_controldata(&response.data))
}

/// Parses `pg_controldata` output into label/value pairs.
pub fn parse_controldata(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[async_trait]
impl BackupControlClient for HttpInstanceClient {
    async fn start_backup(&self, request: &StartBackupRequest, cancel: &CancellationToken) -> Result<()> {
        let builder = self.client.post(self.backup_url.clone()).json(request);
        self.send_backup_mode(builder, "start backup", cancel).await?;
        Ok(())
    }

    async fn stop_backup(&self, request: &StopBackupRequest, cancel: &CancellationToken) -> Result<()> {
        let builder = self.client.put(self.backup_url.clone()).json(request);
        self.send_backup_mode(builder, "stop backup", cancel).await?;
        Ok(())
    }

    async fn status(&self, cancel: &CancellationToken) -> Result<BackupResultData> {
        let builder = self.client.get(self.backup_url.clone());
        self.send_backup_mode(builder, "backup status", cancel).await
    }
}

#[async_trait]
impl ControlDataSource for HttpInstanceClient {
    async fn control_data(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>> {
        let builder = self.client.get(self.controldata_url.clone());
        let (status, body) = self.send(builder, "pg_controldata", cancel).await?;
        decode_controldata_body(status, &body)
    }
}
