// pgsnapshot/src/config/mod.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backup::{InstanceEndpoint, RetryPolicy};
use crate::errors::{AppError, Result};
use crate::repository::StorageProvider;
use crate::storage::PathScheme;
use crate::utils::find_kopia_executable;

pub const DEFAULT_PGDATA: &str = "/var/lib/postgresql/data/pgdata";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonInstanceConfig {
    pub host: Option<String>,
    pub status_port: Option<u16>,
    pub webserver_port: Option<u16>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawJsonConfig {
    pub base_path: Option<PathBuf>,
    pub pgdata: Option<PathBuf>,
    pub storage_provider: Option<String>,
    pub kopia_binary: Option<PathBuf>,
    pub instance: Option<JsonInstanceConfig>,
    pub retry: Option<RetryPolicy>,
}

/// Resolved, immutable application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub paths: PathScheme,
    pub pgdata: PathBuf,
    pub storage_provider: StorageProvider,
    pub kopia_binary: Option<PathBuf>,
    pub instance: InstanceEndpoint,
    pub retry: RetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            paths: PathScheme::default(),
            pgdata: PathBuf::from(DEFAULT_PGDATA),
            storage_provider: StorageProvider::S3,
            kopia_binary: None,
            instance: InstanceEndpoint::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Loads `config_path`. A missing file means "all defaults".
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!(path = %config_path.display(), "No configuration file found, using defaults");
            return Ok(AppConfig::default());
        }
        let config_content =
            fs::read_to_string(config_path).map_err(|e| AppError::io(config_path, e))?;
        Self::from_json_str(&config_content).map_err(|e| match e {
            AppError::Json(inner) => AppError::Config(format!(
                "Failed to parse JSON from config file at {}: {}",
                config_path.display(),
                inner
            )),
            other => other,
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: RawJsonConfig = serde_json::from_str(content)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let defaults = AppConfig::default();

        let storage_provider = match raw.storage_provider.as_deref() {
            Some(name) => name.parse()?,
            None => defaults.storage_provider,
        };

        let pgdata = raw.pgdata.unwrap_or(defaults.pgdata);
        if !pgdata.is_absolute() {
            return Err(AppError::Config(format!(
                "pgdata must be an absolute path, got {}",
                pgdata.display()
            )));
        }

        let paths = match raw.base_path {
            Some(base) if base.as_os_str().is_empty() => {
                return Err(AppError::Config("base_path cannot be empty in config.json.".into()));
            }
            Some(base) => PathScheme::new(base),
            None => defaults.paths,
        };

        let instance = resolve_instance(raw.instance.unwrap_or_default(), defaults.instance)?;

        let retry = raw.retry.unwrap_or(defaults.retry);
        retry.validate()?;

        Ok(AppConfig {
            paths,
            pgdata,
            storage_provider,
            kopia_binary: raw.kopia_binary,
            instance,
            retry,
        })
    }

    /// The configured kopia binary, or the one found in PATH.
    pub fn kopia_binary(&self) -> Result<PathBuf> {
        match &self.kopia_binary {
            Some(path) => Ok(path.clone()),
            None => find_kopia_executable(),
        }
    }
}

fn resolve_instance(raw: JsonInstanceConfig, defaults: InstanceEndpoint) -> Result<InstanceEndpoint> {
    let host = raw.host.unwrap_or(defaults.host);
    if host.trim().is_empty() {
        return Err(AppError::Config("instance.host cannot be empty".into()));
    }
    let connect_timeout = raw
        .connect_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.connect_timeout);
    let request_timeout = raw
        .request_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.request_timeout);
    if connect_timeout.is_zero() || request_timeout.is_zero() {
        return Err(AppError::Config("instance timeouts must be greater than zero".into()));
    }

    Ok(InstanceEndpoint {
        host,
        status_port: raw.status_port.unwrap_or(defaults.status_port),
        webserver_port: raw.webserver_port.unwrap_or(defaults.webserver_port),
        connect_timeout,
        request_timeout,
    })
}

/// Identity of this tool, logged at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    pub name: &'static str,
    pub version: &'static str,
    pub display_name: &'static str,
}

impl PluginMetadata {
    pub fn current() -> Self {
        PluginMetadata {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            display_name: "PostgreSQL physical backups to a kopia repository",
        }
    }
}
