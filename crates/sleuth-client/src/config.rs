use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sleuth_protocol::paths::{self, EVENTS_PATH};

use crate::channel::http_to_ws_url;
use crate::error::{ClientError, ClientResult};
use crate::reconnect::ReconnectPolicy;

pub const BACKEND_URL_ENV: &str = "SLEUTH_BACKEND_URL";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved client settings: defaults, then the TOML file, then the
/// environment. CLI flags are applied on top by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub backend_url: String,
    /// Explicit event channel URL; derived from `backend_url` when unset.
    pub events_url: Option<String>,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub export_dir: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    backend_url: Option<String>,
    events_url: Option<String>,
    request_timeout_ms: Option<u64>,
    reconnect: Option<ReconnectPolicy>,
    export_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            events_url: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            export_dir: PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    /// Load from `path`, or from the default config path if it exists.
    /// An explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> ClientResult<Self> {
        let file = match path {
            Some(path) => read_file_config(path)?,
            None => {
                let default_path = paths::config_path();
                if default_path.exists() {
                    read_file_config(&default_path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        let env_backend = std::env::var(BACKEND_URL_ENV).ok();
        Ok(Self::layered(file, env_backend))
    }

    pub fn from_toml_str(raw: &str) -> ClientResult<Self> {
        let file = parse_file_config(raw, "<inline>")?;
        Ok(Self::layered(file, None))
    }

    fn layered(file: FileConfig, env_backend: Option<String>) -> Self {
        let defaults = Self::default();
        let backend_url = env_backend
            .filter(|url| !url.trim().is_empty())
            .or(file.backend_url)
            .unwrap_or(defaults.backend_url);
        Self {
            backend_url,
            events_url: file.events_url,
            request_timeout: file
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            reconnect: file.reconnect.unwrap_or(defaults.reconnect),
            export_dir: file.export_dir.unwrap_or(defaults.export_dir),
        }
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    /// The websocket URL for the task event channel.
    pub fn events_url(&self) -> String {
        match &self.events_url {
            Some(url) => url.clone(),
            None => format!(
                "{}{EVENTS_PATH}",
                http_to_ws_url(self.backend_url.trim_end_matches('/'))
            ),
        }
    }
}

fn read_file_config(path: &Path) -> ClientResult<FileConfig> {
    let raw = std::fs::read_to_string(path).map_err(|err| ClientError::Config {
        message: format!("failed to read config {}: {err}", path.display()),
    })?;
    parse_file_config(&raw, &path.display().to_string())
}

fn parse_file_config(raw: &str, origin: &str) -> ClientResult<FileConfig> {
    toml::from_str::<FileConfig>(raw).map_err(|err| ClientError::Config {
        message: format!("failed to parse config {origin}: {err}"),
    })
}
