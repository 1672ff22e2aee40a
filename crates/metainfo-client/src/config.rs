use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML for the target type.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// The file is not valid JSON for the target type.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// The file extension is neither `toml` nor `json`.
    #[error("unsupported config file extension: {0:?}")]
    UnsupportedExtension(String),
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext.to_lowercase().as_str() {
        "toml" => Ok(toml::from_str(&contents)?),
        "json" => Ok(serde_json::from_str(&contents)?),
        _ => Err(ConfigError::UnsupportedExtension(ext.to_string())),
    }
}

/// Settings for dialing the coordinator and driving requests over the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Coordinator address handed to the dialer.
    pub coordinator_addr: String,
    /// API key attached to every call on the channel.
    pub api_key: String,
    /// Upper bound on establishing the channel, in milliseconds.
    pub dial_timeout_ms: u64,
    /// Deadline applied to operations whose context carries none; `0` disables it.
    pub request_timeout_ms: u64,
    /// Page size used when a listing asks for `limit = 0`.
    pub default_list_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: String::from("127.0.0.1:7777"),
            api_key: String::new(),
            dial_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            default_list_limit: 1000,
        }
    }
}

impl ClientConfig {
    /// Loads a `.toml` or `.json` file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load(path)
    }

    /// Dial timeout, or `None` when set to zero.
    pub fn dial_timeout(&self) -> Option<Duration> {
        (self.dial_timeout_ms > 0).then(|| Duration::from_millis(self.dial_timeout_ms))
    }

    /// Fallback request deadline, or `None` when set to zero.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// How the in-memory coordinator treats a second attribution for the same bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionPolicy {
    /// A different partner for an already attributed bucket is rejected.
    #[default]
    RejectConflicting,
    /// The latest partner replaces the previous one.
    Overwrite,
}

/// Settings for [`crate::memory::MemoryCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCoordinatorConfig {
    /// Largest page a listing returns regardless of the requested limit.
    pub max_list_limit: u32,
    /// Lifetime of issued piece authorizations, in seconds.
    pub order_expiration_secs: u64,
    /// Treatment of repeated bucket attribution.
    pub attribution_policy: AttributionPolicy,
}

impl Default for MemoryCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_list_limit: 1000,
            order_expiration_secs: 3600,
            attribution_policy: AttributionPolicy::RejectConflicting,
        }
    }
}

impl MemoryCoordinatorConfig {
    /// Loads a `.toml` or `.json` file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load(path)
    }
}
