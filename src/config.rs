use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

/// User configuration for the bench client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchSettings {
    #[serde(default)]
    pub helper: HelperSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    /// Optional override for the JSON-L run history location.
    #[serde(default)]
    pub history_path: Option<PathBuf>,
    #[serde(default)]
    pub logging: LogSettings,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            helper: HelperSettings::default(),
            upload: UploadSettings::default(),
            history_path: None,
            logging: LogSettings::default(),
        }
    }
}

impl BenchSettings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            parsed.helper.endpoint_url()?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Resolve path to the JSON-L run history file.
    pub fn resolve_history_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.history_path {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("history").join("runs.jsonl"))
    }
}

/// Where and how to reach the local bench helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperSettings {
    #[serde(default = "HelperSettings::default_endpoint")]
    pub endpoint: String,
    /// The helper serves a self-signed certificate on localhost.
    #[serde(default = "bool_true")]
    pub accept_invalid_certs: bool,
    #[serde(default = "HelperSettings::default_user_agent")]
    pub user_agent: String,
    /// No timeout unless set; cancellation is the normal way to interrupt a run.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl HelperSettings {
    pub const DEFAULT_ENDPOINT: &'static str = "https://127.0.0.1:5050";

    fn default_endpoint() -> String {
        Self::DEFAULT_ENDPOINT.into()
    }

    fn default_user_agent() -> String {
        format!("sweperf-bench/{}", env!("CARGO_PKG_VERSION"))
    }

    /// Parsed endpoint; only http(s) base URLs are accepted.
    pub fn endpoint_url(&self) -> Result<Url> {
        let url = Url::parse(self.endpoint.trim())
            .with_context(|| format!("Invalid helper endpoint '{}'", self.endpoint))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!(
                "Helper endpoint '{}' must use http or https",
                self.endpoint
            );
        }
        Ok(url)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            accept_invalid_certs: true,
            user_agent: Self::default_user_agent(),
            request_timeout_secs: None,
        }
    }
}

/// Auto-upload retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UploadSettings {
    #[serde(default = "UploadSettings::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "UploadSettings::default_backoff_secs")]
    pub backoff_secs: u64,
}

impl UploadSettings {
    const fn default_max_attempts() -> u32 {
        3
    }

    const fn default_backoff_secs() -> u64 {
        600
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff_secs: Self::default_backoff_secs(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Mirror events as JSON lines into `directory`.
    #[serde(default)]
    pub json_file: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "LogSettings::default_max_files")]
    pub max_files: usize,
}

impl LogSettings {
    const fn default_max_files() -> usize {
        10
    }

    pub fn resolve_directory(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.directory {
            return Ok(dir.clone());
        }
        Ok(project_dirs()?.cache_dir().join("logs"))
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            json_file: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "sweperf", "SWE-Perf")
        .context("Unable to resolve platform data directory")
}

/// Compute the default path to the client configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}
