//! Configuration types for the TMC client.
//!
//! This module provides the configuration structures that control which
//! server the client talks to, where exercises and state live on disk, and
//! how the submission poller behaves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TmcError};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "tmc.json";

/// Default TMC server base URL.
fn default_server_url() -> String {
    "https://tmc.mooc.fi".to_string()
}

/// Default OAuth client name registered on the server.
fn default_client_name() -> String {
    "vscode_plugin".to_string()
}

/// Default client version reported to the server.
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Default data directory.
fn default_data_dir() -> String {
    ".tmc-data".to_string()
}

/// Default tmc-langs CLI executable.
fn default_langs_cli() -> String {
    "tmc-langs-cli".to_string()
}

/// Default interval between submission status polls.
const fn default_poll_interval_ms() -> u64 {
    2500
}

/// Default elapsed time after which the user is offered to detach.
const fn default_escalation_secs() -> u64 {
    120
}

/// Default delay for "remind me later" on new exercises (30 minutes).
const fn default_notification_delay_secs() -> u64 {
    1800
}

/// Default HTTP request timeout.
const fn default_request_timeout_secs() -> u64 {
    30
}

/// Main configuration for the TMC client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Base URL of the TMC server.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// OAuth client name used for credential lookup and submissions.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Client version sent along with every request.
    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Root directory for projects, workspace files and persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Path or name of the tmc-langs CLI executable.
    #[serde(default = "default_langs_cli")]
    pub langs_cli: String,

    /// Which editor flavour hosts the workspace.
    #[serde(default)]
    pub editor: EditorKind,

    /// Submission polling configuration.
    #[serde(default)]
    pub submission: SubmissionConfig,

    /// Delay applied when the user asks to be reminded about new exercises later.
    #[serde(default = "default_notification_delay_secs")]
    pub notification_delay_secs: u64,

    /// Timeout for individual HTTP requests in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            data_dir: default_data_dir(),
            langs_cli: default_langs_cli(),
            editor: EditorKind::default(),
            submission: SubmissionConfig::default(),
            notification_delay_secs: default_notification_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `tmc.json` in the current directory. If not found, returns
    /// the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            TmcError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `tmc.json` in a specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::ConfigParseError` if the file exists but contains
    /// invalid JSON, and `TmcError::ConfigValidationError` if the values
    /// are out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(TmcError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| TmcError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::ConfigValidationError` if any validation check fails.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(TmcError::config_validation(
                "serverUrl must not be empty",
                "Set serverUrl to the TMC server address in your tmc.json, e.g. https://tmc.mooc.fi",
            ));
        }

        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(TmcError::config_validation(
                format!("serverUrl '{}' is not an http(s) URL", self.server_url),
                "Prefix serverUrl with https:// in your tmc.json",
            ));
        }

        if self.client_name.trim().is_empty() {
            return Err(TmcError::config_validation(
                "clientName must not be empty",
                "Set clientName to the OAuth application name in your tmc.json",
            ));
        }

        if self.data_dir.trim().is_empty() {
            return Err(TmcError::config_validation(
                "dataDir must not be empty",
                "Provide a valid data directory in your tmc.json",
            ));
        }

        if self.submission.poll_interval_ms == 0 {
            return Err(TmcError::config_validation(
                "submission.pollIntervalMs must be greater than 0",
                "Set submission.pollIntervalMs to at least 1 in your tmc.json",
            ));
        }

        if self.submission.escalation_secs == 0 {
            return Err(TmcError::config_validation(
                "submission.escalationSecs must be greater than 0",
                "Set submission.escalationSecs to at least 1 second in your tmc.json",
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(TmcError::config_validation(
                "requestTimeoutSecs must be greater than 0",
                "Set requestTimeoutSecs to at least 1 second in your tmc.json",
            ));
        }

        Ok(())
    }

    /// Returns the on-disk layout derived from `data_dir`.
    #[must_use]
    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_dir)
    }

    /// Returns the HTTP request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the "remind me later" delay.
    #[must_use]
    pub fn notification_delay(&self) -> chrono::Duration {
        let secs = i64::try_from(self.notification_delay_secs).unwrap_or(i64::MAX);
        chrono::Duration::seconds(secs.min(i64::MAX / 1000))
    }
}

/// Editor flavour hosting the workspace.
///
/// Some extension recommendations only exist on the official build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EditorKind {
    /// Visual Studio Code (default).
    #[default]
    Code,
    /// An open-source build without the proprietary marketplace.
    Codium,
}

impl EditorKind {
    /// Parses a string into an `EditorKind`, case-insensitively.
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "code" | "vscode" => Some(Self::Code),
            "codium" | "vscodium" => Some(Self::Codium),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for EditorKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid editor '{s}': expected one of 'code', 'codium'"
            ))
        })
    }
}

impl Serialize for EditorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            Self::Code => "code",
            Self::Codium => "codium",
        };
        serializer.serialize_str(s)
    }
}

/// Submission polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionConfig {
    /// Fixed interval between status polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Elapsed seconds after which the caller is offered to detach.
    #[serde(default = "default_escalation_secs")]
    pub escalation_secs: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            escalation_secs: default_escalation_secs(),
        }
    }
}

impl SubmissionConfig {
    /// Returns the poll interval as a `Duration`.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the escalation threshold as a `Duration`.
    #[must_use]
    pub const fn escalation_threshold(&self) -> Duration {
        Duration::from_secs(self.escalation_secs)
    }
}

/// Filesystem layout under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    /// The data directory itself.
    pub root: PathBuf,
    /// Root of all downloaded exercises, `<root>/projects`.
    pub projects: PathBuf,
    /// Directory holding one `.code-workspace` file per course.
    pub workspaces: PathBuf,
    /// Persisted course records.
    pub user_data: PathBuf,
    /// Persisted exercise records.
    pub exercises: PathBuf,
    /// Persisted key/value settings.
    pub settings: PathBuf,
    /// Persisted OAuth token.
    pub credentials: PathBuf,
}

impl DataPaths {
    /// Derives every path from a data directory.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            projects: root.join("projects"),
            workspaces: root.join("workspaces"),
            user_data: root.join("user-data.json"),
            exercises: root.join("exercises.json"),
            settings: root.join("settings.json"),
            credentials: root.join("credentials.json"),
            root,
        }
    }

    /// Returns the workspace descriptor path for a course.
    #[must_use]
    pub fn workspace_file(&self, course: &str) -> PathBuf {
        self.workspaces.join(format!("{course}.code-workspace"))
    }

    /// Returns the directory an exercise is extracted into.
    #[must_use]
    pub fn exercise_dir(&self, course: &str, exercise: &str) -> PathBuf {
        self.projects.join(course).join(exercise)
    }
}
