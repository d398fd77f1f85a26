//! Interfaces of the services the core depends on but does not own.
//!
//! The host (an IDE extension or the `tmc` binary) supplies implementations
//! for user notification, token persistence, key/value settings and the
//! local exercise runner. JSON-file backed settings and credentials are
//! provided here since every host needs them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TmcError};
use crate::store::{read_json_file, write_json_file};

// ============================================================================
// NotificationSink
// ============================================================================

/// Severity of a user notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    /// Informational message.
    Info,
    /// Something the user should look at.
    Warning,
    /// A failed operation.
    Error,
}

/// Channel for everything user-visible.
///
/// The core never renders UI itself.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Shows a message.
    async fn notify(&self, level: NotificationLevel, message: &str);

    /// Asks the user to pick one of `choices`.
    ///
    /// Returns the chosen index, or `None` if the prompt was dismissed.
    async fn ask(&self, message: &str, choices: &[&str]) -> Option<usize>;

    /// Reports a course's disabled flag and new exercise ids after a refresh.
    async fn course_status_changed(&self, course_id: u64, disabled: bool, new_exercise_ids: &[u64]);
}

// ============================================================================
// CredentialStore
// ============================================================================

/// Persistence for the OAuth access token.
pub trait CredentialStore: Send + Sync {
    /// Returns the stored token, if any.
    fn load_token(&self) -> Result<Option<String>>;

    /// Stores a token, replacing any previous one.
    fn store_token(&self, token: &str) -> Result<()>;

    /// Removes the stored token.
    fn clear_token(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredentials {
    access_token: String,
}

/// Stores the access token in a JSON file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Creates a store backed by `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_token(&self) -> Result<Option<String>> {
        let stored: Option<StoredCredentials> = read_json_file(&self.path)?;
        Ok(stored.map(|s| s.access_token))
    }

    fn store_token(&self, token: &str) -> Result<()> {
        write_json_file(
            &self.path,
            &StoredCredentials {
                access_token: token.to_string(),
            },
        )
    }

    fn clear_token(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// SettingsStore
// ============================================================================

/// Returns the settings key holding a course's closed exercise slugs.
#[must_use]
pub fn closed_exercises_key(course: &str) -> String {
    format!("closed-exercises-for:{course}")
}

/// Key/value settings shared with the exercise platform tooling.
pub trait SettingsStore: Send + Sync {
    /// Reads a setting.
    fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Writes a setting.
    fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Removes a setting. Removing a missing key is not an error.
    fn unset_setting(&self, key: &str) -> Result<()>;
}

/// Settings kept in a single JSON object on disk.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl JsonSettingsStore {
    /// Opens the settings file, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::StateFileCorrupted` if the file is not a JSON object.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = read_json_file(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, serde_json::Value>)) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| TmcError::state_corrupted(&self.path, "settings lock poisoned"))?;
        f(&mut values);
        write_json_file(&self.path, &*values)
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let values = self
            .values
            .lock()
            .map_err(|_| TmcError::state_corrupted(&self.path, "settings lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), value);
        })
    }

    fn unset_setting(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

// ============================================================================
// ExerciseRunner
// ============================================================================

/// Overall status of a local test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Every test passed.
    Passed,
    /// At least one test failed.
    TestsFailed,
    /// The exercise did not compile.
    CompileFailed,
    /// The run was interrupted.
    TestrunInterrupted,
    /// Any other failure.
    GenericError,
}

/// Result of one local test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// Test name.
    pub name: String,
    /// Whether the test passed.
    pub successful: bool,
    /// Points the test is worth.
    #[serde(default)]
    pub points: Vec<String>,
    /// Failure message.
    #[serde(default)]
    pub message: String,
    /// Exception trace lines.
    #[serde(default)]
    pub exception: Vec<String>,
}

/// Output of a completed local test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Overall status.
    pub status: RunStatus,
    /// Individual test results.
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    /// Captured runner output streams.
    #[serde(default)]
    pub logs: BTreeMap<String, String>,
}

/// How a local test run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRunOutcome {
    /// The runner finished and produced results.
    Completed(RunResult),
    /// The run was interrupted before it finished.
    Interrupted,
}

/// Local exercise tooling: test execution and archive handling.
#[async_trait]
pub trait ExerciseRunner: Send + Sync {
    /// Runs the exercise's tests. Must stop promptly once `cancel` fires.
    async fn run_tests(&self, exercise_path: &Path, cancel: CancellationToken)
        -> Result<TestRunOutcome>;

    /// Packs an exercise directory into a submission archive.
    async fn compress_project(&self, exercise_path: &Path) -> Result<Vec<u8>>;

    /// Unpacks a downloaded exercise archive into `target`.
    async fn extract_project(&self, archive: &[u8], target: &Path) -> Result<()>;
}
