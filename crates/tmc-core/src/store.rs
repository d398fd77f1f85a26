//! ExerciseRecord store.
//!
//! Holds one [`ExerciseRecord`] per (course, exercise) pair and persists the
//! table as JSON. Every mutation bumps a revision counter on a
//! [`tokio::sync::watch`] channel so the workspace reconciler can react.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Result, TmcError};

// ============================================================================
// ExerciseRecord
// ============================================================================

/// Workspace status of a downloaded exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseStatus {
    /// Shown as a folder of the course workspace.
    Open,
    /// Downloaded but hidden from the workspace.
    Closed,
    /// Known but not present on disk.
    Missing,
}

/// One exercise of the local workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseRecord {
    /// Course slug.
    pub course_slug: String,
    /// Exercise slug.
    pub exercise_slug: String,
    /// Exercise directory, always under the projects root.
    pub local_path: PathBuf,
    /// Current status.
    pub status: ExerciseStatus,
}

impl ExerciseRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(
        course_slug: impl Into<String>,
        exercise_slug: impl Into<String>,
        local_path: impl Into<PathBuf>,
        status: ExerciseStatus,
    ) -> Self {
        Self {
            course_slug: course_slug.into(),
            exercise_slug: exercise_slug.into(),
            local_path: local_path.into(),
            status,
        }
    }

    fn key(&self) -> RecordKey {
        (self.course_slug.clone(), self.exercise_slug.clone())
    }
}

type RecordKey = (String, String);

// ============================================================================
// JSON persistence helpers
// ============================================================================

/// Reads a JSON file, returning `None` if it does not exist.
pub(crate) fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| TmcError::state_corrupted(path, e.to_string()))
}

/// Writes pretty JSON through a sibling temp file and a rename.
pub(crate) fn write_json_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// ExerciseStore
// ============================================================================

/// Table of exercise records.
///
/// Reads never fail. Mutations update memory first and then persist; a
/// persistence failure is returned but the in-memory change stands.
#[derive(Debug)]
pub struct ExerciseStore {
    file: Option<PathBuf>,
    projects_root: PathBuf,
    records: Mutex<BTreeMap<RecordKey, ExerciseRecord>>,
    revision: watch::Sender<u64>,
}

impl ExerciseStore {
    /// Creates an empty store that is never written to disk.
    #[must_use]
    pub fn in_memory(projects_root: impl Into<PathBuf>) -> Self {
        Self::with_records(None, projects_root.into(), BTreeMap::new())
    }

    /// Opens the store persisted at `file`, starting empty if it is missing.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::StateFileCorrupted` if the file is not valid JSON.
    pub fn open(file: impl Into<PathBuf>, projects_root: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let projects_root = projects_root.into();
        let loaded: Vec<ExerciseRecord> = read_json_file(&file)?.unwrap_or_default();
        let records = collect_valid(&projects_root, loaded);
        Ok(Self::with_records(Some(file), projects_root, records))
    }

    fn with_records(
        file: Option<PathBuf>,
        projects_root: PathBuf,
        records: BTreeMap<RecordKey, ExerciseRecord>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            file,
            projects_root,
            records: Mutex::new(records),
            revision,
        }
    }

    /// Root directory every exercise path must be under.
    #[must_use]
    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Returns `true` if `path` is inside the projects root.
    #[must_use]
    pub fn is_under_projects_root(&self, path: &Path) -> bool {
        path.starts_with(&self.projects_root)
    }

    /// Subscribes to the mutation counter.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Replaces every record.
    ///
    /// Records outside the projects root and duplicate keys are dropped with
    /// a warning; the first occurrence of a key wins.
    pub fn set_all(&self, records: Vec<ExerciseRecord>) -> Result<()> {
        let valid = collect_valid(&self.projects_root, records);
        *self.lock() = valid;
        self.changed()
    }

    /// Looks up a record.
    #[must_use]
    pub fn get(&self, course: &str, exercise: &str) -> Option<ExerciseRecord> {
        self.lock()
            .get(&(course.to_string(), exercise.to_string()))
            .cloned()
    }

    /// Lists every record of a course, sorted by exercise slug.
    #[must_use]
    pub fn list_by_course(&self, course: &str) -> Vec<ExerciseRecord> {
        self.lock()
            .values()
            .filter(|r| r.course_slug == course)
            .cloned()
            .collect()
    }

    /// Lists the open records of a course, sorted by exercise slug.
    #[must_use]
    pub fn list_open(&self, course: &str) -> Vec<ExerciseRecord> {
        self.lock()
            .values()
            .filter(|r| r.course_slug == course && r.status == ExerciseStatus::Open)
            .cloned()
            .collect()
    }

    /// Lists every record.
    #[must_use]
    pub fn list_all(&self) -> Vec<ExerciseRecord> {
        self.lock().values().cloned().collect()
    }

    /// Finds the exercise whose directory contains `path`.
    #[must_use]
    pub fn find_by_path(&self, path: &Path) -> Option<ExerciseRecord> {
        self.lock()
            .values()
            .find(|r| path.starts_with(&r.local_path))
            .cloned()
    }

    /// Sets a record's status.
    ///
    /// Returns `Ok(false)` without notifying if the status is unchanged or
    /// the record is unknown.
    pub fn mark_status(&self, course: &str, exercise: &str, status: ExerciseStatus) -> Result<bool> {
        {
            let mut records = self.lock();
            let Some(record) = records.get_mut(&(course.to_string(), exercise.to_string())) else {
                debug!(course, exercise, "mark_status on unknown exercise");
                return Ok(false);
            };
            if record.status == status {
                return Ok(false);
            }
            record.status = status;
        }
        self.changed()?;
        Ok(true)
    }

    /// Adds a record. Returns `Ok(false)` if it was rejected.
    pub fn add(&self, record: ExerciseRecord) -> Result<bool> {
        if !self.is_under_projects_root(&record.local_path) {
            warn!(
                course = %record.course_slug,
                exercise = %record.exercise_slug,
                path = %record.local_path.display(),
                "Rejected exercise outside projects root"
            );
            return Ok(false);
        }
        {
            let mut records = self.lock();
            let key = record.key();
            if records.contains_key(&key) {
                warn!(
                    course = %record.course_slug,
                    exercise = %record.exercise_slug,
                    "Exercise already registered, keeping existing record"
                );
                return Ok(false);
            }
            records.insert(key, record);
        }
        self.changed()?;
        Ok(true)
    }

    /// Drops every record of a course. Returns how many were removed.
    pub fn remove_course(&self, course: &str) -> Result<usize> {
        let removed = {
            let mut records = self.lock();
            let before = records.len();
            records.retain(|(c, _), _| c != course);
            before - records.len()
        };
        if removed > 0 {
            self.changed()?;
        }
        Ok(removed)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RecordKey, ExerciseRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self) -> Result<()> {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let snapshot: Vec<ExerciseRecord> = self.lock().values().cloned().collect();
        write_json_file(file, &snapshot)
    }
}

fn collect_valid(
    projects_root: &Path,
    records: Vec<ExerciseRecord>,
) -> BTreeMap<RecordKey, ExerciseRecord> {
    let mut valid = BTreeMap::new();
    for record in records {
        if !record.local_path.starts_with(projects_root) {
            warn!(
                course = %record.course_slug,
                exercise = %record.exercise_slug,
                path = %record.local_path.display(),
                "Dropping exercise outside projects root"
            );
            continue;
        }
        let key = record.key();
        if valid.contains_key(&key) {
            warn!(course = %key.0, exercise = %key.1, "Dropping duplicate exercise record");
            continue;
        }
        valid.insert(key, record);
    }
    valid
}
