//! Course records and the course update coordinator.
//!
//! [`UserDataStore`] persists one [`CourseRecord`] per added course.
//! [`CourseCoordinator`] refreshes them from the server, turns
//! authorization and connection failures into state instead of errors,
//! and offers newly published exercises for download.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collaborators::{ExerciseRunner, NotificationLevel, NotificationSink};
use crate::config::DataPaths;
use crate::error::{Result, TmcError};
use crate::remote::{CourseData, CourseDataOptions, RemoteClient};
use crate::store::{read_json_file, write_json_file, ExerciseRecord, ExerciseStatus};
use crate::workspace::WorkspaceReconciler;

/// Choices offered when new exercises are found.
pub const NEW_EXERCISE_CHOICES: [&str; 3] = [
    "Download",
    "Remind me later",
    "Don't remind about these exercises",
];

// ============================================================================
// CourseRecord
// ============================================================================

/// An exercise as tracked in user data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseSummary {
    /// Platform exercise id.
    pub id: u64,
    /// Exercise slug.
    pub name: String,
    /// Hard deadline.
    #[serde(default)]
    pub deadline: Option<String>,
    /// Soft deadline.
    #[serde(default)]
    pub soft_deadline: Option<String>,
    /// Whether the user has completed it.
    #[serde(default)]
    pub passed: bool,
}

/// A course the user has added.
///
/// `new_exercise_ids` is always a subset of the ids in `exercises`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRecord {
    /// Platform course id.
    pub id: u64,
    /// Course slug.
    pub name: String,
    /// Human readable title.
    pub title: String,
    /// Course description.
    #[serde(default)]
    pub description: String,
    /// Organization slug.
    pub organization: String,
    /// Exercises of the course.
    #[serde(default)]
    pub exercises: Vec<ExerciseSummary>,
    /// Total points available.
    #[serde(default)]
    pub available_points: u32,
    /// Points awarded to the user.
    #[serde(default)]
    pub awarded_points: u32,
    /// Set when the server denies access to the course.
    #[serde(default)]
    pub disabled: bool,
    /// Submission results are hidden; local tests are skipped.
    #[serde(default)]
    pub perhaps_exam_mode: bool,
    /// Exercises published since the user last looked.
    #[serde(default)]
    pub new_exercise_ids: Vec<u64>,
    /// Do not offer new exercises before this time.
    #[serde(default)]
    pub notify_after: DateTime<Utc>,
    /// Link to the course material.
    #[serde(default)]
    pub material_url: Option<String>,
}

impl CourseRecord {
    /// Builds a fresh record from server data.
    #[must_use]
    pub fn from_course_data(organization: impl Into<String>, data: &CourseData) -> Self {
        let mut record = Self {
            id: data.details.id,
            name: data.details.name.clone(),
            title: data.details.title.clone(),
            description: String::new(),
            organization: organization.into(),
            exercises: Vec::new(),
            available_points: 0,
            awarded_points: 0,
            disabled: false,
            perhaps_exam_mode: false,
            new_exercise_ids: Vec::new(),
            notify_after: DateTime::<Utc>::default(),
            material_url: None,
        };
        record.apply_course_data(data);
        record.exercises = exercise_summaries(data);
        record
    }

    /// Copies points, settings and description from server data.
    fn apply_course_data(&mut self, data: &CourseData) {
        let (available, awarded) = data.exercises.iter().fold((0usize, 0usize), |(a, w), e| {
            (a + e.available_points.len(), w + e.awarded_points.len())
        });
        self.available_points = u32::try_from(available).unwrap_or(u32::MAX);
        self.awarded_points = u32::try_from(awarded).unwrap_or(u32::MAX);
        self.description = data.details.description.clone().unwrap_or_default();
        self.disabled = data.settings.disabled_status != "enabled";
        self.material_url.clone_from(&data.settings.material_url);
        self.perhaps_exam_mode = data.settings.hide_submission_results;
    }

    /// Replaces the exercise list and recomputes `new_exercise_ids`.
    ///
    /// Ids never seen before become new; pending new ids that the server
    /// no longer lists are dropped.
    pub fn update_exercises(&mut self, exercises: Vec<ExerciseSummary>) {
        let known: BTreeSet<u64> = self.exercises.iter().map(|e| e.id).collect();
        let server: BTreeSet<u64> = exercises.iter().map(|e| e.id).collect();
        let pending: BTreeSet<u64> = self.new_exercise_ids.iter().copied().collect();

        let added = server.difference(&known).copied();
        let mut next: BTreeSet<u64> = pending.union(&added.collect()).copied().collect();
        next.retain(|id| server.contains(id));

        self.new_exercise_ids = next.into_iter().collect();
        self.exercises = exercises;
    }

    /// Looks up an exercise by slug.
    #[must_use]
    pub fn exercise_by_name(&self, name: &str) -> Option<&ExerciseSummary> {
        self.exercises.iter().find(|e| e.name == name)
    }
}

fn exercise_summaries(data: &CourseData) -> Vec<ExerciseSummary> {
    data.details
        .exercises
        .iter()
        .map(|e| ExerciseSummary {
            id: e.id,
            name: e.name.clone(),
            deadline: e.deadline.clone(),
            soft_deadline: e.soft_deadline.clone(),
            passed: e.completed,
        })
        .collect()
}

// ============================================================================
// UserDataStore
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserData {
    #[serde(default)]
    courses: Vec<CourseRecord>,
}

/// Persisted course records, keyed by course id.
#[derive(Debug)]
pub struct UserDataStore {
    file: Option<PathBuf>,
    courses: Mutex<BTreeMap<u64, CourseRecord>>,
}

impl UserDataStore {
    /// Creates an empty store that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            file: None,
            courses: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens the store persisted at `file`.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::StateFileCorrupted` if the file is not valid JSON.
    pub fn open(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let data: UserData = read_json_file(&file)?.unwrap_or_default();
        let courses = data.courses.into_iter().map(|c| (c.id, c)).collect();
        Ok(Self {
            file: Some(file),
            courses: Mutex::new(courses),
        })
    }

    /// Returns every course, ordered by id.
    #[must_use]
    pub fn courses(&self) -> Vec<CourseRecord> {
        self.lock().values().cloned().collect()
    }

    /// Looks up a course by id.
    #[must_use]
    pub fn get_course(&self, id: u64) -> Option<CourseRecord> {
        self.lock().get(&id).cloned()
    }

    /// Looks up a course by slug.
    #[must_use]
    pub fn get_course_by_name(&self, name: &str) -> Option<CourseRecord> {
        self.lock().values().find(|c| c.name == name).cloned()
    }

    /// Inserts or replaces a course.
    pub fn upsert_course(&self, course: CourseRecord) -> Result<()> {
        self.lock().insert(course.id, course);
        self.persist()
    }

    /// Removes a course, returning it.
    pub fn remove_course(&self, id: u64) -> Result<Option<CourseRecord>> {
        let removed = self.lock().remove(&id);
        self.persist()?;
        Ok(removed)
    }

    /// Applies `f` to a stored course.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::CourseNotFound` if the course is unknown.
    pub fn modify_course<T>(&self, id: u64, f: impl FnOnce(&mut CourseRecord) -> T) -> Result<T> {
        let value = {
            let mut courses = self.lock();
            let course = courses.get_mut(&id).ok_or_else(|| TmcError::course_not_found(id))?;
            f(course)
        };
        self.persist()?;
        Ok(value)
    }

    /// Defers new-exercise prompts for a course.
    pub fn set_notify_after(&self, id: u64, at: DateTime<Utc>) -> Result<()> {
        self.modify_course(id, |c| c.notify_after = at)
    }

    /// Forgets all pending new exercises of a course.
    pub fn clear_new_exercises(&self, id: u64) -> Result<()> {
        self.modify_course(id, |c| c.new_exercise_ids.clear())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, CourseRecord>> {
        self.courses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let data = UserData {
            courses: self.courses(),
        };
        write_json_file(file, &data)
    }
}

// ============================================================================
// CourseCoordinator
// ============================================================================

/// Result of refreshing one course.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CourseRefresh {
    /// Fresh data was stored.
    Updated,
    /// The server denied access; the course is marked disabled.
    Disabled,
    /// The server could not be reached; stored data is unchanged.
    Unreachable,
}

/// Outcome of a batch download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Exercises downloaded and registered.
    pub downloaded: Vec<u64>,
    /// Exercises that failed, with the reason.
    pub failed: Vec<(u64, String)>,
}

/// Refreshes courses and handles new exercises.
pub struct CourseCoordinator {
    remote: Arc<dyn RemoteClient>,
    runner: Arc<dyn ExerciseRunner>,
    notifier: Arc<dyn NotificationSink>,
    user_data: Arc<UserDataStore>,
    workspace: Arc<WorkspaceReconciler>,
    paths: DataPaths,
    notification_delay: chrono::Duration,
}

impl std::fmt::Debug for CourseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourseCoordinator")
            .field("paths", &self.paths)
            .field("notification_delay", &self.notification_delay)
            .finish_non_exhaustive()
    }
}

impl CourseCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        runner: Arc<dyn ExerciseRunner>,
        notifier: Arc<dyn NotificationSink>,
        user_data: Arc<UserDataStore>,
        workspace: Arc<WorkspaceReconciler>,
        paths: DataPaths,
        notification_delay: chrono::Duration,
    ) -> Self {
        Self {
            remote,
            runner,
            notifier,
            user_data,
            workspace,
            paths,
            notification_delay,
        }
    }

    /// The user data store.
    #[must_use]
    pub fn user_data(&self) -> &Arc<UserDataStore> {
        &self.user_data
    }

    /// Adds a course from the server and creates its workspace file.
    pub async fn add_course(&self, organization: &str, course_id: u64) -> Result<CourseRecord> {
        info!(organization, course_id, "Adding new course");
        let data = self
            .remote
            .get_course_data(course_id, CourseDataOptions::default())
            .await?;
        let record = CourseRecord::from_course_data(organization, &data);
        self.user_data.upsert_course(record.clone())?;
        self.workspace.create_workspace_file(&record.name).await?;
        // a re-added course may still have exercises on disk
        if let Err(e) = self
            .workspace
            .refresh_local_exercises(std::slice::from_ref(&record.name))
            .await
        {
            warn!(course = %record.name, error = %e, "Failed to refresh local exercises");
        }
        Ok(record)
    }

    /// Removes a course with its exercise records and closed-exercise setting.
    pub fn remove_course(&self, course_id: u64) -> Result<CourseRecord> {
        let course = self
            .user_data
            .get_course(course_id)
            .ok_or_else(|| TmcError::course_not_found(course_id))?;
        info!(course = %course.name, "Removing course data");
        if let Err(e) = self.workspace.remove_course(&course.name) {
            warn!(course = %course.name, error = %e, "Failed to remove course workspace data");
        }
        self.user_data.remove_course(course_id)?;
        Ok(course)
    }

    /// Re-fetches a course, bypassing caches.
    ///
    /// Authorization failures disable the course and connection failures
    /// leave it untouched; neither is returned as an error. The status-change
    /// notification is sent on every authorization failure.
    pub async fn update_course(&self, course_id: u64) -> Result<CourseRefresh> {
        let course = self
            .user_data
            .get_course(course_id)
            .ok_or_else(|| TmcError::course_not_found(course_id))?;

        let data = match self
            .remote
            .get_course_data(course_id, CourseDataOptions { force_refresh: true })
            .await
        {
            Ok(data) => data,
            Err(e) if e.is_authorization() => {
                if course.disabled {
                    warn!(course = %course.name, "Course still disabled");
                } else {
                    warn!(
                        course = %course.name,
                        "Failed to access information for course. Marking as disabled"
                    );
                    self.user_data.modify_course(course_id, |c| c.disabled = true)?;
                }
                self.notifier.course_status_changed(course_id, true, &[]).await;
                return Ok(CourseRefresh::Disabled);
            }
            Err(e) if e.is_transient() => {
                warn!(course = %course.name, error = %e, "Failed to fetch data from TMC servers, data not updated");
                return Ok(CourseRefresh::Unreachable);
            }
            Err(e) => return Err(e),
        };

        let updated = self.user_data.modify_course(course_id, |c| {
            c.apply_course_data(&data);
            c.update_exercises(exercise_summaries(&data));
            c.clone()
        })?;
        debug!(course = %updated.name, new = ?updated.new_exercise_ids, "Course updated");
        self.notifier
            .course_status_changed(course_id, updated.disabled, &updated.new_exercise_ids)
            .await;
        Ok(CourseRefresh::Updated)
    }

    /// Refreshes due courses and offers their new exercises.
    ///
    /// Only courses whose `notify_after` has passed are refreshed. With
    /// `course_id`, only that course is considered.
    pub async fn check_for_course_updates(&self, course_id: Option<u64>) -> Result<()> {
        let now = Utc::now();
        let courses = match course_id {
            Some(id) => vec![self
                .user_data
                .get_course(id)
                .ok_or_else(|| TmcError::course_not_found(id))?],
            None => self.user_data.courses(),
        };
        let due: Vec<CourseRecord> = courses.into_iter().filter(|c| c.notify_after <= now).collect();
        info!(courses = ?due.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), "Checking for course updates");

        for course in &due {
            if let Err(e) = self.update_course(course.id).await {
                warn!(course = %course.name, error = %e, "Course update failed");
            }
        }

        for course in due {
            let Some(course) = self.user_data.get_course(course.id) else {
                continue;
            };
            if course.disabled || course.new_exercise_ids.is_empty() {
                continue;
            }
            let prompt = format!(
                "Found {} new exercises for {}. Do you wish to download them now?",
                course.new_exercise_ids.len(),
                course.name
            );
            match self.notifier.ask(&prompt, &NEW_EXERCISE_CHOICES).await {
                Some(0) => {
                    if let Err(e) = self.download_new_exercises(course.id).await {
                        self.notifier
                            .notify(
                                NotificationLevel::Error,
                                &format!(
                                    "Failed to download new exercises for course \"{}.\": {e}",
                                    course.title
                                ),
                            )
                            .await;
                    }
                }
                Some(1) => {
                    self.user_data
                        .set_notify_after(course.id, Utc::now() + self.notification_delay)?;
                }
                Some(2) => self.user_data.clear_new_exercises(course.id)?,
                _ => debug!(course = %course.name, "New exercise prompt dismissed"),
            }
        }
        Ok(())
    }

    /// Downloads every pending new exercise of a course.
    pub async fn download_new_exercises(&self, course_id: u64) -> Result<DownloadReport> {
        let course = self
            .user_data
            .get_course(course_id)
            .ok_or_else(|| TmcError::course_not_found(course_id))?;
        let report = self
            .download_exercises(course_id, &course.new_exercise_ids)
            .await?;
        self.user_data.modify_course(course_id, |c| {
            c.new_exercise_ids.retain(|id| !report.downloaded.contains(id));
        })?;
        Ok(report)
    }

    /// Downloads exercises into the projects root and registers them as closed.
    ///
    /// A failing exercise does not stop the others.
    pub async fn download_exercises(&self, course_id: u64, exercise_ids: &[u64]) -> Result<DownloadReport> {
        let course = self
            .user_data
            .get_course(course_id)
            .ok_or_else(|| TmcError::course_not_found(course_id))?;
        let mut report = DownloadReport::default();

        for &id in exercise_ids {
            let Some(exercise) = course.exercises.iter().find(|e| e.id == id) else {
                report.failed.push((id, "not part of the course".to_string()));
                continue;
            };
            match self.download_one(&course.name, id, &exercise.name).await {
                Ok(()) => report.downloaded.push(id),
                Err(e) => {
                    warn!(course = %course.name, exercise = %exercise.name, error = %e, "Exercise download failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        self.workspace.sync_closed_setting(&course.name)?;
        info!(
            course = %course.name,
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            "Exercise download finished"
        );
        Ok(report)
    }

    async fn download_one(&self, course: &str, exercise_id: u64, exercise: &str) -> Result<()> {
        let archive = self.remote.download_exercise(exercise_id).await?;
        let target = self.paths.exercise_dir(course, exercise);
        self.runner.extract_project(&archive, &target).await?;
        let store = self.workspace.store();
        let added = store.add(ExerciseRecord::new(
            course,
            exercise,
            target,
            ExerciseStatus::Closed,
        ))?;
        let was_missing = store
            .get(course, exercise)
            .is_some_and(|r| r.status == ExerciseStatus::Missing);
        if !added && was_missing {
            store.mark_status(course, exercise, ExerciseStatus::Closed)?;
        }
        Ok(())
    }
}
