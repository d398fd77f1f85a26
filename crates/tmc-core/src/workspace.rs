//! Workspace reconciler.
//!
//! Keeps the host's multi-root folder list equal to
//! `[root folder] ++ open exercises of the active course (sorted by slug)`
//! and mirrors host folder events back into the [`ExerciseStore`].
//!
//! The host is reached through [`WorkspaceHost`]. Host events arrive on the
//! named channels created by [`host_event_channels`], and the active
//! workspace is passed in explicitly as a [`WorkspaceContext`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tmc_core::workspace::{host_event_channels, FileWorkspaceHost, WorkspaceContext, WorkspaceReconciler};
//! use tmc_core::{Config, ExerciseStore, JsonSettingsStore};
//!
//! # async fn example() -> tmc_core::Result<()> {
//! let config = Config::default();
//! let paths = config.paths();
//! let store = Arc::new(ExerciseStore::open(&paths.exercises, &paths.projects)?);
//! let settings = Arc::new(JsonSettingsStore::open(&paths.settings)?);
//! let host = Arc::new(FileWorkspaceHost::new(paths.workspace_file("python-course")));
//! let reconciler = WorkspaceReconciler::new(store, host, settings, paths.clone(), config.editor);
//!
//! let ctx = WorkspaceContext::new(paths.workspace_file("python-course"));
//! reconciler.reconcile(&ctx).await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{closed_exercises_key, SettingsStore};
use crate::config::{DataPaths, EditorKind};
use crate::error::{Result, TmcError};
use crate::store::{ExerciseRecord, ExerciseStatus, ExerciseStore};

/// Name of the folder that is always first in a course workspace.
pub const ROOT_FOLDER_NAME: &str = ".tmc";

/// Marker file inside the root folder.
pub const ROOT_FILE_NAME: &str = "TMC-Readme.txt";

/// Fixed content of the marker file.
pub const ROOT_FILE_TEXT: &str = "This folder is the root of a TestMyCode course workspace.\n\
Exercises you open are shown as folders next to this one. Do not remove this folder.\n";

const WORKSPACE_FILE_EXTENSION: &str = "code-workspace";

// ============================================================================
// Host Boundary
// ============================================================================

/// The editor whose folder list is being managed.
#[async_trait]
pub trait WorkspaceHost: Send + Sync {
    /// Returns the current folder list, in display order.
    async fn folders(&self) -> Vec<PathBuf>;

    /// Replaces the whole folder list in one operation.
    ///
    /// Returns `TmcError::WorkspaceUpdateRejected` if the host refuses.
    async fn replace_folders(&self, folders: Vec<PathBuf>) -> Result<()>;

    /// Returns `true` if the editor extension is installed.
    async fn has_extension(&self, extension_id: &str) -> bool;
}

/// Identity of the workspace currently loaded in the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceContext {
    /// The loaded workspace descriptor, if any.
    pub workspace_file: Option<PathBuf>,
}

impl WorkspaceContext {
    /// Context with a loaded workspace file.
    #[must_use]
    pub fn new(workspace_file: impl Into<PathBuf>) -> Self {
        Self {
            workspace_file: Some(workspace_file.into()),
        }
    }

    /// Context with no workspace loaded.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            workspace_file: None,
        }
    }
}

// ============================================================================
// Host Event Channels
// ============================================================================

/// Folders were added to or removed from the host workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldersChanged {
    /// Added folder paths.
    pub added: Vec<PathBuf>,
    /// Removed folder paths.
    pub removed: Vec<PathBuf>,
}

/// A file or directory under the projects root was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDeleted {
    /// The deleted path.
    pub path: PathBuf,
}

/// A document was opened in the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOpened {
    /// Document path.
    pub path: PathBuf,
    /// Editor language id, e.g. `python`.
    pub language_id: String,
}

/// Sending halves handed to the host integration.
#[derive(Debug, Clone)]
pub struct HostEventSenders {
    /// Folder add/remove events.
    pub folders_changed: mpsc::Sender<FoldersChanged>,
    /// File deletion events.
    pub file_deleted: mpsc::Sender<FileDeleted>,
    /// Document open events.
    pub document_opened: mpsc::Sender<DocumentOpened>,
}

/// Receiving halves consumed by [`WorkspaceReconciler::run`].
#[derive(Debug)]
pub struct HostEventReceivers {
    /// Folder add/remove events.
    pub folders_changed: mpsc::Receiver<FoldersChanged>,
    /// File deletion events.
    pub file_deleted: mpsc::Receiver<FileDeleted>,
    /// Document open events.
    pub document_opened: mpsc::Receiver<DocumentOpened>,
}

/// Creates the three host event channels.
#[must_use]
pub fn host_event_channels(capacity: usize) -> (HostEventSenders, HostEventReceivers) {
    let (folders_tx, folders_rx) = mpsc::channel(capacity);
    let (deleted_tx, deleted_rx) = mpsc::channel(capacity);
    let (opened_tx, opened_rx) = mpsc::channel(capacity);
    (
        HostEventSenders {
            folders_changed: folders_tx,
            file_deleted: deleted_tx,
            document_opened: opened_tx,
        },
        HostEventReceivers {
            folders_changed: folders_rx,
            file_deleted: deleted_rx,
            document_opened: opened_rx,
        },
    )
}

// ============================================================================
// Workspace Descriptor
// ============================================================================

/// One folder entry of a workspace descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorFolder {
    /// Folder path.
    pub path: PathBuf,
}

/// `extensions` section of a workspace descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRecommendations {
    /// Recommended extension ids.
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// A multi-root `.code-workspace` document.
///
/// Unknown top-level keys are preserved on rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    /// Folder entries in display order.
    #[serde(default)]
    pub folders: Vec<DescriptorFolder>,
    /// Workspace-level editor settings.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Extension recommendations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<ExtensionRecommendations>,
    /// Any other keys.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl WorkspaceDescriptor {
    /// Descriptor written for a new course workspace.
    #[must_use]
    pub fn course_default(root_folder: &Path) -> Self {
        let mut settings = serde_json::Map::new();
        settings.insert("explorer.decorations.colors".into(), false.into());
        settings.insert("explorer.decorations.badges".into(), true.into());
        settings.insert("problems.decorations.enabled".into(), false.into());
        settings.insert("files.autoSave".into(), "onFocusChange".into());
        Self {
            folders: vec![DescriptorFolder {
                path: root_folder.to_path_buf(),
            }],
            settings,
            extensions: None,
            other: serde_json::Map::new(),
        }
    }

    /// Merges recommendations as a set union, keeping existing order.
    pub fn add_recommendations(&mut self, extensions: &[&str]) {
        let section = self.extensions.get_or_insert_with(Default::default);
        for ext in extensions {
            if !section.recommendations.iter().any(|r| r == ext) {
                section.recommendations.push((*ext).to_string());
            }
        }
    }

    /// Reads a descriptor file.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&contents).map_err(|e| TmcError::state_corrupted(path, e.to_string()))
    }

    /// Writes the descriptor file through a temp file and a rename.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("code-workspace.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// A [`WorkspaceHost`] whose folder list is the descriptor file itself.
///
/// Used by hosts without a live editor, such as the command line.
#[derive(Debug, Clone)]
pub struct FileWorkspaceHost {
    workspace_file: PathBuf,
    installed_extensions: Vec<String>,
}

impl FileWorkspaceHost {
    /// Creates a host backed by `workspace_file`.
    #[must_use]
    pub fn new(workspace_file: impl Into<PathBuf>) -> Self {
        Self {
            workspace_file: workspace_file.into(),
            installed_extensions: Vec::new(),
        }
    }

    /// Declares extensions as already installed.
    #[must_use]
    pub fn with_installed_extensions(mut self, extensions: Vec<String>) -> Self {
        self.installed_extensions = extensions;
        self
    }
}

#[async_trait]
impl WorkspaceHost for FileWorkspaceHost {
    async fn folders(&self) -> Vec<PathBuf> {
        match WorkspaceDescriptor::load(&self.workspace_file).await {
            Ok(descriptor) => descriptor.folders.into_iter().map(|f| f.path).collect(),
            Err(e) => {
                debug!(error = %e, file = %self.workspace_file.display(), "No readable workspace descriptor");
                Vec::new()
            }
        }
    }

    async fn replace_folders(&self, folders: Vec<PathBuf>) -> Result<()> {
        let mut descriptor = WorkspaceDescriptor::load(&self.workspace_file)
            .await
            .map_err(|e| TmcError::workspace_rejected(e.to_string()))?;
        descriptor.folders = folders
            .into_iter()
            .map(|path| DescriptorFolder { path })
            .collect();
        descriptor
            .save(&self.workspace_file)
            .await
            .map_err(|e| TmcError::workspace_rejected(e.to_string()))
    }

    async fn has_extension(&self, extension_id: &str) -> bool {
        self.installed_extensions.iter().any(|e| e == extension_id)
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Result of a [`WorkspaceReconciler::reconcile`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No course workspace is loaded.
    NoActiveCourse,
    /// The live folder list already matched.
    Unchanged,
    /// The live folder list was replaced.
    Replaced,
}

/// Maintains the folder layout of the active course workspace.
pub struct WorkspaceReconciler {
    store: Arc<ExerciseStore>,
    host: Arc<dyn WorkspaceHost>,
    settings: Arc<dyn SettingsStore>,
    paths: DataPaths,
    editor: EditorKind,
}

impl std::fmt::Debug for WorkspaceReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceReconciler")
            .field("paths", &self.paths)
            .field("editor", &self.editor)
            .finish_non_exhaustive()
    }
}

impl WorkspaceReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        store: Arc<ExerciseStore>,
        host: Arc<dyn WorkspaceHost>,
        settings: Arc<dyn SettingsStore>,
        paths: DataPaths,
        editor: EditorKind,
    ) -> Self {
        Self {
            store,
            host,
            settings,
            paths,
            editor,
        }
    }

    /// The exercise store this reconciler maintains.
    #[must_use]
    pub fn store(&self) -> &Arc<ExerciseStore> {
        &self.store
    }

    /// The folder that is always first in a course workspace.
    #[must_use]
    pub fn root_folder(&self) -> PathBuf {
        self.paths.projects.join(ROOT_FOLDER_NAME)
    }

    /// Path of the marker file.
    #[must_use]
    pub fn marker_file(&self) -> PathBuf {
        self.root_folder().join(ROOT_FILE_NAME)
    }

    /// Derives the active course from the loaded workspace file.
    ///
    /// Only `<workspaces>/<course>.code-workspace` counts as a course workspace.
    #[must_use]
    pub fn active_course(&self, ctx: &WorkspaceContext) -> Option<String> {
        let file = ctx.workspace_file.as_deref()?;
        if file.parent()? != self.paths.workspaces {
            return None;
        }
        if file.extension()? != WORKSPACE_FILE_EXTENSION {
            return None;
        }
        file.file_stem()?.to_str().map(ToString::to_string)
    }

    /// Computes `[root folder] ++ open exercises sorted by slug`.
    #[must_use]
    pub fn target_layout(&self, course: &str) -> Vec<PathBuf> {
        // list_open is already ordered by slug
        std::iter::once(self.root_folder())
            .chain(self.store.list_open(course).into_iter().map(|r| r.local_path))
            .collect()
    }

    /// Makes the live folder list match the target layout.
    ///
    /// A host rejection is returned as `WorkspaceUpdateRejected` and is not
    /// retried; the next triggering event tries again.
    pub async fn reconcile(&self, ctx: &WorkspaceContext) -> Result<ReconcileOutcome> {
        let Some(course) = self.active_course(ctx) else {
            debug!("Attempted refresh for a non-course workspace");
            return Ok(ReconcileOutcome::NoActiveCourse);
        };

        let target = self.target_layout(&course);
        let live = self.host.folders().await;
        if live == target {
            debug!(course = %course, "Workspace refresh was a no-op");
            return Ok(ReconcileOutcome::Unchanged);
        }

        if live.first() != target.first() {
            warn!(course = %course, "Fixing incorrect root folder");
        }
        info!(
            course = %course,
            from = live.len(),
            to = target.len(),
            "Refreshing workspace structure"
        );
        if let Err(e) = self.host.replace_folders(target).await {
            error!(course = %course, error = %e, "Replace operation failed");
            return Err(match e {
                TmcError::WorkspaceUpdateRejected(_) => e,
                other => TmcError::workspace_rejected(other.to_string()),
            });
        }
        Ok(ReconcileOutcome::Replaced)
    }

    /// Creates the root folder and marker file if either is missing.
    pub async fn ensure_root(&self) -> Result<()> {
        let marker = self.marker_file();
        if tokio::fs::try_exists(&marker).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(self.root_folder()).await?;
        tokio::fs::write(&marker, ROOT_FILE_TEXT).await?;
        Ok(())
    }

    /// Writes the course's workspace descriptor unless it already exists.
    ///
    /// Returns the descriptor path.
    pub async fn create_workspace_file(&self, course: &str) -> Result<PathBuf> {
        let path = self.paths.workspace_file(course);
        if !tokio::fs::try_exists(&path).await? {
            WorkspaceDescriptor::course_default(&self.root_folder())
                .save(&path)
                .await?;
            info!(course, path = %path.display(), "Created workspace file");
        }
        Ok(path)
    }

    /// Adds extension recommendations to a course's workspace descriptor.
    pub async fn add_workspace_recommendation(&self, course: &str, extensions: &[&str]) -> Result<()> {
        let path = self.paths.workspace_file(course);
        let mut descriptor = WorkspaceDescriptor::load(&path).await?;
        descriptor.add_recommendations(extensions);
        debug!(course, ?extensions, "Updating workspace recommendations");
        descriptor.save(&path).await
    }

    // ------------------------------------------------------------------------
    // Open / close
    // ------------------------------------------------------------------------

    /// Opens exercises of a course.
    ///
    /// Statuses are updated, the workspace reconciled and the course's
    /// closed-exercise setting rewritten. The setting is rewritten even if
    /// the host rejected the folder update; that error is returned afterwards.
    pub async fn open_exercises(
        &self,
        ctx: &WorkspaceContext,
        course: &str,
        exercises: &[&str],
    ) -> Result<()> {
        info!(course, ?exercises, "Opening exercises");
        self.set_status(ctx, course, exercises, ExerciseStatus::Open).await
    }

    /// Closes exercises of a course. See [`Self::open_exercises`].
    pub async fn close_exercises(
        &self,
        ctx: &WorkspaceContext,
        course: &str,
        exercises: &[&str],
    ) -> Result<()> {
        info!(course, ?exercises, "Closing exercises");
        self.set_status(ctx, course, exercises, ExerciseStatus::Closed).await
    }

    async fn set_status(
        &self,
        ctx: &WorkspaceContext,
        course: &str,
        exercises: &[&str],
        status: ExerciseStatus,
    ) -> Result<()> {
        // the in-memory status stands even if persisting it fails
        let mut persist_error = None;
        for exercise in exercises {
            if let Err(e) = self.store.mark_status(course, exercise, status) {
                warn!(course, exercise, error = %e, "Failed to persist exercise status");
                persist_error.get_or_insert(e);
            }
        }
        let reconciled = self.reconcile(ctx).await;
        self.sync_closed_setting(course)?;
        if let Some(e) = persist_error {
            return Err(e);
        }
        reconciled.map(|_| ())
    }

    /// Rewrites `closed-exercises-for:<course>` from the store.
    pub fn sync_closed_setting(&self, course: &str) -> Result<()> {
        let closed: Vec<String> = self
            .store
            .list_by_course(course)
            .into_iter()
            .filter(|r| r.status == ExerciseStatus::Closed)
            .map(|r| r.exercise_slug)
            .collect();
        self.settings
            .set_setting(&closed_exercises_key(course), serde_json::json!(closed))
    }

    /// Reads `closed-exercises-for:<course>`. Unreadable values count as unset.
    fn closed_setting(&self, course: &str) -> Option<Vec<String>> {
        match self.settings.get_setting(&closed_exercises_key(course)) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(closed) => Some(closed),
                Err(e) => {
                    warn!(course, error = %e, "Ignoring malformed closed-exercise setting");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(course, error = %e, "Failed to read closed-exercise setting");
                None
            }
        }
    }

    /// Rebuilds the records of `courses` from the exercise folders on disk.
    ///
    /// Every folder under `<projects>/<course>` becomes a record, closed if
    /// the course's closed-exercise setting lists it and open otherwise.
    /// Without a setting a known exercise keeps its status and a new one
    /// starts closed. Known exercises whose folder is gone become
    /// `Missing`. Records of other courses are left as they are, and so is
    /// a course whose directory cannot be read.
    pub async fn refresh_local_exercises(&self, courses: &[String]) -> Result<()> {
        let mut records: Vec<ExerciseRecord> = self
            .store
            .list_all()
            .into_iter()
            .filter(|r| !courses.contains(&r.course_slug))
            .collect();

        for course in courses {
            let known = self.store.list_by_course(course);
            let on_disk = match self.local_exercise_folders(course).await {
                Ok(folders) => folders,
                Err(e) => {
                    warn!(course = %course, error = %e, "Failed to list local exercises");
                    records.extend(known);
                    continue;
                }
            };
            let closed = self.closed_setting(course);

            for (slug, path) in &on_disk {
                let previous = known.iter().find(|r| &r.exercise_slug == slug).map(|r| r.status);
                let status = match (&closed, previous) {
                    (Some(closed), _) if closed.contains(slug) => ExerciseStatus::Closed,
                    (Some(_), _) => ExerciseStatus::Open,
                    (None, Some(ExerciseStatus::Open)) => ExerciseStatus::Open,
                    (None, _) => ExerciseStatus::Closed,
                };
                records.push(ExerciseRecord::new(course.as_str(), slug.as_str(), path.clone(), status));
            }

            for record in known {
                if on_disk.iter().any(|(slug, _)| *slug == record.exercise_slug) {
                    continue;
                }
                if record.status != ExerciseStatus::Missing {
                    info!(course = %course, exercise = %record.exercise_slug, "Exercise folder missing");
                }
                records.push(ExerciseRecord {
                    status: ExerciseStatus::Missing,
                    ..record
                });
            }
            debug!(course = %course, local = on_disk.len(), "Refreshed local exercises");
        }

        self.store.set_all(records)
    }

    /// Exercise folders of a course as `(slug, path)`, empty if the course
    /// has no directory yet.
    async fn local_exercise_folders(&self, course: &str) -> Result<Vec<(String, PathBuf)>> {
        let dir = self.paths.projects.join(course);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut folders = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            folders.push((name, entry.path()));
        }
        Ok(folders)
    }

    /// Forgets a course: drops its records and its closed-exercise setting.
    pub fn remove_course(&self, course: &str) -> Result<()> {
        let removed = self.store.remove_course(course)?;
        info!(course, removed, "Removed course exercises from workspace");
        self.settings.unset_setting(&closed_exercises_key(course))
    }

    // ------------------------------------------------------------------------
    // Host events
    // ------------------------------------------------------------------------

    /// Mirrors host folder changes into record status.
    ///
    /// Added folders that are not exercises of the active course are
    /// tolerated and only logged.
    pub fn handle_folders_changed(&self, ctx: &WorkspaceContext, event: &FoldersChanged) -> Result<()> {
        let active = self.active_course(ctx);
        let root = self.root_folder();
        let mut orphans = Vec::new();

        for added in &event.added {
            if *added == root {
                continue;
            }
            match self.exercise_at(added) {
                Some(record) if Some(&record.course_slug) == active.as_ref() => {
                    self.store
                        .mark_status(&record.course_slug, &record.exercise_slug, ExerciseStatus::Open)?;
                }
                _ => orphans.push(added.display().to_string()),
            }
        }

        for removed in &event.removed {
            if let Some(record) = self.exercise_at(removed) {
                self.store
                    .mark_status(&record.course_slug, &record.exercise_slug, ExerciseStatus::Closed)?;
            }
        }

        if !orphans.is_empty() {
            warn!(
                course = active.as_deref().unwrap_or("<none>"),
                ?orphans,
                "Folders added that are not part of the active course. These may be removed later"
            );
        }
        Ok(())
    }

    /// Handles a deletion under the projects root.
    ///
    /// Exercises whose folder was deleted become `Missing`. The marker file
    /// is recreated if it or the root folder was deleted; returns `true` in
    /// that case.
    pub async fn handle_file_deleted(&self, event: &FileDeleted) -> Result<bool> {
        let gone: Vec<ExerciseRecord> = self
            .store
            .list_all()
            .into_iter()
            .filter(|r| r.local_path.starts_with(&event.path))
            .collect();
        for record in gone {
            info!(
                course = %record.course_slug,
                exercise = %record.exercise_slug,
                "Exercise folder deleted"
            );
            self.store
                .mark_status(&record.course_slug, &record.exercise_slug, ExerciseStatus::Missing)?;
        }

        if event.path != self.marker_file() && event.path != self.root_folder() {
            return Ok(false);
        }
        info!(path = %event.path.display(), "Root file deleted, fixing issue");
        tokio::fs::create_dir_all(self.root_folder()).await?;
        tokio::fs::write(self.marker_file(), ROOT_FILE_TEXT).await?;
        Ok(true)
    }

    /// Recommends companion extensions for the opened document's language.
    ///
    /// Returns the recommendations that were added.
    pub async fn handle_document_opened(
        &self,
        ctx: &WorkspaceContext,
        event: &DocumentOpened,
    ) -> Result<Vec<&'static str>> {
        let Some(course) = self.active_course(ctx) else {
            return Ok(Vec::new());
        };
        debug!(language_id = %event.language_id, "Text document opened");

        let mut wanted = Vec::new();
        for ext in recommendations_for(&event.language_id, self.editor) {
            if !self.host.has_extension(ext).await {
                wanted.push(*ext);
            }
        }
        // pylance is only suggested together with the base python extension
        if event.language_id == "python" && !wanted.contains(&"ms-python.python") {
            wanted.clear();
        }
        if wanted.is_empty() {
            return Ok(wanted);
        }
        self.add_workspace_recommendation(&course, &wanted).await?;
        Ok(wanted)
    }

    fn exercise_at(&self, folder: &Path) -> Option<ExerciseRecord> {
        self.store
            .find_by_path(folder)
            .filter(|r| r.local_path == folder)
    }

    /// Drives the reconciler from host events until `cancel` fires.
    ///
    /// Reconciles on start, after every store mutation and whenever the
    /// workspace context changes. Failures are logged and retried on the
    /// next trigger.
    pub async fn run(
        self: Arc<Self>,
        mut events: HostEventReceivers,
        mut context: watch::Receiver<WorkspaceContext>,
        cancel: CancellationToken,
    ) {
        let mut revision = self.store.subscribe();
        drop(revision.borrow_and_update());
        let ctx = context.borrow_and_update().clone();
        if let Err(e) = self.ensure_root().await {
            warn!(error = %e, "Failed to create workspace root");
        }
        self.reconcile_logged(&ctx).await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Workspace reconciler stopping");
                    break;
                }
                changed = revision.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let ctx = context.borrow().clone();
                    self.reconcile_logged(&ctx).await;
                }
                changed = context.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let ctx = context.borrow_and_update().clone();
                    self.reconcile_logged(&ctx).await;
                }
                Some(event) = events.folders_changed.recv() => {
                    let ctx = context.borrow().clone();
                    if let Err(e) = self.handle_folders_changed(&ctx, &event) {
                        warn!(error = %e, "Failed to record folder change");
                    }
                }
                Some(event) = events.file_deleted.recv() => {
                    if let Err(e) = self.handle_file_deleted(&event).await {
                        warn!(error = %e, "Failed to restore workspace root");
                    }
                }
                Some(event) = events.document_opened.recv() => {
                    let ctx = context.borrow().clone();
                    if let Err(e) = self.handle_document_opened(&ctx, &event).await {
                        warn!(error = %e, "Failed to add workspace recommendation");
                    }
                }
            }
        }
    }

    async fn reconcile_logged(&self, ctx: &WorkspaceContext) {
        if let Err(e) = self.reconcile(ctx).await {
            warn!(error = %e, "Workspace reconciliation failed, will retry on next change");
        }
    }
}

/// Extensions recommended for a language id.
///
/// Proprietary extensions are only offered on [`EditorKind::Code`].
#[must_use]
pub fn recommendations_for(language_id: &str, editor: EditorKind) -> &'static [&'static str] {
    let is_code = editor == EditorKind::Code;
    match language_id {
        "c" | "cpp" | "objective-c" | "objective-cpp" if is_code => &["ms-vscode.cpptools"],
        "csharp" if is_code => &["ms-dotnettools.csharp"],
        "r" => &["ikuyadeu.r"],
        "python" if is_code => &["ms-python.vscode-pylance", "ms-python.python"],
        "python" => &["ms-python.python"],
        "java" if is_code => &["vscjava.vscode-java-pack"],
        _ => &[],
    }
}
