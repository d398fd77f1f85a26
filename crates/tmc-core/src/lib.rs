//! TestMyCode client core
//!
//! Exercise bookkeeping, workspace reconciliation, submission orchestration
//! and course updates. Network access and the local test runner sit behind
//! the [`RemoteClient`] and [`ExerciseRunner`] traits, implemented in
//! `tmc-client`.

pub mod collaborators;
pub mod config;
pub mod course;
pub mod error;
pub mod feedback;
pub mod remote;
pub mod store;
pub mod submission;
pub mod workspace;

pub use collaborators::{
    closed_exercises_key, CredentialStore, ExerciseRunner, FileCredentialStore,
    JsonSettingsStore, NotificationLevel, NotificationSink, RunResult, RunStatus, SettingsStore,
    TestResult, TestRunOutcome,
};
pub use config::{Config, DataPaths, EditorKind, SubmissionConfig};
pub use course::{
    CourseCoordinator, CourseRecord, CourseRefresh, DownloadReport, ExerciseSummary,
    UserDataStore, NEW_EXERCISE_CHOICES,
};
pub use error::{Result, TmcError};
pub use feedback::{FeedbackKind, FeedbackQuestion};
pub use remote::{
    CourseData, CourseDataOptions, CourseDetails, CourseExercise, CourseSettings, CourseSummary,
    ExerciseDetails, ExercisePoint, FeedbackAnswer, Organization, RawFeedbackQuestion,
    RemoteClient, SandboxStatus, SubmissionCreated, SubmissionPoll, SubmissionResult,
    SubmissionResultStatus, TestCase,
};
pub use store::{ExerciseRecord, ExerciseStatus, ExerciseStore};
pub use submission::{
    AbortReason, SessionStatus, SubmissionEvent, SubmissionHandle, SubmissionOrchestrator,
    SubmissionOutcome, SubmissionSession, SubmissionVerdict, TestRun,
};
pub use workspace::{
    host_event_channels, DocumentOpened, FileDeleted, FileWorkspaceHost, FoldersChanged,
    HostEventReceivers, HostEventSenders, ReconcileOutcome, WorkspaceContext, WorkspaceDescriptor,
    WorkspaceHost, WorkspaceReconciler,
};
