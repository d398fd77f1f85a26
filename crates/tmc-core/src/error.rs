//! Error types for the TMC client core.
//!
//! This module defines the error hierarchy shared by the workspace
//! reconciler, the remote client boundary, the submission orchestrator and
//! the course update coordinator.

use std::path::PathBuf;

/// A specialized `Result` type for TMC client operations.
pub type Result<T> = std::result::Result<T, TmcError>;

/// Errors that can occur while talking to the exercise platform or while
/// maintaining the local exercise workspace.
///
/// The first group mirrors the remote failure taxonomy: callers treat
/// `Connection` as transient, `Authorization` as a permission problem on a
/// single resource, `Api` as a protocol mismatch and `Bottleneck` as a
/// "no-op, not a failure" signal.
#[derive(Debug, thiserror::Error)]
pub enum TmcError {
    // ========================================================================
    // Remote Errors
    // ========================================================================
    /// The server could not be reached or the request timed out.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Login failed because of bad credentials or an existing session.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The user lacks permission for the requested resource.
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// The server answered with an unexpected status or response shape.
    #[error("API error: {0}")]
    Api(String),

    /// A conflicting operation is already in progress for the same resource.
    ///
    /// Raised both by this client's own single-flight guards and by the
    /// grading server's cooldown.
    #[error("Operation already in progress: {0}")]
    Bottleneck(String),

    /// No access token is available for an authenticated request.
    #[error("Not logged in\n\nSuggestion: Run 'tmc login' first")]
    NotAuthenticated,

    /// A paste request succeeded but the server returned an empty link.
    #[error("Didn't receive paste link from server.")]
    PasteLinkMissing,

    // ========================================================================
    // Lookup Errors
    // ========================================================================
    /// The exercise is not known to the local store or course data.
    #[error("Exercise not found: {course}/{exercise}")]
    ExerciseNotFound {
        /// Course slug.
        course: String,
        /// Exercise slug.
        exercise: String,
    },

    /// The course is not present in user data.
    #[error("Course not found: {0}\n\nSuggestion: Add the course with 'tmc add-course'")]
    CourseNotFound(String),

    // ========================================================================
    // Workspace Errors
    // ========================================================================
    /// The host refused to replace its folder list.
    ///
    /// Recoverable: the next triggering event re-attempts reconciliation.
    #[error("Failed to refresh active workspace: {0}")]
    WorkspaceUpdateRejected(String),

    /// The exercise runner (tmc-langs) failed.
    #[error("Exercise runner failed: {0}")]
    Runner(String),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in the configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your tmc.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// A persisted state file contains malformed JSON.
    #[error("Corrupted state file '{path}': {message}\n\nSuggestion: Remove the file to start fresh, or restore from backup")]
    StateFileCorrupted {
        /// Path to the corrupted file.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TmcError {
    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Creates a new `Authentication` error.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// Creates a new `Authorization` error.
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    /// Creates a new `Api` error.
    #[must_use]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api(message.into())
    }

    /// Creates a new `Bottleneck` error.
    #[must_use]
    pub fn bottleneck(message: impl Into<String>) -> Self {
        Self::Bottleneck(message.into())
    }

    /// Creates a new `ExerciseNotFound` error.
    #[must_use]
    pub fn exercise_not_found(course: impl Into<String>, exercise: impl Into<String>) -> Self {
        Self::ExerciseNotFound {
            course: course.into(),
            exercise: exercise.into(),
        }
    }

    /// Creates a new `CourseNotFound` error.
    #[must_use]
    pub fn course_not_found(course: impl std::fmt::Display) -> Self {
        Self::CourseNotFound(course.to_string())
    }

    /// Creates a new `WorkspaceUpdateRejected` error.
    #[must_use]
    pub fn workspace_rejected(message: impl Into<String>) -> Self {
        Self::WorkspaceUpdateRejected(message.into())
    }

    /// Creates a new `Runner` error.
    #[must_use]
    pub fn runner(message: impl Into<String>) -> Self {
        Self::Runner(message.into())
    }

    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `StateFileCorrupted` error.
    #[must_use]
    pub fn state_corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StateFileCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error is a network-level failure that may
    /// succeed on a later attempt.
    ///
    /// Transient errors never disable a course.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns `true` for concurrency-conflict signals.
    #[must_use]
    pub const fn is_bottleneck(&self) -> bool {
        matches!(self, Self::Bottleneck(_))
    }

    /// Returns `true` if the server denied access to the resource.
    #[must_use]
    pub const fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }
}
