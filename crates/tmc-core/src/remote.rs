//! Remote client boundary.
//!
//! [`RemoteClient`] is the stateless request layer towards the exercise
//! platform. It performs no retries: every failure is reported as one of the
//! remote [`TmcError`](crate::TmcError) variants and retry policy belongs to
//! the callers. The wire types below follow the TMC v8 REST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An organization listed on the TMC server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Display name.
    pub name: String,
    /// URL slug, used to list courses.
    pub slug: String,
    /// Free-form description.
    #[serde(default)]
    pub information: String,
    /// Whether the organization is pinned on the front page.
    #[serde(default)]
    pub pinned: bool,
}

/// A course as shown in an organization's course listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSummary {
    /// Platform course id.
    pub id: u64,
    /// Course slug.
    pub name: String,
    /// Human readable title.
    pub title: String,
    /// Course description, may be absent.
    #[serde(default)]
    pub description: Option<String>,
}

/// Per-exercise entry of [`CourseDetails`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseDetails {
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
    /// Whether the user has completed the exercise.
    #[serde(default)]
    pub completed: bool,
}

/// Course details including its exercise list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseDetails {
    /// Platform course id.
    pub id: u64,
    /// Course slug.
    pub name: String,
    /// Human readable title.
    pub title: String,
    /// Course description.
    #[serde(default)]
    pub description: Option<String>,
    /// Exercises of the course.
    #[serde(default)]
    pub exercises: Vec<ExerciseDetails>,
}

/// An awardable point of an exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExercisePoint {
    /// Point id.
    pub id: u64,
    /// Point name, e.g. `1.1`.
    pub name: String,
}

/// Point information for one exercise of a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseExercise {
    /// Platform exercise id.
    pub id: u64,
    /// Exercise slug.
    pub name: String,
    /// Points that can be earned.
    #[serde(default)]
    pub available_points: Vec<ExercisePoint>,
    /// Names of the points already awarded.
    #[serde(default)]
    pub awarded_points: Vec<String>,
}

/// Course-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSettings {
    /// `enabled` unless the course has been closed on the server.
    #[serde(default = "default_disabled_status")]
    pub disabled_status: String,
    /// Link to the course material.
    #[serde(default)]
    pub material_url: Option<String>,
    /// Exam courses hide submission results.
    #[serde(default)]
    pub hide_submission_results: bool,
}

fn default_disabled_status() -> String {
    "enabled".to_string()
}

/// Aggregate result of [`RemoteClient::get_course_data`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseData {
    /// Course details.
    pub details: CourseDetails,
    /// Exercise point information.
    pub exercises: Vec<CourseExercise>,
    /// Course settings.
    pub settings: CourseSettings,
}

/// Options for [`RemoteClient::get_course_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CourseDataOptions {
    /// Bypass any response cache.
    pub force_refresh: bool,
}

/// Response to a successful submission upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionCreated {
    /// API URL to poll for the verdict.
    pub submission_url: String,
    /// Browser URL for the submission page.
    #[serde(default)]
    pub show_submission_url: Option<String>,
    /// Paste link, only set for paste submissions.
    #[serde(default)]
    pub paste_url: Option<String>,
}

/// Grading stage reported by the server while a submission is processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Submission is waiting in the queue.
    Created,
    /// Submission is being sent to a sandbox.
    SendingToSandbox,
    /// Tests are running in the sandbox.
    ProcessingOnSandbox,
}

impl SandboxStatus {
    /// Returns the progress percentage and message shown for this stage.
    #[must_use]
    pub const fn progress(self) -> (u8, &'static str) {
        match self {
            Self::Created => (10, "Submission is in queue."),
            Self::SendingToSandbox => (20, "Submission is being sent to sandbox."),
            Self::ProcessingOnSandbox => (40, "Submission is running."),
        }
    }
}

/// Final grading status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionResultStatus {
    /// All tests passed.
    Ok,
    /// Some tests failed.
    Fail,
    /// The submission could not be graded.
    Error,
    /// Result hidden (exam mode).
    Hidden,
}

/// One test case of a graded submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Test name.
    pub name: String,
    /// Whether the test passed.
    pub successful: bool,
    /// Failure message.
    #[serde(default)]
    pub message: Option<String>,
    /// Exception trace lines.
    #[serde(default)]
    pub exception: Option<Vec<String>>,
}

/// A feedback question as it appears on the wire.
///
/// `kind` is free-form here; [`crate::feedback`] turns it into a typed
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFeedbackQuestion {
    /// Question id.
    pub id: u64,
    /// Question text.
    pub question: String,
    /// Kind string, e.g. `text` or `intrange[1..5]`.
    pub kind: String,
}

/// Final verdict of a graded submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    /// Final status.
    pub status: SubmissionResultStatus,
    /// Exercise slug.
    #[serde(default)]
    pub exercise_name: String,
    /// Whether every test passed.
    #[serde(default)]
    pub all_tests_passed: Option<bool>,
    /// Awarded point names.
    #[serde(default)]
    pub points: Vec<String>,
    /// Per-test results.
    #[serde(default)]
    pub test_cases: Option<Vec<TestCase>>,
    /// Feedback questions asked after a passing submission.
    #[serde(default)]
    pub feedback_questions: Option<Vec<RawFeedbackQuestion>>,
    /// Where feedback answers are posted.
    #[serde(default)]
    pub feedback_answer_url: Option<String>,
    /// Browser URL for the submission page.
    #[serde(default)]
    pub submission_url: Option<String>,
    /// Model solution URL, if released.
    #[serde(default)]
    pub solution_url: Option<String>,
    /// Grader error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// One poll of a submission's status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionPoll {
    /// Grading still in progress.
    Processing {
        /// Current sandbox stage, if reported.
        sandbox_status: Option<SandboxStatus>,
    },
    /// Grading finished.
    Finished(Box<SubmissionResult>),
}

/// An answer to one feedback question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackAnswer {
    /// Question id.
    pub question_id: u64,
    /// Answer text, or the chosen number for integer ranges.
    pub answer: String,
}

/// Request layer to the exercise platform.
///
/// Implementations must not retry on their own and must map failures onto
/// `Connection`, `Authentication`, `Authorization`, `Api` or `Bottleneck`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Logs in with a username and password.
    async fn authenticate(&self, username: &str, password: &str) -> Result<()>;

    /// Drops the stored access token.
    async fn deauthenticate(&self) -> Result<()>;

    /// Returns `true` if an access token is available.
    async fn is_authenticated(&self) -> bool;

    /// Lists organizations.
    async fn get_organizations(&self) -> Result<Vec<Organization>>;

    /// Lists courses of an organization.
    async fn get_courses(&self, organization: &str) -> Result<Vec<CourseSummary>>;

    /// Fetches details, points and settings for a course.
    async fn get_course_data(&self, course_id: u64, options: CourseDataOptions)
        -> Result<CourseData>;

    /// Downloads an exercise template archive.
    async fn download_exercise(&self, exercise_id: u64) -> Result<Vec<u8>>;

    /// Uploads a compressed exercise for grading.
    async fn submit_exercise(&self, exercise_id: u64, archive: Vec<u8>)
        -> Result<SubmissionCreated>;

    /// Polls the status of a submission.
    async fn poll_submission(&self, submission_url: &str) -> Result<SubmissionPoll>;

    /// Posts feedback answers for a graded submission.
    async fn submit_feedback(&self, feedback_url: &str, answers: &[FeedbackAnswer]) -> Result<()>;

    /// Uploads a compressed exercise to the paste service.
    ///
    /// Returns the paste link, which may be empty if the server did not
    /// provide one.
    async fn submit_to_paste(&self, exercise_id: u64, archive: Vec<u8>) -> Result<String>;
}
