//! Submission orchestrator.
//!
//! Drives the submit → poll → result state machine for each exercise and
//! runs local tests, keeping at most one operation in flight per key:
//!
//! - graded submissions are keyed by exercise id,
//! - paste submissions are keyed by exercise id in a separate table,
//! - local test runs are keyed by exercise path.
//!
//! A slot is claimed synchronously before the first suspension point and is
//! released exactly once when its [`FlightSlot`] is dropped, whichever
//! terminal state the operation reaches.
//!
//! Polling runs as a spawned task on a fixed-period timer. Detach and abort
//! cancel [`CancellationToken`]s held by the [`SubmissionHandle`]; a network
//! call in flight at that moment is dropped and its result discarded.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::collaborators::{ExerciseRunner, TestRunOutcome};
use crate::config::SubmissionConfig;
use crate::error::{Result, TmcError};
use crate::feedback::{parse_questions, FeedbackQuestion};
use crate::remote::{
    FeedbackAnswer, RemoteClient, SubmissionPoll, SubmissionResult, SubmissionResultStatus,
};

// ============================================================================
// Session State
// ============================================================================

/// State of a graded submission.
///
/// `Submitting` → `Polling` → one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Uploading the exercise.
    Submitting,
    /// Waiting for the grader.
    Polling,
    /// Finished, with or without a verdict.
    Done,
    /// Stopped by a remote error.
    Failed,
    /// Cancelled by the caller or by a server cooldown.
    Aborted,
}

impl SessionStatus {
    /// Returns `true` for `Done`, `Failed` and `Aborted`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }
}

/// Snapshot of a live submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionSession {
    /// Exercise being submitted.
    pub exercise_id: u64,
    /// API URL of the submission, once known.
    pub submission_url: Option<String>,
    /// Current state.
    pub status: SessionStatus,
    /// When the submission was started.
    pub started_at: DateTime<Utc>,
    /// When the status endpoint was last polled.
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Polling period.
    pub poll_interval_ms: u64,
    /// Time spent since the upload finished.
    pub elapsed_ms: u64,
}

impl SubmissionSession {
    fn new(exercise_id: u64, poll_interval: Duration) -> Self {
        Self {
            exercise_id,
            submission_url: None,
            status: SessionStatus::Submitting,
            started_at: Utc::now(),
            last_polled_at: None,
            poll_interval_ms: millis(poll_interval),
            elapsed_ms: 0,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Single-flight Tables
// ============================================================================

fn lock<K, V>(entries: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keys with an operation in flight, each with its live state.
struct FlightTable<K: Eq + Hash, V> {
    entries: Arc<Mutex<HashMap<K, V>>>,
}

impl<K: Eq + Hash + Clone, V> FlightTable<K, V> {
    fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claims `key`, or returns `None` if it is already taken.
    fn try_acquire(&self, key: K, value: V) -> Option<FlightSlot<K, V>> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&key) {
            return None;
        }
        entries.insert(key.clone(), value);
        Some(FlightSlot {
            entries: Arc::clone(&self.entries),
            key,
        })
    }

    fn contains(&self, key: &K) -> bool {
        lock(&self.entries).contains_key(key)
    }

    fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        lock(&self.entries).get(key).cloned()
    }
}

/// Ownership of one key in a [`FlightTable`]. Dropping releases the key.
struct FlightSlot<K: Eq + Hash, V> {
    entries: Arc<Mutex<HashMap<K, V>>>,
    key: K,
}

impl<K: Eq + Hash, V> FlightSlot<K, V> {
    fn update(&self, f: impl FnOnce(&mut V)) {
        if let Some(value) = lock(&self.entries).get_mut(&self.key) {
            f(value);
        }
    }
}

impl<K: Eq + Hash, V> Drop for FlightSlot<K, V> {
    fn drop(&mut self) {
        lock(&self.entries).remove(&self.key);
    }
}

// ============================================================================
// Events and Outcomes
// ============================================================================

/// Why a submission was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller aborted, or dropped the handle.
    Cancelled,
    /// The grading server refused the upload because of a cooldown.
    ServerBusy,
}

/// A finished grading result with parsed feedback questions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionVerdict {
    /// The server's result.
    pub result: SubmissionResult,
    /// Feedback questions, only for passing submissions.
    pub feedback_questions: Vec<FeedbackQuestion>,
}

impl SubmissionVerdict {
    fn from_result(result: SubmissionResult) -> Self {
        let passed =
            result.status == SubmissionResultStatus::Ok && result.all_tests_passed == Some(true);
        let feedback_questions = match (&result.feedback_questions, passed) {
            (Some(questions), true) => parse_questions(questions),
            _ => Vec::new(),
        };
        Self {
            result,
            feedback_questions,
        }
    }
}

/// Terminal result of a submission.
#[derive(Debug)]
pub enum SubmissionOutcome {
    /// Grading finished and the verdict is available.
    Completed(Box<SubmissionVerdict>),
    /// The caller stopped waiting; grading continues on the server.
    Detached {
        /// Browser URL where the result can be viewed later.
        submission_url: Option<String>,
    },
    /// Aborted without a user-visible error.
    Aborted(AbortReason),
    /// Stopped by a remote error.
    Failed(TmcError),
}

impl SubmissionOutcome {
    /// The terminal session status this outcome corresponds to.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        match self {
            Self::Completed(_) | Self::Detached { .. } => SessionStatus::Done,
            Self::Aborted(_) => SessionStatus::Aborted,
            Self::Failed(_) => SessionStatus::Failed,
        }
    }
}

/// Events delivered on a submission's channel, in order.
#[derive(Debug)]
pub enum SubmissionEvent {
    /// The browser link of the submission, sent before polling starts.
    SubmissionUrl(String),
    /// Sent on every poll while grading is in progress.
    Progress {
        /// Rough completion percentage.
        percent: u8,
        /// Status message, omitted if identical to the previous one.
        message: Option<String>,
    },
    /// Sent once when grading takes longer than the escalation threshold.
    Escalated {
        /// Time spent polling so far.
        elapsed: Duration,
    },
    /// Always the last event.
    Finished(SubmissionOutcome),
}

/// Caller's side of a running submission.
///
/// Dropping the handle aborts the submission.
#[derive(Debug)]
pub struct SubmissionHandle {
    exercise_id: u64,
    events: mpsc::UnboundedReceiver<SubmissionEvent>,
    detach: CancellationToken,
    abort: CancellationToken,
    task: JoinHandle<()>,
    _abort_on_drop: DropGuard,
}

impl SubmissionHandle {
    /// The exercise being submitted.
    #[must_use]
    pub const fn exercise_id(&self) -> u64 {
        self.exercise_id
    }

    /// Receives the next event. Returns `None` after `Finished`.
    pub async fn next_event(&mut self) -> Option<SubmissionEvent> {
        self.events.recv().await
    }

    /// Stops waiting for the verdict. The session ends as `Done`.
    pub fn detach(&self) {
        self.detach.cancel();
    }

    /// Cancels the submission. The session ends as `Aborted`.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Discards intermediate events and returns the outcome.
    ///
    /// Returns after the session's slot has been released.
    pub async fn wait(mut self) -> SubmissionOutcome {
        let mut outcome = None;
        while let Some(event) = self.events.recv().await {
            if let SubmissionEvent::Finished(o) = event {
                outcome = Some(o);
            }
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Submission task ended abnormally");
        }
        outcome.unwrap_or(SubmissionOutcome::Aborted(AbortReason::Cancelled))
    }
}

// ============================================================================
// Local Test Runs
// ============================================================================

/// A running local test execution.
#[derive(Debug)]
pub struct TestRun {
    cancel: CancellationToken,
    task: JoinHandle<Result<TestRunOutcome>>,
}

impl TestRun {
    /// Requests the run to stop. It resolves to `Interrupted`.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// A token that interrupts the run when cancelled.
    #[must_use]
    pub fn interrupt_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the run to finish.
    pub async fn result(self) -> Result<TestRunOutcome> {
        self.task
            .await
            .map_err(|e| TmcError::runner(format!("test run task failed: {e}")))?
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Owner of all submission, paste and test-run state.
pub struct SubmissionOrchestrator {
    remote: Arc<dyn RemoteClient>,
    runner: Arc<dyn ExerciseRunner>,
    config: SubmissionConfig,
    sessions: FlightTable<u64, SubmissionSession>,
    pastes: FlightTable<u64, ()>,
    test_runs: FlightTable<PathBuf, ()>,
}

impl std::fmt::Debug for SubmissionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SubmissionOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        runner: Arc<dyn ExerciseRunner>,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            remote,
            runner,
            config,
            sessions: FlightTable::new(),
            pastes: FlightTable::new(),
            test_runs: FlightTable::new(),
        }
    }

    /// Returns a snapshot of the live session for an exercise.
    #[must_use]
    pub fn session(&self, exercise_id: u64) -> Option<SubmissionSession> {
        self.sessions.get(&exercise_id)
    }

    /// Returns `true` if a submission for the exercise is in flight.
    #[must_use]
    pub fn is_submitting(&self, exercise_id: u64) -> bool {
        self.sessions.contains(&exercise_id)
    }

    /// Starts a graded submission.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::Bottleneck` without sending anything if a
    /// submission for the same exercise is already in flight.
    pub fn submit(&self, exercise_id: u64, exercise_path: &Path) -> Result<SubmissionHandle> {
        let slot = self
            .sessions
            .try_acquire(
                exercise_id,
                SubmissionSession::new(exercise_id, self.config.poll_interval()),
            )
            .ok_or_else(|| {
                TmcError::bottleneck(format!(
                    "submission for exercise {exercise_id} is already in progress"
                ))
            })?;

        info!(exercise_id, path = %exercise_path.display(), "Submitting exercise to server");
        let (tx, rx) = mpsc::unbounded_channel();
        let detach = CancellationToken::new();
        let abort = CancellationToken::new();

        let task = SubmissionTask {
            exercise_id,
            exercise_path: exercise_path.to_path_buf(),
            remote: Arc::clone(&self.remote),
            runner: Arc::clone(&self.runner),
            poll_interval: self.config.poll_interval(),
            escalation: self.config.escalation_threshold(),
            events: tx,
            detach: detach.clone(),
            abort: abort.clone(),
            slot,
        };
        let join = tokio::spawn(task.run());

        Ok(SubmissionHandle {
            exercise_id,
            events: rx,
            detach,
            _abort_on_drop: abort.clone().drop_guard(),
            abort,
            task: join,
        })
    }

    /// Posts feedback answers for a graded submission.
    pub async fn submit_feedback(&self, feedback_url: &str, answers: &[FeedbackAnswer]) -> Result<()> {
        self.remote.submit_feedback(feedback_url, answers).await
    }

    /// Sends an exercise to the paste service and returns the link.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::Bottleneck` if a paste for the exercise is in
    /// flight and `TmcError::PasteLinkMissing` if the server answered with
    /// an empty link.
    pub async fn paste(&self, exercise_id: u64, exercise_path: &Path) -> Result<String> {
        let _slot = self.pastes.try_acquire(exercise_id, ()).ok_or_else(|| {
            TmcError::bottleneck(format!("paste for exercise {exercise_id} is already in progress"))
        })?;

        let archive = self.runner.compress_project(exercise_path).await?;
        let link = self.remote.submit_to_paste(exercise_id, archive).await?;
        if link.is_empty() {
            warn!(exercise_id, "Paste response had no link");
            return Err(TmcError::PasteLinkMissing);
        }
        info!(exercise_id, link = %link, "Exercise sent to paste");
        Ok(link)
    }

    /// Starts a local test run.
    ///
    /// Returns `Ok(None)` for exam-mode courses, where local tests are not run.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::Bottleneck` if tests for the same path are running.
    pub fn run_tests(&self, exercise_path: &Path, exam_mode: bool) -> Result<Option<TestRun>> {
        if exam_mode {
            info!(path = %exercise_path.display(), "Skipping local tests in exam mode");
            return Ok(None);
        }
        let slot = self
            .test_runs
            .try_acquire(exercise_path.to_path_buf(), ())
            .ok_or_else(|| {
                TmcError::bottleneck(format!(
                    "tests for {} are already running",
                    exercise_path.display()
                ))
            })?;

        let cancel = CancellationToken::new();
        let runner = Arc::clone(&self.runner);
        let path = exercise_path.to_path_buf();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let _slot = slot;
            debug!(path = %path.display(), "Running local tests");
            tokio::select! {
                biased;
                () = token.cancelled() => Ok(TestRunOutcome::Interrupted),
                result = runner.run_tests(&path, token.clone()) => result,
            }
        });
        Ok(Some(TestRun { cancel, task }))
    }
}

// ============================================================================
// Submission Task
// ============================================================================

struct SubmissionTask {
    exercise_id: u64,
    exercise_path: PathBuf,
    remote: Arc<dyn RemoteClient>,
    runner: Arc<dyn ExerciseRunner>,
    poll_interval: Duration,
    escalation: Duration,
    events: mpsc::UnboundedSender<SubmissionEvent>,
    detach: CancellationToken,
    abort: CancellationToken,
    slot: FlightSlot<u64, SubmissionSession>,
}

/// Result of racing a step against detach and abort.
enum Step<T> {
    Done(T),
    Stopped(SubmissionOutcome),
}

impl SubmissionTask {
    async fn run(self) {
        let outcome = self.execute().await;
        let status = outcome.status();
        match &outcome {
            SubmissionOutcome::Failed(e) => {
                warn!(exercise_id = self.exercise_id, error = %e, "Submission failed");
            }
            SubmissionOutcome::Aborted(AbortReason::ServerBusy) => {
                warn!(exercise_id = self.exercise_id, "Submission cancelled by server cooldown");
            }
            _ => info!(exercise_id = self.exercise_id, ?status, "Submission finished"),
        }
        self.slot.update(|s| s.status = status);
        self.emit(SubmissionEvent::Finished(outcome));
        // slot released when self is dropped here
    }

    fn emit(&self, event: SubmissionEvent) {
        // A closed receiver means the caller went away; nothing to deliver to.
        let _ = self.events.send(event);
    }

    async fn race<T>(
        &self,
        browser_url: Option<&str>,
        step: impl std::future::Future<Output = T>,
    ) -> Step<T> {
        tokio::select! {
            biased;
            () = self.abort.cancelled() => Step::Stopped(SubmissionOutcome::Aborted(AbortReason::Cancelled)),
            () = self.detach.cancelled() => Step::Stopped(SubmissionOutcome::Detached {
                submission_url: browser_url.map(ToString::to_string),
            }),
            value = step => Step::Done(value),
        }
    }

    async fn upload(&self) -> Result<crate::remote::SubmissionCreated> {
        let archive = self.runner.compress_project(&self.exercise_path).await?;
        self.remote.submit_exercise(self.exercise_id, archive).await
    }

    async fn execute(&self) -> SubmissionOutcome {
        let created = match self.race(None, self.upload()).await {
            Step::Stopped(outcome) => return outcome,
            Step::Done(Ok(created)) => created,
            Step::Done(Err(TmcError::Bottleneck(_))) => {
                return SubmissionOutcome::Aborted(AbortReason::ServerBusy);
            }
            Step::Done(Err(e)) => return SubmissionOutcome::Failed(e),
        };

        let browser_url = created
            .show_submission_url
            .clone()
            .unwrap_or_else(|| created.submission_url.clone());
        self.slot.update(|s| {
            s.submission_url = Some(created.submission_url.clone());
            s.status = SessionStatus::Polling;
        });
        self.emit(SubmissionEvent::SubmissionUrl(browser_url.clone()));

        self.poll(&created.submission_url, &browser_url).await
    }

    async fn poll(&self, submission_url: &str, browser_url: &str) -> SubmissionOutcome {
        let started = Instant::now();
        let mut ticker = interval_at(started + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_message: Option<&'static str> = None;
        let mut escalated = false;

        loop {
            if let Step::Stopped(outcome) = self.race(Some(browser_url), ticker.tick()).await {
                return outcome;
            }
            let polled = match self
                .race(Some(browser_url), self.remote.poll_submission(submission_url))
                .await
            {
                Step::Stopped(outcome) => return outcome,
                Step::Done(polled) => polled,
            };

            let elapsed = started.elapsed();
            self.slot.update(|s| {
                s.last_polled_at = Some(Utc::now());
                s.elapsed_ms = millis(elapsed);
            });

            match polled {
                Ok(SubmissionPoll::Processing { sandbox_status }) => {
                    let (percent, message) = sandbox_status.map_or((0, None), |status| {
                        let (percent, message) = status.progress();
                        (percent, Some(message))
                    });
                    let fresh = message.filter(|m| last_message != Some(*m));
                    if fresh.is_some() {
                        last_message = fresh;
                    }
                    self.emit(SubmissionEvent::Progress {
                        percent,
                        message: fresh.map(ToString::to_string),
                    });

                    if !escalated && elapsed >= self.escalation {
                        escalated = true;
                        debug!(exercise_id = self.exercise_id, ?elapsed, "Submission is taking long");
                        self.emit(SubmissionEvent::Escalated { elapsed });
                    }
                }
                Ok(SubmissionPoll::Finished(result)) => {
                    self.emit(SubmissionEvent::Progress {
                        percent: 100,
                        message: None,
                    });
                    return SubmissionOutcome::Completed(Box::new(SubmissionVerdict::from_result(
                        *result,
                    )));
                }
                Err(e) => return SubmissionOutcome::Failed(e),
            }
        }
    }
}
