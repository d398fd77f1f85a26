//! Integration tests for the submission lifecycle.
//!
//! A fake TMC server runs in-process on an ephemeral port and the real
//! `HttpClient` talks to it, so these tests cover the HTTP mapping and the
//! orchestrator's state machine together.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tmc_client::HttpClient;
use tmc_core::{
    AbortReason, ExerciseRunner, FeedbackAnswer, FeedbackKind, FileCredentialStore, RemoteClient,
    Result as TmcResult, SessionStatus, SubmissionConfig, SubmissionEvent, SubmissionOrchestrator,
    SubmissionOutcome, TestRunOutcome, TmcError,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fake TMC server
// ============================================================================

struct FakeTmc {
    base_url: String,
    submissions: AtomicU32,
    polls: AtomicU32,
    /// Polls answered with "processing" before the result is returned.
    processing_polls: u32,
    submit_status: Mutex<Option<u16>>,
    paste_url: Mutex<String>,
    feedback_bodies: Mutex<Vec<String>>,
}

async fn credentials() -> Json<Value> {
    Json(json!({"application_id": "app", "secret": "shh"}))
}

async fn token() -> Json<Value> {
    Json(json!({"access_token": "token"}))
}

async fn create_submission(
    State(tmc): State<Arc<FakeTmc>>,
    UrlPath(exercise_id): UrlPath<u64>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(code) = *tmc.submit_status.lock().unwrap() {
        return (StatusCode::from_u16(code).unwrap(), Json(json!({})));
    }
    let is_paste = String::from_utf8_lossy(&body).contains("name=\"paste\"");
    if is_paste {
        let paste_url = tmc.paste_url.lock().unwrap().clone();
        return (
            StatusCode::OK,
            Json(json!({
                "submission_url": format!("{}/api/v8/core/submissions/99", tmc.base_url),
                "paste_url": paste_url,
            })),
        );
    }
    tmc.submissions.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::OK,
        Json(json!({
            "submission_url": format!("{}/api/v8/core/submissions/{exercise_id}", tmc.base_url),
            "show_submission_url": format!("{}/submissions/{exercise_id}", tmc.base_url),
        })),
    )
}

async fn submission_status(State(tmc): State<Arc<FakeTmc>>) -> Json<Value> {
    let n = tmc.polls.fetch_add(1, Ordering::SeqCst);
    if n < tmc.processing_polls {
        let sandbox = if n == 0 { "created" } else { "processing_on_sandbox" };
        return Json(json!({"status": "processing", "sandbox_status": sandbox}));
    }
    Json(json!({
        "status": "ok",
        "exercise_name": "part01-01_hello",
        "all_tests_passed": true,
        "points": ["1.1"],
        "test_cases": [{"name": "HelloTest: test_output", "successful": true}],
        "feedback_questions": [
            {"id": 1, "question": "How hard was it?", "kind": "intrange[-5..10]"},
            {"id": 2, "question": "Comments?", "kind": "text"},
            {"id": 3, "question": "Broken", "kind": "intrange[1..2]extra"}
        ],
        "feedback_answer_url": format!("{}/api/v8/core/submissions/1/feedback", tmc.base_url),
    }))
}

async fn feedback(State(tmc): State<Arc<FakeTmc>>, body: String) -> Json<Value> {
    tmc.feedback_bodies.lock().unwrap().push(body);
    Json(json!({"status": "ok"}))
}

async fn spawn_fake_tmc(processing_polls: u32) -> Arc<FakeTmc> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let tmc = Arc::new(FakeTmc {
        base_url: format!("http://{addr}"),
        submissions: AtomicU32::new(0),
        polls: AtomicU32::new(0),
        processing_polls,
        submit_status: Mutex::new(None),
        paste_url: Mutex::new(String::new()),
        feedback_bodies: Mutex::new(Vec::new()),
    });

    let router = Router::new()
        .route("/api/v8/application/:client/credentials", get(credentials))
        .route("/oauth/token", post(token))
        .route("/api/v8/core/exercises/:id/submissions", post(create_submission))
        .route("/api/v8/core/submissions/:id", get(submission_status))
        .route("/api/v8/core/submissions/:id/feedback", post(feedback))
        .with_state(tmc.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });
    tmc
}

// ============================================================================
// Fixture
// ============================================================================

struct ZipRunner;

#[async_trait]
impl ExerciseRunner for ZipRunner {
    async fn run_tests(&self, _: &Path, cancel: CancellationToken) -> TmcResult<TestRunOutcome> {
        cancel.cancelled().await;
        Ok(TestRunOutcome::Interrupted)
    }

    async fn compress_project(&self, _: &Path) -> TmcResult<Vec<u8>> {
        Ok(b"PK\x03\x04fake".to_vec())
    }

    async fn extract_project(&self, _: &[u8], _: &Path) -> TmcResult<()> {
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    tmc: Arc<FakeTmc>,
    orchestrator: SubmissionOrchestrator,
}

async fn harness(processing_polls: u32) -> Harness {
    let tmc = spawn_fake_tmc(processing_polls).await;
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = tmc_core::Config {
        server_url: tmc.base_url.clone(),
        ..Default::default()
    };
    let credentials = Arc::new(FileCredentialStore::new(dir.path().join("credentials.json")));
    let client = HttpClient::new(&config, credentials).expect("Failed to build client");
    client
        .authenticate("student", "password")
        .await
        .expect("Login failed");

    let orchestrator = SubmissionOrchestrator::new(
        Arc::new(client),
        Arc::new(ZipRunner),
        SubmissionConfig {
            poll_interval_ms: 20,
            escalation_secs: 120,
        },
    );
    Harness {
        _dir: dir,
        tmc,
        orchestrator,
    }
}

const EXERCISE: &str = "/tmp/tmc-data/projects/python-course/part01-01_hello";

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_submit_polls_until_verdict() {
    let h = harness(3).await;
    let mut handle = h.orchestrator.submit(1, Path::new(EXERCISE)).unwrap();
    assert_eq!(
        h.orchestrator.session(1).map(|s| s.exercise_id),
        Some(1),
        "session should be live while submitting"
    );

    let mut events = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(10), handle.next_event())
        .await
        .expect("Timeout waiting for submission event")
    {
        events.push(event);
    }

    match events.first() {
        Some(SubmissionEvent::SubmissionUrl(url)) => {
            assert_eq!(url, &format!("{}/submissions/1", h.tmc.base_url));
        }
        other => panic!("expected submission url first, got {other:?}"),
    }

    let messages: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            SubmissionEvent::Progress {
                message: Some(m), ..
            } => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        messages,
        vec!["Submission is in queue.", "Submission is running."]
    );

    let Some(SubmissionEvent::Finished(SubmissionOutcome::Completed(verdict))) = events.pop()
    else {
        panic!("expected completed verdict last");
    };
    assert_eq!(verdict.result.points, vec!["1.1"]);
    let kinds: Vec<FeedbackKind> = verdict.feedback_questions.iter().map(|q| q.kind).collect();
    assert_eq!(
        kinds,
        vec![
            FeedbackKind::IntRange {
                lower: -5,
                upper: 10
            },
            FeedbackKind::Text
        ]
    );
    assert_eq!(h.tmc.polls.load(Ordering::SeqCst), 4);

    // Slot released once finished
    for _ in 0..50 {
        if h.orchestrator.session(1).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.orchestrator.session(1).is_none());
}

#[tokio::test]
async fn test_concurrent_submit_sends_one_request() {
    let h = harness(2).await;

    let first = h.orchestrator.submit(1, Path::new(EXERCISE)).unwrap();
    let second = h.orchestrator.submit(1, Path::new(EXERCISE));
    assert!(matches!(second, Err(TmcError::Bottleneck(_))));

    let outcome = timeout(Duration::from_secs(10), first.wait())
        .await
        .expect("Timeout waiting for submission");
    assert_eq!(outcome.status(), SessionStatus::Done);
    assert_eq!(h.tmc.submissions.load(Ordering::SeqCst), 1);

    // A new submission is allowed after the first one finished
    let third = h.orchestrator.submit(1, Path::new(EXERCISE)).unwrap();
    third.abort();
    third.wait().await;
}

#[tokio::test]
async fn test_server_cooldown_aborts_silently() {
    let h = harness(0).await;
    *h.tmc.submit_status.lock().unwrap() = Some(429);

    let outcome = h.orchestrator.submit(1, Path::new(EXERCISE)).unwrap().wait().await;
    assert!(matches!(
        outcome,
        SubmissionOutcome::Aborted(AbortReason::ServerBusy)
    ));
    assert_eq!(h.tmc.polls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_forbidden_submit_fails() {
    let h = harness(0).await;
    *h.tmc.submit_status.lock().unwrap() = Some(403);

    let outcome = h.orchestrator.submit(1, Path::new(EXERCISE)).unwrap().wait().await;
    match outcome {
        SubmissionOutcome::Failed(e) => assert!(e.is_authorization()),
        other => panic!("expected authorization failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_detach_keeps_submission_link() {
    // Grading never finishes within the test
    let h = harness(u32::MAX).await;
    let mut handle = h.orchestrator.submit(4, Path::new(EXERCISE)).unwrap();

    let first = timeout(Duration::from_secs(5), handle.next_event())
        .await
        .expect("Timeout waiting for submission url");
    assert!(matches!(first, Some(SubmissionEvent::SubmissionUrl(_))));
    handle.detach();

    match handle.wait().await {
        SubmissionOutcome::Detached { submission_url } => {
            assert_eq!(
                submission_url,
                Some(format!("{}/submissions/4", h.tmc.base_url))
            );
        }
        other => panic!("expected detached outcome, got {other:?}"),
    }
    assert!(h.orchestrator.session(4).is_none());
}

#[tokio::test]
async fn test_paste_empty_link_is_failure() {
    let h = harness(0).await;

    let err = h
        .orchestrator
        .paste(1, Path::new(EXERCISE))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Didn't receive paste link from server.");

    *h.tmc.paste_url.lock().unwrap() = format!("{}/paste/abc123", h.tmc.base_url);
    let link = h.orchestrator.paste(1, Path::new(EXERCISE)).await.unwrap();
    assert!(link.ends_with("/paste/abc123"));
    // Pastes are not graded submissions
    assert_eq!(h.tmc.submissions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_feedback_answers_are_posted() {
    let h = harness(0).await;
    let outcome = h.orchestrator.submit(1, Path::new(EXERCISE)).unwrap().wait().await;
    let SubmissionOutcome::Completed(verdict) = outcome else {
        panic!("expected completed submission");
    };
    let url = verdict
        .result
        .feedback_answer_url
        .clone()
        .expect("feedback url");

    let answers = vec![
        FeedbackAnswer {
            question_id: 1,
            answer: "3".to_string(),
        },
        FeedbackAnswer {
            question_id: 2,
            answer: "Nice exercise".to_string(),
        },
    ];
    h.orchestrator.submit_feedback(&url, &answers).await.unwrap();

    let bodies = h.tmc.feedback_bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("question_id%5D=1"));
    assert!(bodies[0].contains("Nice+exercise"));
}
