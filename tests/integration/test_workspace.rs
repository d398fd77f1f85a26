//! Integration tests for the exercise workspace.
//!
//! Courses are added and exercises downloaded from an in-process fake TMC
//! server through the real `HttpClient`. The workspace host is the
//! `.code-workspace` descriptor file, as in the command-line client.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tmc_client::HttpClient;
use tmc_core::workspace::ROOT_FILE_TEXT;
use tmc_core::{
    host_event_channels, Config, CourseCoordinator, CourseRefresh, DataPaths, ExerciseRunner,
    ExerciseStatus, ExerciseStore, FileDeleted, FileWorkspaceHost, FoldersChanged,
    JsonSettingsStore, NotificationLevel, NotificationSink, ReconcileOutcome, RemoteClient,
    Result as TmcResult, SettingsStore, TestRunOutcome, UserDataStore, WorkspaceContext,
    WorkspaceDescriptor, WorkspaceReconciler,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const COURSE: &str = "python-course";
const COURSE_ID: u64 = 600;

// ============================================================================
// Fake TMC server
// ============================================================================

struct FakeTmc {
    exercises: Mutex<Vec<(u64, String)>>,
    forbidden: AtomicBool,
    downloads: AtomicU32,
}

async fn course_details(
    State(tmc): State<Arc<FakeTmc>>,
    UrlPath(id): UrlPath<u64>,
) -> (StatusCode, Json<Value>) {
    if tmc.forbidden.load(Ordering::SeqCst) {
        return (StatusCode::FORBIDDEN, Json(json!({"errors": ["Forbidden"]})));
    }
    let exercises: Vec<Value> = tmc
        .exercises
        .lock()
        .unwrap()
        .iter()
        .map(|(id, name)| json!({"id": id, "name": name, "completed": false}))
        .collect();
    (
        StatusCode::OK,
        Json(json!({"course": {
            "id": id,
            "name": COURSE,
            "title": "Python Programming",
            "exercises": exercises,
        }})),
    )
}

async fn course_points(State(tmc): State<Arc<FakeTmc>>) -> Json<Value> {
    let exercises: Vec<Value> = tmc
        .exercises
        .lock()
        .unwrap()
        .iter()
        .map(|(id, name)| {
            json!({
                "id": id,
                "name": name,
                "available_points": [{"id": id, "name": format!("{id}.1")}],
                "awarded_points": [],
            })
        })
        .collect();
    Json(Value::Array(exercises))
}

async fn course_settings() -> Json<Value> {
    Json(json!({"disabled_status": "enabled", "material_url": "https://example.org/python"}))
}

async fn download(State(tmc): State<Arc<FakeTmc>>) -> Vec<u8> {
    tmc.downloads.fetch_add(1, Ordering::SeqCst);
    b"PK\x03\x04".to_vec()
}

async fn spawn_fake_tmc(exercises: &[(u64, &str)]) -> (String, Arc<FakeTmc>) {
    let tmc = Arc::new(FakeTmc {
        exercises: Mutex::new(
            exercises
                .iter()
                .map(|(id, name)| (*id, (*name).to_string()))
                .collect(),
        ),
        forbidden: AtomicBool::new(false),
        downloads: AtomicU32::new(0),
    });
    let router = Router::new()
        .route(
            "/api/v8/application/:client/credentials",
            get(|| async { Json(json!({"application_id": "app", "secret": "shh"})) }),
        )
        .route(
            "/oauth/token",
            axum::routing::post(|| async { Json(json!({"access_token": "token"})) }),
        )
        .route("/api/v8/core/courses/:id", get(course_details))
        .route("/api/v8/courses/:id/exercises", get(course_points))
        .route("/api/v8/courses/:id", get(course_settings))
        .route("/api/v8/core/exercises/:id/download", get(download))
        .with_state(tmc.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });
    (format!("http://{addr}"), tmc)
}

// ============================================================================
// Collaborators
// ============================================================================

/// Extracts an exercise by creating its directory.
struct DirRunner;

#[async_trait]
impl ExerciseRunner for DirRunner {
    async fn run_tests(&self, _: &Path, _: CancellationToken) -> TmcResult<TestRunOutcome> {
        Ok(TestRunOutcome::Interrupted)
    }

    async fn compress_project(&self, _: &Path) -> TmcResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn extract_project(&self, archive: &[u8], target: &Path) -> TmcResult<()> {
        tokio::fs::create_dir_all(target).await?;
        tokio::fs::write(target.join("template.zip"), archive).await?;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    status_changes: Mutex<Vec<(u64, bool)>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, _: NotificationLevel, _: &str) {}

    async fn ask(&self, _: &str, _: &[&str]) -> Option<usize> {
        None
    }

    async fn course_status_changed(&self, course_id: u64, disabled: bool, _: &[u64]) {
        self.status_changes
            .lock()
            .unwrap()
            .push((course_id, disabled));
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    base_url: String,
    tmc: Arc<FakeTmc>,
    paths: DataPaths,
    settings: Arc<JsonSettingsStore>,
    sink: Arc<RecordingSink>,
    workspace: Arc<WorkspaceReconciler>,
    courses: CourseCoordinator,
}

impl Harness {
    fn ctx(&self) -> WorkspaceContext {
        WorkspaceContext::new(self.paths.workspace_file(COURSE))
    }

    async fn folders(&self) -> Vec<PathBuf> {
        WorkspaceDescriptor::load(&self.paths.workspace_file(COURSE))
            .await
            .expect("Failed to read workspace descriptor")
            .folders
            .into_iter()
            .map(|f| f.path)
            .collect()
    }

    fn exercise_dir(&self, exercise: &str) -> PathBuf {
        self.paths.exercise_dir(COURSE, exercise)
    }

    fn client(&self, server_url: &str) -> Arc<HttpClient> {
        let config = Config {
            server_url: server_url.to_string(),
            ..Config::default()
        };
        let credentials = Arc::new(tmc_core::FileCredentialStore::new(&self.paths.credentials));
        Arc::new(HttpClient::new(&config, credentials).expect("Failed to build client"))
    }

    fn coordinator(&self, remote: Arc<dyn RemoteClient>) -> CourseCoordinator {
        CourseCoordinator::new(
            remote,
            Arc::new(DirRunner),
            self.sink.clone(),
            self.courses.user_data().clone(),
            self.workspace.clone(),
            self.paths.clone(),
            chrono::Duration::minutes(30),
        )
    }
}

/// Logs in, adds the course and downloads every exercise.
async fn harness(exercises: &[(u64, &str)]) -> Harness {
    let (base_url, tmc) = spawn_fake_tmc(exercises).await;
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let paths = DataPaths::new(dir.path());

    let config = Config {
        server_url: base_url.clone(),
        data_dir: dir.path().display().to_string(),
        ..Config::default()
    };
    let credentials = Arc::new(tmc_core::FileCredentialStore::new(&paths.credentials));
    let remote = Arc::new(HttpClient::new(&config, credentials).expect("Failed to build client"));
    remote
        .authenticate("student", "password")
        .await
        .expect("Login failed");

    let store = Arc::new(ExerciseStore::open(&paths.exercises, &paths.projects).unwrap());
    let settings = Arc::new(JsonSettingsStore::open(&paths.settings).unwrap());
    let host = Arc::new(FileWorkspaceHost::new(paths.workspace_file(COURSE)));
    let workspace = Arc::new(WorkspaceReconciler::new(
        store,
        host,
        settings.clone(),
        paths.clone(),
        config.editor,
    ));
    workspace.ensure_root().await.unwrap();

    let sink = Arc::new(RecordingSink::default());
    let courses = CourseCoordinator::new(
        remote,
        Arc::new(DirRunner),
        sink.clone(),
        Arc::new(UserDataStore::open(&paths.user_data).unwrap()),
        workspace.clone(),
        paths.clone(),
        config.notification_delay(),
    );

    let course = courses.add_course("mooc", COURSE_ID).await.unwrap();
    let ids: Vec<u64> = course.exercises.iter().map(|e| e.id).collect();
    let report = courses.download_exercises(COURSE_ID, &ids).await.unwrap();
    assert!(report.failed.is_empty(), "downloads failed: {:?}", report.failed);

    Harness {
        _dir: dir,
        base_url,
        tmc,
        paths,
        settings,
        sink,
        workspace,
        courses,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_downloaded_exercises_start_closed() {
    let h = harness(&[(1, "A"), (2, "B")]).await;

    assert_eq!(h.tmc.downloads.load(Ordering::SeqCst), 2);
    let store = h.workspace.store();
    assert_eq!(store.get(COURSE, "A").unwrap().status, ExerciseStatus::Closed);
    assert!(h.exercise_dir("B").join("template.zip").exists());
    assert_eq!(
        h.settings
            .get_setting(&format!("closed-exercises-for:{COURSE}"))
            .unwrap(),
        Some(json!(["A", "B"]))
    );
    assert_eq!(h.folders().await, vec![h.workspace.root_folder()]);
}

#[tokio::test]
async fn test_open_close_round_trip() {
    let h = harness(&[(1, "A"), (2, "B")]).await;
    let ctx = h.ctx();

    h.workspace.open_exercises(&ctx, COURSE, &["B", "A"]).await.unwrap();
    assert_eq!(
        h.folders().await,
        vec![
            h.workspace.root_folder(),
            h.exercise_dir("A"),
            h.exercise_dir("B")
        ]
    );

    h.workspace.close_exercises(&ctx, COURSE, &["A"]).await.unwrap();
    assert_eq!(
        h.folders().await,
        vec![h.workspace.root_folder(), h.exercise_dir("B")]
    );
    assert_eq!(
        h.settings
            .get_setting(&format!("closed-exercises-for:{COURSE}"))
            .unwrap(),
        Some(json!(["A"]))
    );

    // Nothing changed since the last reconciliation
    assert_eq!(
        h.workspace.reconcile(&ctx).await.unwrap(),
        ReconcileOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_reconcile_repairs_hand_edited_descriptor() {
    let h = harness(&[(1, "A")]).await;
    let ctx = h.ctx();
    h.workspace.open_exercises(&ctx, COURSE, &["A"]).await.unwrap();

    // Someone reorders the folders by hand
    let path = h.paths.workspace_file(COURSE);
    let mut descriptor = WorkspaceDescriptor::load(&path).await.unwrap();
    descriptor.folders.reverse();
    descriptor.save(&path).await.unwrap();

    assert_eq!(
        h.workspace.reconcile(&ctx).await.unwrap(),
        ReconcileOutcome::Replaced
    );
    assert_eq!(
        h.folders().await,
        vec![h.workspace.root_folder(), h.exercise_dir("A")]
    );
    // Settings written at creation survive the rewrite
    let descriptor = WorkspaceDescriptor::load(&path).await.unwrap();
    assert_eq!(descriptor.settings["files.autoSave"], json!("onFocusChange"));
}

#[tokio::test]
async fn test_host_events_drive_the_workspace() {
    let h = harness(&[(1, "A"), (2, "B")]).await;
    let ctx = h.ctx();
    h.workspace.open_exercises(&ctx, COURSE, &["A", "B"]).await.unwrap();

    let (events, receivers) = host_event_channels(16);
    let (_ctx_tx, ctx_rx) = watch::channel(ctx.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.workspace.clone().run(receivers, ctx_rx, cancel.clone()));

    // Folder removed in the editor closes the exercise
    events
        .folders_changed
        .send(FoldersChanged {
            added: vec![PathBuf::from("/home/student/notes")],
            removed: vec![h.exercise_dir("A")],
        })
        .await
        .unwrap();

    let expected = vec![h.workspace.root_folder(), h.exercise_dir("B")];
    for _ in 0..200 {
        if h.folders().await == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.folders().await, expected);
    assert_eq!(
        h.workspace.store().get(COURSE, "A").unwrap().status,
        ExerciseStatus::Closed
    );

    // Deleted marker file is recreated
    let marker = h.workspace.marker_file();
    std::fs::remove_file(&marker).unwrap();
    events
        .file_deleted
        .send(FileDeleted {
            path: marker.clone(),
        })
        .await
        .unwrap();
    for _ in 0..200 {
        if marker.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), ROOT_FILE_TEXT);

    cancel.cancel();
    task.await.expect("reconciler task panicked");
}

#[tokio::test]
async fn test_forbidden_course_is_disabled_once() {
    let h = harness(&[(1, "A")]).await;
    h.tmc.forbidden.store(true, Ordering::SeqCst);

    assert_eq!(
        h.courses.update_course(COURSE_ID).await.unwrap(),
        CourseRefresh::Disabled
    );
    let disabled = h.courses.user_data().get_course(COURSE_ID).unwrap();
    assert!(disabled.disabled);

    assert_eq!(
        h.courses.update_course(COURSE_ID).await.unwrap(),
        CourseRefresh::Disabled
    );
    assert_eq!(h.courses.user_data().get_course(COURSE_ID).unwrap(), disabled);
    assert_eq!(
        *h.sink.status_changes.lock().unwrap(),
        vec![(COURSE_ID, true), (COURSE_ID, true)]
    );
}

#[tokio::test]
async fn test_new_exercises_found_on_refresh() {
    let h = harness(&[(1, "A")]).await;
    h.tmc.exercises.lock().unwrap().push((2, "B".to_string()));

    assert_eq!(
        h.courses.update_course(COURSE_ID).await.unwrap(),
        CourseRefresh::Updated
    );
    assert_eq!(
        h.courses
            .user_data()
            .get_course(COURSE_ID)
            .unwrap()
            .new_exercise_ids,
        vec![2]
    );

    let report = h.courses.download_new_exercises(COURSE_ID).await.unwrap();
    assert_eq!(report.downloaded, vec![2]);
    assert!(h
        .courses
        .user_data()
        .get_course(COURSE_ID)
        .unwrap()
        .new_exercise_ids
        .is_empty());
    assert!(h.workspace.store().get(COURSE, "B").is_some());
}

#[tokio::test]
async fn test_unreachable_server_leaves_course_untouched() {
    let h = harness(&[(1, "A")]).await;
    let before = h.courses.user_data().get_course(COURSE_ID).unwrap();

    // Shares the stored token, but nothing listens on the discard port
    let offline = h.coordinator(h.client("http://127.0.0.1:9"));
    assert_eq!(
        offline.update_course(COURSE_ID).await.unwrap(),
        CourseRefresh::Unreachable
    );
    assert_eq!(h.courses.user_data().get_course(COURSE_ID).unwrap(), before);

    // The real server still works with the same token
    let online = h.coordinator(h.client(&h.base_url));
    assert_eq!(
        online.update_course(COURSE_ID).await.unwrap(),
        CourseRefresh::Updated
    );
}
