//! HTTP implementation of [`RemoteClient`] for the TMC v8 REST API.
//!
//! The client is stateless apart from the access token and a course data
//! cache that `force_refresh` bypasses. It never retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use tmc_core::{
    Config, CourseData, CourseDataOptions, CourseDetails, CourseExercise, CourseSettings,
    CourseSummary, CredentialStore, FeedbackAnswer, Organization, RemoteClient, Result,
    SandboxStatus, SubmissionCreated, SubmissionPoll, SubmissionResult, TmcError,
};

#[derive(Debug, Deserialize)]
struct ApplicationCredentials {
    application_id: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CourseDetailsEnvelope {
    course: CourseDetails,
}

/// TMC server client over HTTP.
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    client_name: String,
    client_version: String,
    credentials: Arc<dyn CredentialStore>,
    token: Mutex<Option<String>>,
    course_cache: Mutex<HashMap<u64, CourseData>>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Creates a client for `config.server_url`, restoring any stored token.
    ///
    /// # Errors
    ///
    /// Returns `TmcError::Connection` if the HTTP client cannot be built and
    /// `TmcError::StateFileCorrupted` if the credentials file is unreadable.
    pub fn new(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(format!("{}/{}", config.client_name, config.client_version))
            .build()
            .map_err(|e| TmcError::connection(format!("Failed to build HTTP client: {e}")))?;
        let token = credentials.load_token()?;
        Ok(Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            client_name: config.client_name.clone(),
            client_version: config.client_version.clone(),
            credentials,
            token: Mutex::new(token),
            course_cache: Mutex::new(HashMap::new()),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/v8/{endpoint}", self.base_url)
    }

    fn token(&self) -> MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<u64, CourseData>> {
        self.course_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signs a request with the access token and client identification.
    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.token().clone().ok_or(TmcError::NotAuthenticated)?;
        Ok(request.bearer_auth(token).query(&[
            ("client", self.client_name.as_str()),
            ("client_version", self.client_version.as_str()),
        ]))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        let response = send(self.authorized(self.http.get(url))?).await?;
        decode(response).await
    }
}

// ============================================================================
// Response handling
// ============================================================================

async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await.map_err(transport_error)?;
    check_status(response)
}

fn transport_error(error: reqwest::Error) -> TmcError {
    if error.is_timeout() {
        TmcError::connection("Request timed out")
    } else {
        TmcError::connection(format!("Connection error: {error}"))
    }
}

fn status_message(status: StatusCode) -> String {
    format!(
        "{} - {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = status_message(status);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TmcError::authorization(message),
        StatusCode::TOO_MANY_REQUESTS => TmcError::bottleneck(message),
        _ => TmcError::api(message),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&body)
        .map_err(|e| TmcError::api(format!("Unexpected response from server: {e}")))
}

fn parse_poll(value: serde_json::Value) -> Result<SubmissionPoll> {
    if value.get("status").and_then(serde_json::Value::as_str) == Some("processing") {
        let sandbox_status = value
            .get("sandbox_status")
            .cloned()
            .and_then(|s| serde_json::from_value::<SandboxStatus>(s).ok());
        return Ok(SubmissionPoll::Processing { sandbox_status });
    }
    let result: SubmissionResult = serde_json::from_value(value)
        .map_err(|e| TmcError::api(format!("Unexpected submission status: {e}")))?;
    Ok(SubmissionPoll::Finished(Box::new(result)))
}

fn archive_part(archive: Vec<u8>) -> Result<Part> {
    Part::bytes(archive)
        .file_name("submission.zip")
        .mime_str("application/zip")
        .map_err(|e| TmcError::api(e.to_string()))
}

// ============================================================================
// RemoteClient
// ============================================================================

#[async_trait]
impl RemoteClient for HttpClient {
    #[instrument(skip(self, password))]
    async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        if self.token().is_some() {
            return Err(TmcError::authentication("Already logged in"));
        }

        let url = self.api_url(&format!("application/{}/credentials", self.client_name));
        let app: ApplicationCredentials = decode(send(self.http.get(url)).await?).await?;

        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .form(&[
                ("grant_type", "password"),
                ("client_id", app.application_id.as_str()),
                ("client_secret", app.secret.as_str()),
                ("username", username),
                ("password", password),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED
        ) {
            return Err(TmcError::authentication("Incorrect username and/or password"));
        }
        let token: TokenResponse = decode(check_status(response)?).await?;

        self.credentials.store_token(&token.access_token)?;
        *self.token() = Some(token.access_token);
        info!("Logged in");
        Ok(())
    }

    async fn deauthenticate(&self) -> Result<()> {
        self.token().take();
        self.cache().clear();
        self.credentials.clear_token()?;
        info!("Logged out");
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    #[instrument(skip(self))]
    async fn get_organizations(&self) -> Result<Vec<Organization>> {
        self.get_json(self.api_url("org.json")).await
    }

    #[instrument(skip(self))]
    async fn get_courses(&self, organization: &str) -> Result<Vec<CourseSummary>> {
        self.get_json(self.api_url(&format!("core/org/{organization}/courses")))
            .await
    }

    #[instrument(skip(self))]
    async fn get_course_data(
        &self,
        course_id: u64,
        options: CourseDataOptions,
    ) -> Result<CourseData> {
        if !options.force_refresh {
            if let Some(cached) = self.cache().get(&course_id).cloned() {
                debug!(course_id, "Course data served from cache");
                return Ok(cached);
            }
        }

        let (details, exercises, settings) = tokio::try_join!(
            self.get_json::<CourseDetailsEnvelope>(self.api_url(&format!("core/courses/{course_id}"))),
            self.get_json::<Vec<CourseExercise>>(self.api_url(&format!("courses/{course_id}/exercises"))),
            self.get_json::<CourseSettings>(self.api_url(&format!("courses/{course_id}"))),
        )?;
        let data = CourseData {
            details: details.course,
            exercises,
            settings,
        };
        self.cache().insert(course_id, data.clone());
        Ok(data)
    }

    #[instrument(skip(self))]
    async fn download_exercise(&self, exercise_id: u64) -> Result<Vec<u8>> {
        let url = self.api_url(&format!("core/exercises/{exercise_id}/download"));
        let response = send(self.authorized(self.http.get(url))?).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        debug!(exercise_id, size = bytes.len(), "Exercise downloaded");
        Ok(bytes.to_vec())
    }

    #[instrument(skip(self, archive), fields(size = archive.len()))]
    async fn submit_exercise(
        &self,
        exercise_id: u64,
        archive: Vec<u8>,
    ) -> Result<SubmissionCreated> {
        let url = self.api_url(&format!("core/exercises/{exercise_id}/submissions"));
        let form = Form::new().part("submission[file]", archive_part(archive)?);
        let response = send(self.authorized(self.http.post(url))?.multipart(form)).await?;
        decode(response).await
    }

    #[instrument(skip(self))]
    async fn poll_submission(&self, submission_url: &str) -> Result<SubmissionPoll> {
        let value: serde_json::Value = self.get_json(submission_url.to_string()).await?;
        parse_poll(value)
    }

    #[instrument(skip(self, answers), fields(count = answers.len()))]
    async fn submit_feedback(&self, feedback_url: &str, answers: &[FeedbackAnswer]) -> Result<()> {
        let fields: Vec<(String, String)> = answers
            .iter()
            .enumerate()
            .flat_map(|(i, a)| {
                [
                    (format!("answers[{i}][question_id]"), a.question_id.to_string()),
                    (format!("answers[{i}][answer]"), a.answer.clone()),
                ]
            })
            .collect();
        send(self.authorized(self.http.post(feedback_url))?.form(&fields)).await?;
        Ok(())
    }

    #[instrument(skip(self, archive), fields(size = archive.len()))]
    async fn submit_to_paste(&self, exercise_id: u64, archive: Vec<u8>) -> Result<String> {
        let url = self.api_url(&format!("core/exercises/{exercise_id}/submissions"));
        let form = Form::new()
            .text("paste", "1")
            .part("submission[file]", archive_part(archive)?);
        let response = send(self.authorized(self.http.post(url))?.multipart(form)).await?;
        let created: SubmissionCreated = decode(response).await?;
        Ok(created.paste_url.unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tmc_core::{FileCredentialStore, SubmissionResultStatus};
    use tokio_test::assert_ok;

    use super::*;

    #[derive(Default)]
    struct ServerState {
        details_calls: AtomicU32,
        fail_with: Mutex<Option<u16>>,
    }

    fn bearer_ok(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer secret-token")
    }

    async fn credentials_handler() -> Json<Value> {
        Json(json!({"application_id": "app", "secret": "shh"}))
    }

    async fn token_handler(body: String) -> (AxumStatus, Json<Value>) {
        if body.contains("password=hunter2") && body.contains("client_id=app") {
            (AxumStatus::OK, Json(json!({"access_token": "secret-token"})))
        } else {
            (AxumStatus::UNAUTHORIZED, Json(json!({"error": "invalid_grant"})))
        }
    }

    async fn details_handler(
        State(state): State<Arc<ServerState>>,
        headers: HeaderMap,
        Path(id): Path<u64>,
    ) -> (AxumStatus, Json<Value>) {
        state.details_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = *state.fail_with.lock().unwrap() {
            return (AxumStatus::from_u16(code).unwrap(), Json(json!({})));
        }
        if !bearer_ok(&headers) {
            return (AxumStatus::FORBIDDEN, Json(json!({})));
        }
        (
            AxumStatus::OK,
            Json(json!({"course": {
                "id": id, "name": "python", "title": "Python",
                "exercises": [{"id": 5, "name": "hello", "completed": true}]
            }})),
        )
    }

    async fn points_handler() -> Json<Value> {
        Json(json!([{"id": 5, "name": "hello",
            "available_points": [{"id": 1, "name": "1.1"}],
            "awarded_points": ["1.1"]}]))
    }

    async fn settings_handler() -> Json<Value> {
        Json(json!({"disabled_status": "enabled", "hide_submission_results": true}))
    }

    async fn submission_handler() -> Json<Value> {
        Json(json!({"status": "processing", "sandbox_status": "sending_to_sandbox"}))
    }

    async fn spawn_server(state: Arc<ServerState>) -> String {
        let app = Router::new()
            .route("/api/v8/application/:client/credentials", get(credentials_handler))
            .route("/oauth/token", post(token_handler))
            .route("/api/v8/core/courses/:id", get(details_handler))
            .route("/api/v8/courses/:id/exercises", get(points_handler))
            .route("/api/v8/courses/:id", get(settings_handler))
            .route("/api/v8/submissions/:id", get(submission_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str, dir: &tempfile::TempDir) -> HttpClient {
        let config = Config {
            server_url: base_url.to_string(),
            ..Config::default()
        };
        let credentials = Arc::new(FileCredentialStore::new(dir.path().join("credentials.json")));
        HttpClient::new(&config, credentials).unwrap()
    }

    #[tokio::test]
    async fn test_login_stores_token() {
        let base = spawn_server(Arc::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let client = client(&base, &dir);

        assert!(!client.is_authenticated().await);
        assert_ok!(client.authenticate("user", "hunter2").await);
        assert!(client.is_authenticated().await);

        // A second client restores the token from disk
        let restored = self::client(&base, &dir);
        assert!(restored.is_authenticated().await);

        let again = client.authenticate("user", "hunter2").await.unwrap_err();
        assert!(matches!(again, TmcError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_wrong_password_is_authentication_error() {
        let base = spawn_server(Arc::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let client = client(&base, &dir);

        let err = client.authenticate("user", "wrong").await.unwrap_err();
        assert!(matches!(err, TmcError::Authentication(_)));
        assert!(!client.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_requests_need_token() {
        let base = spawn_server(Arc::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let client = client(&base, &dir);

        let err = client
            .get_course_data(1, CourseDataOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TmcError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_course_data_is_cached_until_forced() {
        let state = Arc::new(ServerState::default());
        let base = spawn_server(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let client = client(&base, &dir);
        client.authenticate("user", "hunter2").await.unwrap();

        let data = client
            .get_course_data(7, CourseDataOptions::default())
            .await
            .unwrap();
        assert_eq!(data.details.id, 7);
        assert_eq!(data.exercises[0].awarded_points, vec!["1.1"]);
        assert!(data.settings.hide_submission_results);

        client.get_course_data(7, CourseDataOptions::default()).await.unwrap();
        assert_eq!(state.details_calls.load(Ordering::SeqCst), 1);

        client
            .get_course_data(7, CourseDataOptions { force_refresh: true })
            .await
            .unwrap();
        assert_eq!(state.details_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let state = Arc::new(ServerState::default());
        let base = spawn_server(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let client = client(&base, &dir);
        client.authenticate("user", "hunter2").await.unwrap();
        let forced = CourseDataOptions { force_refresh: true };

        *state.fail_with.lock().unwrap() = Some(403);
        let err = client.get_course_data(1, forced).await.unwrap_err();
        assert!(err.is_authorization());
        assert!(err.to_string().contains("403 - Forbidden"));

        *state.fail_with.lock().unwrap() = Some(429);
        assert!(client.get_course_data(1, forced).await.unwrap_err().is_bottleneck());

        *state.fail_with.lock().unwrap() = Some(500);
        let err = client.get_course_data(1, forced).await.unwrap_err();
        assert!(matches!(err, TmcError::Api(ref m) if m == "500 - Internal Server Error"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = client("http://127.0.0.1:9", &dir);
        let err = client.get_organizations().await.unwrap_err();
        // No token yet
        assert!(matches!(err, TmcError::NotAuthenticated));

        let err = client.authenticate("user", "pw").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_poll_processing_with_sandbox_status() {
        let base = spawn_server(Arc::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let client = client(&base, &dir);
        client.authenticate("user", "hunter2").await.unwrap();

        let poll = client
            .poll_submission(&format!("{base}/api/v8/submissions/3"))
            .await
            .unwrap();
        assert_eq!(
            poll,
            SubmissionPoll::Processing {
                sandbox_status: Some(SandboxStatus::SendingToSandbox)
            }
        );
    }

    #[test]
    fn test_parse_poll_finished() {
        let poll = parse_poll(json!({
            "status": "ok",
            "exercise_name": "hello",
            "all_tests_passed": true,
            "feedback_questions": [{"id": 1, "question": "Hard?", "kind": "intrange[1..5]"}],
            "feedback_answer_url": "http://x/feedback"
        }))
        .unwrap();
        let SubmissionPoll::Finished(result) = poll else {
            panic!("expected finished poll");
        };
        assert_eq!(result.status, SubmissionResultStatus::Ok);
        assert_eq!(result.feedback_questions.unwrap().len(), 1);
    }

    #[test]
    fn test_parse_poll_garbage_is_api_error() {
        let err = parse_poll(json!({"status": "weird"})).unwrap_err();
        assert!(matches!(err, TmcError::Api(_)));
    }
}
