use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::extract::ingest_video;
use crate::frame_store::{FrameListing, FrameStore, FrameStoreError, StoreStatus};
use crate::interpolator::{build_interpolator, FrameInterpolator, InterpolatorPool};
use crate::queue::{JobQueue, RetryPolicy};
use crate::repos::RepoRegistry;
use crate::task::{TaskRecord, TaskRegistry};
use crate::worker::{WorkerContext, WorkerPool};

const DEFAULT_PAGE_SIZE: i64 = 20;
const SCRATCH_DIR_NAME: &str = "scratch";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    data_dir: PathBuf,
    repos: Arc<RepoRegistry>,
    tasks: Arc<TaskRegistry>,
    queue: Arc<JobQueue>,
    dispatcher: Dispatcher,
}

impl AppState {
    /// Opens the repos root and the task table under `data_dir`.
    pub fn new(config: AppConfig, data_dir: PathBuf) -> Self {
        let tasks = Arc::new(TaskRegistry::open(&data_dir));
        Self::with_tasks(config, data_dir, tasks)
    }

    pub fn with_tasks(config: AppConfig, data_dir: PathBuf, tasks: Arc<TaskRegistry>) -> Self {
        let repos = Arc::new(RepoRegistry::new(config.resolved_repos_dir(&data_dir)));
        let queue = Arc::new(JobQueue::new());
        let dispatcher =
            Dispatcher::new(Arc::clone(&repos), Arc::clone(&tasks), Arc::clone(&queue));

        Self {
            inner: Arc::new(AppStateInner {
                config,
                data_dir,
                repos,
                tasks,
                queue,
                dispatcher,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn repos(&self) -> &Arc<RepoRegistry> {
        &self.inner.repos
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.inner.tasks
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.inner.queue
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Starts the worker pool with the configured interpolator.
    pub fn spawn_workers(&self) -> Result<WorkerPool> {
        let interpolator =
            build_interpolator(&self.inner.config.interpolator, &self.scratch_dir())?;
        Ok(self.spawn_workers_with(interpolator))
    }

    pub fn spawn_workers_with(&self, interpolator: Arc<dyn FrameInterpolator>) -> WorkerPool {
        let workers = &self.inner.config.workers;
        let ctx = Arc::new(WorkerContext {
            repos: Arc::clone(&self.inner.repos),
            tasks: Arc::clone(&self.inner.tasks),
            queue: Arc::clone(&self.inner.queue),
            interpolators: InterpolatorPool::new(interpolator, workers.model_instances),
            retry: RetryPolicy::from_config(&self.inner.config.queue),
        });
        WorkerPool::spawn(ctx, workers.pool_size)
    }

    /// Redelivers restored unfinished tasks when enabled in config.
    pub fn requeue_on_startup(&self) -> usize {
        if !self.inner.config.tasks.requeue_on_startup {
            let pending = self.inner.tasks.pending().len();
            if pending > 0 {
                warn!(pending, "Startup requeue disabled; unfinished tasks stay as they are");
            }
            return 0;
        }
        self.inner.dispatcher.redeliver_pending()
    }

    /// Periodically drops terminal tasks older than the retention window.
    pub fn spawn_task_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let tasks = Arc::clone(&self.inner.tasks);
        let settings = self.inner.config.tasks.clone();
        let retention = Duration::from_secs(settings.retention_secs);
        let interval = Duration::from_secs(settings.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let purged = tasks.purge_expired(Utc::now(), retention);
                        if purged > 0 {
                            info!(purged, remaining = tasks.len(), "Purged expired tasks");
                        }
                    }
                }
            }
        })
    }

    fn scratch_dir(&self) -> PathBuf {
        self.inner.data_dir.join(SCRATCH_DIR_NAME)
    }

    fn store(&self, repo_id: &str) -> Result<Arc<FrameStore>, AppError> {
        self.inner
            .repos
            .get(repo_id)?
            .ok_or_else(|| AppError::unknown_repo(repo_id))
    }
}

// ─── Request / response types ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRepoRequest {
    pub repo_id: Option<String>,
    pub video_path: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRepoResponse {
    pub repo_id: String,
}

#[derive(Deserialize)]
pub struct FrameRangeQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Serialize)]
pub struct FrameCountResponse {
    pub total: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitInterpolationRequest {
    pub repo_id: String,
    pub target_frames: Vec<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitInterpolationResponse {
    pub task_id: String,
    #[serde(flatten)]
    pub task: TaskRecord,
}

#[derive(Deserialize)]
pub struct TaskListQuery {
    pub repo_id: Option<String>,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/repos", post(create_repo))
        .route("/api/repos/{repo_id}/status", get(repo_status))
        .route("/api/repos/{repo_id}/frames", get(list_frames))
        .route("/api/repos/{repo_id}/frames/count", get(frame_count))
        .route("/api/repos/{repo_id}/frames/{number}/image", get(frame_image))
        .route("/api/interpolations", post(submit_interpolation))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{task_id}", get(get_task))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound {
        code: "NOT_FOUND",
        message: format!("api endpoint not found: /api/{path}"),
    }
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.inner.config.clone())
}

async fn create_repo(
    State(state): State<AppState>,
    Json(payload): Json<CreateRepoRequest>,
) -> Result<(StatusCode, Json<CreateRepoResponse>), AppError> {
    if !payload.video_path.is_file() {
        return Err(AppError::bad_request(
            "VIDEO_NOT_FOUND",
            format!("video not found: {}", payload.video_path.display()),
        ));
    }

    let repo_id = payload
        .repo_id
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let store = state.inner.repos.create(&repo_id)?;
    let claim = store.claim_ingestion().ok_or_else(|| {
        AppError::bad_request(
            "REPO_EXISTS",
            format!("repo already populated or being ingested: {repo_id}"),
        )
    })?;

    info!(
        repo_id = %repo_id,
        video = %payload.video_path.display(),
        "Repo created; ingestion started"
    );
    let scratch = state.scratch_dir();
    let video = payload.video_path;
    let task_repo_id = repo_id.clone();
    tokio::spawn(async move {
        let outcome =
            tokio::task::spawn_blocking(move || ingest_video(&video, &claim, &scratch)).await;
        match outcome {
            Ok(Ok(_summary)) => {}
            Ok(Err(err)) => {
                error!(repo_id = %task_repo_id, error = %format!("{err:#}"), "Ingestion failed")
            }
            Err(err) => {
                error!(repo_id = %task_repo_id, error = %err, "Ingestion task join failure")
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(CreateRepoResponse { repo_id })))
}

async fn repo_status(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<StoreStatus>, AppError> {
    Ok(Json(state.store(&repo_id)?.status()))
}

async fn list_frames(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Query(query): Query<FrameRangeQuery>,
) -> Result<Json<FrameListing>, AppError> {
    let store = state.store(&repo_id)?;
    let (start, end) = resolve_range(query.start, query.end);
    Ok(Json(store.list_range(start, end)))
}

async fn frame_count(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<FrameCountResponse>, AppError> {
    Ok(Json(FrameCountResponse {
        total: state.store(&repo_id)?.frame_count(),
    }))
}

async fn frame_image(
    State(state): State<AppState>,
    Path((repo_id, number)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let number: u32 = number.parse().map_err(|_| {
        AppError::bad_request(
            "INVALID_FRAME_NUMBER",
            format!("frame number must be a positive integer: {number:?}"),
        )
    })?;
    let store = state.store(&repo_id)?;
    let path = store.frame_path(number)?;
    let bytes = tokio::task::spawn_blocking(move || store.read_frame(number))
        .await
        .map_err(|e| AppError::Internal(format!("failed to read frame: {e}")))??;

    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        bytes,
    )
        .into_response())
}

async fn submit_interpolation(
    State(state): State<AppState>,
    Json(payload): Json<SubmitInterpolationRequest>,
) -> Result<(StatusCode, Json<SubmitInterpolationResponse>), AppError> {
    let mut frames = Vec::with_capacity(payload.target_frames.len());
    let mut negative = Vec::new();
    for n in payload.target_frames {
        match u32::try_from(n) {
            Ok(n) => frames.push(n),
            Err(_) => negative.push(n),
        }
    }
    if !negative.is_empty() {
        return Err(AppError::bad_request(
            "INVALID_FRAME_RANGE",
            format!("frames {negative:?} are not valid frame numbers"),
        ));
    }

    let task = state.inner.dispatcher.submit(&payload.repo_id, &frames)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitInterpolationResponse {
            task_id: task.id.clone(),
            task,
        }),
    ))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Json<Vec<TaskRecord>> {
    Json(state.inner.tasks.list(query.repo_id.as_deref()))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, AppError> {
    state
        .inner
        .tasks
        .get(&task_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound {
            code: "UNKNOWN_TASK",
            message: format!("task not found: {task_id}"),
        })
}

/// Defaults to the first page; negative or zero bounds clip to the store.
fn resolve_range(start: Option<i64>, end: Option<i64>) -> (u32, u32) {
    let start = start.unwrap_or(1).max(1);
    let end = end.unwrap_or_else(|| start.saturating_add(DEFAULT_PAGE_SIZE - 1));
    let clamp = |n: i64| n.clamp(0, i64::from(u32::MAX)) as u32;
    (clamp(start), clamp(end))
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest { code: &'static str, message: String },
    NotFound { code: &'static str, message: String },
    Internal(String),
}

impl AppError {
    fn bad_request(code: &'static str, message: String) -> Self {
        Self::BadRequest { code, message }
    }

    fn unknown_repo(repo_id: &str) -> Self {
        Self::NotFound {
            code: "UNKNOWN_REPO",
            message: format!("repo not found: {repo_id}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            AppError::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            AppError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message),
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        let code = err.code();
        match err {
            DispatchError::EmptyRequest | DispatchError::InvalidFrameRange { .. } => {
                AppError::BadRequest {
                    code,
                    message: err.to_string(),
                }
            }
            DispatchError::UnknownRepo(_) => AppError::NotFound {
                code,
                message: err.to_string(),
            },
            DispatchError::Persistence(_) | DispatchError::QueueClosed(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<FrameStoreError> for AppError {
    fn from(err: FrameStoreError) -> Self {
        match err {
            FrameStoreError::NotFound { .. } => AppError::NotFound {
                code: "FRAME_NOT_FOUND",
                message: err.to_string(),
            },
            FrameStoreError::InvalidRepoId(_) => AppError::BadRequest {
                code: "INVALID_REPO_ID",
                message: err.to_string(),
            },
            _ => AppError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::interpolator::{InterpolationError, InterpolationInput};
    use crate::task::TaskState;

    struct FixedInterpolator;

    impl FrameInterpolator for FixedInterpolator {
        fn name(&self) -> &str {
            "fixed"
        }

        fn interpolate(
            &self,
            input: &InterpolationInput,
        ) -> std::result::Result<Vec<u8>, InterpolationError> {
            Ok(format!("mid@{:.2}", input.time).into_bytes())
        }
    }

    fn test_state(frames: u32) -> (tempfile::TempDir, AppState) {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = AppState::with_tasks(
            AppConfig::default(),
            temp.path().to_path_buf(),
            Arc::new(TaskRegistry::in_memory()),
        );
        let store = state.repos().create("clip").expect("create repo");
        for n in 1..=frames {
            store
                .append("png", format!("frame-{n}").as_bytes())
                .expect("append");
        }
        (temp, state)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn wait_for_terminal(state: &AppState, task_id: &str) -> TaskRecord {
        for _ in 0..200 {
            if let Some(task) = state.tasks().get(task_id) {
                if task.state.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn health_and_config_endpoints() {
        let (_temp, state) = test_state(0);
        let app = app_router(state);

        let (status, body) = send(&app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, get("/api/config")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workers"]["pool_size"], 1);
    }

    #[tokio::test]
    async fn unknown_api_path_is_json_404() {
        let (_temp, state) = test_state(0);
        let (status, body) = send(&app_router(state), get("/api/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn repo_status_reports_store_state() {
        let (_temp, state) = test_state(3);
        let app = app_router(state);

        let (status, body) = send(&app, get("/api/repos/clip/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["frameCount"], 3);
        assert_eq!(body["processingComplete"], false);
        assert_eq!(body["hasMetadata"], false);

        let (status, body) = send(&app, get("/api/repos/missing/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_REPO");
    }

    #[tokio::test]
    async fn frame_listing_defaults_and_clips() {
        let (_temp, state) = test_state(25);
        let app = app_router(state);

        let (_, page) = send(&app, get("/api/repos/clip/frames")).await;
        assert_eq!(page["frames"].as_array().unwrap().len(), 20);
        assert_eq!(page["total"], 25);
        assert_eq!(page["version"], 25);
        assert_eq!(page["frames"][0]["number"], 1);
        assert_eq!(page["frames"][0]["path"], "clip/frame_000001.png");

        let (_, tail) = send(&app, get("/api/repos/clip/frames?start=21&end=99")).await;
        assert_eq!(tail["frames"].as_array().unwrap().len(), 5);

        let (_, inverted) = send(&app, get("/api/repos/clip/frames?start=9&end=3")).await;
        assert!(inverted["frames"].as_array().unwrap().is_empty());
        assert_eq!(inverted["total"], 25);

        let (_, again) = send(&app, get("/api/repos/clip/frames?start=21&end=99")).await;
        assert_eq!(again, tail);

        let (_, count) = send(&app, get("/api/repos/clip/frames/count")).await;
        assert_eq!(count["total"], 25);
    }

    #[tokio::test]
    async fn frame_image_serves_current_bytes() {
        let (_temp, state) = test_state(2);
        let app = app_router(state);

        let resp = app
            .clone()
            .oneshot(get("/api/repos/clip/frames/2/image"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"frame-2");

        let (status, body) = send(&app, get("/api/repos/clip/frames/9/image")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "FRAME_NOT_FOUND");

        let (status, body) = send(&app, get("/api/repos/clip/frames/abc/image")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_FRAME_NUMBER");
    }

    #[tokio::test]
    async fn submit_rejects_invalid_requests_without_recording() {
        let (_temp, state) = test_state(10);
        let app = app_router(state.clone());

        let (status, body) = send(
            &app,
            post_json(
                "/api/interpolations",
                serde_json::json!({"repoId": "clip", "targetFrames": [15]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_FRAME_RANGE");

        let (status, body) = send(
            &app,
            post_json(
                "/api/interpolations",
                serde_json::json!({"repoId": "clip", "targetFrames": []}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "EMPTY_REQUEST");

        let (status, body) = send(
            &app,
            post_json(
                "/api/interpolations",
                serde_json::json!({"repoId": "clip", "targetFrames": [-2]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_FRAME_RANGE");

        let (status, body) = send(
            &app,
            post_json(
                "/api/interpolations",
                serde_json::json!({"repoId": "ghost", "targetFrames": [1]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_REPO");

        assert!(state.tasks().is_empty());
        assert_eq!(state.queue().depth(), 0);
    }

    #[tokio::test]
    async fn submitted_task_runs_to_completion() {
        let (_temp, state) = test_state(10);
        let workers = state.spawn_workers_with(Arc::new(FixedInterpolator));
        let app = app_router(state.clone());

        let (status, body) = send(
            &app,
            post_json(
                "/api/interpolations",
                serde_json::json!({"repoId": "clip", "targetFrames": [7, 3, 3]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["progress"]["total"], 2);
        let task_id = body["taskId"].as_str().unwrap().to_string();

        let finished = wait_for_terminal(&state, &task_id).await;
        assert_eq!(finished.state, TaskState::Completed);

        let (status, body) = send(&app, get(&format!("/api/tasks/{task_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "completed");
        assert_eq!(body["progress"]["done"], 2);
        assert!(body.get("error").is_none());

        let store = state.repos().get("clip").unwrap().unwrap();
        assert_eq!(store.read_frame(3).unwrap(), b"mid@0.50");
        assert_eq!(store.read_frame(4).unwrap(), b"frame-4");

        let (_, listed) = send(&app, get("/api/tasks?repo_id=clip")).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        let (_, none) = send(&app, get("/api/tasks?repo_id=other")).await;
        assert!(none.as_array().unwrap().is_empty());

        workers.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let (_temp, state) = test_state(1);
        let (status, body) = send(&app_router(state), get("/api/tasks/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_TASK");
    }

    #[tokio::test]
    async fn create_repo_requires_existing_video() {
        let (temp, state) = test_state(0);
        let (status, body) = send(
            &app_router(state),
            post_json(
                "/api/repos",
                serde_json::json!({"videoPath": temp.path().join("missing.mp4")}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VIDEO_NOT_FOUND");
    }

    #[tokio::test]
    async fn create_repo_refuses_repo_with_ingestion_in_flight() {
        let (temp, state) = test_state(0);
        let video = temp.path().join("clip.mp4");
        std::fs::write(&video, b"video bytes").expect("write video");
        let app = app_router(state.clone());

        let held = state
            .repos()
            .create("dup")
            .expect("create repo")
            .claim_ingestion()
            .expect("claim");
        let (status, body) = send(
            &app,
            post_json(
                "/api/repos",
                serde_json::json!({"repoId": "dup", "videoPath": video}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "REPO_EXISTS");
        assert_eq!(held.store().frame_count(), 0);

        let (status, body) = send(
            &app,
            post_json(
                "/api/repos",
                serde_json::json!({"repoId": "clip", "videoPath": video}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["repoId"], "clip");
    }

    #[tokio::test]
    async fn create_repo_refuses_populated_repo() {
        let (temp, state) = test_state(3);
        let video = temp.path().join("clip.mp4");
        std::fs::write(&video, b"video bytes").expect("write video");

        let (status, body) = send(
            &app_router(state.clone()),
            post_json(
                "/api/repos",
                serde_json::json!({"repoId": "clip", "videoPath": video}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "REPO_EXISTS");
        assert_eq!(state.repos().get("clip").unwrap().unwrap().frame_count(), 3);
    }

    #[tokio::test]
    async fn sweeper_purges_expired_tasks_and_stops_on_cancel() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.tasks.retention_secs = 0;
        config.tasks.sweep_interval_secs = 1;
        let state = AppState::with_tasks(
            config,
            temp.path().to_path_buf(),
            Arc::new(TaskRegistry::in_memory()),
        );

        let mut record = TaskRecord::new("clip", &[1], 0);
        record.mark_running(Utc::now());
        record.finish(Vec::new(), Utc::now() - chrono::Duration::seconds(5));
        state.tasks().insert(record).expect("insert");

        let cancel = CancellationToken::new();
        let sweeper = state.spawn_task_sweeper(cancel.clone());
        for _ in 0..40 {
            if state.tasks().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(state.tasks().is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), sweeper)
            .await
            .expect("sweeper stopped")
            .expect("join");
    }

    #[test]
    fn range_resolution_defaults_and_clamps() {
        assert_eq!(resolve_range(None, None), (1, 20));
        assert_eq!(resolve_range(Some(5), None), (5, 24));
        assert_eq!(resolve_range(Some(-3), Some(4)), (1, 4));
        assert_eq!(resolve_range(Some(3), Some(-1)), (3, 0));
    }
}
