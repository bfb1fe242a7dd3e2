use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{FileEntry, Payload, Project, ProjectMessage, ProjectStatus};
use super::orchestrator::{ProjectOrchestrator, RunRequest};
use super::repository::DEFAULT_LIST_LIMIT;
use super::ws::ws_handler;
use crate::errors::FactoryError;

/// Header carrying the caller's user id.
pub const USER_HEADER: &str = "x-user-id";
pub const ANONYMOUS_USER: &str = "anonymous";

const MAX_CONTENT_CHARS: usize = 4096;
const MAX_INTRO_CHARS: usize = 512;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: ProjectOrchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub prompt: String,
    pub template: Option<String>,
    pub metadata: Option<Payload>,
}

#[derive(Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    pub assistant_intro: Option<String>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct FilesQuery {
    pub path: Option<String>,
}

#[derive(Serialize)]
pub struct ProjectListResponse {
    pub projects: Vec<Project>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub project_id: String,
    pub status: ProjectStatus,
    pub preview_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Project> for StatusSnapshot {
    fn from(project: &Project) -> Self {
        Self {
            project_id: project.id.clone(),
            status: project.status,
            preview_url: project.preview_url.clone(),
            created_at: project.created_at,
            updated_at: project.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct MessagesResponse {
    pub project_id: String,
    pub messages: Vec<ProjectMessage>,
}

#[derive(Serialize)]
pub struct MessageAccepted {
    pub project_id: String,
    pub user_message: ProjectMessage,
    pub status: ProjectStatus,
}

#[derive(Serialize)]
pub struct FilesResponse {
    pub project_id: String,
    pub files: Vec<FileEntry>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<FactoryError> for ApiError {
    fn from(err: FactoryError) -> Self {
        match err {
            err if err.is_not_found() => ApiError::NotFound(err.to_string()),
            FactoryError::SandboxEscape { .. }
            | FactoryError::BadRequest(_)
            | FactoryError::InvalidTransition { .. } => ApiError::BadRequest(err.to_string()),
            FactoryError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

fn project_routes() -> Router<SharedState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/{id}", get(get_project))
        .route("/projects/{id}/status", get(get_status))
        .route("/projects/{id}/runs", post(start_run))
        .route("/projects/{id}/cancel", post(cancel_run))
        .route(
            "/projects/{id}/messages",
            get(list_messages).post(create_message),
        )
        .route("/projects/{id}/files", get(list_files))
        .route("/projects/{id}/files/{*file_path}", get(get_file))
}

/// REST routes mounted under `api_prefix`, plus `/health` and `/ws/{id}`.
pub fn api_router(api_prefix: &str) -> Router<SharedState> {
    let prefix = api_prefix.trim_matches('/');
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/ws/{project_id}", get(ws_handler));
    if prefix.is_empty() {
        router.merge(project_routes())
    } else {
        router.nest(&format!("/{}", prefix), project_routes())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

fn check_length(field: &str, value: &str, max: usize) -> Result<(), ApiError> {
    if value.chars().count() > max {
        return Err(ApiError::BadRequest(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .orchestrator
        .list_projects(
            &user_id(&headers),
            query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(ProjectListResponse { projects }))
}

async fn create_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("Prompt cannot be empty".into()));
    }
    check_length("prompt", prompt, MAX_CONTENT_CHARS)?;

    let orchestrator = &state.orchestrator;
    let project = orchestrator
        .create_project(
            &user_id(&headers),
            prompt,
            req.template,
            req.metadata.unwrap_or_default(),
        )
        .await?;
    orchestrator
        .start_run(&project.id, RunRequest::default())
        .await?;
    let project = orchestrator.get_project(&project.id, None).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .orchestrator
        .get_project(&id, Some(&user_id(&headers)))
        .await?;
    Ok(Json(project))
}

async fn get_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .orchestrator
        .get_project(&id, Some(&user_id(&headers)))
        .await?;
    Ok(Json(StatusSnapshot::from(&project)))
}

async fn start_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = &state.orchestrator;
    orchestrator.get_project(&id, Some(&user_id(&headers))).await?;
    orchestrator.start_run(&id, RunRequest::default()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted"})),
    ))
}

async fn cancel_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = &state.orchestrator;
    orchestrator.get_project(&id, Some(&user_id(&headers))).await?;
    let project = orchestrator.cancel(&id).await?;
    Ok(Json(project))
}

async fn list_messages(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .orchestrator
        .list_messages(&id, Some(&user_id(&headers)))
        .await?;
    Ok(Json(MessagesResponse {
        project_id: id,
        messages,
    }))
}

async fn create_message(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = &state.orchestrator;
    let project = orchestrator.get_project(&id, Some(&user_id(&headers))).await?;
    if project.status == ProjectStatus::Running {
        return Err(ApiError::Conflict(
            "Project generation already running".into(),
        ));
    }

    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest(
            "Message content cannot be empty".into(),
        ));
    }
    check_length("content", content, MAX_CONTENT_CHARS)?;
    let intro = req.assistant_intro.as_deref().map(str::trim).unwrap_or("");
    check_length("assistant_intro", intro, MAX_INTRO_CHARS)?;

    let user_message = orchestrator
        .start_run(
            &id,
            RunRequest {
                user_content: Some(content.to_string()),
                assistant_intro: Some(intro.to_string()).filter(|i| !i.is_empty()),
                ..RunRequest::default()
            },
        )
        .await?
        .ok_or_else(|| ApiError::Internal("User message was not recorded".into()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageAccepted {
            project_id: id,
            user_message,
            status: ProjectStatus::Pending,
        }),
    ))
}

async fn list_files(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let files = state
        .orchestrator
        .list_files(&id, Some(&user_id(&headers)), query.path)
        .await?;
    Ok(Json(FilesResponse {
        project_id: id,
        files,
    }))
}

async fn get_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, file_path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let content = state
        .orchestrator
        .read_file(&id, Some(&user_id(&headers)), file_path)
        .await?;
    Ok(content)
}
