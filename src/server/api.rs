use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::{BuildUpload, CallbackDisposition, CallbackEvent, Orchestrator};
use crate::errors::EngineError;
use crate::store::models::NewRelease;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct AppendSlotRequest {
    pub scheduled_at: DateTime<Utc>,
}

#[derive(serde::Serialize)]
pub struct CallbackResponse {
    pub disposition: CallbackDisposition,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
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

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let msg = err.to_string();
        match err {
            EngineError::ReleaseNotFound { .. }
            | EngineError::TaskNotFound { .. }
            | EngineError::CycleNotFound { .. } => ApiError::NotFound(msg),
            EngineError::Validation(_) | EngineError::NotSkippable { .. } => {
                ApiError::BadRequest(msg)
            }
            EngineError::AlreadyReleased { .. }
            | EngineError::StageNotComplete { .. }
            | EngineError::RetryNotAllowed { .. }
            | EngineError::SkipNotAllowed { .. }
            | EngineError::CycleNotActive { .. } => ApiError::Conflict(msg),
            EngineError::Other(_) => ApiError::Internal(msg),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/releases", get(list_releases).post(create_release))
        .route("/api/releases/{id}", get(get_release))
        .route("/api/releases/{id}/advance", post(advance_release))
        .route("/api/releases/{id}/builds", post(upload_build))
        .route("/api/releases/{id}/slots", post(append_slot))
        .route("/api/tasks/{id}/callback", post(task_callback))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}/skip", post(skip_task))
        .route("/api/cycles/{id}/abandon", post(abandon_cycle))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_releases(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let releases = state.orchestrator.list_releases().await?;
    Ok(Json(releases).into_response())
}

async fn create_release(
    State(state): State<SharedState>,
    Json(new): Json<NewRelease>,
) -> Result<Response, ApiError> {
    let release = state.orchestrator.create_release(new).await?;
    Ok((StatusCode::CREATED, Json(release)).into_response())
}

async fn get_release(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let detail = state.orchestrator.release_detail(id).await?;
    Ok(Json(detail).into_response())
}

async fn advance_release(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let phase = state.orchestrator.trigger_next_stage(id).await?;
    Ok(Json(serde_json::json!({"phase": phase})).into_response())
}

async fn upload_build(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(upload): Json<BuildUpload>,
) -> Result<Response, ApiError> {
    let artifact = state.orchestrator.handle_build_upload(id, upload).await?;
    Ok((StatusCode::CREATED, Json(artifact)).into_response())
}

async fn append_slot(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AppendSlotRequest>,
) -> Result<Response, ApiError> {
    let slot = state.orchestrator.append_slot(id, req.scheduled_at).await?;
    Ok((StatusCode::CREATED, Json(slot)).into_response())
}

async fn task_callback(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(event): Json<CallbackEvent>,
) -> Result<Response, ApiError> {
    let disposition = state.orchestrator.handle_callback(id, event).await?;
    Ok(Json(CallbackResponse { disposition }).into_response())
}

async fn retry_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let task = state.orchestrator.retry_task(id).await?;
    Ok(Json(task).into_response())
}

async fn skip_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let task = state.orchestrator.skip_task(id).await?;
    Ok(Json(task).into_response())
}

async fn abandon_cycle(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let cycle = state.orchestrator.abandon_cycle(id).await?;
    Ok(Json(cycle).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::adapters::AdapterRegistry;
    use crate::store::{Db, DbHandle};

    fn test_router() -> Router {
        let db = DbHandle::new(Db::new_in_memory().unwrap());
        let orchestrator = Arc::new(Orchestrator::new(db, AdapterRegistry::local()));
        super::super::build_router(Arc::new(AppState { orchestrator }))
    }

    fn create_body() -> String {
        serde_json::json!({
            "tenant": "acme",
            "version": "1.0.0",
            "platforms": ["android", "ios"],
            "kickoff_at": "2026-08-01T09:00:00Z",
            "target_release_at": "2026-08-15T09:00:00Z",
            "upload_modes": {"android": "manual", "ios": "manual"},
            "regression_slots": ["2026-08-05T09:00:00Z"]
        })
        .to_string()
    }

    async fn create_release(app: &Router) -> serde_json::Value {
        let req = Request::builder()
            .method("POST")
            .uri("/api/releases")
            .header("content-type", "application/json")
            .body(Body::from(create_body()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_fetch_release() {
        let app = test_router();
        let created = create_release(&app).await;
        assert_eq!(created["phase"], "not_started");

        let uri = format!("/api/releases/{}", created["id"].as_str().unwrap());
        let req = Request::builder().uri(&uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let detail: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(detail["stages"].as_array().unwrap().len(), 3);
        assert_eq!(detail["slots"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_release_validation_is_rejected() {
        let app = test_router();
        let body = serde_json::json!({
            "tenant": "acme",
            "version": "1.0.0",
            "platforms": [],
            "kickoff_at": "2026-08-01T09:00:00Z",
            "target_release_at": "2026-08-15T09:00:00Z"
        })
        .to_string();
        let req = Request::builder()
            .method("POST")
            .uri("/api/releases")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_release_is_not_found() {
        let app = test_router();
        let req = Request::builder()
            .uri(format!("/api/releases/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_build_for_release() {
        let app = test_router();
        let created = create_release(&app).await;
        let uri = format!("/api/releases/{}/builds", created["id"].as_str().unwrap());

        let body = serde_json::json!({
            "platform": "android",
            "stage": "regression",
            "locator": "s3://builds/android.aab",
            "source": "manual"
        })
        .to_string();
        let req = Request::builder()
            .method("POST")
            .uri(&uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let artifact: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(artifact["consumed"], false);
        assert_eq!(artifact["platform"], "android");
    }

    #[tokio::test]
    async fn test_premature_advance_conflicts() {
        let app = test_router();
        let created = create_release(&app).await;
        let id = created["id"].as_str().unwrap().to_string();

        // First advance starts kickoff.
        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/releases/{}/advance", id))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Kickoff is not complete, so a second advance is refused.
        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/releases/{}/advance", id))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_retry_unknown_task_is_not_found() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/tasks/{}/retry", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
