//! Job management endpoints. Each maps 1:1 onto a [`JobRegistry`] call.
//!
//! Create:  `POST /job/add`    `{"cron": "0/5 * * * * ?", "id": "job1", "group": "g1", "jobData": {"extra": "x"}}`
//! Update:  `POST /job/update` `{"id": "job1", "group": "g1", "cron": "...", "jobData": {...}}`
//! Delete:  `POST /job/delete` `{"id": "job1", "group": "g1"}`
//!
//! [`JobRegistry`]: chime_scheduler::JobRegistry

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chime_scheduler::{JobKey, JobRequest, KeyRequest, ScheduledJob, UpdateRequest};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;
use crate::http::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

/// POST /job/add
pub async fn add_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<ScheduledJob>)> {
    let created = state.registry.create_job(req)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /job/update
pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateRequest>,
) -> ApiResult<Json<ScheduledJob>> {
    let key = JobKey::new(req.group, req.id);
    let updated = state
        .registry
        .update_job(&key, req.cron.as_deref(), req.job_data)?;
    Ok(Json(updated))
}

/// POST /job/delete
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<Json<Value>> {
    let key = req.key();
    state.registry.delete_job(&key)?;
    Ok(Json(json!({ "deleted": key })))
}

/// POST /job/pause
pub async fn pause_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<Json<ScheduledJob>> {
    Ok(Json(state.registry.pause_job(&req.key())?))
}

/// POST /job/resume
pub async fn resume_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<Json<ScheduledJob>> {
    Ok(Json(state.registry.resume_job(&req.key())?))
}

/// GET /jobs
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ScheduledJob>>> {
    Ok(Json(state.registry.list_jobs()?))
}

/// GET /job/{group}/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path((group, id)): Path<(String, String)>,
) -> ApiResult<Json<ScheduledJob>> {
    Ok(Json(state.registry.get_job(&JobKey::new(group, id))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{build_router, AppState};
    use crate::jobs::builtin_handlers;
    use axum::{body::Body, http::Request, Router};
    use chime_core::ChimeConfig;
    use chime_scheduler::{
        JobRegistry, JobStore, LockCoordinator, SchedulerEngine, SqliteJobStore,
    };
    use tower::ServiceExt;

    fn router() -> Router {
        let config = ChimeConfig::default();
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let handlers = Arc::new(builtin_handlers());
        let coordinator =
            Arc::new(LockCoordinator::new(store.clone(), "node-a", &config.scheduler).unwrap());
        let engine = Arc::new(
            SchedulerEngine::new(config.scheduler.clone(), store.clone(), coordinator, handlers.clone())
                .unwrap(),
        );
        let registry = JobRegistry::new(store, handlers, config.scheduler.default_handler.clone());
        build_router(Arc::new(AppState::new("node-a".to_string(), registry, engine)))
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn job1() -> Value {
        json!({"cron": "0/5 * * * * ?", "id": "job1", "group": "g1", "jobData": {"extra": "x"}})
    }

    #[tokio::test]
    async fn add_then_get() {
        let router = router();
        let (status, body) = send(&router, "POST", "/job/add", job1()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["job"]["handler"], "log");
        assert_eq!(body["trigger"]["state"], "waiting");

        let (status, body) = send(&router, "GET", "/job/g1/job1", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["job_data"]["extra"], "x");

        let (_, list) = send(&router, "GET", "/jobs", Value::Null).await;
        assert_eq!(list.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let router = router();
        let mut bad = job1();
        bad["cron"] = json!("every tuesday");
        let (status, body) = send(&router, "POST", "/job/add", bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_SCHEDULE");

        let mut unknown = job1();
        unknown["handler"] = json!("DemoJob");
        let (status, body) = send(&router, "POST", "/job/add", unknown).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_HANDLER");

        send(&router, "POST", "/job/add", job1()).await;
        let (status, _) = send(&router, "POST", "/job/add", job1()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &router,
            "POST",
            "/job/delete",
            json!({"id": "ghost", "group": "g1"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn update_pause_resume_delete() {
        let router = router();
        send(&router, "POST", "/job/add", job1()).await;

        let (status, body) = send(
            &router,
            "POST",
            "/job/update",
            json!({"id": "job1", "group": "g1", "cron": "0 0/10 * * * ?"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trigger"]["cron"], "0 0/10 * * * ?");
        assert_eq!(body["job"]["job_data"]["extra"], "x");

        let key = json!({"id": "job1", "group": "g1"});
        let (_, body) = send(&router, "POST", "/job/pause", key.clone()).await;
        assert_eq!(body["trigger"]["state"], "paused");
        let (_, body) = send(&router, "POST", "/job/resume", key.clone()).await;
        assert_eq!(body["trigger"]["state"], "waiting");

        let (status, body) = send(&router, "POST", "/job/delete", key).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"]["id"], "job1");
        let (status, _) = send(&router, "GET", "/job/g1/job1", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_instance() {
        let router = router();
        let (status, body) = send(&router, "GET", "/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["instance_id"], "node-a");
        assert_eq!(body["lock"]["status"], "healthy");
        assert_eq!(body["dispatching"], false);
    }
}
