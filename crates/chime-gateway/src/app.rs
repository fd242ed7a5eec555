use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chime_scheduler::{JobRegistry, SchedulerEngine};
use tower_http::trace::TraceLayer;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    /// Effective instance id (`AUTO` already resolved).
    pub instance_id: String,
    pub registry: JobRegistry,
    pub engine: Arc<SchedulerEngine>,
}

impl AppState {
    pub fn new(
        instance_id: String,
        registry: JobRegistry,
        engine: Arc<SchedulerEngine>,
    ) -> Self {
        Self {
            instance_id,
            registry,
            engine,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{health, jobs};

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/jobs", get(jobs::list_jobs))
        .route("/job/{group}/{id}", get(jobs::get_job))
        .route("/job/add", post(jobs::add_job))
        .route("/job/update", post(jobs::update_job))
        .route("/job/delete", post(jobs::delete_job))
        .route("/job/pause", post(jobs::pause_job))
        .route("/job/resume", post(jobs::resume_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
