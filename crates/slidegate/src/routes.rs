use axum::{
    Json, Router,
    extract::{Path, Request, State},
    middleware,
    response::Response,
    routing::{any, get, post},
};
use serde::{Deserialize, Serialize};
use slidegate_process::{PreviewStatus, ResourceId};

use crate::error::PreviewError;
use crate::request_meta;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    instances: usize,
}

#[derive(Debug, Serialize)]
struct PortResponse {
    port: u16,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopped: bool,
}

// Extra segments (the `*rest` tail) are ignored.
#[derive(Debug, Deserialize)]
struct PreviewPath {
    id: String,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instances: state.supervisor.instance_count().await,
    })
}

async fn preview_port(
    State(state): State<AppState>,
    Path(PreviewPath { id }): Path<PreviewPath>,
) -> Result<Json<PortResponse>, PreviewError> {
    let port = state.gateway.resolve_port(&ResourceId::new(id)).await?;
    Ok(Json(PortResponse { port }))
}

async fn proxy(
    State(state): State<AppState>,
    Path(PreviewPath { id }): Path<PreviewPath>,
    req: Request,
) -> Response {
    state.gateway.forward(ResourceId::new(id), req).await
}

async fn list_previews(State(state): State<AppState>) -> Json<Vec<PreviewStatus>> {
    Json(state.supervisor.list().await)
}

async fn preview_status(
    State(state): State<AppState>,
    Path(PreviewPath { id }): Path<PreviewPath>,
) -> Result<Json<PreviewStatus>, PreviewError> {
    let id = ResourceId::new(id);
    state
        .supervisor
        .status(&id)
        .await
        .map(Json)
        .ok_or_else(|| PreviewError::NotFound(format!("no preview instance for resource {id}")))
}

async fn stop_preview(
    State(state): State<AppState>,
    Path(PreviewPath { id }): Path<PreviewPath>,
) -> Json<StopResponse> {
    let id = ResourceId::new(id);
    let stopped = state.supervisor.stop(&id).await;
    tracing::info!(resource_id = %id, stopped, "preview stop requested");
    Json(StopResponse { stopped })
}

/// Public surface of the gateway. `public_prefix` is the normalized route
/// prefix (leading slash, no trailing slash) the dev servers are based at.
pub fn router(state: AppState, public_prefix: &str) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(&format!("{public_prefix}-id/:id"), get(preview_port))
        .route(&format!("{public_prefix}/:id"), any(proxy))
        .route(&format!("{public_prefix}/:id/"), any(proxy))
        .route(&format!("{public_prefix}/:id/*rest"), any(proxy))
        .route("/api/previews", get(list_previews))
        .route("/api/previews/:id", get(preview_status))
        .route("/api/previews/:id/stop", post(stop_preview))
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(state)
}
