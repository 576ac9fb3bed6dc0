//! API request handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gateway::ConnectionsSnapshot;
use crate::preview::diagnose::{ProjectDiagnosis, diagnose_project};
use crate::preview::{
    PreviewKey, PreviewTarget, ServerKind, detect, is_valid_port, probe_port,
};
use crate::storage::RemoteStore;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Dump of every live editor connection.
pub async fn debug_connections(State(state): State<AppState>) -> Json<ConnectionsSnapshot> {
    Json(state.gateway.connections.snapshot())
}

// ============================================================================
// Preview targets
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStatus {
    pub available: bool,
    #[serde(flatten)]
    pub target: Option<PreviewTarget>,
}

/// Whether a dev server is registered for the pair. Polled by the
/// placeholder page.
pub async fn preview_status(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(String, String)>,
) -> Json<PreviewStatus> {
    let target = state.registry.lookup(&PreviewKey::new(project_id, user_id));
    Json(PreviewStatus {
        available: target.is_some(),
        target,
    })
}

#[derive(Debug, Deserialize)]
pub struct RegisterPreviewRequest {
    pub port: u32,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: ServerKind,
}

fn default_kind() -> ServerKind {
    ServerKind::Other
}

pub async fn register_preview(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(String, String)>,
    Json(request): Json<RegisterPreviewRequest>,
) -> ApiResult<(StatusCode, Json<PreviewTarget>)> {
    if !is_valid_port(request.port) {
        return Err(ApiError::bad_request(format!(
            "port must be between 1025 and 65534, got {}",
            request.port
        )));
    }
    let port = u16::try_from(request.port)
        .map_err(|_| ApiError::bad_request(format!("invalid port {}", request.port)))?;
    let key = PreviewKey::new(project_id, user_id);
    let target = PreviewTarget::new(port, request.kind);
    info!(%key, port, "Registering preview target");
    state.registry.register(key, target.clone());
    Ok((StatusCode::CREATED, Json(target)))
}

pub async fn remove_preview(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = PreviewKey::new(project_id, user_id);
    match state.registry.evict(&key) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::not_found(format!("No preview registered for {key}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PreviewTarget>,
}

/// Run the dev server detector over posted output and register a match.
pub async fn detect_preview(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(String, String)>,
    Json(request): Json<DetectRequest>,
) -> Json<DetectResponse> {
    let Some(found) = detect(&request.output) else {
        return Json(DetectResponse {
            detected: false,
            target: None,
        });
    };
    let key = PreviewKey::new(project_id, user_id);
    let target = PreviewTarget::new(found.port, found.kind);
    info!(%key, port = found.port, "Registering detected preview target");
    state.registry.register(key, target.clone());
    Json(DetectResponse {
        detected: true,
        target: Some(target),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewDiagnosis {
    pub project_id: String,
    pub user_id: String,
    pub registered: bool,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PreviewTarget>,
    /// Bytes held by remote storage; `None` when the size query failed.
    pub stored_bytes: Option<u64>,
    #[serde(flatten)]
    pub project: ProjectDiagnosis,
}

pub async fn preview_diagnosis(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(String, String)>,
) -> Json<PreviewDiagnosis> {
    let target = state
        .registry
        .lookup(&PreviewKey::new(project_id.as_str(), user_id.as_str()));
    let alive = match &target {
        Some(t) => probe_port(t.port, state.config.preview.probe_timeout()).await,
        None => false,
    };
    let stored_bytes = match state.sessions.remote().project_size(&project_id).await {
        Ok(size) => Some(size),
        Err(e) => {
            warn!("Size query for {} failed: {}", project_id, e);
            None
        }
    };
    let project = diagnose_project(&state.sessions.project_dir(&project_id)).await;
    Json(PreviewDiagnosis {
        project_id,
        user_id,
        registered: target.is_some(),
        alive,
        target,
        stored_bytes,
        project,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOption {
    pub url: String,
    pub recommended: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOptions {
    pub iframe: PreviewOption,
    pub proxy: PreviewOption,
    pub status_url: String,
}

/// URLs a client can use to show the preview.
pub async fn preview_options(
    headers: HeaderMap,
    Path((project_id, user_id)): Path<(String, String)>,
) -> Json<PreviewOptions> {
    let base = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_default();
    let prefix = PreviewKey::new(project_id.as_str(), user_id.as_str()).prefix();
    Json(PreviewOptions {
        iframe: PreviewOption {
            url: format!("{base}{prefix}/iframe"),
            recommended: true,
        },
        proxy: PreviewOption {
            url: format!("{base}{prefix}"),
            recommended: false,
        },
        status_url: format!("{base}/api/preview-status/{project_id}/{user_id}"),
    })
}
