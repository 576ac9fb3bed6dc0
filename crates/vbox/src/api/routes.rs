//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{any, get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::gateway::socket_handler;
use crate::preview::proxy;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.server.cors_origins);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Proxied dev servers see every method and may upgrade to WebSocket.
    let preview_routes = Router::new()
        .route("/preview/{project_id}/{user_id}", any(proxy::preview_root))
        // `{*path}` never matches an empty remainder.
        .route("/preview/{project_id}/{user_id}/", any(proxy::preview_root))
        .route(
            "/preview/{project_id}/{user_id}/iframe",
            get(proxy::preview_iframe),
        )
        .route(
            "/preview/{project_id}/{user_id}/{*path}",
            any(proxy::preview_path),
        );

    let api_routes = Router::new()
        .route(
            "/api/preview-status/{project_id}/{user_id}",
            get(handlers::preview_status),
        )
        .route(
            "/api/preview/{project_id}/{user_id}",
            post(handlers::register_preview).delete(handlers::remove_preview),
        )
        .route(
            "/api/preview/{project_id}/{user_id}/detect",
            post(handlers::detect_preview),
        )
        .route(
            "/api/preview-diagnosis/{project_id}/{user_id}",
            get(handlers::preview_diagnosis),
        )
        .route(
            "/api/preview-options/{project_id}/{user_id}",
            get(handlers::preview_options),
        )
        .layer(cors);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/debug/connections", get(handlers::debug_connections))
        .route("/socket", get(socket_handler))
        .merge(preview_routes)
        .merge(api_routes)
        .layer(trace_layer)
        .with_state(state)
}

/// Build the CORS layer for the management API. No configured origins
/// means any origin may call it.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::error!("CORS: All configured origins are invalid!");
        return CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")));
    }

    tracing::info!("CORS: Allowing {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN])
}
