//! Reverse proxy from `/preview/<project>/<user>/...` to a local dev server.
//!
//! Plain requests are buffered, forwarded over the shared hyper client and,
//! for bundler targets, have HTML/JS/CSS bodies prefix-rewritten. WebSocket
//! upgrades are verified with a TCP probe, connected upstream first (so a
//! refused port can still be answered with a status code) and then relayed
//! frame by frame until either side closes or the target is evicted.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{
        ConnectInfo, FromRequestParts, Path, Request, State,
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message as TungsteniteMessage, client::IntoClientRequest},
};

use crate::api::AppState;

use super::health::probe_port;
use super::pages;
use super::registry::{PreviewKey, PreviewTarget, ServerKind};
use super::rewrite::{DocumentKind, rewrite_body};

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CORS_HEADERS: [(HeaderName, &str); 3] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (
        header::ACCESS_CONTROL_ALLOW_METHODS,
        "GET, POST, PUT, DELETE, PATCH, OPTIONS",
    ),
    (
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        "Origin, X-Requested-With, Content-Type, Accept, Authorization",
    ),
];

// ============================================================================
// Handlers
// ============================================================================

/// `/preview/{project_id}/{user_id}` and the same path with a trailing slash.
pub async fn preview_root(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(String, String)>,
    req: Request,
) -> Response {
    serve_preview(state, PreviewKey::new(project_id, user_id), req).await
}

/// `/preview/{project_id}/{user_id}/{*path}`
pub async fn preview_path(
    State(state): State<AppState>,
    Path((project_id, user_id, _path)): Path<(String, String, String)>,
    req: Request,
) -> Response {
    serve_preview(state, PreviewKey::new(project_id, user_id), req).await
}

/// `/preview/{project_id}/{user_id}/iframe`
pub async fn preview_iframe(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(String, String)>,
) -> Response {
    let key = PreviewKey::new(project_id, user_id);
    match state.registry.lookup(&key) {
        Some(_) => html_response(StatusCode::OK, pages::iframe_page(&key)),
        None => html_response(StatusCode::SERVICE_UNAVAILABLE, pages::waiting_page(&key)),
    }
}

async fn serve_preview(state: AppState, key: PreviewKey, req: Request) -> Response {
    let target_path = strip_prefix(req.uri(), &key);

    if is_websocket_upgrade(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        return proxy_websocket(state, key, target_path, parts.headers, ws).await;
    }

    let Some(target) = state.registry.lookup(&key) else {
        debug!("No dev server for {}, serving placeholder", key);
        return html_response(StatusCode::SERVICE_UNAVAILABLE, pages::waiting_page(&key));
    };

    proxy_http(&state, &key, &target, &target_path, req).await
}

// ============================================================================
// Path helpers
// ============================================================================

/// Strip `/preview/<project>/<user>` from the request, keeping the query.
/// An empty remainder becomes `/`.
pub fn strip_prefix(uri: &Uri, key: &PreviewKey) -> String {
    let prefix = key.prefix();
    let path = uri.path();
    let rest = path.strip_prefix(prefix.as_str()).unwrap_or(path);
    let mut target = if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    };
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    target
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn html_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}

/// Content type for module-like paths that the dev server may mislabel.
fn module_content_type(path: &str) -> Option<&'static str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
    match ext.as_str() {
        "js" | "mjs" | "jsx" | "ts" | "tsx" => Some("application/javascript"),
        "css" => Some("text/css"),
        _ => None,
    }
}

fn correct_content_type(headers: &mut HeaderMap, target_path: &str) {
    let current = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase());
    let mislabeled = match current.as_deref() {
        None => true,
        Some(ct) => ct.starts_with("text/plain") || ct.starts_with("application/octet-stream"),
    };
    if !mislabeled {
        return;
    }

    let path = target_path.split('?').next().unwrap_or(target_path);
    let corrected = module_content_type(path).map(str::to_string).or_else(|| {
        current
            .is_none()
            .then(|| mime_guess::from_path(path).first().map(|m| m.to_string()))
            .flatten()
    });
    if let Some(value) = corrected.and_then(|v| HeaderValue::from_str(&v).ok()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
}

// ============================================================================
// HTTP
// ============================================================================

async fn proxy_http(
    state: &AppState,
    key: &PreviewKey,
    target: &PreviewTarget,
    target_path: &str,
    req: Request,
) -> Response {
    let target_uri = format!("http://localhost:{}{}", target.port, target_path);
    let uri: Uri = match target_uri.parse() {
        Ok(uri) => uri,
        Err(e) => {
            error!("Invalid target URI {}: {:?}", target_uri, e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let max_body_bytes = state.config.preview.max_body_bytes;
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    let (parts, body) = req.into_parts();

    if let Err(status) = enforce_body_limit(&parts.headers, max_body_bytes) {
        return status.into_response();
    }
    let body_bytes = match axum::body::to_bytes(body, max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to buffer preview request body: {:?}", e);
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let mut forwarded = match axum::http::Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Body::from(body_bytes.clone()))
    {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to build proxy request: {:?}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let headers = forwarded.headers_mut();
    *headers = parts.headers.clone();
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_bytes.len()));
    if let Ok(host) = HeaderValue::from_str(&format!("localhost:{}", target.port)) {
        headers.insert(header::HOST, host);
    }

    if target.kind.is_bundler() {
        // Rewritable bodies must arrive uncompressed.
        headers.remove(header::ACCEPT_ENCODING);
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        if let Some(value) = peer.and_then(|ip| HeaderValue::from_str(&ip).ok()) {
            headers.insert("x-forwarded-for", value);
        }
    }

    debug!("Proxying {} {} -> port {}", parts.method, target_path, target.port);

    let timeout = state.config.preview.request_timeout();
    let response = match tokio::time::timeout(timeout, state.http_client.request(forwarded)).await
    {
        Ok(Ok(res)) => res,
        Ok(Err(err)) if err.is_connect() => {
            warn!(
                "Dev server for {} refused connection on port {}",
                key, target.port
            );
            state.registry.evict_if_port(key, target.port);
            return html_response(StatusCode::BAD_GATEWAY, pages::unreachable_page(target.port));
        }
        Ok(Err(err)) => {
            error!("Preview proxy request failed: {:?}", err);
            return html_response(StatusCode::BAD_GATEWAY, pages::unreachable_page(target.port));
        }
        Err(_) => {
            warn!(
                "Dev server for {} timed out after {:?}",
                key, timeout
            );
            return html_response(StatusCode::GATEWAY_TIMEOUT, pages::timeout_page(target.port));
        }
    };

    let (mut parts, body) = response.into_parts();
    let path_only = target_path.split('?').next().unwrap_or(target_path);
    correct_content_type(&mut parts.headers, path_only);
    for (name, value) in CORS_HEADERS {
        parts
            .headers
            .insert(name, HeaderValue::from_static(value));
    }

    let rewritable = target.kind.is_bundler()
        && !parts.headers.contains_key(header::CONTENT_ENCODING)
        && parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(DocumentKind::from_content_type)
            .is_some();

    if !rewritable {
        return Response::from_parts(parts, Body::new(body));
    }

    let bytes = match axum::body::to_bytes(Body::new(body), max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read dev server response body: {:?}", e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    let rewritten = match std::str::from_utf8(&bytes) {
        Ok(text) => {
            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            rewrite_body(content_type, &key.prefix(), text).into_bytes()
        }
        Err(_) => bytes.to_vec(),
    };

    parts.headers.remove(header::TRANSFER_ENCODING);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
    Response::from_parts(parts, Body::from(rewritten))
}

/// Reject requests whose declared length exceeds `max_body_bytes`.
fn enforce_body_limit(headers: &HeaderMap, max_body_bytes: usize) -> Result<(), StatusCode> {
    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or(StatusCode::BAD_REQUEST)?;
        if length > max_body_bytes {
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
    }
    Ok(())
}

// ============================================================================
// WebSocket
// ============================================================================

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
}

async fn proxy_websocket(
    state: AppState,
    key: PreviewKey,
    target_path: String,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(target) = state.registry.lookup(&key) else {
        debug!("WebSocket upgrade for {} without a dev server", key);
        return unavailable();
    };

    // The registry may be stale until the next health sweep.
    if !probe_port(target.port, state.config.preview.probe_timeout()).await {
        info!(
            "Dev server for {} failed pre-upgrade probe on port {}",
            key, target.port
        );
        state.registry.evict_if_port(&key, target.port);
        return unavailable();
    }

    let upstream_url = format!("ws://localhost:{}{}", target.port, target_path);
    let mut request = match upstream_url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            error!("Invalid upstream WebSocket URL {}: {:?}", upstream_url, e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if let Some(protocols) = headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }
    if target.kind == ServerKind::Vite {
        if let Ok(origin) = HeaderValue::from_str(&format!("http://localhost:{}", target.port)) {
            request.headers_mut().insert(header::ORIGIN, origin);
        }
    } else if let Some(origin) = headers.get(header::ORIGIN) {
        request.headers_mut().insert(header::ORIGIN, origin.clone());
    }

    let (upstream, response) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            warn!(
                "Dev server for {} refused WebSocket on port {}",
                key, target.port
            );
            state.registry.evict_if_port(&key, target.port);
            return html_response(StatusCode::BAD_GATEWAY, pages::unreachable_page(target.port));
        }
        Err(e) => {
            error!("Upstream WebSocket connect to {} failed: {}", upstream_url, e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let negotiated = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ws = match negotiated {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    info!("Proxying WebSocket for {} to {}", key, upstream_url);
    ws.on_upgrade(move |socket| async move {
        let tracked = state.registry.track_socket(&key);
        tokio::select! {
            result = relay(socket, upstream) => {
                if let Err(e) = result {
                    debug!("WebSocket relay for {} ended: {}", key, e);
                }
            }
            _ = tracked.token().cancelled() => {
                info!("Closing WebSocket for {}: dev server evicted", key);
            }
        }
    })
}

/// Relay frames in both directions until one side closes.
async fn relay(client: WebSocket, upstream: Upstream) -> anyhow::Result<()> {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut server_tx, mut server_rx) = upstream.split();

    let client_to_server = async {
        while let Some(msg) = client_rx.next().await {
            let forward = match msg? {
                AxumMessage::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
                AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
                AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
                AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
                AxumMessage::Close(_) => TungsteniteMessage::Close(None),
            };
            server_tx.send(forward).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let server_to_client = async {
        while let Some(msg) = server_rx.next().await {
            let forward = match msg? {
                TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
                TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
                TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
                TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
                TungsteniteMessage::Close(_) => AxumMessage::Close(None),
                TungsteniteMessage::Frame(_) => continue,
            };
            client_tx.send(forward).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = client_to_server => result?,
        result = server_to_client => result?,
    }

    Ok(())
}
