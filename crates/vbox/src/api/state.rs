//! Application state shared across handlers.

use std::sync::Arc;

use axum::body::Body;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::gateway::Gateway;
use crate::preview::ServerRegistry;
use crate::session::SessionStore;
use crate::settings::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Dev servers reachable through the preview proxy.
    pub registry: Arc<ServerRegistry>,
    /// Open project sessions and their disk mirrors.
    pub sessions: Arc<SessionStore>,
    /// Editor connections, terminals and rate limits.
    pub gateway: Arc<Gateway>,
    /// HTTP client for proxying requests to dev servers.
    pub http_client: Client<HttpConnector, Body>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<ServerRegistry>,
        sessions: Arc<SessionStore>,
        gateway: Arc<Gateway>,
    ) -> Self {
        let http_client: Client<HttpConnector, Body> =
            Client::builder(TokioExecutor::new()).build_http();

        Self {
            config,
            registry,
            sessions,
            gateway,
            http_client,
        }
    }
}
