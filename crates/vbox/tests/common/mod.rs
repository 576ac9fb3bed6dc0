//! Test utilities and common setup.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use vbox::api::{self, AppState};
use vbox::codegen::CodeGenerator;
use vbox::gateway::Gateway;
use vbox::identity::StaticIdentity;
use vbox::preview::ServerRegistry;
use vbox::session::{SessionLimits, SessionStore};
use vbox::settings::AppConfig;
use vbox::storage::MemoryStore;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A fully wired application over an in-memory store.
pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub workspace: TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        api::create_router(self.state.clone())
    }
}

/// Defaults with the reconnect cooldown disabled.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.gateway.reconnect_cooldown_ms = 0;
    config.gateway.idle_log_secs = 1;
    config
}

/// Create a test application with an empty store and no users.
pub async fn test_app() -> TestApp {
    test_app_with(test_config(), MemoryStore::new(), StaticIdentity::new()).await
}

pub async fn test_app_with(
    config: AppConfig,
    store: MemoryStore,
    identity: StaticIdentity,
) -> TestApp {
    let workspace = tempfile::tempdir().unwrap();
    let store = Arc::new(store);
    let registry = Arc::new(ServerRegistry::new());
    let sessions = Arc::new(SessionStore::new(
        store.clone(),
        workspace.path().to_path_buf(),
        SessionLimits::from(&config.limits),
    ));
    let gateway = Gateway::start(
        &config,
        workspace.path().to_path_buf(),
        sessions.clone(),
        registry.clone(),
        Arc::new(identity),
        CodeGenerator::new(&config.codegen).unwrap(),
    );
    let state = AppState::new(Arc::new(config), registry, sessions, gateway);
    TestApp {
        state,
        store,
        workspace,
    }
}

/// Serve the app on an ephemeral port.
pub async fn spawn_server(app: &TestApp) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

pub fn socket_url(addr: SocketAddr, user_id: &str, project_id: &str) -> String {
    format!("ws://{addr}/socket?userId={user_id}&virtualboxId={project_id}")
}

pub async fn connect(addr: SocketAddr, user_id: &str, project_id: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(socket_url(addr, user_id, project_id))
        .await
        .unwrap();
    client
}

/// Next JSON frame, skipping heartbeats. `None` once the socket closed.
pub async fn next_event(client: &mut Client) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")?;
        match msg {
            Ok(Message::Text(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "ping" {
                    continue;
                }
                return Some(value);
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Next frame with the given `type`, skipping others.
pub async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let event = next_event(client)
            .await
            .unwrap_or_else(|| panic!("socket closed before a {kind} frame"));
        if event["type"] == kind {
            return event;
        }
    }
}

pub async fn send(client: &mut Client, frame: Value) {
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

/// Send a request and wait for the reply with the same id.
pub async fn request(client: &mut Client, mut frame: Value, request_id: u64) -> Value {
    frame["requestId"] = request_id.into();
    send(client, frame).await;
    loop {
        let event = next_of_type(client, "reply").await;
        if event["requestId"] == request_id {
            return event["result"].clone();
        }
    }
}

/// Poll until `check` holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
