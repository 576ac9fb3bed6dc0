//! Editor connection gateway.
//!
//! Authenticates connections, keeps one live connection per user and
//! project, gates shared users behind the owner's presence and dispatches
//! file and terminal commands.

pub mod auth;
pub mod connections;
pub mod handler;
pub mod ratelimit;
pub mod terminal;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use vbox_protocol::ServerEvent;

use crate::codegen::CodeGenerator;
use crate::identity::IdentityProvider;
use crate::preview::{Detection, OutputScanner, PreviewKey, PreviewTarget, ServerRegistry};
use crate::session::SessionStore;
use crate::settings::{AppConfig, GatewayConfig};

pub use auth::{AuthRejection, Authorized, HandshakeQuery, ReconnectGuard, authenticate};
pub use connections::{ConnectionRecord, ConnectionRegistry, ConnectionsSnapshot};
pub use handler::socket_handler;
pub use ratelimit::{Operation, RateLimiter};
pub use terminal::{TerminalError, TerminalEvent, TerminalManager};

/// Shared state behind every editor connection.
pub struct Gateway {
    pub connections: ConnectionRegistry,
    pub guard: ReconnectGuard,
    pub limiter: RateLimiter,
    pub terminals: Arc<TerminalManager>,
    pub identity: Arc<dyn IdentityProvider>,
    pub codegen: CodeGenerator,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<ServerRegistry>,
    pub config: GatewayConfig,
    pub max_file_bytes: u64,
}

impl Gateway {
    /// Build the gateway and start forwarding terminal output.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        config: &AppConfig,
        workspace_root: PathBuf,
        sessions: Arc<SessionStore>,
        registry: Arc<ServerRegistry>,
        identity: Arc<dyn IdentityProvider>,
        codegen: CodeGenerator,
    ) -> Arc<Self> {
        let (terminals, terminal_events) = TerminalManager::new(
            config.terminal.clone(),
            config.gateway.max_terminals,
            workspace_root,
        );
        let gateway = Arc::new(Self {
            connections: ConnectionRegistry::new(),
            guard: ReconnectGuard::new(config.gateway.reconnect_cooldown()),
            limiter: RateLimiter::new(&config.limits),
            terminals: Arc::new(terminals),
            identity,
            codegen,
            sessions,
            registry,
            config: config.gateway.clone(),
            max_file_bytes: config.limits.max_file_bytes,
        });
        tokio::spawn(pump_terminal_events(
            Arc::downgrade(&gateway),
            terminal_events,
        ));
        gateway
    }

    /// Register a dev server found in a terminal of `project_id` started by
    /// `user_id`, unless the registry already points at that port.
    pub fn register_detection(&self, project_id: &str, user_id: &str, found: Detection) {
        let key = PreviewKey::new(project_id, user_id);
        if self.registry.lookup(&key).map(|t| t.port) == Some(found.port) {
            return;
        }
        info!(
            "Detected {:?} dev server on port {} for {}",
            found.kind, found.port, key
        );
        self.registry
            .register(key, PreviewTarget::new(found.port, found.kind));
    }

    /// Tear down a project after its owner left: kill its terminals, tell
    /// every remaining client and make them read-only.
    pub fn owner_left(&self, project_id: &str) {
        let killed = self.terminals.kill_project(project_id);
        if killed > 0 {
            info!("Killed {} terminal(s) of project {}", killed, project_id);
        }
        info!("Owner disconnected from {}, notifying other users", project_id);
        for conn in self.connections.project_connections(project_id) {
            conn.send(ServerEvent::OwnerDisconnected);
            conn.disable("The virtualbox owner has disconnected.");
        }
    }

    /// Log once if a project stays without connections for the idle period.
    pub fn schedule_idle_notice(self: &Arc<Self>, project_id: &str) {
        if !self.connections.project_connections(project_id).is_empty() {
            return;
        }
        let gateway = Arc::downgrade(self);
        let project_id = project_id.to_string();
        let delay = self.config.idle_log_after();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(gateway) = gateway.upgrade() else {
                return;
            };
            if gateway.connections.project_connections(&project_id).is_empty() {
                info!(
                    "No users connected to {} for {} seconds",
                    project_id,
                    delay.as_secs()
                );
                gateway.guard.prune();
                gateway.limiter.prune();
            }
        });
    }
}

/// Forward terminal output to the project's connections and feed the dev
/// server detector.
async fn pump_terminal_events(
    gateway: Weak<Gateway>,
    mut events: mpsc::UnboundedReceiver<TerminalEvent>,
) {
    let mut scanners: HashMap<(String, u64), OutputScanner> = HashMap::new();
    while let Some(event) = events.recv().await {
        let Some(gateway) = gateway.upgrade() else {
            break;
        };
        match event {
            TerminalEvent::Output {
                id,
                serial,
                project_id,
                user_id,
                data,
            } => {
                let scanner = scanners.entry((id.clone(), serial)).or_default();
                if let Some(found) = scanner.feed(&data) {
                    gateway.register_detection(&project_id, &user_id, found);
                }
                gateway.connections.broadcast(
                    &project_id,
                    None,
                    ServerEvent::TerminalResponse { id, data },
                );
            }
            TerminalEvent::Closed { id, serial } => {
                scanners.remove(&(id.clone(), serial));
                match gateway.terminals.reap(&id, serial) {
                    Some((info, code)) => gateway.connections.broadcast(
                        &info.project_id,
                        None,
                        ServerEvent::TerminalExit { id, code },
                    ),
                    None => debug!("Terminal {} already closed", id),
                }
            }
        }
    }
    warn!("Terminal event pump stopped");
}
