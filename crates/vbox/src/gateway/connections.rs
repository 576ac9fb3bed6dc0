//! Live editor connections, keyed by `userId:projectId`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vbox_protocol::ServerEvent;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

pub fn connection_key(user_id: &str, project_id: &str) -> String {
    format!("{user_id}:{project_id}")
}

/// One connected client.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub socket_id: u64,
    pub user_id: String,
    pub project_id: String,
    pub is_owner: bool,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<ServerEvent>,
    access_disabled: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl ConnectionRecord {
    pub fn key(&self) -> String {
        connection_key(&self.user_id, &self.project_id)
    }

    /// Queue an event without waiting; dropped when the buffer is full.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Send buffer full for socket {}, dropping event", self.socket_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn access_disabled(&self) -> bool {
        self.access_disabled.load(Ordering::SeqCst)
    }

    /// Switch to read-only and tell the client why.
    pub fn disable(&self, message: &str) {
        self.access_disabled.store(true, Ordering::SeqCst);
        self.send(ServerEvent::DisableAccess {
            message: message.to_string(),
        });
    }

    /// Cancelled when the connection must close.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Row of the `/debug/connections` dump.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub user_key: String,
    pub socket_id: u64,
    pub user_id: String,
    pub virtualbox_id: String,
    pub is_owner: bool,
    pub connected_at: DateTime<Utc>,
    pub connected_for_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsSnapshot {
    pub total_connections: usize,
    pub owners: Vec<String>,
    pub connections: Vec<ConnectionInfo>,
}

/// At most one connection per user and project; tracks which projects have
/// their owner online.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionRecord>,
    owners: DashMap<String, u64>,
    next_socket_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, force-disconnecting any previous one for the
    /// same key.
    pub fn register(
        &self,
        user_id: &str,
        project_id: &str,
        is_owner: bool,
    ) -> (ConnectionRecord, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = ConnectionRecord {
            socket_id,
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            is_owner,
            connected_at: Utc::now(),
            sender: tx,
            access_disabled: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        };

        let key = record.key();
        if let Some(previous) = self.connections.insert(key.clone(), record.clone()) {
            info!("Disconnecting existing connection for {}", key);
            previous.send(ServerEvent::ForceDisconnect {
                message: "New connection established".to_string(),
            });
            previous.shutdown.cancel();
            if previous.is_owner {
                self.owners
                    .remove_if(&previous.project_id, |_, id| *id == previous.socket_id);
            }
        }
        if is_owner {
            self.owners.insert(project_id.to_string(), socket_id);
            info!("Owner connected for project {}", project_id);
        }
        debug!("Registered socket {} for {}", socket_id, key);
        (record, rx)
    }

    /// Remove a connection if it is still the registered one for its key.
    pub fn unregister(&self, record: &ConnectionRecord) -> bool {
        let removed = self
            .connections
            .remove_if(&record.key(), |_, current| current.socket_id == record.socket_id)
            .is_some();
        if removed && record.is_owner {
            self.owners
                .remove_if(&record.project_id, |_, id| *id == record.socket_id);
        }
        removed
    }

    pub fn owner_connected(&self, project_id: &str) -> bool {
        self.owners.contains_key(project_id)
    }

    pub fn get(&self, user_id: &str, project_id: &str) -> Option<ConnectionRecord> {
        self.connections
            .get(&connection_key(user_id, project_id))
            .map(|r| r.clone())
    }

    pub fn project_connections(&self, project_id: &str) -> Vec<ConnectionRecord> {
        self.connections
            .iter()
            .filter(|r| r.project_id == project_id)
            .map(|r| r.clone())
            .collect()
    }

    /// Send to every connection of a project except `skip_socket`.
    pub fn broadcast(&self, project_id: &str, skip_socket: Option<u64>, event: ServerEvent) {
        for record in self.project_connections(project_id) {
            if Some(record.socket_id) != skip_socket {
                record.send(event.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn snapshot(&self) -> ConnectionsSnapshot {
        let now = Utc::now();
        let mut connections: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| {
                let r = entry.value();
                ConnectionInfo {
                    user_key: entry.key().clone(),
                    socket_id: r.socket_id,
                    user_id: r.user_id.clone(),
                    virtualbox_id: r.project_id.clone(),
                    is_owner: r.is_owner,
                    connected_at: r.connected_at,
                    connected_for_secs: (now - r.connected_at).num_seconds(),
                }
            })
            .collect();
        connections.sort_by_key(|c| c.socket_id);
        let mut owners: Vec<String> = self.owners.iter().map(|e| e.key().clone()).collect();
        owners.sort();
        ConnectionsSnapshot {
            total_connections: connections.len(),
            owners,
            connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_connection_replaces_first() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = registry.register("u1", "p1", true);
        let (second, _rx) = registry.register("u1", "p1", true);

        assert_eq!(registry.len(), 1);
        assert!(first.shutdown_token().is_cancelled());
        assert!(matches!(
            first_rx.try_recv(),
            Ok(ServerEvent::ForceDisconnect { .. })
        ));
        assert_eq!(registry.get("u1", "p1").unwrap().socket_id, second.socket_id);
        assert!(registry.owner_connected("p1"));

        // The stale connection's cleanup must not remove its replacement.
        assert!(!registry.unregister(&first));
        assert_eq!(registry.len(), 1);
        assert!(registry.owner_connected("p1"));

        assert!(registry.unregister(&second));
        assert!(registry.is_empty());
        assert!(!registry.owner_connected("p1"));
    }

    #[test]
    fn broadcast_reaches_project_only() {
        let registry = ConnectionRegistry::new();
        let (owner, mut owner_rx) = registry.register("u1", "p1", true);
        let (_guest, mut guest_rx) = registry.register("u2", "p1", false);
        let (_other, mut other_rx) = registry.register("u3", "p2", true);

        registry.broadcast("p1", Some(owner.socket_id), ServerEvent::OwnerDisconnected);
        assert!(owner_rx.try_recv().is_err());
        assert!(matches!(guest_rx.try_recv(), Ok(ServerEvent::OwnerDisconnected)));
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn disable_sets_flag_and_notifies() {
        let registry = ConnectionRegistry::new();
        let (guest, mut rx) = registry.register("u2", "p1", false);
        assert!(!guest.access_disabled());
        guest.disable("owner left");
        assert!(registry.get("u2", "p1").unwrap().access_disabled());
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::DisableAccess { .. })));
    }

    #[test]
    fn snapshot_lists_connections_and_owners() {
        let registry = ConnectionRegistry::new();
        registry.register("u1", "p1", true);
        registry.register("u2", "p1", false);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.owners, vec!["p1"]);
        assert_eq!(snapshot.connections[0].user_key, "u1:p1");
        assert!(snapshot.connections[0].is_owner);
        assert_eq!(snapshot.connections[1].virtualbox_id, "p1");
    }
}
