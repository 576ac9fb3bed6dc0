//! Registry of running dev servers, keyed by project and user.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Identifies one preview: a project viewed through one user's dev server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewKey {
    pub project_id: String,
    pub user_id: String,
}

impl PreviewKey {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Public path prefix the target is served under.
    pub fn prefix(&self) -> String {
        format!("/preview/{}/{}", self.project_id, self.user_id)
    }
}

impl fmt::Display for PreviewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.project_id, self.user_id)
    }
}

/// Kind of dev server behind a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Vite-style bundler; needs path rewriting.
    Vite,
    /// Next-style framework server.
    Next,
    Other,
}

impl ServerKind {
    pub fn is_bundler(self) -> bool {
        matches!(self, ServerKind::Vite)
    }
}

/// A registered dev server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewTarget {
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub registered_at: DateTime<Utc>,
}

impl PreviewTarget {
    pub fn new(port: u16, kind: ServerKind) -> Self {
        Self {
            port,
            kind,
            registered_at: Utc::now(),
        }
    }
}

/// Ports accepted as dev-server ports: strictly between 1024 and 65535.
pub fn is_valid_port(port: u32) -> bool {
    port > 1024 && port < 65535
}

/// Handle for a proxied WebSocket. Dropping it unregisters the socket.
pub struct TrackedSocket<'a> {
    registry: &'a ServerRegistry,
    key: PreviewKey,
    id: u64,
    token: CancellationToken,
}

impl TrackedSocket<'_> {
    /// Resolves when the target is evicted.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for TrackedSocket<'_> {
    fn drop(&mut self) {
        if let Some(mut sockets) = self.registry.sockets.get_mut(&self.key) {
            sockets.remove(&self.id);
        }
        self.registry.sockets.remove_if(&self.key, |_, s| s.is_empty());
    }
}

/// Concurrent map of preview targets plus the WebSockets proxied to them.
#[derive(Default)]
pub struct ServerRegistry {
    targets: DashMap<PreviewKey, PreviewTarget>,
    sockets: DashMap<PreviewKey, HashMap<u64, CancellationToken>>,
    next_socket_id: AtomicU64,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the target for `key`.
    pub fn register(&self, key: PreviewKey, target: PreviewTarget) {
        info!(
            "Registered {:?} dev server for {} on port {}",
            target.kind, key, target.port
        );
        self.targets.insert(key, target);
    }

    pub fn lookup(&self, key: &PreviewKey) -> Option<PreviewTarget> {
        self.targets.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &PreviewKey) -> Option<PreviewTarget> {
        self.targets.remove(key).map(|(_, target)| target)
    }

    /// Remove the target and close every WebSocket proxied to it.
    pub fn evict(&self, key: &PreviewKey) -> Option<PreviewTarget> {
        let removed = self.remove(key);
        self.close_sockets(key);
        if let Some(target) = &removed {
            info!("Evicted dev server for {} (port {})", key, target.port);
        }
        removed
    }

    /// Evict `key` only if it still points at `port`.
    ///
    /// A probe that raced a re-registration must not drop the newer target.
    pub fn evict_if_port(&self, key: &PreviewKey, port: u16) -> bool {
        let stale = self
            .targets
            .remove_if(key, |_, target| target.port == port)
            .is_some();
        if stale {
            self.close_sockets(key);
            info!("Evicted dev server for {} (port {})", key, port);
        }
        stale
    }

    fn close_sockets(&self, key: &PreviewKey) {
        if let Some((_, sockets)) = self.sockets.remove(key) {
            debug!("Closing {} proxied socket(s) for {}", sockets.len(), key);
            for token in sockets.into_values() {
                token.cancel();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(PreviewKey, PreviewTarget)> {
        self.targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Start tracking a proxied WebSocket for `key`.
    pub fn track_socket(&self, key: &PreviewKey) -> TrackedSocket<'_> {
        let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.sockets
            .entry(key.clone())
            .or_default()
            .insert(id, token.clone());
        TrackedSocket {
            registry: self,
            key: key.clone(),
            id,
            token,
        }
    }

    pub fn open_sockets(&self, key: &PreviewKey) -> usize {
        self.sockets.get(key).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_then_lookup_returns_target() {
        let registry = ServerRegistry::new();
        let key = PreviewKey::new("p1", "u1");
        let target = PreviewTarget::new(5173, ServerKind::Vite);
        registry.register(key.clone(), target.clone());
        assert_eq!(registry.lookup(&key), Some(target));
        assert_eq!(key.to_string(), "p1_u1");
        assert_eq!(key.prefix(), "/preview/p1/u1");
    }

    #[test]
    fn last_registration_wins() {
        let registry = ServerRegistry::new();
        let key = PreviewKey::new("p1", "u1");
        registry.register(key.clone(), PreviewTarget::new(3000, ServerKind::Next));
        registry.register(key.clone(), PreviewTarget::new(5173, ServerKind::Vite));
        let found = registry.lookup(&key).unwrap();
        assert_eq!(found.port, 5173);
        assert_eq!(found.kind, ServerKind::Vite);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn port_bounds_are_exclusive() {
        assert!(!is_valid_port(1024));
        assert!(is_valid_port(1025));
        assert!(is_valid_port(65534));
        assert!(!is_valid_port(65535));
        assert!(!is_valid_port(99999));
    }

    #[test]
    fn evict_cancels_tracked_sockets() {
        let registry = ServerRegistry::new();
        let key = PreviewKey::new("p1", "u1");
        registry.register(key.clone(), PreviewTarget::new(5173, ServerKind::Vite));
        let socket = registry.track_socket(&key);
        assert_eq!(registry.open_sockets(&key), 1);

        registry.evict(&key);
        assert!(socket.token().is_cancelled());
        assert!(registry.lookup(&key).is_none());
        drop(socket);
        assert_eq!(registry.open_sockets(&key), 0);
    }

    #[test]
    fn evict_if_port_ignores_reregistered_target() {
        let registry = ServerRegistry::new();
        let key = PreviewKey::new("p1", "u1");
        registry.register(key.clone(), PreviewTarget::new(5174, ServerKind::Vite));
        assert!(!registry.evict_if_port(&key, 5173));
        assert!(registry.lookup(&key).is_some());
        assert!(registry.evict_if_port(&key, 5174));
        assert!(registry.lookup(&key).is_none());
    }

    #[test]
    fn concurrent_registrations_keep_each_key() {
        let registry = Arc::new(ServerRegistry::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for round in 0..50u16 {
                        let key = PreviewKey::new(format!("p{i}"), "u");
                        let target = PreviewTarget::new(2000 + i * 100 + round, ServerKind::Other);
                        registry.register(key.clone(), target.clone());
                        assert_eq!(registry.lookup(&key), Some(target));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 8);
    }
}
