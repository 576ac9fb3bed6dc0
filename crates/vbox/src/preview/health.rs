//! Background liveness checks for registered dev servers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::ServerRegistry;

/// Open a TCP connection to `localhost:port` within `timeout`.
pub async fn probe_port(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("localhost", port))).await,
        Ok(Ok(_))
    )
}

/// Periodically probes every registered target and evicts dead ones.
pub struct HealthChecker {
    registry: Arc<ServerRegistry>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<ServerRegistry>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            probe_timeout,
        }
    }

    /// Probe every target once. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let targets = self.registry.snapshot();
        if targets.is_empty() {
            return 0;
        }

        let probes = targets.into_iter().map(|(key, target)| async move {
            let alive = probe_port(target.port, self.probe_timeout).await;
            (key, target, alive)
        });

        let mut evicted = 0;
        for (key, target, alive) in join_all(probes).await {
            if alive {
                debug!("Dev server {} on port {} is alive", key, target.port);
            } else if self.registry.evict_if_port(&key, target.port) {
                info!(
                    "Health probe failed for {} on port {}, target removed",
                    key, target.port
                );
                evicted += 1;
            }
        }
        evicted
    }

    /// Run until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            debug!("Health checker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::registry::{PreviewKey, PreviewTarget, ServerKind};
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn live_target_survives_sweep() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = Arc::new(ServerRegistry::new());
        let key = PreviewKey::new("p1", "u1");
        registry.register(key.clone(), PreviewTarget::new(port, ServerKind::Vite));

        let checker = HealthChecker::new(
            registry.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        assert_eq!(checker.sweep().await, 0);
        assert!(registry.lookup(&key).is_some());
    }

    #[tokio::test]
    async fn dead_target_is_evicted_and_sockets_closed() {
        let port = closed_port().await;
        let registry = Arc::new(ServerRegistry::new());
        let key = PreviewKey::new("p1", "u1");
        registry.register(key.clone(), PreviewTarget::new(port, ServerKind::Vite));
        let socket = registry.track_socket(&key);

        let checker = HealthChecker::new(
            registry.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        assert_eq!(checker.sweep().await, 1);
        assert!(registry.lookup(&key).is_none());
        assert!(socket.token().is_cancelled());
    }

    #[tokio::test]
    async fn spawned_loop_evicts_and_stops() {
        let port = closed_port().await;
        let registry = Arc::new(ServerRegistry::new());
        let key = PreviewKey::new("p1", "u1");
        registry.register(key.clone(), PreviewTarget::new(port, ServerKind::Other));

        let shutdown = CancellationToken::new();
        let handle = HealthChecker::new(
            registry.clone(),
            Duration::from_millis(20),
            Duration::from_millis(200),
        )
        .spawn(shutdown.clone());

        for _ in 0..50 {
            if registry.lookup(&key).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registry.lookup(&key).is_none());
        shutdown.cancel();
        handle.await.unwrap();
    }
}
