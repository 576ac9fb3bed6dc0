//! Handshake validation for editor connections.
//!
//! Runs before the WebSocket upgrade, so every rejection is an ordinary
//! HTTP status the client can read.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::identity::{Access, IdentityError, IdentityProvider};

/// Query string of the connect request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeQuery {
    pub user_id: Option<String>,
    pub virtualbox_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthRejection {
    #[error("Invalid request")]
    InvalidRequest,

    #[error("Too many connection attempts")]
    ReconnectTooSoon,

    #[error("Failed to fetch user data: {0}")]
    FetchFailed(String),

    #[error("Invalid credentials")]
    NotAuthorized,
}

/// An accepted handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorized {
    pub user_id: String,
    pub project_id: String,
    pub is_owner: bool,
}

/// Remembers the last connection attempt per user.
pub struct ReconnectGuard {
    cooldown: Duration,
    attempts: DashMap<String, Instant>,
}

impl ReconnectGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            attempts: DashMap::new(),
        }
    }

    /// Record an attempt; `false` if the previous one was too recent.
    pub fn check(&self, user_id: &str) -> bool {
        self.check_at(user_id, Instant::now())
    }

    fn check_at(&self, user_id: &str, now: Instant) -> bool {
        match self.attempts.entry(user_id.to_string()) {
            Entry::Occupied(mut last) => {
                if now.saturating_duration_since(*last.get()) < self.cooldown {
                    return false;
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        true
    }

    /// Forget attempts older than the cooldown.
    pub fn prune(&self) {
        let now = Instant::now();
        self.attempts
            .retain(|_, at| now.saturating_duration_since(*at) < self.cooldown);
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Validate the handshake shape, the reconnect cooldown and project access.
pub async fn authenticate(
    query: HandshakeQuery,
    guard: &ReconnectGuard,
    identity: &dyn IdentityProvider,
) -> Result<Authorized, AuthRejection> {
    let (Some(user_id), Some(project_id)) = (non_empty(query.user_id), non_empty(query.virtualbox_id))
    else {
        debug!("Rejecting handshake with missing userId or virtualboxId");
        return Err(AuthRejection::InvalidRequest);
    };
    info!("Connection attempt - project: {}, user: {}", project_id, user_id);

    if !guard.check(&user_id) {
        info!("Rejecting rapid reconnection from user {}", user_id);
        return Err(AuthRejection::ReconnectTooSoon);
    }

    let user = identity.fetch_user(&user_id).await.map_err(|e| {
        warn!("Identity lookup for {} failed: {}", user_id, e);
        match e {
            IdentityError::UserNotFound(_) => AuthRejection::NotAuthorized,
            other => AuthRejection::FetchFailed(other.to_string()),
        }
    })?;

    let is_owner = match user.access_to(&project_id) {
        Access::Owner => true,
        Access::Shared => false,
        Access::Denied => return Err(AuthRejection::NotAuthorized),
    };
    Ok(Authorized {
        user_id,
        project_id,
        is_owner,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;

    fn query(user: &str, project: &str) -> HandshakeQuery {
        HandshakeQuery {
            user_id: Some(user.into()),
            virtualbox_id: Some(project.into()),
        }
    }

    #[tokio::test]
    async fn owner_and_shared_users_are_accepted() {
        let identity = StaticIdentity::new().owner("alice", "p1").shared("bob", "p1");
        let guard = ReconnectGuard::new(Duration::from_secs(1));

        let owner = authenticate(query("alice", "p1"), &guard, &identity).await.unwrap();
        assert!(owner.is_owner);
        let shared = authenticate(query("bob", "p1"), &guard, &identity).await.unwrap();
        assert!(!shared.is_owner);
        assert_eq!(shared.project_id, "p1");
    }

    #[tokio::test]
    async fn rejections_are_distinct() {
        let identity = StaticIdentity::new().owner("alice", "p1");
        let guard = ReconnectGuard::new(Duration::from_secs(60));

        assert!(matches!(
            authenticate(HandshakeQuery::default(), &guard, &identity).await,
            Err(AuthRejection::InvalidRequest)
        ));
        assert!(matches!(
            authenticate(query("alice", ""), &guard, &identity).await,
            Err(AuthRejection::InvalidRequest)
        ));
        assert!(matches!(
            authenticate(query("alice", "p2"), &guard, &identity).await,
            Err(AuthRejection::NotAuthorized)
        ));
        assert!(matches!(
            authenticate(query("alice", "p1"), &guard, &identity).await,
            Err(AuthRejection::ReconnectTooSoon)
        ));
        assert!(matches!(
            authenticate(query("mallory", "p1"), &guard, &identity).await,
            Err(AuthRejection::NotAuthorized)
        ));
    }

    #[test]
    fn cooldown_expires() {
        let guard = ReconnectGuard::new(Duration::from_secs(1));
        let start = Instant::now();
        assert!(guard.check_at("u1", start));
        assert!(!guard.check_at("u1", start + Duration::from_millis(200)));
        assert!(guard.check_at("u2", start + Duration::from_millis(200)));
        assert!(guard.check_at("u1", start + Duration::from_millis(1200)));
    }
}
