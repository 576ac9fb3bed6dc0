//! Project access lookups against the database worker.
//!
//! The gateway asks once per connection whether a user owns a project or has
//! been granted shared access to it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

pub type IdentityResult<T> = Result<T, IdentityError>;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Identity service returned {status}")]
    UnexpectedStatus { status: u16 },

    #[error("User not found: {0}")]
    UserNotFound(String),
}

/// How a user relates to a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Owner,
    Shared,
    Denied,
}

/// The slice of the user record the gateway needs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub virtualbox: Vec<OwnedProject>,
    #[serde(default)]
    pub users_to_virtualboxes: Vec<SharedProject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnedProject {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedProject {
    pub virtualbox_id: String,
}

impl UserRecord {
    pub fn access_to(&self, project_id: &str) -> Access {
        if self.virtualbox.iter().any(|v| v.id == project_id) {
            Access::Owner
        } else if self
            .users_to_virtualboxes
            .iter()
            .any(|s| s.virtualbox_id == project_id)
        {
            Access::Shared
        } else {
            Access::Denied
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn fetch_user(&self, user_id: &str) -> IdentityResult<UserRecord>;

    /// Count one code generation against the user.
    async fn record_generation(&self, user_id: &str) -> IdentityResult<()>;
}

/// Client for the database worker's `/api/user` surface.
#[derive(Debug, Clone)]
pub struct HttpIdentity {
    client: Client,
    base_url: String,
    key: Option<String>,
}

impl HttpIdentity {
    pub fn new(base_url: impl Into<String>, key: Option<String>) -> IdentityResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.key {
            Some(key) => builder.header(reqwest::header::AUTHORIZATION, key),
            None => builder,
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentity {
    async fn fetch_user(&self, user_id: &str) -> IdentityResult<UserRecord> {
        let url = format!("{}/api/user", self.base_url);
        let response = self
            .authorize(self.client.get(&url).query(&[("id", user_id)]))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }
        // The worker answers `null` for unknown users.
        let record: Option<UserRecord> = response.json().await?;
        record.ok_or_else(|| IdentityError::UserNotFound(user_id.to_string()))
    }

    async fn record_generation(&self, user_id: &str) -> IdentityResult<()> {
        let url = format!("{}/api/virtualbox/generate", self.base_url);
        let response = self
            .authorize(self.client.post(&url).json(&json!({ "userId": user_id })))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IdentityError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Fixed user table, for local development and tests.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    users: HashMap<String, UserRecord>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: `user_id` owns `project_id`.
    pub fn owner(mut self, user_id: &str, project_id: &str) -> Self {
        self.entry(user_id).virtualbox.push(OwnedProject {
            id: project_id.to_string(),
        });
        self
    }

    /// Builder-style: `user_id` has shared access to `project_id`.
    pub fn shared(mut self, user_id: &str, project_id: &str) -> Self {
        self.entry(user_id)
            .users_to_virtualboxes
            .push(SharedProject {
                virtualbox_id: project_id.to_string(),
            });
        self
    }

    fn entry(&mut self, user_id: &str) -> &mut UserRecord {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserRecord {
                id: user_id.to_string(),
                ..Default::default()
            })
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn fetch_user(&self, user_id: &str) -> IdentityResult<UserRecord> {
        self.users
            .get(user_id)
            .cloned()
            .ok_or_else(|| IdentityError::UserNotFound(user_id.to_string()))
    }

    async fn record_generation(&self, _user_id: &str) -> IdentityResult<()> {
        Ok(())
    }
}
