//! Runtime configuration.
//!
//! Every section deserializes with defaults, so a partial TOML file (or no
//! file at all) yields a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub identity: IdentityConfig,
    pub codegen: CodegenConfig,
    pub workspace: WorkspaceConfig,
    pub preview: PreviewConfig,
    pub gateway: GatewayConfig,
    pub limits: LimitsConfig,
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty means any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Http,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Base URL of the object storage worker.
    pub base_url: String,
    /// Value sent in the `Authorization` header, if any.
    pub key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Http,
            base_url: "http://127.0.0.1:8787".to_string(),
            key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Base URL of the database worker serving `/api/user`.
    pub base_url: String,
    /// Value sent in the `Authorization` header, if any.
    pub key: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8788".to_string(),
            key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    /// AI endpoint; code generation is disabled when unset.
    pub endpoint: Option<String>,
    /// Bearer token for the AI endpoint.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory mirroring every hydrated project. Defaults to the data dir.
    pub root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub health_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 5,
            probe_timeout_ms: 1000,
            request_timeout_secs: 30,
            max_body_bytes: 10 * MIB as usize,
        }
    }
}

impl PreviewConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub reconnect_cooldown_ms: u64,
    pub max_terminals: usize,
    pub ping_interval_secs: u64,
    pub idle_log_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reconnect_cooldown_ms: 1000,
            max_terminals: 4,
            ping_interval_secs: 30,
            idle_log_secs: 15,
        }
    }
}

impl GatewayConfig {
    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn idle_log_after(&self) -> Duration {
        Duration::from_secs(self.idle_log_secs)
    }
}

/// Fixed-window budget: `points` operations per `window_secs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateBudget {
    pub points: u32,
    pub window_secs: u64,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            points: 1,
            window_secs: 2,
        }
    }
}

impl RateBudget {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub project_quota_bytes: u64,
    pub max_file_bytes: u64,
    pub save: RateBudget,
    pub create_file: RateBudget,
    pub create_folder: RateBudget,
    pub delete: RateBudget,
    pub rename: RateBudget,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            project_quota_bytes: 200 * MIB,
            max_file_bytes: 5 * MIB,
            save: RateBudget::default(),
            create_file: RateBudget::default(),
            create_folder: RateBudget::default(),
            delete: RateBudget::default(),
            rename: RateBudget::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            cols: 100,
            rows: 30,
        }
    }
}

impl WorkspaceConfig {
    /// Resolve the mirror root, expanding `~` and environment variables.
    pub fn resolve_root(&self, fallback: PathBuf) -> anyhow::Result<PathBuf> {
        match &self.root {
            Some(raw) => {
                let expanded = shellexpand::full(raw)?;
                Ok(PathBuf::from(expanded.to_string()))
            }
            None => Ok(fallback),
        }
    }
}
