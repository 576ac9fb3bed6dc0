//! Persistent object storage for project files.
//!
//! The store is an external worker addressed by object key
//! (`projects/<projectId>/<path>`). [`RemoteStore`] abstracts it so the
//! session layer can run against the HTTP worker or an in-process map.

mod error;
mod http;
mod memory;

pub use error::{StorageError, StorageResult};
pub use http::HttpStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

/// Object storage consumed by the session store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every object key stored for a project.
    async fn list(&self, project_id: &str) -> StorageResult<Vec<String>>;

    /// Object keys under a folder id.
    async fn list_folder(&self, folder_id: &str) -> StorageResult<Vec<String>>;

    /// Raw contents of one object, decoded as UTF-8 (lossy).
    async fn fetch(&self, file_id: &str) -> StorageResult<String>;

    /// Create an empty object.
    async fn create(&self, file_id: &str) -> StorageResult<()>;

    async fn save(&self, file_id: &str, data: &str) -> StorageResult<()>;

    async fn rename(&self, file_id: &str, new_file_id: &str, data: &str) -> StorageResult<()>;

    async fn delete(&self, file_id: &str) -> StorageResult<()>;

    /// Total stored bytes for a project.
    async fn project_size(&self, project_id: &str) -> StorageResult<u64>;
}
