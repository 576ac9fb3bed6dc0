//! In-process object store for local development and tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::error::{StorageError, StorageResult};
use super::RemoteStore;

/// A `RemoteStore` backed by an ordered map of key -> contents.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with objects.
    pub fn with_objects<I, K, V>(objects: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        if let Ok(mut map) = store.objects.write() {
            map.extend(objects.into_iter().map(|(k, v)| (k.into(), v.into())));
        }
        store
    }

    /// Current contents of one object.
    pub fn get(&self, key: &str) -> Option<String> {
        self.objects.read().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, BTreeMap<String, String>>> {
        self.objects
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".into()))
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, BTreeMap<String, String>>> {
        self.objects
            .read()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list(&self, project_id: &str) -> StorageResult<Vec<String>> {
        let prefix = format!("projects/{project_id}/");
        Ok(self
            .read()?
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn list_folder(&self, folder_id: &str) -> StorageResult<Vec<String>> {
        let prefix = format!("{folder_id}/");
        Ok(self
            .read()?
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn fetch(&self, file_id: &str) -> StorageResult<String> {
        self.read()?
            .get(file_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(file_id.to_string()))
    }

    async fn create(&self, file_id: &str) -> StorageResult<()> {
        self.write()?.insert(file_id.to_string(), String::new());
        Ok(())
    }

    async fn save(&self, file_id: &str, data: &str) -> StorageResult<()> {
        self.write()?.insert(file_id.to_string(), data.to_string());
        Ok(())
    }

    async fn rename(&self, file_id: &str, new_file_id: &str, data: &str) -> StorageResult<()> {
        let mut map = self.write()?;
        map.remove(file_id);
        map.insert(new_file_id.to_string(), data.to_string());
        Ok(())
    }

    async fn delete(&self, file_id: &str) -> StorageResult<()> {
        self.write()?.remove(file_id);
        Ok(())
    }

    async fn project_size(&self, project_id: &str) -> StorageResult<u64> {
        let prefix = format!("projects/{project_id}/");
        Ok(self
            .read()?
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.len() as u64)
            .sum())
    }
}
