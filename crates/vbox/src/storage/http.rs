//! HTTP client for the object storage worker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;

use super::error::{StorageError, StorageResult};
use super::RemoteStore;

#[derive(Debug, Deserialize)]
struct ObjectListing {
    #[serde(default)]
    objects: Vec<ObjectEntry>,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    key: String,
}

#[derive(Debug, Deserialize)]
struct SizeResponse {
    size: u64,
}

/// Client for the storage worker's `/api` surface.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    /// Base URL, e.g. "http://127.0.0.1:8787".
    base_url: String,
    key: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>, key: Option<String>) -> StorageResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.key {
            Some(key) => builder.header(reqwest::header::AUTHORIZATION, key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, url: &str) -> StorageResult<Response> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| StorageError::ConnectionFailed {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response) -> StorageResult<T> {
        response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn list(&self, project_id: &str) -> StorageResult<Vec<String>> {
        let url = self.url("/api");
        let response = self
            .send(
                self.client.get(&url).query(&[("virtualboxId", project_id)]),
                &url,
            )
            .await?;
        let listing: ObjectListing = Self::json(response).await?;
        Ok(listing.objects.into_iter().map(|o| o.key).collect())
    }

    async fn list_folder(&self, folder_id: &str) -> StorageResult<Vec<String>> {
        let url = self.url("/api");
        let response = self
            .send(self.client.get(&url).query(&[("folderId", folder_id)]), &url)
            .await?;
        Self::json(response).await
    }

    async fn fetch(&self, file_id: &str) -> StorageResult<String> {
        let url = self.url("/api");
        let response = self
            .send(self.client.get(&url).query(&[("fileId", file_id)]), &url)
            .await?;
        let bytes = response.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn create(&self, file_id: &str) -> StorageResult<()> {
        let url = self.url("/api");
        self.send(
            self.client.post(&url).json(&json!({ "fileId": file_id })),
            &url,
        )
        .await?;
        Ok(())
    }

    async fn save(&self, file_id: &str, data: &str) -> StorageResult<()> {
        let url = self.url("/api/save");
        self.send(
            self.client
                .post(&url)
                .json(&json!({ "fileId": file_id, "data": data })),
            &url,
        )
        .await?;
        Ok(())
    }

    async fn rename(&self, file_id: &str, new_file_id: &str, data: &str) -> StorageResult<()> {
        let url = self.url("/api/rename");
        self.send(
            self.client.post(&url).json(&json!({
                "fileId": file_id,
                "newFileId": new_file_id,
                "data": data,
            })),
            &url,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, file_id: &str) -> StorageResult<()> {
        let url = self.url("/api");
        self.send(
            self.client.delete(&url).json(&json!({ "fileId": file_id })),
            &url,
        )
        .await?;
        Ok(())
    }

    async fn project_size(&self, project_id: &str) -> StorageResult<u64> {
        let url = self.url("/api/size");
        let response = self
            .send(
                self.client.get(&url).query(&[("virtualboxId", project_id)]),
                &url,
            )
            .await?;
        let size: SizeResponse = Self::json(response).await?;
        Ok(size.size)
    }
}
