//! HTTP file storage adapter
//!
//! Talks to a Supabase-style storage REST API for chat attachments and voice
//! notes.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use helpdesk_shared::{FileStorage, FileStorageError, StoredObject};

use crate::config::Config;

/// Client for the storage REST API
#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "Key")]
    key: Option<String>,
}

#[derive(Debug, Serialize)]
struct RemoveRequest<'a> {
    prefixes: &'a [String],
}

impl StorageClient {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            bucket: bucket.into(),
        }
    }

    /// Create from environment config, returns None if not configured
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.storage_url.is_empty() || config.storage_service_key.is_empty() {
            warn!("File storage not configured - voice notes and attachments cannot be uploaded");
            return None;
        }
        Some(Self::new(
            config.storage_url.clone(),
            config.storage_service_key.clone(),
            config.storage_bucket.clone(),
        ))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }

    async fn rejected(response: reqwest::Response) -> FileStorageError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        FileStorageError::Rejected { status, body }
    }
}

fn validate_path(path: &str) -> Result<(), FileStorageError> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s == "..") {
        return Err(FileStorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[async_trait]
impl FileStorage for StorageClient {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, FileStorageError> {
        validate_path(path)?;
        let size = bytes.len();

        let response = self
            .client
            .post(self.object_url(path))
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|e| FileStorageError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let err = Self::rejected(response).await;
            warn!(path = %path, error = %err, "Storage upload rejected");
            return Err(err);
        }

        // The response key is prefixed with the bucket; callers work with
        // bucket-relative paths.
        let stored = response
            .json::<UploadResponse>()
            .await
            .ok()
            .and_then(|r| r.key)
            .and_then(|key| {
                key.strip_prefix(&format!("{}/", self.bucket))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| path.to_string());

        debug!(path = %stored, size, "Uploaded object");
        Ok(StoredObject { path: stored })
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }

    async fn remove(&self, paths: &[String]) -> Result<(), FileStorageError> {
        if paths.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .delete(format!("{}/storage/v1/object/{}", self.base_url, self.bucket))
            .header("Authorization", format!("Bearer {}", self.service_key))
            .json(&RemoveRequest { prefixes: paths })
            .send()
            .await
            .map_err(|e| FileStorageError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }

        debug!(count = paths.len(), "Removed objects");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test]
    async fn test_upload_returns_bucket_relative_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/storage/v1/object/chat-media/conv-1/voice-1.webm")
            .match_header("authorization", "Bearer service-key")
            .match_header("content-type", "audio/webm")
            .match_body("abc")
            .with_status(200)
            .with_body(r#"{"Key":"chat-media/conv-1/voice-1.webm"}"#)
            .create_async()
            .await;

        let client = StorageClient::new(server.url(), "service-key", "chat-media");
        let stored = client
            .upload("conv-1/voice-1.webm", b"abc".to_vec(), "audio/webm")
            .await
            .unwrap();

        assert_eq!(stored.path, "conv-1/voice-1.webm");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_rejection_carries_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/storage/v1/object/chat-media/conv-1/big.webm")
            .with_status(413)
            .with_body("Payload too large")
            .create_async()
            .await;

        let client = StorageClient::new(server.url(), "service-key", "chat-media");
        let err = client
            .upload("conv-1/big.webm", vec![0; 16], "audio/webm")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FileStorageError::Rejected {
                status: 413,
                body: "Payload too large".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_upload_rejects_invalid_path_without_request() {
        let client = StorageClient::new("http://127.0.0.1:9", "key", "chat-media");
        let err = client
            .upload("../etc/passwd", vec![1], "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, FileStorageError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_remove_sends_prefixes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/storage/v1/object/chat-media")
            .match_body(Matcher::Json(json!({"prefixes": ["conv-1/voice-1.webm"]})))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = StorageClient::new(server.url(), "service-key", "chat-media");
        client
            .remove(&["conv-1/voice-1.webm".to_string()])
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_public_url() {
        let client = StorageClient::new("https://files.example.com/", "key", "chat-media");
        assert_eq!(
            client.public_url("conv-1/voice-1.webm"),
            "https://files.example.com/storage/v1/object/public/chat-media/conv-1/voice-1.webm"
        );
    }
}
