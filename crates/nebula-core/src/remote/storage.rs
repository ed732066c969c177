//! Media uploads to the object storage service

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use super::{check, RestContext};
use crate::error::SyncResult;
use crate::provider::ObjectStorage;

#[derive(Debug, Clone)]
pub struct StorageClient {
    rest: RestContext,
    bucket: String,
}

#[derive(Debug, Default, Deserialize)]
struct UploadResponse {
    #[serde(default, rename = "Key")]
    key: Option<String>,
}

impl StorageClient {
    pub fn new(rest: RestContext, bucket: &str) -> Self {
        Self {
            rest,
            bucket: bucket.to_string(),
        }
    }

    fn object_path(path: &str) -> &str {
        path.trim_start_matches('/')
    }
}

#[async_trait]
impl ObjectStorage for StorageClient {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> SyncResult<String> {
        let path = Self::object_path(path);
        let url = self
            .rest
            .url(&format!("/storage/v1/object/{}/{}", self.bucket, path));
        let response = self
            .rest
            .authorize(self.rest.http.post(url))
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        let response = check(response).await?;

        // The response key is `{bucket}/{path}`; callers want the object path
        let body: UploadResponse = response.json().await.unwrap_or_default();
        let prefix = format!("{}/", self.bucket);
        Ok(body
            .key
            .map(|key| key.strip_prefix(prefix.as_str()).unwrap_or(&key).to_string())
            .unwrap_or_else(|| path.to_string()))
    }

    fn public_url(&self, path: &str) -> String {
        self.rest.url(&format!(
            "/storage/v1/object/public/{}/{}",
            self.bucket,
            Self::object_path(path)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Credentials;

    #[test]
    fn test_public_url() {
        let rest = RestContext::new("https://abc.supabase.co/", "anon", Credentials::default());
        let storage = StorageClient::new(rest, "posts");
        assert_eq!(
            storage.public_url("/u1/photo.jpg"),
            "https://abc.supabase.co/storage/v1/object/public/posts/u1/photo.jpg"
        );
    }

    #[tokio::test]
    async fn test_upload_unreachable_is_network_error() {
        let rest = RestContext::new("http://127.0.0.1:9", "anon", Credentials::default());
        let storage = StorageClient::new(rest, "posts");
        let result = storage.upload("u1/a.png", vec![1, 2, 3], "image/png").await;
        assert!(matches!(result, Err(crate::error::SyncError::Network(_))));
    }
}
