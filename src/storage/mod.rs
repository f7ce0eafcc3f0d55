//! Storage operations for file uploads and downloads

mod types;

use reqwest::{multipart, Client};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::fetch::{Fetch, CLIENT_INFO};

pub use types::*;

/// Client for object storage
#[derive(Clone)]
pub struct StorageClient {
    /// The base URL for the project
    url: String,

    /// The anonymous API key for the project
    key: String,

    /// Token of the signed-in user, if any
    token: Option<String>,

    /// HTTP client used for requests
    client: Client,

    timeout: Option<Duration>,
}

/// Client for a specific storage bucket
pub struct BucketClient<'a> {
    /// Reference to the storage client
    storage: &'a StorageClient,

    /// The bucket ID
    bucket_id: String,
}

impl StorageClient {
    /// Create a new StorageClient
    pub fn new(url: &str, key: &str, client: Client) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            token: None,
            client,
            timeout: None,
        }
    }

    /// Authenticate requests as the signed-in user
    pub fn with_auth(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Bound every request made by this client
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn get_url(&self, path: &str) -> String {
        format!("{}/storage/v1{}", self.url, path)
    }

    fn bearer(&self) -> &str {
        self.token.as_deref().unwrap_or(&self.key)
    }

    /// Get a client for a specific bucket
    pub fn from(&self, bucket_id: &str) -> BucketClient<'_> {
        BucketClient {
            storage: self,
            bucket_id: bucket_id.to_string(),
        }
    }
}

impl<'a> BucketClient<'a> {
    fn object_url(&self, path: &str) -> String {
        self.storage
            .get_url(&format!("/object/{}/{}", self.bucket_id, path.trim_start_matches('/')))
    }

    /// Upload a file to the bucket
    pub async fn upload(
        &self,
        path: &str,
        file_data: Vec<u8>,
        options: FileOptions,
    ) -> Result<UploadResponse> {
        let url = self.object_url(path);
        let file_name = Path::new(path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());

        let mut part = multipart::Part::bytes(file_data).file_name(file_name);
        if let Some(content_type) = &options.content_type {
            part = part.mime_str(content_type)?;
        }
        let form = multipart::Form::new()
            .text(
                "cacheControl",
                options.cache_control.clone().unwrap_or_else(|| "3600".to_string()),
            )
            .part("", part);

        let mut request = self
            .storage
            .client
            .post(&url)
            .header("apikey", &self.storage.key)
            .header("Authorization", format!("Bearer {}", self.storage.bearer()))
            .header("X-Client-Info", CLIENT_INFO)
            .header("x-upsert", options.upsert.to_string())
            .multipart(form);
        if let Some(timeout) = self.storage.timeout {
            request = request.timeout(timeout);
        }

        log::debug!("Uploading {} to bucket {}", path, self.bucket_id);
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(storage_error(status, &text));
        }

        Ok(response.json::<UploadResponse>().await?)
    }

    /// Download a file from the bucket
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.object_url(path);

        let mut builder = Fetch::get(&self.storage.client, &url)
            .apikey(&self.storage.key)
            .bearer_auth(self.storage.bearer())
            .classify(storage_error);
        if let Some(timeout) = self.storage.timeout {
            builder = builder.timeout(timeout);
        }
        builder.execute_bytes().await
    }

    /// Delete files in the bucket
    pub async fn remove(&self, paths: &[&str]) -> Result<()> {
        let url = self.storage.get_url(&format!("/object/{}", self.bucket_id));

        let body = serde_json::json!({
            "prefixes": paths
        });

        let mut builder = Fetch::delete(&self.storage.client, &url)
            .apikey(&self.storage.key)
            .bearer_auth(self.storage.bearer())
            .classify(storage_error)
            .json(&body)?;
        if let Some(timeout) = self.storage.timeout {
            builder = builder.timeout(timeout);
        }
        builder.execute_empty().await
    }

    /// Get the public URL for a file
    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.storage.url,
            self.bucket_id,
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn upload_sends_upsert_flag() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/medical_files/reports/r1.pdf"))
            .and(header("x-upsert", "true"))
            .and(header("Authorization", "Bearer user-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"Key": "medical_files/reports/r1.pdf"})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let storage = StorageClient::new(&mock_server.uri(), "anon", Client::new())
            .with_auth("user-token");
        let uploaded = storage
            .from("medical_files")
            .upload(
                "reports/r1.pdf",
                b"%PDF".to_vec(),
                FileOptions::default().with_upsert(true),
            )
            .await
            .unwrap();
        assert_eq!(uploaded.key, "medical_files/reports/r1.pdf");
    }

    #[tokio::test]
    async fn download_returns_bytes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/object/medical_files/reports/r1.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4".to_vec()))
            .mount(&mock_server)
            .await;

        let storage = StorageClient::new(&mock_server.uri(), "anon", Client::new());
        let bytes = storage
            .from("medical_files")
            .download("reports/r1.pdf")
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-1.4");
    }

    #[tokio::test]
    async fn remove_posts_prefixes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/medical_files"))
            .and(body_json(json!({"prefixes": ["reports/r1.pdf"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let storage = StorageClient::new(&mock_server.uri(), "anon", Client::new());
        storage
            .from("medical_files")
            .remove(&["reports/r1.pdf"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_object_is_a_storage_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "statusCode": "404",
                "error": "not_found",
                "message": "Object not found"
            })))
            .mount(&mock_server)
            .await;

        let storage = StorageClient::new(&mock_server.uri(), "anon", Client::new());
        match storage.from("medical_files").download("nope").await {
            Err(Error::Storage(msg)) => assert!(msg.contains("Object not found")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn public_url_points_at_public_route() {
        let storage = StorageClient::new("https://abc.supabase.co/", "anon", Client::new());
        assert_eq!(
            storage.from("medical_files").public_url("/reports/r1.pdf"),
            "https://abc.supabase.co/storage/v1/object/public/medical_files/reports/r1.pdf"
        );
    }
}
