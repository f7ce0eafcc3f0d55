//! Types for storage operations

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::Error;

/// Options for uploading a file
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    /// Cache control max-age in seconds
    pub cache_control: Option<String>,

    /// Content type header
    pub content_type: Option<String>,

    /// Whether to overwrite an existing object
    pub upsert: bool,
}

impl FileOptions {
    pub fn with_cache_control(mut self, seconds: u32) -> Self {
        self.cache_control = Some(seconds.to_string());
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }
}

/// Response to a successful upload
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UploadResponse {
    /// Object key, prefixed with the bucket name
    #[serde(rename = "Key")]
    pub key: String,

    /// Object id, when the server reports one
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageApiError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a failed storage response to [`Error::Storage`]
pub(crate) fn storage_error(status: StatusCode, body: &str) -> Error {
    let detail = serde_json::from_str::<StorageApiError>(body)
        .ok()
        .and_then(|e| e.message.or(e.error))
        .unwrap_or_else(|| body.trim().to_string());
    if status.is_server_error() {
        return Error::Unavailable(format!("{} (Status: {})", detail, status));
    }
    Error::storage(format!("{} (Status: {})", detail, status))
}
