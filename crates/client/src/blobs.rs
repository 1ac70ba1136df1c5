//! Blob store access.
//!
//! Large payloads (continuations, values, HTTP bodies) never travel inline
//! through the completer protocol; they are written once to the blob store
//! and referenced by id. The store is content-addressed and append-only:
//! there is no update or delete.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use rill_types::FlowError;

use crate::protocol::BlobRef;

/// Client-side view of the blob store.
#[async_trait]
pub trait BlobStoreClient: Send + Sync {
    /// Write a payload under the given prefix, returning its reference.
    async fn write_blob(&self, prefix: &str, bytes: Vec<u8>, content_type: &str) -> Result<BlobRef, FlowError>;

    /// Read a payload back. `expected_content_type` is sent as `Accept`;
    /// the store answers 406 if it cannot satisfy it.
    async fn read_blob(&self, prefix: &str, blob_id: &str, expected_content_type: &str) -> Result<Vec<u8>, FlowError>;
}

#[derive(Debug, Deserialize)]
struct WriteBlobResponse {
    blob_id: String,
    content_type: String,
    length: u64,
}

/// HTTP implementation of [`BlobStoreClient`] against the completer's blob
/// endpoint.
#[derive(Debug, Clone)]
pub struct RemoteBlobStore {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteBlobStore {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait]
impl BlobStoreClient for RemoteBlobStore {
    async fn write_blob(&self, prefix: &str, bytes: Vec<u8>, content_type: &str) -> Result<BlobRef, FlowError> {
        let url = format!("{}/{}", self.base_url, prefix);
        debug!(%url, content_type, length = bytes.len(), "writing blob");

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| FlowError::platform(format!("failed to write blob: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlowError::platform(format!(
                "blob store answered {} writing to '{}'",
                status.as_u16(),
                prefix
            )));
        }

        let parsed: WriteBlobResponse = response
            .json()
            .await
            .map_err(|e| FlowError::platform(format!("invalid blob store response: {e}")))?;
        Ok(BlobRef {
            blob_id: parsed.blob_id,
            content_type: parsed.content_type,
            length: parsed.length,
        })
    }

    async fn read_blob(&self, prefix: &str, blob_id: &str, expected_content_type: &str) -> Result<Vec<u8>, FlowError> {
        let url = format!("{}/{}/{}", self.base_url, prefix, blob_id);
        debug!(%url, "reading blob");

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, expected_content_type)
            .send()
            .await
            .map_err(|e| FlowError::platform(format!("failed to read blob: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlowError::platform(format!(
                "blob store answered {} reading blob '{}'",
                status.as_u16(),
                blob_id
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FlowError::platform(format!("failed to read blob body: {e}")))?;
        Ok(bytes.to_vec())
    }
}
