//! Append-only in-memory blob store.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;

use rill_client::{blobs::BlobStoreClient, protocol::BlobRef};
use rill_types::FlowError;

struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-memory [`BlobStoreClient`]: write-once, read-many, never deleted.
#[derive(Default)]
pub struct InMemBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    counter: AtomicU64,
}

impl InMemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs written so far, across all prefixes.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("blob store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStoreClient for InMemBlobStore {
    async fn write_blob(&self, prefix: &str, bytes: Vec<u8>, content_type: &str) -> Result<BlobRef, FlowError> {
        let blob_id = format!("blob-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        let length = bytes.len() as u64;
        let mut blobs = self.blobs.lock().expect("blob store lock");
        blobs.insert(
            format!("{prefix}/{blob_id}"),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(BlobRef {
            blob_id,
            content_type: content_type.to_string(),
            length,
        })
    }

    async fn read_blob(&self, prefix: &str, blob_id: &str, expected_content_type: &str) -> Result<Vec<u8>, FlowError> {
        let blobs = self.blobs.lock().expect("blob store lock");
        let stored = blobs
            .get(&format!("{prefix}/{blob_id}"))
            .ok_or_else(|| FlowError::platform(format!("no blob '{blob_id}' under prefix '{prefix}'")))?;
        if stored.content_type != expected_content_type {
            return Err(FlowError::platform(format!(
                "blob '{blob_id}' has content type '{}', expected '{}'",
                stored.content_type, expected_content_type
            )));
        }
        Ok(stored.bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = InMemBlobStore::new();
        let blob = store
            .write_blob("flow-1", b"payload".to_vec(), "application/json")
            .await
            .expect("write");
        assert_eq!(blob.length, 7);
        let bytes = store
            .read_blob("flow-1", &blob.blob_id, "application/json")
            .await
            .expect("read");
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn read_with_wrong_content_type_fails() {
        let store = InMemBlobStore::new();
        let blob = store
            .write_blob("flow-1", b"payload".to_vec(), "application/json")
            .await
            .expect("write");
        let err = store.read_blob("flow-1", &blob.blob_id, "text/plain").await.unwrap_err();
        assert!(matches!(err, FlowError::Platform { .. }));
    }

    #[tokio::test]
    async fn prefixes_are_isolated() {
        let store = InMemBlobStore::new();
        let blob = store
            .write_blob("flow-1", b"payload".to_vec(), "application/json")
            .await
            .expect("write");
        assert!(store.read_blob("flow-2", &blob.blob_id, "application/json").await.is_err());
    }
}
