use super::{stored_binary, BlobStore};
use crate::error::{Error, Result};
use crate::types::Binary;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tresor_format::blob_id;

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Binary>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: Bytes, content_type: Option<String>) -> Result<String> {
        let file_id = blob_id(&data);
        let mut blobs = self.blobs.write().await;
        blobs
            .entry(file_id.clone())
            .or_insert_with(|| stored_binary(&file_id, data, content_type));
        Ok(file_id)
    }

    async fn get(&self, file_id: &str) -> Result<Binary> {
        self.blobs
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(file_id.to_string()))
    }

    async fn exists(&self, file_id: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(file_id))
    }
}
