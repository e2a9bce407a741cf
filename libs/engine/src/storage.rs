//! Storage façade composing the meta, revision and blob stores.
//!
//! Thin pass-throughs whose only purpose is to shield the resource manager
//! from the three backends' seams. The single piece of logic here is
//! `revision_exists`, which requires both the meta row and the revision
//! artefact.

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::meta::MetaStore;
use crate::revision::{DataReader, RevisionStore};
use crate::types::{ResourceMeta, RevisionInfo};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use tresor_query::SearchQuery;

#[derive(Clone)]
pub struct Storage {
    meta: Arc<dyn MetaStore>,
    revisions: Arc<dyn RevisionStore>,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl Storage {
    pub fn new(meta: Arc<dyn MetaStore>, revisions: Arc<dyn RevisionStore>) -> Self {
        Storage {
            meta,
            revisions,
            blobs: None,
        }
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn blob_store(&self) -> Option<&Arc<dyn BlobStore>> {
        self.blobs.as_ref()
    }

    pub async fn exists(&self, resource_id: &str) -> Result<bool> {
        self.meta.exists(resource_id).await
    }

    pub async fn revision_exists(&self, resource_id: &str, revision_id: &str) -> Result<bool> {
        Ok(self.meta.exists(resource_id).await?
            && self.revisions.exists(resource_id, revision_id).await?)
    }

    pub async fn get_meta(&self, resource_id: &str) -> Result<Option<ResourceMeta>> {
        self.meta.get(resource_id).await
    }

    pub async fn save_meta(&self, meta: &ResourceMeta) -> Result<()> {
        self.meta.put(meta).await
    }

    pub async fn save_many_metas(&self, metas: Vec<ResourceMeta>) -> Result<()> {
        self.meta.save_many(metas).await
    }

    pub async fn delete_meta(&self, resource_id: &str) -> Result<()> {
        self.meta.delete(resource_id).await
    }

    pub async fn list_revisions(
        &self,
        resource_id: &str,
    ) -> Result<BoxStream<'static, Result<RevisionInfo>>> {
        self.revisions.list_revisions(resource_id).await
    }

    pub async fn get_revision_info(
        &self,
        resource_id: &str,
        revision_id: &str,
    ) -> Result<RevisionInfo> {
        self.revisions.get_info(resource_id, revision_id).await
    }

    pub async fn get_revision_data(
        &self,
        resource_id: &str,
        revision_id: &str,
    ) -> Result<DataReader> {
        self.revisions.get_data(resource_id, revision_id).await
    }

    pub async fn save_revision_info(&self, info: &RevisionInfo) -> Result<()> {
        self.revisions.save_info(info).await
    }

    pub async fn save_revision_data(
        &self,
        resource_id: &str,
        revision_id: &str,
        data: Bytes,
    ) -> Result<()> {
        self.revisions.save_data(resource_id, revision_id, data).await
    }

    pub async fn search(
        &self,
        query: &SearchQuery,
    ) -> Result<BoxStream<'static, Result<ResourceMeta>>> {
        self.meta.iter_search(query).await
    }

    pub async fn count(&self, query: &SearchQuery) -> Result<u64> {
        self.meta.count(query).await
    }

    pub async fn put_blob(&self, data: Bytes, content_type: Option<String>) -> Result<String> {
        self.require_blobs()?.put(data, content_type).await
    }

    pub async fn get_blob(&self, file_id: &str) -> Result<crate::types::Binary> {
        self.require_blobs()?.get(file_id).await
    }

    fn require_blobs(&self) -> Result<&Arc<dyn BlobStore>> {
        self.blobs
            .as_ref()
            .ok_or_else(|| Error::Internal("no blob store configured".into()))
    }
}
