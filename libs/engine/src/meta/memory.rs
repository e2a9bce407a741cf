use super::eval::{matches_query, sort_metas};
use super::MetaStore;
use crate::error::{Error, Result};
use crate::types::ResourceMeta;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tresor_query::SearchQuery;

/// In-process meta store. A single writer-exclusive lock guards the map;
/// searches evaluate the same predicate semantics as the SQLite compiler.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    metas: RwLock<BTreeMap<String, ResourceMeta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn matching(&self, query: &SearchQuery) -> Vec<ResourceMeta> {
        let metas = self.metas.read().await;
        metas
            .values()
            .filter(|meta| matches_query(meta, query))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, resource_id: &str) -> Result<Option<ResourceMeta>> {
        Ok(self.metas.read().await.get(resource_id).cloned())
    }

    async fn put(&self, meta: &ResourceMeta) -> Result<()> {
        self.metas
            .write()
            .await
            .insert(meta.resource_id.clone(), meta.clone());
        Ok(())
    }

    async fn delete(&self, resource_id: &str) -> Result<()> {
        match self.metas.write().await.remove(resource_id) {
            Some(_) => Ok(()),
            None => Err(Error::ResourceIdNotFound(resource_id.to_string())),
        }
    }

    async fn exists(&self, resource_id: &str) -> Result<bool> {
        Ok(self.metas.read().await.contains_key(resource_id))
    }

    async fn iter_search(
        &self,
        query: &SearchQuery,
    ) -> Result<BoxStream<'static, Result<ResourceMeta>>> {
        let mut matching = self.matching(query).await;
        sort_metas(&mut matching, &query.sorts);
        let page: Vec<Result<ResourceMeta>> = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .map(Ok)
            .collect();
        Ok(futures::stream::iter(page).boxed())
    }

    async fn count(&self, query: &SearchQuery) -> Result<u64> {
        Ok(self.matching(query).await.len() as u64)
    }

    async fn save_many(&self, metas: Vec<ResourceMeta>) -> Result<()> {
        let mut store = self.metas.write().await;
        for meta in metas {
            store.insert(meta.resource_id.clone(), meta);
        }
        Ok(())
    }
}
