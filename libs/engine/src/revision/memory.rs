use super::{sort_revision_ids, DataReader, RevisionStore};
use crate::error::{Error, Result};
use crate::types::RevisionInfo;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tresor_format::{Format, Serializer};

#[derive(Default)]
struct Shelves {
    data: HashMap<String, HashMap<String, Bytes>>,
    info: HashMap<String, HashMap<String, Vec<u8>>>,
}

/// In-process revision store; artefacts are kept encoded, like the durable
/// backends, so serializer behavior is identical across implementations.
pub struct MemoryRevisionStore {
    shelves: RwLock<Shelves>,
    info_serializer: Serializer<RevisionInfo>,
}

impl MemoryRevisionStore {
    pub fn new(format: Format) -> Self {
        MemoryRevisionStore {
            shelves: RwLock::new(Shelves::default()),
            info_serializer: Serializer::new(format),
        }
    }
}

impl Default for MemoryRevisionStore {
    fn default() -> Self {
        Self::new(Format::MessagePack)
    }
}

#[async_trait]
impl RevisionStore for MemoryRevisionStore {
    async fn exists(&self, resource_id: &str, revision_id: &str) -> Result<bool> {
        let shelves = self.shelves.read().await;
        Ok(shelves
            .info
            .get(resource_id)
            .is_some_and(|revisions| revisions.contains_key(revision_id)))
    }

    async fn list_revisions(
        &self,
        resource_id: &str,
    ) -> Result<BoxStream<'static, Result<RevisionInfo>>> {
        let shelves = self.shelves.read().await;
        let mut ids: Vec<String> = shelves
            .info
            .get(resource_id)
            .map(|revisions| revisions.keys().cloned().collect())
            .unwrap_or_default();
        sort_revision_ids(&mut ids);

        let infos: Vec<Result<RevisionInfo>> = ids
            .iter()
            .filter_map(|id| shelves.info.get(resource_id)?.get(id))
            .map(|bytes| self.info_serializer.decode(bytes).map_err(Error::from))
            .collect();
        Ok(futures::stream::iter(infos).boxed())
    }

    async fn get_info(&self, resource_id: &str, revision_id: &str) -> Result<RevisionInfo> {
        let shelves = self.shelves.read().await;
        let bytes = shelves
            .info
            .get(resource_id)
            .and_then(|revisions| revisions.get(revision_id))
            .ok_or_else(|| Error::RevisionIdNotFound {
                resource_id: resource_id.to_string(),
                revision_id: revision_id.to_string(),
            })?;
        Ok(self.info_serializer.decode(bytes)?)
    }

    async fn get_data(&self, resource_id: &str, revision_id: &str) -> Result<DataReader> {
        let shelves = self.shelves.read().await;
        let bytes = shelves
            .data
            .get(resource_id)
            .and_then(|revisions| revisions.get(revision_id))
            .cloned()
            .ok_or_else(|| Error::RevisionIdNotFound {
                resource_id: resource_id.to_string(),
                revision_id: revision_id.to_string(),
            })?;
        Ok(Box::new(std::io::Cursor::new(bytes.to_vec())))
    }

    async fn save_info(&self, info: &RevisionInfo) -> Result<()> {
        let encoded = self.info_serializer.encode(info)?;
        let mut shelves = self.shelves.write().await;
        shelves
            .info
            .entry(info.resource_id.clone())
            .or_default()
            .insert(info.revision_id.clone(), encoded);
        Ok(())
    }

    async fn save_data(&self, resource_id: &str, revision_id: &str, data: Bytes) -> Result<()> {
        let mut shelves = self.shelves.write().await;
        shelves
            .data
            .entry(resource_id.to_string())
            .or_default()
            .insert(revision_id.to_string(), data);
        Ok(())
    }
}
