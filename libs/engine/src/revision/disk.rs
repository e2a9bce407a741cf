use super::{sort_revision_ids, DataReader, RevisionStore};
use crate::error::{Error, Result};
use crate::types::RevisionInfo;
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tresor_format::{Format, Serializer};

/// Per-resource directory holding `<revision_id>.data` and
/// `<revision_id>.info`.
pub struct DiskRevisionStore {
    root: PathBuf,
    info_serializer: Serializer<RevisionInfo>,
}

impl DiskRevisionStore {
    pub async fn open(root: impl Into<PathBuf>, format: Format) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(DiskRevisionStore {
            root,
            info_serializer: Serializer::new(format),
        })
    }

    fn data_path(&self, resource_id: &str, revision_id: &str) -> PathBuf {
        self.root.join(resource_id).join(format!("{revision_id}.data"))
    }

    fn info_path(&self, resource_id: &str, revision_id: &str) -> PathBuf {
        self.root.join(resource_id).join(format!("{revision_id}.info"))
    }
}

fn not_found(resource_id: &str, revision_id: &str) -> Error {
    Error::RevisionIdNotFound {
        resource_id: resource_id.to_string(),
        revision_id: revision_id.to_string(),
    }
}

async fn read_or_not_found(path: &Path, resource_id: &str, revision_id: &str) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(not_found(resource_id, revision_id))
        }
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl RevisionStore for DiskRevisionStore {
    async fn exists(&self, resource_id: &str, revision_id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.info_path(resource_id, revision_id)).await?)
    }

    async fn list_revisions(
        &self,
        resource_id: &str,
    ) -> Result<BoxStream<'static, Result<RevisionInfo>>> {
        let resource_dir = self.root.join(resource_id);
        let serializer = self.info_serializer.clone();
        let resource_id = resource_id.to_string();

        let stream = try_stream! {
            let mut ids = Vec::new();
            match tokio::fs::read_dir(&resource_dir).await {
                Ok(mut entries) => {
                    while let Some(entry) = entries.next_entry().await? {
                        let name = entry.file_name();
                        let name = name.to_string_lossy();
                        if let Some(stem) = name.strip_suffix(".info") {
                            ids.push(stem.to_string());
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => Err(Error::from(err))?,
            }
            sort_revision_ids(&mut ids);

            for revision_id in ids {
                let path = resource_dir.join(format!("{revision_id}.info"));
                let bytes = read_or_not_found(&path, &resource_id, &revision_id).await?;
                let info = serializer.decode(&bytes)?;
                yield info;
            }
        };
        Ok(stream.boxed())
    }

    async fn get_info(&self, resource_id: &str, revision_id: &str) -> Result<RevisionInfo> {
        let bytes = read_or_not_found(
            &self.info_path(resource_id, revision_id),
            resource_id,
            revision_id,
        )
        .await?;
        Ok(self.info_serializer.decode(&bytes)?)
    }

    async fn get_data(&self, resource_id: &str, revision_id: &str) -> Result<DataReader> {
        match tokio::fs::File::open(self.data_path(resource_id, revision_id)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(not_found(resource_id, revision_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save_info(&self, info: &RevisionInfo) -> Result<()> {
        let dir = self.root.join(&info.resource_id);
        tokio::fs::create_dir_all(&dir).await?;
        let encoded = self.info_serializer.encode(info)?;
        tokio::fs::write(self.info_path(&info.resource_id, &info.revision_id), encoded).await?;
        Ok(())
    }

    async fn save_data(&self, resource_id: &str, revision_id: &str, data: Bytes) -> Result<()> {
        let dir = self.root.join(resource_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(self.data_path(resource_id, revision_id), &data).await?;
        Ok(())
    }
}
