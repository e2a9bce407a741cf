use super::{stored_binary, BlobStore};
use crate::error::{Error, Result};
use crate::types::Binary;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tresor_format::blob_id;

/// One file per blob under `root`, file name = blob id, content =
/// MessagePack-encoded [`Binary`] with the bytes inline.
#[derive(Debug)]
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(DiskBlobStore { root })
    }

    fn path_for(&self, file_id: &str) -> PathBuf {
        self.root.join(file_id)
    }
}

fn serializer() -> tresor_format::Serializer<Binary> {
    tresor_format::Serializer::new(tresor_format::Format::MessagePack)
}

async fn decode(path: &Path, file_id: &str) -> Result<Binary> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::BlobNotFound(file_id.to_string()))
        }
        Err(err) => return Err(err.into()),
    };
    serializer().decode(&bytes).map_err(Error::from)
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn put(&self, data: Bytes, content_type: Option<String>) -> Result<String> {
        let file_id = blob_id(&data);
        let path = self.path_for(&file_id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(file_id);
        }
        let encoded = serializer().encode(&stored_binary(&file_id, data, content_type))?;
        tokio::fs::write(&path, encoded).await?;
        Ok(file_id)
    }

    async fn get(&self, file_id: &str) -> Result<Binary> {
        decode(&self.path_for(file_id), file_id).await
    }

    async fn exists(&self, file_id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(file_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disk_round_trip_preserves_bytes_and_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path()).await.unwrap();

        let payload = vec![7u8; 1024];
        let id = store
            .put(Bytes::from(payload.clone()), Some("image/png".into()))
            .await
            .unwrap();

        let blob = store.get(&id).await.unwrap();
        assert_eq!(blob.data.as_deref().map(|b| b.as_slice()), Some(payload.as_slice()));
        assert_eq!(blob.size, Some(1024));
        assert_eq!(blob.content_type.as_deref(), Some("image/png"));

        // File name is the blob id.
        assert!(dir.path().join(&id).exists());
    }

    #[tokio::test]
    async fn repeated_put_does_not_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path()).await.unwrap();

        let id = store.put(Bytes::from_static(b"same"), None).await.unwrap();
        let before = tokio::fs::metadata(dir.path().join(&id)).await.unwrap().modified().unwrap();
        let id2 = store.put(Bytes::from_static(b"same"), None).await.unwrap();
        let after = tokio::fs::metadata(dir.path().join(&id2)).await.unwrap().modified().unwrap();
        assert_eq!(id, id2);
        assert_eq!(before, after);
    }
}
