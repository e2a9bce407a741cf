//! Durable per-revision storage.
//!
//! Each revision stores two artefacts keyed by `(resource_id, revision_id)`:
//! the encoded payload bytes and the encoded [`RevisionInfo`]. Artefacts are
//! laid out per resource so listing a resource's revisions is cheap. There
//! is no global lock; callers serialize writes per resource as needed.

mod disk;
mod memory;

pub use disk::DiskRevisionStore;
pub use memory::MemoryRevisionStore;

use crate::error::Result;
use crate::types::{revision_sequence, RevisionInfo};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Scoped payload reader; the underlying handle is released on drop.
pub type DataReader = Box<dyn AsyncRead + Send + Unpin>;

/// Drains a [`DataReader`] to a byte vector.
pub async fn read_all(mut reader: DataReader) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

#[async_trait]
pub trait RevisionStore: Send + Sync {
    async fn exists(&self, resource_id: &str, revision_id: &str) -> Result<bool>;

    /// Lazily yields every revision of a resource, ordered by sequence
    /// number. Unknown resources yield an empty stream.
    async fn list_revisions(
        &self,
        resource_id: &str,
    ) -> Result<BoxStream<'static, Result<RevisionInfo>>>;

    async fn get_info(&self, resource_id: &str, revision_id: &str) -> Result<RevisionInfo>;

    async fn get_data(&self, resource_id: &str, revision_id: &str) -> Result<DataReader>;

    async fn save_info(&self, info: &RevisionInfo) -> Result<()>;

    async fn save_data(&self, resource_id: &str, revision_id: &str, data: Bytes) -> Result<()>;
}

/// Orders revision ids by their trailing sequence number, falling back to
/// the full id for ids that do not carry one.
pub(crate) fn sort_revision_ids(ids: &mut [String]) {
    ids.sort_by(|a, b| match (revision_sequence(a), revision_sequence(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });
}
