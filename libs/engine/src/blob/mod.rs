//! Content-addressed blob storage.
//!
//! Blob ids are the xxh3-128 hash of the bytes, so `put` is idempotent and
//! reads are lock-free. The disk layout is one file per blob, file name =
//! blob id, content = MessagePack-encoded [`Binary`] including the bytes.

mod disk;
mod memory;

pub use disk::DiskBlobStore;
pub use memory::MemoryBlobStore;

use crate::error::Result;
use crate::types::Binary;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes and returns their content address. Re-putting
    /// identical bytes returns the same id without rewriting.
    async fn put(&self, data: Bytes, content_type: Option<String>) -> Result<String>;

    /// Returns the blob with its bytes. `Error::BlobNotFound` if absent.
    async fn get(&self, file_id: &str) -> Result<Binary>;

    async fn exists(&self, file_id: &str) -> Result<bool>;
}

pub(crate) fn stored_binary(file_id: &str, data: Bytes, content_type: Option<String>) -> Binary {
    Binary {
        file_id: Some(file_id.to_string()),
        size: Some(data.len() as u64),
        content_type,
        data: Some(serde_bytes::ByteBuf::from(data.to_vec())),
    }
}
