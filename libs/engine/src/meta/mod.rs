//! Keyed storage of [`ResourceMeta`] with indexed querying.
//!
//! This is the heart of the query system: `iter_search` honours the explicit
//! shortcut filters, the condition AST, the sort list and pagination —
//! sorting and paging happen inside the store, never in the caller. The
//! SQLite implementation is the reference; the in-memory implementation
//! evaluates the same predicate semantics in process.

pub(crate) mod eval;
mod memory;
mod s3;
mod sqlite;

pub use memory::MemoryMetaStore;
pub use s3::{S3MetaStore, S3MetaStoreOptions};
pub use sqlite::SqliteMetaStore;

use crate::error::Result;
use crate::types::ResourceMeta;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tresor_query::SearchQuery;

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, resource_id: &str) -> Result<Option<ResourceMeta>>;

    async fn put(&self, meta: &ResourceMeta) -> Result<()>;

    /// `Error::ResourceIdNotFound` when the row is absent.
    async fn delete(&self, resource_id: &str) -> Result<()>;

    async fn exists(&self, resource_id: &str) -> Result<bool>;

    /// Lazily yields matching metas, filtered, sorted and paginated by the
    /// store. Rows that fail to decode are skipped with a warning so one
    /// corrupt row does not kill a whole listing.
    async fn iter_search(
        &self,
        query: &SearchQuery,
    ) -> Result<BoxStream<'static, Result<ResourceMeta>>>;

    /// Number of metas matching the query's filters (pagination ignored).
    async fn count(&self, query: &SearchQuery) -> Result<u64>;

    /// Batch write; atomic where the backend permits (single transaction on
    /// SQLite).
    async fn save_many(&self, metas: Vec<ResourceMeta>) -> Result<()>;
}
