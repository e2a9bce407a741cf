//! Tresor engine: give it a record type, get a versioned, searchable,
//! permission-guarded resource service.
//!
//! Every mutation becomes an immutable revision; a mutable meta record per
//! resource tracks the current revision, soft-delete state and an indexed
//! projection of payload fields that drives querying. Storage is pluggable
//! along three seams — meta store, revision store, blob store — with
//! in-memory, on-disk, SQLite and S3-synced-SQLite implementations.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tresor_engine::blob::MemoryBlobStore;
//! use tresor_engine::context::OpContext;
//! use tresor_engine::manager::ResourceManager;
//! use tresor_engine::meta::MemoryMetaStore;
//! use tresor_engine::revision::MemoryRevisionStore;
//! use tresor_engine::storage::Storage;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! #[serde(deny_unknown_fields)]
//! struct Widget {
//!     name: String,
//!     price: i64,
//! }
//!
//! # async fn demo() -> tresor_engine::Result<()> {
//! let storage = Storage::new(
//!     Arc::new(MemoryMetaStore::new()),
//!     Arc::new(MemoryRevisionStore::default()),
//! )
//! .with_blob_store(Arc::new(MemoryBlobStore::new()));
//!
//! let manager = ResourceManager::<Widget>::builder(storage)
//!     .indexed_fields(["name", "price"])
//!     .build();
//!
//! let ctx = OpContext::acting("user:alice");
//! let info = manager
//!     .create(&ctx, Widget { name: "Widget".into(), price: 42 })
//!     .await?;
//! let resource = manager.get(&ctx, &info.resource_id).await?;
//! assert_eq!(resource.data.price, 42);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod context;
pub mod error;
pub mod manager;
pub mod meta;
pub mod migration;
pub mod permission;
pub mod revision;
pub mod storage;
pub mod types;

pub use context::OpContext;
pub use error::{Error, Result};
pub use manager::{ResourceManager, ResourceView, ReturnSet, RevisionList, RevisionListQuery};
pub use migration::Migration;
pub use permission::{
    AclPermission, Effect, PermissionEngine, PermissionGate, PermissionObject, Policy,
    RoleMembership,
};
pub use storage::Storage;
pub use types::{Binary, IndexableField, Resource, ResourceMeta, RevisionInfo, RevisionStatus};
