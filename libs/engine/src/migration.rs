//! Schema migration hooks.
//!
//! A migration targets a single schema version. `migrate` decodes raw
//! payload bytes written under an older version into the current record
//! type; `migrate_meta` may adjust the meta record alongside. The manager
//! rewrites the current revision in place — same revision id, no new
//! revision.

use crate::error::Result;
use crate::types::{Resource, ResourceMeta};

pub trait Migration<T>: Send + Sync {
    /// The target schema version new and migrated revisions carry.
    fn schema_version(&self) -> &str;

    /// Decodes payload bytes written under `stored_version` into the current
    /// record type.
    fn migrate(&self, data: &[u8], stored_version: Option<&str>) -> Result<T>;

    /// Optional hook to adjust the meta record after a payload migration.
    /// The manager refreshes `schema_version` and the indexed projection
    /// afterwards either way.
    fn migrate_meta(
        &self,
        meta: ResourceMeta,
        _resource: &Resource<T>,
        _stored_version: Option<&str>,
    ) -> Result<ResourceMeta> {
        Ok(meta)
    }
}
