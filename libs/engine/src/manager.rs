//! The revision engine.
//!
//! `ResourceManager<T>` owns the policy: revision minting, meta refresh and
//! indexed projection, binary promotion, partial reads, migration, batch
//! soft-delete/restore, and permission dispatch. Storage mechanics live
//! behind the [`Storage`] façade.

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::migration::Migration;
use crate::permission::{Effect, PermissionGate, PermissionObject};
use crate::revision::read_all;
use crate::storage::Storage;
use crate::types::{
    project_indexed_data, IndexableField, Resource, ResourceMeta, RevisionInfo, RevisionStatus,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use heck::ToSnakeCase;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tresor_format::{content_hash, Format, Serializer};
use tresor_query::SearchQuery;
use uuid::Uuid;

type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;
type Validator<T> = Box<dyn Fn(&T) -> std::result::Result<(), String> + Send + Sync>;

/// Above this many hits, `list_resources` fetches revision artefacts
/// concurrently (order preserved).
const PARALLEL_FETCH_THRESHOLD: usize = 10;
const PARALLEL_FETCH_WIDTH: usize = 8;

/// Which sections `list_resources` returns per hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnSet {
    pub data: bool,
    pub info: bool,
    pub meta: bool,
}

impl Default for ReturnSet {
    fn default() -> Self {
        ReturnSet {
            data: true,
            info: false,
            meta: false,
        }
    }
}

impl ReturnSet {
    pub fn all() -> Self {
        ReturnSet {
            data: true,
            info: true,
            meta: true,
        }
    }
}

/// One hit of `list_resources`, sections as JSON values so partial
/// projection applies uniformly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceView {
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Options for the revision-list operation.
#[derive(Debug, Clone, Default)]
pub struct RevisionListQuery {
    pub limit: Option<u32>,
    pub offset: u32,
    /// Oldest-first when set; newest-first by default.
    pub ascending: bool,
    pub created_time_start: Option<DateTime<Utc>>,
    /// Start listing from this revision (inclusive).
    pub from_revision_id: Option<String>,
    /// Follow `parent_revision_id` from the current (or `from_revision_id`)
    /// revision backward instead of listing every revision.
    pub chain_only: bool,
}

#[derive(Debug, Clone)]
pub struct RevisionList {
    pub meta: ResourceMeta,
    pub revisions: Vec<RevisionInfo>,
    pub total: u64,
    pub has_more: bool,
}

pub struct ResourceManager<T> {
    name: String,
    storage: Storage,
    format: Format,
    record_serializer: Serializer<T>,
    value_serializer: Serializer<Value>,
    indexed_fields: Vec<IndexableField>,
    id_generator: Option<IdGenerator>,
    validator: Option<Validator<T>>,
    migration: Option<Box<dyn Migration<T>>>,
    permissions: Option<Arc<dyn PermissionGate>>,
    schema_version: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

pub struct ResourceManagerBuilder<T> {
    storage: Storage,
    name: Option<String>,
    format: Format,
    indexed_fields: Vec<IndexableField>,
    id_generator: Option<IdGenerator>,
    validator: Option<Validator<T>>,
    migration: Option<Box<dyn Migration<T>>>,
    permissions: Option<Arc<dyn PermissionGate>>,
    schema_version: Option<String>,
}

impl<T> ResourceManagerBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Resource type name used in minted ids and permission objects.
    /// Defaults to the record type's name in snake case.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn indexed_fields<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<IndexableField>,
    {
        self.indexed_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn id_generator(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.id_generator = Some(Box::new(generator));
        self
    }

    pub fn validator(
        mut self,
        validator: impl Fn(&T) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn migration(mut self, migration: impl Migration<T> + 'static) -> Self {
        self.migration = Some(Box::new(migration));
        self
    }

    pub fn permission_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.permissions = Some(gate);
        self
    }

    /// Schema version stamped on new revisions when no migration is
    /// configured (a migration's target version takes precedence).
    pub fn schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }

    pub fn build(self) -> ResourceManager<T> {
        let name = self.name.unwrap_or_else(type_base_name::<T>);
        ResourceManager {
            name,
            storage: self.storage,
            format: self.format,
            record_serializer: Serializer::new(self.format),
            value_serializer: Serializer::new(self.format),
            indexed_fields: self.indexed_fields,
            id_generator: self.id_generator,
            validator: self.validator,
            migration: self.migration,
            permissions: self.permissions,
            schema_version: self.schema_version,
            _marker: PhantomData,
        }
    }
}

fn type_base_name<T>() -> String {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    let base = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);
    base.to_snake_case()
}

impl<T> ResourceManager<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn builder(storage: Storage) -> ResourceManagerBuilder<T> {
        ResourceManagerBuilder {
            storage,
            name: None,
            format: Format::MessagePack,
            indexed_fields: Vec::new(),
            id_generator: None,
            validator: None,
            migration: None,
            permissions: None,
            schema_version: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn target_schema_version(&self) -> Option<String> {
        self.migration
            .as_ref()
            .map(|m| m.schema_version().to_string())
            .or_else(|| self.schema_version.clone())
    }

    async fn guard(&self, ctx: &OpContext, action: &str, resource_id: Option<&str>) -> Result<()> {
        let Some(gate) = &self.permissions else {
            return Ok(());
        };
        let object = PermissionObject {
            resource_type: &self.name,
            resource_id,
        };
        match gate.check(ctx, action, object).await? {
            Effect::Allow => Ok(()),
            Effect::Deny => Err(Error::PermissionDenied {
                actor: ctx.actor.clone(),
                action: action.to_string(),
                object: resource_id
                    .map(str::to_string)
                    .unwrap_or_else(|| self.name.clone()),
            }),
        }
    }

    fn mint_resource_id(&self) -> String {
        match &self.id_generator {
            Some(generator) => generator(),
            None => format!("{}:{}", self.name, Uuid::new_v4()),
        }
    }

    fn validate(&self, data: &T) -> Result<()> {
        if let Some(validator) = &self.validator {
            validator(data).map_err(Error::Validation)?;
        }
        Ok(())
    }

    /// Serializes the payload, promoting inline binary fields to blob
    /// references first. Returns the (possibly rewritten) value tree, the
    /// encoded bytes and their content hash.
    async fn prepare_payload(&self, data: &T) -> Result<(Value, Vec<u8>, String)> {
        let mut value = serde_json::to_value(data)
            .map_err(|err| Error::Internal(format!("payload not serializable: {err}")))?;
        if self.storage.blob_store().is_some() {
            self.promote_binaries(&mut value).await?;
        }
        let bytes = self.value_serializer.encode(&value)?;
        let hash = content_hash(&bytes);
        Ok((value, bytes, hash))
    }

    async fn promote_binaries(&self, value: &mut Value) -> Result<()> {
        for pointer in find_inline_binaries(value) {
            let Some(node) = value.pointer_mut(&pointer) else {
                continue;
            };
            let Some(obj) = node.as_object_mut() else {
                continue;
            };
            let Some(bytes) = obj.get("data").and_then(binary_bytes) else {
                continue;
            };
            let content_type = obj
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string);
            let size = bytes.len() as u64;
            let file_id = self
                .storage
                .put_blob(Bytes::from(bytes), content_type.clone())
                .await?;
            *node = serde_json::json!({
                "file_id": file_id,
                "size": size,
                "content_type": content_type,
            });
        }
        Ok(())
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<T> {
        Ok(self.record_serializer.decode(bytes)?)
    }

    async fn meta_or_not_found(&self, resource_id: &str) -> Result<ResourceMeta> {
        self.storage
            .get_meta(resource_id)
            .await?
            .ok_or_else(|| Error::ResourceIdNotFound(resource_id.to_string()))
    }

    async fn meta_checked(&self, resource_id: &str) -> Result<ResourceMeta> {
        let meta = self.meta_or_not_found(resource_id).await?;
        if meta.is_deleted {
            return Err(Error::ResourceIsDeleted(resource_id.to_string()));
        }
        Ok(meta)
    }

    fn build_revision_info(
        &self,
        ctx: &OpContext,
        resource_id: &str,
        sequence: u64,
        parent: Option<String>,
        data_hash: String,
    ) -> RevisionInfo {
        RevisionInfo {
            uid: Uuid::new_v4(),
            resource_id: resource_id.to_string(),
            revision_id: format!("{resource_id}:{sequence}"),
            parent_revision_id: parent,
            status: RevisionStatus::Stable,
            schema_version: self.target_schema_version(),
            data_hash,
            created_time: ctx.now,
            updated_time: ctx.now,
            created_by: ctx.actor.clone(),
            updated_by: ctx.actor.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub async fn create(&self, ctx: &OpContext, data: T) -> Result<RevisionInfo> {
        self.guard(ctx, "create", None).await?;
        self.validate(&data)?;

        let resource_id = self.mint_resource_id();
        let (value, bytes, hash) = self.prepare_payload(&data).await?;
        let info = self.build_revision_info(ctx, &resource_id, 1, None, hash);

        self.storage
            .save_revision_data(&resource_id, &info.revision_id, Bytes::from(bytes))
            .await?;
        self.storage.save_revision_info(&info).await?;

        let meta = ResourceMeta {
            resource_id: resource_id.clone(),
            current_revision_id: info.revision_id.clone(),
            total_revision_count: 1,
            created_time: ctx.now,
            updated_time: ctx.now,
            created_by: ctx.actor.clone(),
            updated_by: ctx.actor.clone(),
            is_deleted: false,
            schema_version: info.schema_version.clone(),
            indexed_data: project_indexed_data(&value, &self.indexed_fields),
        };
        self.storage.save_meta(&meta).await?;

        tracing::debug!(resource_id, revision_id = %info.revision_id, "resource created");
        Ok(info)
    }

    pub async fn get(&self, ctx: &OpContext, resource_id: &str) -> Result<Resource<T>> {
        self.guard(ctx, "get", Some(resource_id)).await?;
        let meta = self.meta_checked(resource_id).await?;
        self.get_revision_inner(resource_id, &meta.current_revision_id, true)
            .await
    }

    pub async fn get_meta(&self, ctx: &OpContext, resource_id: &str) -> Result<ResourceMeta> {
        self.guard(ctx, "get_meta", Some(resource_id)).await?;
        self.meta_checked(resource_id).await
    }

    pub async fn get_revision(
        &self,
        ctx: &OpContext,
        resource_id: &str,
        revision_id: &str,
    ) -> Result<Resource<T>> {
        self.guard(ctx, "get_resource_revision", Some(resource_id))
            .await?;
        self.get_revision_inner(resource_id, revision_id, false).await
    }

    async fn get_revision_inner(
        &self,
        resource_id: &str,
        revision_id: &str,
        check_schema: bool,
    ) -> Result<Resource<T>> {
        if !self.storage.revision_exists(resource_id, revision_id).await? {
            return Err(Error::RevisionIdNotFound {
                resource_id: resource_id.to_string(),
                revision_id: revision_id.to_string(),
            });
        }
        let info = self
            .storage
            .get_revision_info(resource_id, revision_id)
            .await?;

        // A stale schema version is a conflict unless a migration stands
        // ready to rewrite the revision; then the caller drives `migrate`.
        if check_schema && self.migration.is_none() {
            if let Some(expected) = self.target_schema_version() {
                if info.schema_version.as_deref() != Some(expected.as_str()) {
                    return Err(Error::SchemaConflict {
                        resource_id: resource_id.to_string(),
                        stored: info.schema_version.clone(),
                        expected,
                    });
                }
            }
        }

        let reader = self
            .storage
            .get_revision_data(resource_id, revision_id)
            .await?;
        let bytes = read_all(reader).await?;
        let data = self.decode_record(&bytes)?;
        Ok(Resource { info, data })
    }

    pub async fn list_revisions(
        &self,
        ctx: &OpContext,
        resource_id: &str,
    ) -> Result<BoxStream<'static, Result<RevisionInfo>>> {
        self.guard(ctx, "list_revisions", Some(resource_id)).await?;
        if !self.storage.exists(resource_id).await? {
            return Err(Error::ResourceIdNotFound(resource_id.to_string()));
        }
        self.storage.list_revisions(resource_id).await
    }

    /// Sorted, filtered, paginated revision listing; `chain_only` follows
    /// the parent chain instead of listing every revision.
    pub async fn list_revision_infos(
        &self,
        ctx: &OpContext,
        resource_id: &str,
        query: &RevisionListQuery,
    ) -> Result<RevisionList> {
        self.guard(ctx, "list_revisions", Some(resource_id)).await?;
        let meta = self.meta_or_not_found(resource_id).await?;

        let mut revisions: Vec<RevisionInfo> = self
            .storage
            .list_revisions(resource_id)
            .await?
            .try_collect()
            .await?;

        if query.chain_only {
            let start = query
                .from_revision_id
                .clone()
                .unwrap_or_else(|| meta.current_revision_id.clone());
            revisions = parent_chain(revisions, &start);
            if query.ascending {
                revisions.reverse();
            }
        } else {
            revisions.sort_by(|a, b| {
                let ordering = a.created_time.cmp(&b.created_time);
                if query.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
            if let Some(from) = &query.from_revision_id {
                if let Some(index) = revisions.iter().position(|r| &r.revision_id == from) {
                    revisions.drain(..index);
                } else {
                    return Err(Error::RevisionIdNotFound {
                        resource_id: resource_id.to_string(),
                        revision_id: from.clone(),
                    });
                }
            }
        }

        if let Some(start) = query.created_time_start {
            revisions.retain(|r| r.created_time >= start);
        }

        let total = revisions.len() as u64;
        let offset = query.offset as usize;
        let limit = query.limit.unwrap_or(tresor_query::DEFAULT_LIMIT) as usize;
        let page: Vec<RevisionInfo> = revisions.into_iter().skip(offset).take(limit).collect();
        let has_more = (offset + limit) < total as usize;

        Ok(RevisionList {
            meta,
            revisions: page,
            total,
            has_more,
        })
    }

    pub async fn update(&self, ctx: &OpContext, resource_id: &str, data: T) -> Result<RevisionInfo> {
        self.guard(ctx, "update", Some(resource_id)).await?;
        self.update_inner(ctx, resource_id, data).await
    }

    async fn update_inner(
        &self,
        ctx: &OpContext,
        resource_id: &str,
        data: T,
    ) -> Result<RevisionInfo> {
        self.validate(&data)?;
        let prev = self.meta_checked(resource_id).await?;

        let (value, bytes, hash) = self.prepare_payload(&data).await?;
        let info = self.build_revision_info(
            ctx,
            resource_id,
            prev.total_revision_count + 1,
            Some(prev.current_revision_id.clone()),
            hash,
        );

        self.storage
            .save_revision_data(resource_id, &info.revision_id, Bytes::from(bytes))
            .await?;
        self.storage.save_revision_info(&info).await?;

        let meta = ResourceMeta {
            current_revision_id: info.revision_id.clone(),
            total_revision_count: prev.total_revision_count + 1,
            updated_time: ctx.now,
            updated_by: ctx.actor.clone(),
            schema_version: info.schema_version.clone(),
            indexed_data: project_indexed_data(&value, &self.indexed_fields),
            ..prev
        };
        self.storage.save_meta(&meta).await?;

        tracing::debug!(resource_id, revision_id = %info.revision_id, "resource updated");
        Ok(info)
    }

    /// RFC 6902 patch applied against the current revision, persisted as a
    /// regular update.
    pub async fn patch(
        &self,
        ctx: &OpContext,
        resource_id: &str,
        patch: &json_patch::Patch,
    ) -> Result<RevisionInfo> {
        self.guard(ctx, "patch", Some(resource_id)).await?;
        let meta = self.meta_checked(resource_id).await?;
        let current = self
            .get_revision_inner(resource_id, &meta.current_revision_id, true)
            .await?;

        let mut value = serde_json::to_value(&current.data)
            .map_err(|err| Error::Internal(format!("payload not serializable: {err}")))?;
        json_patch::patch(&mut value, &patch.0)
            .map_err(|err| Error::PatchFailed(err.to_string()))?;
        let data: T =
            serde_json::from_value(value).map_err(|err| Error::PatchFailed(err.to_string()))?;

        self.update_inner(ctx, resource_id, data).await
    }

    /// Repoints `current_revision_id` at an existing revision. Does not
    /// create a new revision; bumps `updated_*`.
    pub async fn switch(
        &self,
        ctx: &OpContext,
        resource_id: &str,
        revision_id: &str,
    ) -> Result<ResourceMeta> {
        self.guard(ctx, "switch", Some(resource_id)).await?;
        let mut meta = self.meta_checked(resource_id).await?;
        if meta.current_revision_id == revision_id {
            return Ok(meta);
        }
        if !self.storage.revision_exists(resource_id, revision_id).await? {
            return Err(Error::RevisionIdNotFound {
                resource_id: resource_id.to_string(),
                revision_id: revision_id.to_string(),
            });
        }

        meta.current_revision_id = revision_id.to_string();
        meta.updated_time = ctx.now;
        meta.updated_by = ctx.actor.clone();

        // The projection must follow the now-current revision.
        let reader = self.storage.get_revision_data(resource_id, revision_id).await?;
        let bytes = read_all(reader).await?;
        let value: Value = self.value_serializer.decode(&bytes)?;
        meta.indexed_data = project_indexed_data(&value, &self.indexed_fields);

        self.storage.save_meta(&meta).await?;
        Ok(meta)
    }

    pub async fn delete(&self, ctx: &OpContext, resource_id: &str) -> Result<ResourceMeta> {
        self.guard(ctx, "delete", Some(resource_id)).await?;
        let mut meta = self.meta_checked(resource_id).await?;
        meta.is_deleted = true;
        meta.updated_time = ctx.now;
        meta.updated_by = ctx.actor.clone();
        self.storage.save_meta(&meta).await?;
        tracing::debug!(resource_id, "resource soft-deleted");
        Ok(meta)
    }

    pub async fn restore(&self, ctx: &OpContext, resource_id: &str) -> Result<ResourceMeta> {
        self.guard(ctx, "restore", Some(resource_id)).await?;
        let mut meta = self.meta_or_not_found(resource_id).await?;
        if meta.is_deleted {
            meta.is_deleted = false;
            meta.updated_time = ctx.now;
            meta.updated_by = ctx.actor.clone();
            self.storage.save_meta(&meta).await?;
            tracing::debug!(resource_id, "resource restored");
        }
        Ok(meta)
    }

    /// Batch soft delete over a search. Forces `is_deleted=false` into the
    /// filter so already-deleted rows are not retargeted. Returns the ids
    /// touched.
    pub async fn delete_many(&self, ctx: &OpContext, query: &SearchQuery) -> Result<Vec<String>> {
        self.guard(ctx, "delete", None).await?;
        let mut query = query.clone();
        query.is_deleted = Some(false);
        self.flip_many(ctx, &query, true).await
    }

    /// Batch restore; forces `is_deleted=true` into the filter.
    pub async fn restore_many(&self, ctx: &OpContext, query: &SearchQuery) -> Result<Vec<String>> {
        self.guard(ctx, "restore", None).await?;
        let mut query = query.clone();
        query.is_deleted = Some(true);
        self.flip_many(ctx, &query, false).await
    }

    async fn flip_many(
        &self,
        ctx: &OpContext,
        query: &SearchQuery,
        deleted: bool,
    ) -> Result<Vec<String>> {
        let metas: Vec<ResourceMeta> = self.storage.search(query).await?.try_collect().await?;
        let mut ids = Vec::with_capacity(metas.len());
        let mut updated = Vec::with_capacity(metas.len());
        for mut meta in metas {
            meta.is_deleted = deleted;
            meta.updated_time = ctx.now;
            meta.updated_by = ctx.actor.clone();
            ids.push(meta.resource_id.clone());
            updated.push(meta);
        }
        self.storage.save_many_metas(updated).await?;
        Ok(ids)
    }

    /// Projects the stored payload to the requested JSON-Pointer paths.
    /// Paths missing from the payload yield no key in the result.
    pub async fn get_partial(
        &self,
        ctx: &OpContext,
        resource_id: &str,
        revision_id: Option<&str>,
        paths: &[String],
    ) -> Result<Map<String, Value>> {
        self.guard(ctx, "get_partial", Some(resource_id)).await?;
        let meta = self.meta_checked(resource_id).await?;
        let revision_id = revision_id.unwrap_or(&meta.current_revision_id);
        if !self.storage.revision_exists(resource_id, revision_id).await? {
            return Err(Error::RevisionIdNotFound {
                resource_id: resource_id.to_string(),
                revision_id: revision_id.to_string(),
            });
        }

        let reader = self.storage.get_revision_data(resource_id, revision_id).await?;
        let bytes = read_all(reader).await?;
        let value: Value = self.value_serializer.decode(&bytes)?;
        Ok(project_pointers(&value, paths))
    }

    /// Meta-store search (sorted, paginated in the store), then per-hit
    /// fetch of the requested sections with optional partial projection.
    pub async fn list_resources(
        &self,
        ctx: &OpContext,
        query: &SearchQuery,
        returns: ReturnSet,
        partial: &[String],
    ) -> Result<Vec<ResourceView>> {
        self.guard(ctx, "list_resources", None).await?;
        let spec = PartialSpec::classify(partial);
        let metas: Vec<ResourceMeta> = self.storage.search(query).await?.try_collect().await?;

        if metas.len() > PARALLEL_FETCH_THRESHOLD {
            let views = futures::stream::iter(
                metas
                    .into_iter()
                    .map(|meta| self.fetch_view(meta, returns, &spec)),
            )
            .buffered(PARALLEL_FETCH_WIDTH)
            .collect::<Vec<_>>()
            .await;
            Ok(views.into_iter().flatten().collect())
        } else {
            let mut views = Vec::with_capacity(metas.len());
            for meta in metas {
                if let Some(view) = self.fetch_view(meta, returns, &spec).await {
                    views.push(view);
                }
            }
            Ok(views)
        }
    }

    /// Per-hit fetch; failures are logged and the hit skipped so one corrupt
    /// row does not kill the listing.
    async fn fetch_view(
        &self,
        meta: ResourceMeta,
        returns: ReturnSet,
        spec: &PartialSpec,
    ) -> Option<ResourceView> {
        let resource_id = meta.resource_id.clone();
        match self.try_fetch_view(meta, returns, spec).await {
            Ok(view) => Some(view),
            Err(err) => {
                tracing::warn!(resource_id, error = %err, "skipping resource in listing");
                None
            }
        }
    }

    async fn try_fetch_view(
        &self,
        meta: ResourceMeta,
        returns: ReturnSet,
        spec: &PartialSpec,
    ) -> Result<ResourceView> {
        let resource_id = meta.resource_id.clone();
        let revision_id = meta.current_revision_id.clone();

        let info = if returns.info {
            let info = self.storage.get_revision_info(&resource_id, &revision_id).await?;
            let value = serde_json::to_value(&info)
                .map_err(|err| Error::Internal(format!("info not serializable: {err}")))?;
            Some(spec.project_info(&value))
        } else {
            None
        };

        let data = if returns.data {
            let reader = self.storage.get_revision_data(&resource_id, &revision_id).await?;
            let bytes = read_all(reader).await?;
            let value: Value = self.value_serializer.decode(&bytes)?;
            Some(spec.project_data(&value))
        } else {
            None
        };

        let meta_value = if returns.meta {
            let value = serde_json::to_value(&meta)
                .map_err(|err| Error::Internal(format!("meta not serializable: {err}")))?;
            Some(spec.project_meta(&value))
        } else {
            None
        };

        Ok(ResourceView {
            resource_id,
            data,
            info,
            meta: meta_value,
        })
    }

    pub async fn search_resources(
        &self,
        ctx: &OpContext,
        query: &SearchQuery,
    ) -> Result<Vec<ResourceMeta>> {
        self.guard(ctx, "search_resources", None).await?;
        Ok(self.storage.search(query).await?.try_collect().await?)
    }

    /// Streaming variant of [`ResourceManager::search_resources`].
    pub async fn iter_search(
        &self,
        ctx: &OpContext,
        query: &SearchQuery,
    ) -> Result<BoxStream<'static, Result<ResourceMeta>>> {
        self.guard(ctx, "search_resources", None).await?;
        self.storage.search(query).await
    }

    pub async fn count_resources(&self, ctx: &OpContext, query: &SearchQuery) -> Result<u64> {
        self.guard(ctx, "count_resources", None).await?;
        self.storage.count(query).await
    }

    /// Rewrites the current revision in place through the configured
    /// migration: same revision id, no new revision, count unchanged.
    pub async fn migrate(&self, ctx: &OpContext, resource_id: &str) -> Result<RevisionInfo> {
        self.guard(ctx, "migrate", Some(resource_id)).await?;
        let migration = self.migration.as_ref().ok_or(Error::MigrationNotConfigured)?;

        let meta = self.meta_checked(resource_id).await?;
        let mut info = self
            .storage
            .get_revision_info(resource_id, &meta.current_revision_id)
            .await?;
        let target = migration.schema_version().to_string();
        if info.schema_version.as_deref() == Some(target.as_str()) {
            return Ok(info);
        }
        let stored_version = info.schema_version.clone();

        let reader = self
            .storage
            .get_revision_data(resource_id, &info.revision_id)
            .await?;
        let old_bytes = read_all(reader).await?;
        let data = migration.migrate(&old_bytes, stored_version.as_deref())?;

        let (value, bytes, hash) = self.prepare_payload(&data).await?;
        info.schema_version = Some(target.clone());
        info.data_hash = hash;
        info.updated_time = ctx.now;
        info.updated_by = ctx.actor.clone();

        self.storage
            .save_revision_data(resource_id, &info.revision_id, Bytes::from(bytes))
            .await?;
        self.storage.save_revision_info(&info).await?;

        let resource = Resource {
            info: info.clone(),
            data,
        };
        let mut meta = migration.migrate_meta(meta, &resource, stored_version.as_deref())?;
        meta.schema_version = Some(target);
        meta.indexed_data = project_indexed_data(&value, &self.indexed_fields);
        meta.updated_time = ctx.now;
        meta.updated_by = ctx.actor.clone();
        self.storage.save_meta(&meta).await?;

        tracing::debug!(resource_id, revision_id = %info.revision_id, "revision migrated in place");
        Ok(info)
    }

    /// Dereferences a blob promoted out of a payload.
    pub async fn get_blob(&self, ctx: &OpContext, file_id: &str) -> Result<crate::types::Binary> {
        self.guard(ctx, "get_blob", None).await?;
        self.storage.get_blob(file_id).await
    }

    pub fn wire_format(&self) -> Format {
        self.format
    }
}

/// Walks `parent_revision_id` from `start` backward, newest first.
fn parent_chain(revisions: Vec<RevisionInfo>, start: &str) -> Vec<RevisionInfo> {
    let mut by_id: std::collections::HashMap<String, RevisionInfo> = revisions
        .into_iter()
        .map(|r| (r.revision_id.clone(), r))
        .collect();
    let mut chain = Vec::new();
    let mut cursor = Some(start.to_string());
    while let Some(id) = cursor {
        match by_id.remove(&id) {
            Some(info) => {
                cursor = info.parent_revision_id.clone();
                chain.push(info);
            }
            None => break,
        }
    }
    chain
}

/// Partial-field classification: `data/`, `info/`, `meta/` prefixes select
/// the bucket; unprefixed paths default to data.
#[derive(Debug, Default, Clone)]
struct PartialSpec {
    data: Vec<String>,
    info: Vec<String>,
    meta: Vec<String>,
}

impl PartialSpec {
    fn classify(paths: &[String]) -> Self {
        let mut spec = PartialSpec::default();
        for path in paths {
            let trimmed = path.trim_start_matches('/');
            if let Some(rest) = trimmed.strip_prefix("data/") {
                spec.data.push(rest.to_string());
            } else if let Some(rest) = trimmed.strip_prefix("info/") {
                spec.info.push(rest.to_string());
            } else if let Some(rest) = trimmed.strip_prefix("meta/") {
                spec.meta.push(rest.to_string());
            } else {
                spec.data.push(trimmed.to_string());
            }
        }
        spec
    }

    fn project_data(&self, value: &Value) -> Value {
        project_section(value, &self.data)
    }

    fn project_info(&self, value: &Value) -> Value {
        project_section(value, &self.info)
    }

    fn project_meta(&self, value: &Value) -> Value {
        project_section(value, &self.meta)
    }
}

fn project_section(value: &Value, paths: &[String]) -> Value {
    if paths.is_empty() {
        return value.clone();
    }
    Value::Object(project_pointers(
        value,
        &paths.iter().map(|p| format!("/{p}")).collect::<Vec<_>>(),
    ))
}

/// JSON-Pointer projection: keys are the paths without the leading slash.
fn project_pointers(value: &Value, paths: &[String]) -> Map<String, Value> {
    let mut out = Map::new();
    for path in paths {
        let pointer = if path.starts_with('/') {
            path.clone()
        } else {
            format!("/{path}")
        };
        if let Some(found) = value.pointer(&pointer) {
            out.insert(pointer.trim_start_matches('/').to_string(), found.clone());
        }
    }
    out
}

const BINARY_KEYS: [&str; 4] = ["file_id", "size", "content_type", "data"];
const BINARY_SCAN_MAX_DEPTH: usize = 128;

/// Object shaped exactly like an inline [`crate::types::Binary`] carrying
/// bytes.
fn is_inline_binary(obj: &Map<String, Value>) -> bool {
    if obj.is_empty() || !obj.keys().all(|k| BINARY_KEYS.contains(&k.as_str())) {
        return false;
    }
    obj.get("data").and_then(binary_bytes).is_some()
}

fn binary_bytes(value: &Value) -> Option<Vec<u8>> {
    let items = value.as_array()?;
    items
        .iter()
        .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

/// Iterative scan for inline binary nodes; depth-guarded so pathologically
/// nested payloads cannot blow the stack.
fn find_inline_binaries(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack: Vec<(String, &Value, usize)> = vec![(String::new(), value, 0)];
    while let Some((pointer, node, depth)) = stack.pop() {
        if depth > BINARY_SCAN_MAX_DEPTH {
            continue;
        }
        match node {
            Value::Object(obj) => {
                if is_inline_binary(obj) {
                    found.push(pointer);
                    continue;
                }
                for (key, child) in obj {
                    stack.push((
                        format!("{pointer}/{}", escape_pointer_token(key)),
                        child,
                        depth + 1,
                    ));
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    stack.push((format!("{pointer}/{index}"), child, depth + 1));
                }
            }
            _ => {}
        }
    }
    found
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_base_name_snake_cases() {
        struct WidgetOrder;
        assert_eq!(type_base_name::<WidgetOrder>(), "widget_order");
    }

    #[test]
    fn inline_binary_detection_is_exact() {
        let inline = json!({"data": [1, 2, 3], "content_type": "image/png"});
        let reference = json!({"file_id": "abc", "size": 3, "content_type": null});
        let unrelated = json!({"data": [1, 2], "name": "not a binary"});

        assert!(is_inline_binary(inline.as_object().unwrap()));
        assert!(!is_inline_binary(reference.as_object().unwrap()));
        assert!(!is_inline_binary(unrelated.as_object().unwrap()));
    }

    #[test]
    fn binary_scan_finds_nested_nodes() {
        let value = json!({
            "avatar": {"data": [0, 1], "content_type": "image/png"},
            "files": [
                {"inner": {"data": [2]}},
                {"file_id": "done", "size": 1}
            ],
        });
        let mut pointers = find_inline_binaries(&value);
        pointers.sort();
        assert_eq!(pointers, vec!["/avatar", "/files/0/inner"]);
    }

    #[test]
    fn pointer_projection_skips_missing_paths() {
        let value = json!({"user": {"email": "a@b.c"}, "name": "x"});
        let projected = project_pointers(
            &value,
            &["/user/email".to_string(), "/missing".to_string(), "name".to_string()],
        );
        assert_eq!(projected.get("user/email"), Some(&json!("a@b.c")));
        assert_eq!(projected.get("name"), Some(&json!("x")));
        assert!(!projected.contains_key("missing"));
    }

    #[test]
    fn parent_chain_walks_backward() {
        let mk = |id: &str, parent: Option<&str>| RevisionInfo {
            uid: Uuid::new_v4(),
            resource_id: "r".into(),
            revision_id: id.into(),
            parent_revision_id: parent.map(str::to_string),
            status: RevisionStatus::Stable,
            schema_version: None,
            data_hash: String::new(),
            created_time: Utc::now(),
            updated_time: Utc::now(),
            created_by: "u".into(),
            updated_by: "u".into(),
        };
        let revisions = vec![
            mk("r:1", None),
            mk("r:2", Some("r:1")),
            mk("r:3", Some("r:2")),
        ];
        let chain = parent_chain(revisions, "r:3");
        let ids: Vec<&str> = chain.iter().map(|r| r.revision_id.as_str()).collect();
        assert_eq!(ids, vec!["r:3", "r:2", "r:1"]);
    }
}
