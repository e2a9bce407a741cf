//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tresor_engine::blob::MemoryBlobStore;
use tresor_engine::context::OpContext;
use tresor_engine::manager::ResourceManager;
use tresor_engine::meta::{MemoryMetaStore, SqliteMetaStore};
use tresor_engine::revision::MemoryRevisionStore;
use tresor_engine::storage::Storage;
use tresor_format::Format;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Item {
    pub name: String,
    pub price: i64,
    pub tags: Vec<String>,
}

pub fn item(name: &str, price: i64, tags: &[&str]) -> Item {
    Item {
        name: name.to_string(),
        price,
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

pub fn memory_storage() -> Storage {
    Storage::new(
        Arc::new(MemoryMetaStore::new()),
        Arc::new(MemoryRevisionStore::new(Format::Json)),
    )
    .with_blob_store(Arc::new(MemoryBlobStore::new()))
}

pub async fn sqlite_storage() -> Storage {
    let meta = SqliteMetaStore::in_memory(Format::Json)
        .await
        .expect("in-memory sqlite store");
    Storage::new(Arc::new(meta), Arc::new(MemoryRevisionStore::new(Format::Json)))
        .with_blob_store(Arc::new(MemoryBlobStore::new()))
}

/// Both meta backends the universal properties must hold for.
pub async fn backends() -> Vec<(&'static str, Storage)> {
    vec![
        ("memory", memory_storage()),
        ("sqlite", sqlite_storage().await),
    ]
}

pub fn item_manager(storage: Storage) -> ResourceManager<Item> {
    ResourceManager::<Item>::builder(storage)
        .name("item")
        .format(Format::Json)
        .indexed_fields(["name", "price", "tags"])
        .build()
}

/// Deterministic context: `t` seconds past a fixed epoch.
pub fn ctx_at(actor: &str, t: i64) -> OpContext {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    OpContext::new(actor, base + chrono::Duration::seconds(t))
}

pub fn alice(t: i64) -> OpContext {
    ctx_at("user:alice", t)
}
