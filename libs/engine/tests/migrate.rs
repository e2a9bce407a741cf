//! In-place schema migration.

mod support;

use serde::{Deserialize, Serialize};
use support::*;
use tresor_engine::{Error, Migration, ResourceManager, Storage};
use tresor_format::Format;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LegacyNote {
    title: String,
    body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Note {
    title: String,
    body: String,
    #[serde(default)]
    word_count: u64,
}

struct NoteMigration;

impl Migration<Note> for NoteMigration {
    fn schema_version(&self) -> &str {
        "2"
    }

    fn migrate(&self, data: &[u8], stored_version: Option<&str>) -> tresor_engine::Result<Note> {
        match stored_version {
            Some("1") | None => {
                let legacy: LegacyNote = serde_json::from_slice(data)
                    .map_err(|err| Error::Internal(format!("legacy note undecodable: {err}")))?;
                let word_count = legacy.body.split_whitespace().count() as u64;
                Ok(Note {
                    title: legacy.title,
                    body: legacy.body,
                    word_count,
                })
            }
            Some(other) => Err(Error::Internal(format!("unexpected source version {other}"))),
        }
    }
}

fn legacy_manager(storage: Storage) -> ResourceManager<LegacyNote> {
    ResourceManager::<LegacyNote>::builder(storage)
        .name("note")
        .format(Format::Json)
        .indexed_fields(["title"])
        .schema_version("1")
        .build()
}

fn migrating_manager(storage: Storage) -> ResourceManager<Note> {
    ResourceManager::<Note>::builder(storage)
        .name("note")
        .format(Format::Json)
        .indexed_fields(["title", "word_count"])
        .migration(NoteMigration)
        .build()
}

#[tokio::test]
async fn migrate_rewrites_the_current_revision_in_place() -> anyhow::Result<()> {
    let storage = memory_storage();
    let legacy = legacy_manager(storage.clone());
    let info = legacy
        .create(
            &alice(0),
            LegacyNote {
                title: "hello".into(),
                body: "one two three".into(),
            },
        )
        .await?;
    let id = info.resource_id.clone();

    let manager = migrating_manager(storage);
    let migrated = manager.migrate(&alice(10), &id).await?;

    assert_eq!(migrated.schema_version.as_deref(), Some("2"));
    assert_eq!(migrated.revision_id, info.revision_id, "same revision id");
    assert_ne!(migrated.data_hash, info.data_hash, "payload was rewritten");

    let meta = manager.get_meta(&alice(11), &id).await?;
    assert_eq!(meta.total_revision_count, 1, "no new revision");
    assert_eq!(meta.schema_version.as_deref(), Some("2"));
    assert_eq!(
        meta.indexed_data.get("word_count"),
        Some(&serde_json::json!(3)),
        "projection rebuilt from the migrated payload"
    );

    let note = manager.get(&alice(12), &id).await?.data;
    assert_eq!(note.word_count, 3);
    assert_eq!(note.title, "hello");
    Ok(())
}

#[tokio::test]
async fn migrate_is_a_noop_at_the_target_version() -> anyhow::Result<()> {
    let storage = memory_storage();
    let manager = migrating_manager(storage);

    let info = manager
        .create(
            &alice(0),
            Note {
                title: "fresh".into(),
                body: "b".into(),
                word_count: 1,
            },
        )
        .await?;
    assert_eq!(info.schema_version.as_deref(), Some("2"));

    let migrated = manager.migrate(&alice(1), &info.resource_id).await?;
    assert_eq!(migrated.data_hash, info.data_hash);
    assert_eq!(migrated.updated_time, info.updated_time, "untouched");
    Ok(())
}

#[tokio::test]
async fn migrate_without_configuration_is_an_error() -> anyhow::Result<()> {
    let manager = item_manager(memory_storage());
    let info = manager.create(&alice(0), item("x", 1, &[])).await?;
    match manager.migrate(&alice(1), &info.resource_id).await {
        Err(Error::MigrationNotConfigured) => Ok(()),
        other => panic!("expected MigrationNotConfigured, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_schema_without_migration_is_a_conflict_on_get() -> anyhow::Result<()> {
    let storage = memory_storage();
    let legacy = legacy_manager(storage.clone());
    let info = legacy
        .create(
            &alice(0),
            LegacyNote {
                title: "old".into(),
                body: "b".into(),
            },
        )
        .await?;

    // Reader pinned to version "2" with no migration configured.
    let strict = ResourceManager::<Note>::builder(storage)
        .name("note")
        .format(Format::Json)
        .schema_version("2")
        .build();
    match strict.get(&alice(1), &info.resource_id).await {
        Err(Error::SchemaConflict {
            stored, expected, ..
        }) => {
            assert_eq!(stored.as_deref(), Some("1"));
            assert_eq!(expected, "2");
        }
        other => panic!("expected SchemaConflict, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn migrate_checks_soft_delete_and_existence() -> anyhow::Result<()> {
    let storage = memory_storage();
    let manager = migrating_manager(storage);

    match manager.migrate(&alice(0), "note:missing").await {
        Err(Error::ResourceIdNotFound(_)) => {}
        other => panic!("expected ResourceIdNotFound, got {other:?}"),
    }

    let info = manager
        .create(
            &alice(0),
            Note {
                title: "t".into(),
                body: "b".into(),
                word_count: 1,
            },
        )
        .await?;
    manager.delete(&alice(1), &info.resource_id).await?;
    match manager.migrate(&alice(2), &info.resource_id).await {
        Err(Error::ResourceIsDeleted(_)) => Ok(()),
        other => panic!("expected ResourceIsDeleted, got {other:?}"),
    }
}
