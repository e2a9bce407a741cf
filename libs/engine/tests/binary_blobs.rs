//! Binary-field promotion and blob round trips.

mod support;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use support::*;
use tresor_engine::blob::{BlobStore, DiskBlobStore, MemoryBlobStore};
use tresor_engine::meta::MemoryMetaStore;
use tresor_engine::revision::DiskRevisionStore;
use tresor_engine::{Binary, Error, ResourceManager, Storage};
use tresor_format::Format;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Account {
    username: String,
    avatar: Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Attachment {
    label: String,
    content: Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Bundle {
    title: String,
    attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cover: Option<Binary>,
}

fn account_manager(storage: Storage) -> ResourceManager<Account> {
    ResourceManager::<Account>::builder(storage)
        .name("account")
        .format(Format::Json)
        .indexed_fields(["username"])
        .build()
}

#[tokio::test]
async fn binary_fields_are_promoted_to_blob_references() -> anyhow::Result<()> {
    let manager = account_manager(memory_storage());
    let ctx = alice(0);

    let raw = vec![9u8; 1024];
    let info = manager
        .create(
            &ctx,
            Account {
                username: "ada".into(),
                avatar: Binary::from_bytes(raw.clone()).with_content_type("image/png"),
            },
        )
        .await?;

    let resource = manager.get(&ctx, &info.resource_id).await?;
    let avatar = &resource.data.avatar;
    assert!(avatar.data.is_none(), "bytes must be elided from the payload");
    assert_eq!(avatar.size, Some(1024));
    assert_eq!(avatar.content_type.as_deref(), Some("image/png"));
    let file_id = avatar.file_id.clone().expect("promoted file id");

    // Dereference through the blob store.
    let blob = manager.get_blob(&ctx, &file_id).await?;
    assert_eq!(blob.data.as_deref().map(|b| b.as_slice()), Some(raw.as_slice()));

    match manager.get_blob(&ctx, "does-not-exist").await {
        Err(Error::BlobNotFound(_)) => {}
        other => panic!("expected BlobNotFound, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn nested_and_optional_binaries_are_all_promoted() -> anyhow::Result<()> {
    let manager = ResourceManager::<Bundle>::builder(memory_storage())
        .name("bundle")
        .format(Format::Json)
        .indexed_fields(["title"])
        .build();
    let ctx = alice(0);

    let info = manager
        .create(
            &ctx,
            Bundle {
                title: "docs".into(),
                attachments: vec![
                    Attachment {
                        label: "one".into(),
                        content: Binary::from_bytes(b"first".to_vec()),
                    },
                    Attachment {
                        label: "two".into(),
                        content: Binary::from_bytes(b"second".to_vec()),
                    },
                ],
                cover: Some(Binary::from_bytes(b"cover".to_vec())),
            },
        )
        .await?;

    let bundle = manager.get(&ctx, &info.resource_id).await?.data;
    for binary in bundle
        .attachments
        .iter()
        .map(|a| &a.content)
        .chain(bundle.cover.iter())
    {
        assert!(binary.data.is_none());
        assert!(binary.file_id.is_some());
    }

    // Same bytes from different records share one blob.
    let again = manager
        .create(
            &alice(1),
            Bundle {
                title: "copy".into(),
                attachments: vec![Attachment {
                    label: "dup".into(),
                    content: Binary::from_bytes(b"first".to_vec()),
                }],
                cover: None,
            },
        )
        .await?;
    let copy = manager.get(&alice(1), &again.resource_id).await?.data;
    assert_eq!(
        copy.attachments[0].content.file_id,
        bundle.attachments[0].content.file_id
    );
    Ok(())
}

#[tokio::test]
async fn blob_put_is_idempotent_across_implementations() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stores: Vec<(&str, Arc<dyn BlobStore>)> = vec![
        ("memory", Arc::new(MemoryBlobStore::new())),
        ("disk", Arc::new(DiskBlobStore::open(dir.path()).await?)),
    ];

    for (name, store) in stores {
        let first = store
            .put(bytes::Bytes::from_static(b"identical"), None)
            .await?;
        let second = store
            .put(bytes::Bytes::from_static(b"identical"), None)
            .await?;
        assert_eq!(first, second, "{name}");

        let blob = store.get(&first).await?;
        assert_eq!(
            blob.data.as_deref().map(|b| b.as_slice()),
            Some(b"identical".as_slice()),
            "{name}"
        );
        assert!(store.exists(&first).await?, "{name}");
        assert!(!store.exists("missing").await?, "{name}");
    }
    Ok(())
}

#[tokio::test]
async fn disk_revision_store_round_trips_through_the_manager() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = Storage::new(
        Arc::new(MemoryMetaStore::new()),
        Arc::new(DiskRevisionStore::open(dir.path().join("revisions"), Format::Json).await?),
    )
    .with_blob_store(Arc::new(
        DiskBlobStore::open(dir.path().join("blobs")).await?,
    ));
    let manager = account_manager(storage);
    let ctx = alice(0);

    let info = manager
        .create(
            &ctx,
            Account {
                username: "disk".into(),
                avatar: Binary::from_bytes(b"on-disk".to_vec()),
            },
        )
        .await?;
    manager
        .update(
            &alice(1),
            &info.resource_id,
            Account {
                username: "disk2".into(),
                avatar: Binary::from_bytes(b"on-disk-2".to_vec()),
            },
        )
        .await?;

    let resource = manager.get(&alice(2), &info.resource_id).await?;
    assert_eq!(resource.data.username, "disk2");

    // Per-resource directory with one .data and one .info per revision.
    let resource_dir = dir.path().join("revisions").join(&info.resource_id);
    let mut entries: Vec<String> = std::fs::read_dir(&resource_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().any(|e| e.ends_with(":1.data")));
    assert!(entries.iter().any(|e| e.ends_with(":2.info")));
    Ok(())
}
