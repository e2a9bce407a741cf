//! SQLite meta store whose database file lives in an S3 bucket.
//!
//! The database is downloaded on open (capturing the object's ETag) and
//! operated on locally; mutations sync back to S3, guarded by ETag-based
//! optimistic concurrency. There is no in-process mutex protecting the
//! upload path beyond the store's own state lock — concurrent writers from
//! different processes race, and the loser sees `Error::S3Conflict`.

use super::{MetaStore, SqliteMetaStore};
use crate::error::{Error, Result};
use crate::types::ResourceMeta;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tresor_format::Format;
use tresor_query::SearchQuery;

/// Throttle for ETag checks ahead of read operations.
const READ_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct S3MetaStoreOptions {
    pub bucket: String,
    pub key: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    /// Custom endpoint for MinIO, LocalStack and friends.
    pub endpoint_url: Option<String>,
    pub format: Format,
    /// Sync to S3 after each mutation.
    pub auto_sync: bool,
    /// Minimum spacing between auto syncs; zero syncs immediately.
    pub sync_interval: Duration,
    /// ETag-based optimistic locking.
    pub enable_locking: bool,
    /// On upload conflict, pull the remote state (discarding local changes)
    /// before surfacing the conflict, so the caller can simply retry.
    pub auto_reload_on_conflict: bool,
    /// Detect upstream changes before reads (throttled, best effort).
    pub check_etag_on_read: bool,
}

impl S3MetaStoreOptions {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        S3MetaStoreOptions {
            bucket: bucket.into(),
            key: key.into(),
            access_key_id: "minioadmin".into(),
            secret_access_key: "minioadmin".into(),
            region: "us-east-1".into(),
            endpoint_url: None,
            format: Format::MessagePack,
            auto_sync: true,
            sync_interval: Duration::ZERO,
            enable_locking: true,
            auto_reload_on_conflict: false,
            check_etag_on_read: true,
        }
    }
}

struct SyncState {
    etag: Option<String>,
    last_sync: Instant,
    last_read_check: Instant,
}

pub struct S3MetaStore {
    client: aws_sdk_s3::Client,
    options: S3MetaStoreOptions,
    inner: RwLock<SqliteMetaStore>,
    state: Mutex<SyncState>,
    db_path: PathBuf,
    _tmpdir: tempfile::TempDir,
}

impl S3MetaStore {
    pub async fn open(options: S3MetaStoreOptions) -> Result<Self> {
        let client = build_client(&options);
        let tmpdir = tempfile::tempdir()?;
        let db_path = tmpdir.path().join("resource_meta.db");

        let etag = download(&client, &options.bucket, &options.key, &db_path).await?;
        let inner = SqliteMetaStore::open(&db_path, options.format).await?;

        Ok(S3MetaStore {
            client,
            options,
            inner: RwLock::new(inner),
            state: Mutex::new(SyncState {
                etag,
                last_sync: Instant::now(),
                last_read_check: Instant::now(),
            }),
            db_path,
            _tmpdir: tmpdir,
        })
    }

    /// Uploads the local database to S3. With locking enabled a `HEAD`
    /// compares the remote ETag first; `force` bypasses the check.
    pub async fn sync_to_s3(&self, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        self.sync_locked(&mut state, force).await
    }

    /// Final sync plus connection teardown. The temp directory holding the
    /// local database is removed when the store is dropped.
    pub async fn close(&self) -> Result<()> {
        if self.options.auto_sync {
            self.sync_to_s3(false).await?;
        }
        self.inner.read().await.close().await;
        Ok(())
    }

    async fn sync_locked(&self, state: &mut SyncState, force: bool) -> Result<()> {
        if self.options.enable_locking && state.etag.is_some() && !force {
            // A vanished object (HEAD 404) is not a conflict; the upload
            // recreates it.
            if let Some(found) = self.remote_etag().await? {
                if Some(&found) != state.etag.as_ref() {
                    let expected = state.etag.clone();
                    if self.options.auto_reload_on_conflict {
                        self.reload(state).await?;
                    }
                    return Err(Error::S3Conflict {
                        expected,
                        found: Some(found),
                    });
                }
            }
        }

        let body = ByteStream::from_path(&self.db_path)
            .await
            .map_err(|err| Error::S3(format!("cannot read local database: {err}")))?;
        let response = self
            .client
            .put_object()
            .bucket(&self.options.bucket)
            .key(&self.options.key)
            .body(body)
            .send()
            .await
            .map_err(|err| Error::S3(err.into_service_error().to_string()))?;

        state.etag = response.e_tag().map(str::to_string);
        state.last_sync = Instant::now();
        Ok(())
    }

    /// `Ok(None)` when the object does not exist.
    async fn remote_etag(&self) -> Result<Option<String>> {
        match self
            .client
            .head_object()
            .bucket(&self.options.bucket)
            .key(&self.options.key)
            .send()
            .await
        {
            Ok(head) => Ok(head.e_tag().map(str::to_string)),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_not_found() {
                    Ok(None)
                } else {
                    Err(Error::S3(service.to_string()))
                }
            }
        }
    }

    /// Discards local state and replaces the database with the remote copy
    /// (or a fresh empty one when the object is gone).
    async fn reload(&self, state: &mut SyncState) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.close().await;

        match download(
            &self.client,
            &self.options.bucket,
            &self.options.key,
            &self.db_path,
        )
        .await?
        {
            Some(etag) => state.etag = Some(etag),
            None => {
                state.etag = None;
                match tokio::fs::remove_file(&self.db_path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        *inner = SqliteMetaStore::open(&self.db_path, self.options.format).await?;
        Ok(())
    }

    async fn maybe_sync(&self) -> Result<()> {
        if !self.options.auto_sync {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let due = self.options.sync_interval.is_zero()
            || state.last_sync.elapsed() >= self.options.sync_interval;
        if due {
            self.sync_locked(&mut state, false).await?;
        }
        Ok(())
    }

    /// Throttled upstream-change detection before reads. Best effort: HEAD
    /// failures (including 404) are swallowed so reads never block on S3.
    async fn check_reload_before_read(&self) {
        if !self.options.check_etag_on_read || !self.options.enable_locking {
            return;
        }
        let mut state = self.state.lock().await;
        if state.last_read_check.elapsed() < READ_CHECK_INTERVAL {
            return;
        }
        state.last_read_check = Instant::now();

        match self.remote_etag().await {
            Ok(Some(found)) if Some(&found) != state.etag.as_ref() => {
                if let Err(err) = self.reload(&mut state).await {
                    tracing::warn!(error = %err, "reload after upstream change failed");
                }
            }
            // 404s and transport failures are ignored so reads never block.
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "ignoring ETag read check failure");
            }
        }
    }
}

fn build_client(options: &S3MetaStoreOptions) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        options.access_key_id.clone(),
        options.secret_access_key.clone(),
        None,
        None,
        "tresor-s3-meta-store",
    );
    let mut builder = aws_sdk_s3::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .credentials_provider(credentials)
        .region(Region::new(options.region.clone()))
        .force_path_style(true);
    if let Some(endpoint) = &options.endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }
    aws_sdk_s3::Client::from_conf(builder.build())
}

/// Downloads the object into `path`, returning its ETag; `None` when the
/// object does not exist yet.
async fn download(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    path: &Path,
) -> Result<Option<String>> {
    match client.get_object().bucket(bucket).key(key).send().await {
        Ok(response) => {
            let etag = response.e_tag().map(str::to_string);
            let bytes = response
                .body
                .collect()
                .await
                .map_err(|err| Error::S3(format!("download failed: {err}")))?
                .into_bytes();
            tokio::fs::write(path, &bytes).await?;
            Ok(etag)
        }
        Err(err) => {
            let service = err.into_service_error();
            if service.is_no_such_key() {
                Ok(None)
            } else {
                Err(Error::S3(service.to_string()))
            }
        }
    }
}

#[async_trait]
impl MetaStore for S3MetaStore {
    async fn get(&self, resource_id: &str) -> Result<Option<ResourceMeta>> {
        self.check_reload_before_read().await;
        self.inner.read().await.get(resource_id).await
    }

    async fn put(&self, meta: &ResourceMeta) -> Result<()> {
        self.inner.read().await.put(meta).await?;
        self.maybe_sync().await
    }

    async fn delete(&self, resource_id: &str) -> Result<()> {
        self.inner.read().await.delete(resource_id).await?;
        self.maybe_sync().await
    }

    async fn exists(&self, resource_id: &str) -> Result<bool> {
        self.check_reload_before_read().await;
        self.inner.read().await.exists(resource_id).await
    }

    async fn iter_search(
        &self,
        query: &SearchQuery,
    ) -> Result<BoxStream<'static, Result<ResourceMeta>>> {
        self.check_reload_before_read().await;
        self.inner.read().await.iter_search(query).await
    }

    async fn count(&self, query: &SearchQuery) -> Result<u64> {
        self.check_reload_before_read().await;
        self.inner.read().await.count(query).await
    }

    async fn save_many(&self, metas: Vec<ResourceMeta>) -> Result<()> {
        self.inner.read().await.save_many(metas).await?;
        self.maybe_sync().await
    }
}
