use bytes::Bytes;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{GalleryError, Result};
use crate::metrics::{COORDINATION_ERRORS_TOTAL, COORDINATION_OPERATION_DURATION};

/// Shared object store holding cluster coordination state: membership
/// records and lock objects. Template data never goes through here.
#[derive(Clone)]
pub struct CoordinationStore {
    inner: Arc<dyn ObjectStore>,
}

fn observe(operation: &str, start: Instant) {
    let elapsed = start.elapsed();
    debug!(elapsed_ms = elapsed.as_millis(), operation, "coordination op");
    COORDINATION_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

fn count_error(operation: &str) {
    COORDINATION_ERRORS_TOTAL
        .with_label_values(&[operation])
        .inc();
}

fn not_found_or_storage(e: object_store::Error) -> GalleryError {
    match e {
        object_store::Error::NotFound { path, .. } => GalleryError::NotFound { key: path },
        other => GalleryError::Storage(other),
    }
}

impl CoordinationStore {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.backend {
            StorageBackend::Memory => Arc::new(InMemory::new()),
            StorageBackend::S3 => {
                let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);

                if let Some(ref region) = config.s3_region {
                    builder = builder.with_region(region);
                }
                if let Some(ref endpoint) = config.s3_endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(ref key_id) = config.s3_access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(ref secret) = config.s3_secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                if config.s3_allow_http {
                    builder = builder.with_allow_http(true);
                }

                // Lock objects rely on ETag-conditional writes.
                builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch);

                let client_options = ClientOptions::new()
                    .with_timeout(std::time::Duration::from_secs(10))
                    .with_connect_timeout(std::time::Duration::from_secs(5));
                builder = builder.with_client_options(client_options);

                Arc::new(builder.build().map_err(|e| {
                    GalleryError::Config(format!("failed to build S3 store: {e}"))
                })?)
            }
            StorageBackend::Local => {
                let path = std::path::Path::new(&config.bucket);
                if !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(path).map_err(|e| {
                        GalleryError::Config(format!("failed to build local store: {e}"))
                    })?,
                )
            }
        };

        Ok(Self { inner: store })
    }

    /// Wrap an existing ObjectStore instance (tests).
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { inner: store }
    }

    /// In-process store, shared by every clone.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    #[instrument(skip(self, data), fields(key = key, size = data.len()))]
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let start = Instant::now();
        let path = Path::parse(key)?;
        self.inner
            .put(&path, PutPayload::from(data))
            .await
            .inspect_err(|_| count_error("put"))?;
        observe("put", start);
        Ok(())
    }

    /// Returns the object's bytes and its ETag for later conditional writes.
    #[instrument(skip(self), fields(key = key))]
    pub async fn get_with_meta(&self, key: &str) -> Result<(Bytes, Option<String>)> {
        let start = Instant::now();
        let path = Path::parse(key)?;
        let result = self.inner.get(&path).await.map_err(|e| {
            if !matches!(e, object_store::Error::NotFound { .. }) {
                count_error("get");
            }
            not_found_or_storage(e)
        })?;
        let etag = result.meta.e_tag.clone();
        let bytes = result.bytes().await?;
        observe("get", start);
        Ok((bytes, etag))
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        Ok(self.get_with_meta(key).await?.0)
    }

    /// Compare-and-swap on ETag. A concurrent writer yields `CasConflict`.
    #[instrument(skip(self, data), fields(key = key))]
    pub async fn put_if_match(&self, key: &str, data: Bytes, etag: &str) -> Result<()> {
        let start = Instant::now();
        let path = Path::parse(key)?;
        let options = PutOptions {
            mode: PutMode::Update(UpdateVersion {
                e_tag: Some(etag.to_string()),
                version: None,
            }),
            ..PutOptions::default()
        };
        self.inner
            .put_opts(&path, PutPayload::from(data), options)
            .await
            .map_err(|e| match e {
                object_store::Error::Precondition { .. } | object_store::Error::NotFound { .. } => {
                    GalleryError::CasConflict {
                        key: key.to_string(),
                    }
                }
                other => {
                    count_error("put_if_match");
                    GalleryError::Storage(other)
                }
            })?;
        observe("put_if_match", start);
        Ok(())
    }

    /// Create-only write. An existing object yields `CasConflict`.
    #[instrument(skip(self, data), fields(key = key))]
    pub async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<()> {
        let start = Instant::now();
        let path = Path::parse(key)?;
        let options = PutOptions {
            mode: PutMode::Create,
            ..PutOptions::default()
        };
        self.inner
            .put_opts(&path, PutPayload::from(data), options)
            .await
            .map_err(|e| match e {
                object_store::Error::AlreadyExists { .. } => GalleryError::CasConflict {
                    key: key.to_string(),
                },
                other => {
                    count_error("put_if_not_exists");
                    GalleryError::Storage(other)
                }
            })?;
        observe("put_if_not_exists", start);
        Ok(())
    }

    /// Deleting a missing key is not an error.
    #[instrument(skip(self), fields(key = key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let path = Path::parse(key)?;
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => {
                count_error("delete");
                return Err(GalleryError::Storage(e));
            }
        }
        observe("delete", start);
        Ok(())
    }

    #[instrument(skip(self), fields(prefix = prefix))]
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        use futures::TryStreamExt;
        let start = Instant::now();
        let path = Path::parse(prefix)?;
        let objects: Vec<_> = self
            .inner
            .list(Some(&path))
            .try_collect()
            .await
            .inspect_err(|_| count_error("list_prefix"))?;
        let keys: Vec<String> = objects.iter().map(|o| o.location.to_string()).collect();
        debug!(count = keys.len(), "coordination list_prefix");
        observe("list_prefix", start);
        Ok(keys)
    }
}
