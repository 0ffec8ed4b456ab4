//! The blob store adapter.
//!
//! Key *strings* are built elsewhere (`keys.rs`); every byte that crosses the
//! wire to the object store passes through here. Writes are fire-and-verify:
//! immediately after `put`, we `get` the key back and compare lengths, to
//! guard against silent truncation on the way to the store. [`LocalBlobStore`]
//! additionally writes every blob to a temp file and renames it into place,
//! so a crash mid-write never leaves a torn file behind -- this is what keeps
//! the Document index consistent with its backing store across a restart.

use std::sync::atomic::{AtomicU64, Ordering};

use aws_sdk_s3::primitives::ByteStream;
use serde::de::DeserializeOwned;

use crate::{errors::PipelineError, prelude::*, retry::IsKnownTransient};

/// Errors specific to the blob store. Converted to [`PipelineError`] at the
/// call site, the same way an adapter-specific error (e.g. `OpenAIError`) is
/// converted through a thin wrapper before it crosses a module boundary.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("transport error reading/writing {key}: {source}")]
    Transport {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("write verification failed for {key}: wrote {wrote} bytes, read back {read} bytes")]
    Verify { key: String, wrote: usize, read: usize },
}

impl IsKnownTransient for BlobStoreError {
    fn is_known_transient(&self) -> bool {
        matches!(self, BlobStoreError::Transport { .. })
    }
}

impl From<BlobStoreError> for PipelineError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::NotFound(key) => PipelineError::NotFound(key),
            BlobStoreError::Verify { .. } => PipelineError::permanent(err),
            BlobStoreError::Transport { .. } => PipelineError::transient(err),
        }
    }
}

/// Typed get/put/head/list over the object store.
#[async_trait]
pub trait BlobStore: fmt_debug::MaybeDebug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError>;
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobStoreError>;
    async fn head(&self, key: &str) -> Result<bool, BlobStoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError>;
}

// Small shim so we don't need to require `Debug` on every future blob store
// backend while still letting `dyn BlobStore` be used in `#[derive(Debug)]`
// structs elsewhere in the pipeline.
mod fmt_debug {
    pub trait MaybeDebug {}
    impl<T> MaybeDebug for T {}
}

/// Helpers shared by every [`BlobStore`] implementation: JSON (de)serialize
/// plus the fire-and-verify write.
#[async_trait]
pub trait BlobStoreJsonExt: BlobStore {
    /// Read and deserialize a JSON blob.
    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, BlobStoreError> {
        let bytes = self.get(key).await?;
        serde_json::from_slice(&bytes).map_err(|err| BlobStoreError::Transport {
            key: key.to_string(),
            source: anyhow!(err),
        })
    }

    /// Try to read and deserialize a JSON blob, returning `None` on
    /// [`BlobStoreError::NotFound`].
    async fn try_get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, BlobStoreError> {
        match self.get_json(key).await {
            Ok(value) => Ok(Some(value)),
            Err(BlobStoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Serialize and write a JSON blob, then verify by reading it back.
    async fn put_json_verified<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), BlobStoreError> {
        let bytes = serde_json::to_vec(value).map_err(|err| BlobStoreError::Transport {
            key: key.to_string(),
            source: anyhow!(err),
        })?;
        let wrote = bytes.len();
        self.put(key, bytes, "application/json").await?;
        let read_back = self.get(key).await?;
        if read_back.len() != wrote {
            return Err(BlobStoreError::Verify {
                key: key.to_string(),
                wrote,
                read: read_back.len(),
            });
        }
        Ok(())
    }
}

impl<T: BlobStore + ?Sized> BlobStoreJsonExt for T {}

/// Per-process counter giving each temp file [`LocalBlobStore::put`] creates
/// a name unique within this run, even across concurrent writers to the same
/// key.
fn next_tmp_suffix() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An S3-backed [`BlobStore`], the production implementation.
#[derive(Debug)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn new(bucket: impl Into<String>) -> Result<Self> {
        let config = crate::aws::load_aws_config().await?;
        let client = aws_sdk_s3::Client::new(&config);
        Ok(S3BlobStore {
            client,
            bucket: bucket.into(),
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(output) => {
                let bytes = output.body.collect().await.map_err(|err| BlobStoreError::Transport {
                    key: key.to_string(),
                    source: anyhow!(err),
                })?;
                Ok(bytes.into_bytes().to_vec())
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    Err(BlobStoreError::NotFound(key.to_string()))
                } else {
                    Err(BlobStoreError::Transport {
                        key: key.to_string(),
                        source: anyhow!(err),
                    })
                }
            }
        }
    }

    #[instrument(level = "debug", skip(self, bytes))]
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| BlobStoreError::Transport {
                key: key.to_string(),
                source: anyhow!(err),
            })?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn head(&self, key: &str) -> Result<bool, BlobStoreError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(BlobStoreError::Transport {
                        key: key.to_string(),
                        source: anyhow!(err),
                    })
                }
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation_token {
                req = req.continuation_token(token);
            }
            let output = req.send().await.map_err(|err| BlobStoreError::Transport {
                key: prefix.to_string(),
                source: anyhow!(err),
            })?;
            keys.extend(output.contents().iter().filter_map(|o| o.key().map(str::to_owned)));
            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

/// A local-disk [`BlobStore`], used as a test double and for local
/// development.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBlobStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.path_for(key);
        tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BlobStoreError::NotFound(key.to_string())
            } else {
                BlobStoreError::Transport {
                    key: key.to_string(),
                    source: anyhow!(err),
                }
            }
        })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), BlobStoreError> {
        let path = self.path_for(key);
        let parent = path.parent().ok_or_else(|| BlobStoreError::Transport {
            key: key.to_string(),
            source: anyhow!("key {key} has no parent directory"),
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| BlobStoreError::Transport {
                key: key.to_string(),
                source: anyhow!(err),
            })?;
        // Write to a temp file in the same directory, then rename into
        // place, so a reader never observes a partially-written blob and a
        // crash mid-write never corrupts the existing one.
        let tmp_name = format!(
            ".{}.tmp-{}-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("blob"),
            std::process::id(),
            next_tmp_suffix(),
        );
        let tmp_path = parent.join(tmp_name);
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|err| BlobStoreError::Transport {
                key: key.to_string(),
                source: anyhow!(err),
            })?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(|err| {
            BlobStoreError::Transport {
                key: key.to_string(),
                source: anyhow!(err),
            }
        })
    }

    async fn head(&self, key: &str) -> Result<bool, BlobStoreError> {
        Ok(self.path_for(key).is_file())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let mut out = Vec::new();
        let base = self.root.clone();
        // Walk the whole tree and filter by prefix; this store only backs
        // tests and local dev, so simplicity wins over efficiency here.
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(BlobStoreError::Transport {
                        key: prefix.to_string(),
                        source: anyhow!(err),
                    });
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|err| BlobStoreError::Transport {
                key: prefix.to_string(),
                source: anyhow!(err),
            })? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    if rel.starts_with(prefix) {
                        out.push(rel);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trips_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store
            .put_json_verified("a/b.json", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        let value: serde_json::Value = store.get_json("a/b.json").await.unwrap();
        assert_eq!(value, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn local_store_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let err = store.get("missing.json").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_store_try_get_json_returns_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let value: Option<serde_json::Value> = store.try_get_json("missing.json").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn local_store_list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.put("page_data/d1/page_0.json", b"{}".to_vec(), "application/json").await.unwrap();
        store.put("ocr_cache/d1/text_cache.json", b"{}".to_vec(), "application/json").await.unwrap();
        let keys = store.list("page_data/").await.unwrap();
        assert_eq!(keys, vec!["page_data/d1/page_0.json".to_string()]);
    }
}
