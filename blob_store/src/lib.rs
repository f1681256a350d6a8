use std::{env, fmt::Debug, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{
    parse_url_opts,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
    WriteMultipart,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobStorageConfig {
    pub path: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: Some(format!("file://{}", path)),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = env::current_dir()
            .map(|dir| format!("file://{}", dir.join("vaas_storage/items").display()))
            .unwrap_or_else(|_| "file:///tmp/vaas_storage/items".to_string());
        info!("using blob store path: {}", blob_store_path);
        BlobStorageConfig {
            path: Some(blob_store_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// Object storage rooted at a configured URL. All keys are relative to that
/// root and may contain `/` separators.
#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    local_root: Option<PathBuf>,
}

impl Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("path", &self.path)
            .field("local_root", &self.local_root)
            .finish()
    }
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url_str = config
            .path
            .ok_or_else(|| anyhow!("blob storage path is required"))?;
        let url = url_str.parse::<Url>()?;
        let (scheme, _) = ObjectStoreScheme::parse(&url)?;
        let local_root = match scheme {
            ObjectStoreScheme::Local => {
                let root = url
                    .to_file_path()
                    .map_err(|_| anyhow!("invalid local blob store path: {}", url_str))?;
                std::fs::create_dir_all(&root)?;
                Some(root)
            }
            _ => None,
        };
        // inject AWS environment variables to prioritize keys over instance metadata
        // credentials.
        let opts: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with("AWS_"))
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();
        let (object_store, path) = parse_url_opts(&url, opts)?;
        Ok(Self {
            object_store: Arc::from(object_store),
            path,
            local_root,
        })
    }

    fn key_path(&self, key: &str) -> Path {
        let key = key.trim_start_matches('/');
        if self.path.as_ref().is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", self.path, key))
        }
    }

    /// Filesystem location of `key` when the store is backed by a local
    /// directory.
    pub fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.local_root
            .as_ref()
            .map(|root| root.join(key.trim_start_matches('/')))
    }

    pub async fn put(
        &self,
        key: &str,
        data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult, anyhow::Error> {
        let mut hasher = Sha256::new();
        let mut hashed_stream = data.map(|item| {
            item.map(|bytes| {
                hasher.update(&bytes);
                bytes
            })
        });

        let path = self.key_path(key);
        let m = self.object_store.put_multipart(&path).await?;
        let mut w = WriteMultipart::new(m);
        let mut size_bytes = 0;
        while let Some(chunk) = hashed_stream.next().await {
            w.wait_for_capacity(1).await?;
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            w.write(&chunk);
        }
        w.finish().await?;

        let hash = format!("{:x}", hasher.finalize());
        debug!(key, size_bytes, "stored blob");
        Ok(PutResult {
            url: path.to_string(),
            size_bytes,
            sha256_hash: hash,
        })
    }

    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<()> {
        self.object_store
            .put(&self.key_path(key), PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let client_clone = self.object_store.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let get_result = client_clone
            .get(&self.key_path(key))
            .await
            .map_err(|e| anyhow!("can't get object {:?}: {:?}", key, e))?;
        let key = key.to_string();
        tokio::spawn(async move {
            let mut stream = get_result.into_stream();
            while let Some(chunk) = stream.next().await {
                let _ = tx.send(
                    chunk.map_err(|e| anyhow!("error reading object {:?}: {:?}", key.clone(), e)),
                );
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.object_store.delete(&self.key_path(key)).await?;
        Ok(())
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }

    /// Keys under `prefix`, relative to the storage root.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = self.key_path(prefix);
        let root = self.path.as_ref().to_string();
        let metas: Vec<_> = self
            .object_store
            .list(Some(&prefix_path))
            .try_collect()
            .await?;
        let mut keys: Vec<String> = metas
            .into_iter()
            .map(|meta| {
                let location = meta.location.as_ref();
                location
                    .strip_prefix(root.as_str())
                    .unwrap_or(location)
                    .trim_start_matches('/')
                    .to_string()
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}
