//! src/services/object_store.rs
//!
//! ObjectStorage: The collaborator that holds image payloads. The local-disk
//! backend shards payloads beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}` and serves them back through
//! presigned URLs verified with a shared secret.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum ObjectStorageError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidKey,
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucket { name: String, reason: &'static str },
    #[error("presigned url has expired")]
    Expired,
    #[error("presigned url signature does not match")]
    BadSignature,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectResult<T> = Result<T, ObjectStorageError>;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Metadata of a stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub etag: String,
    pub content_type: String,
}

/// An opened payload ready to be streamed out.
pub struct ObjectReader {
    pub object: StoredObject,
    pub body: ByteStream,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write a payload, replacing any existing object under the same key.
    async fn put_stream(&self, bucket: &str, key: &str, body: ByteStream)
    -> ObjectResult<StoredObject>;

    async fn open(&self, bucket: &str, key: &str) -> ObjectResult<ObjectReader>;

    /// Remove a payload. Returns NotFound if nothing is stored under the key.
    async fn delete(&self, bucket: &str, key: &str) -> ObjectResult<()>;

    /// Time-limited download URL for a payload.
    fn presign(&self, bucket: &str, key: &str, expires_in: Duration) -> ObjectResult<String>;

    /// Check the `expires` and `signature` query values of a presigned URL.
    fn verify(&self, bucket: &str, key: &str, expires: i64, signature: &str) -> ObjectResult<()>;

    /// Confirm the backend accepts writes.
    async fn ping(&self) -> ObjectResult<()>;
}

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,
    /// Prefix of generated download URLs, e.g. `http://localhost:3000`.
    public_base_url: String,
    secret: String,
}

impl LocalObjectStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    /// Reject empty keys, absolute keys, traversal and control characters.
    fn ensure_key_safe(key: &str) -> ObjectResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(ObjectStorageError::InvalidKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(ObjectStorageError::InvalidKey);
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(ObjectStorageError::InvalidKey);
        }
        Ok(())
    }

    /// Lowercase letters, digits and inner hyphens, 3 to 63 characters.
    fn ensure_bucket_safe(name: &str) -> ObjectResult<()> {
        let invalid = |reason| ObjectStorageError::InvalidBucket {
            name: name.to_string(),
            reason,
        };
        if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
        {
            return Err(invalid("allowed characters are lowercase letters, digits and hyphens"));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard directories taken from MD5(bucket/key).
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn signature(&self, bucket: &str, key: &str, expires: i64) -> String {
        let digest = md5::compute(format!("{}|{}|{}|{}", self.secret, bucket, key, expires));
        URL_SAFE_NO_PAD.encode(digest.0)
    }

    /// Remove empty directories from `start` up to, not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn discard(tmp_path: &Path, err: io::Error) -> ObjectStorageError {
        let _ = fs::remove_file(tmp_path).await;
        ObjectStorageError::Io(err)
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStore {
    /// Streams into a temp file while hashing, fsyncs, then renames into place.
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
    ) -> ObjectResult<StoredObject> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(bucket, key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(ObjectStorageError::InvalidKey)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => return Err(Self::discard(&tmp_path, err).await),
            };
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                return Err(Self::discard(&tmp_path, err).await);
            }
        }
        if let Err(err) = file.flush().await {
            return Err(Self::discard(&tmp_path, err).await);
        }
        if let Err(err) = file.sync_all().await {
            return Err(Self::discard(&tmp_path, err).await);
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                return Err(Self::discard(&tmp_path, err).await);
            }
        }

        let object = StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size_bytes,
            etag: format!("{:x}", digest.compute()),
            content_type: content_type_for(key).to_string(),
        };
        debug!(bucket, key, size_bytes, "stored object");
        Ok(object)
    }

    async fn open(&self, bucket: &str, key: &str) -> ObjectResult<ObjectReader> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(bucket, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                ObjectStorageError::Io(err)
            }
        })?;
        let size_bytes = file.metadata().await?.len();

        Ok(ObjectReader {
            object: StoredObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size_bytes,
                etag: String::new(),
                content_type: content_type_for(key).to_string(),
            },
            body: Box::pin(ReaderStream::new(file)),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> ObjectResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ObjectStorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(ObjectStorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    fn presign(&self, bucket: &str, key: &str, expires_in: Duration) -> ObjectResult<String> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        Ok(format!(
            "{}/objects/{}/{}?expires={}&signature={}",
            self.public_base_url,
            bucket,
            encode_key(key),
            expires,
            self.signature(bucket, key, expires)
        ))
    }

    fn verify(&self, bucket: &str, key: &str, expires: i64, signature: &str) -> ObjectResult<()> {
        let expected = self.signature(bucket, key, expires);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(ObjectStorageError::BadSignature);
        }
        if expires < Utc::now().timestamp() {
            return Err(ObjectStorageError::Expired);
        }
        Ok(())
    }

    async fn ping(&self) -> ObjectResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }
}

/// Percent-encode each `/`-separated segment of an object key.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Content type guessed from the key's file extension.
pub fn content_type_for(key: &str) -> &'static str {
    let extension = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}
