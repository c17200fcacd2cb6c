//! Object storage used for federated key batches, checkpoint records and the
//! locally stored mobile submissions that feed the upload direction.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const APPLICATION_JSON: &str = "application/json";

const TEMP_SUFFIX: &str = ".tmp";

#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid object path: {0}")]
    InvalidPath(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: String,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates or overwrites the object. The object is durable once this returns.
    async fn put(&self, path: &str, content_type: &str, body: Bytes) -> Result<(), BlobError>;

    async fn get(&self, path: &str) -> Result<Option<Bytes>, BlobError>;

    /// All objects whose path starts with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BlobError>;
}

/// Stores objects as files below a base directory. Object paths map to
/// relative file paths.
pub struct FilesystemBlobStore {
    base_dir: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        FilesystemBlobStore {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(path);
        let is_plain = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain || path.ends_with(TEMP_SUFFIX) {
            return Err(BlobError::InvalidPath(path.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }

    fn object_path(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.base_dir).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

/// Flushes a directory's entries. A rename into it is durable afterwards.
async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, path: &str, content_type: &str, body: Bytes) -> Result<(), BlobError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write aside and rename so readers never observe a partial object
        let mut temp_name = target.clone().into_os_string();
        temp_name.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp_name);

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, &target).await?;
        if let Some(parent) = target.parent() {
            sync_dir(parent).await?;
        }

        tracing::debug!(path, content_type, bytes = body.len(), "stored object");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>, BlobError> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BlobError> {
        let mut objects = Vec::new();
        let mut pending = vec![self.base_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let file = entry.path();
                if file_type.is_dir() {
                    pending.push(file);
                    continue;
                }

                let Some(path) = self.object_path(&file) else {
                    continue;
                };
                if !path.starts_with(prefix) || path.ends_with(TEMP_SUFFIX) {
                    continue;
                }

                let modified = entry.metadata().await?.modified()?;
                objects.push(ObjectMeta {
                    path,
                    last_modified: DateTime::<Utc>::from(modified),
                });
            }
        }

        Ok(objects)
    }
}
