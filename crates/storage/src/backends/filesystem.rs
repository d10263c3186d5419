//! Local filesystem storage backend.
//!
//! Multipart sessions live under `.multipart/{session}/` next to the data;
//! each part is a file named by its zero-padded index. Composing concatenates
//! the parts into a temp file and renames it into place.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ListingOptions, ListingPage, ObjectEntry, ObjectMeta, ObjectStore, PageStream, PartReceipt,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Maximum range size for get_range operations (128 MiB).
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// Scratch directory for multipart sessions, relative to the root.
const MULTIPART_DIR: &str = ".multipart";

/// Marker inserted into temp file names; listings skip such files.
const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

fn map_not_found(err: std::io::Error, key: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(err)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let suffix = format!("{TEMP_MARKER}{}", Uuid::new_v4());
    path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{suffix}", n.to_string_lossy()))
            .unwrap_or(suffix),
    )
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Get the full path for a key, with path traversal protection.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Returns an error if the key would escape the storage root, including
    /// through symlinks at the path or at any existing ancestor.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StorageError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Walk from the path itself upwards; the first thing that exists must
        // resolve inside the root.
        let mut candidate = Some(path.as_path());
        while let Some(current) = candidate {
            match std::fs::symlink_metadata(current) {
                Ok(meta) => {
                    let canonical = current.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(std::io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize path: {e}"),
                            ))
                        }
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(std::io::Error::new(
                        err.kind(),
                        format!("failed to stat path: {err}"),
                    )));
                }
            }
            candidate = current.parent();
        }

        Ok(path)
    }

    /// Scratch directory of a multipart session.
    fn session_dir(&self, session: &str) -> StorageResult<PathBuf> {
        let id = Uuid::parse_str(session).map_err(|_| {
            StorageError::InvalidKey(format!("malformed multipart session id: {session}"))
        })?;
        Ok(self.root.join(MULTIPART_DIR).join(id.to_string()))
    }

    fn part_path(session_dir: &Path, part_index: u32) -> PathBuf {
        session_dir.join(format!("{part_index:05}"))
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write `data` to `path` through a temp file, fsync, then rename.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.ensure_parent(path).await?;
        let temp_path = temp_sibling(path);
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| map_not_found(e, key))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(|e| map_not_found(e, key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        let range_size = end - start;
        if range_size > MAX_RANGE_SIZE {
            return Err(StorageError::InvalidRange(format!(
                "range size {range_size} exceeds maximum {MAX_RANGE_SIZE} bytes"
            )));
        }
        let len = usize::try_from(range_size).map_err(|_| {
            StorageError::InvalidRange(format!(
                "range size {range_size} exceeds platform address space"
            ))
        })?;

        let path = self.key_path(key).await?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| map_not_found(e, key))?;

        let size = file.metadata().await?.len();
        if end > size {
            return Err(StorageError::InvalidRange(format!(
                "range end {end} beyond object size {size}"
            )));
        }

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;

        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.write_atomic(&path, &data).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        // Validate the destination up front so a bad key fails before any parts move.
        self.key_path(key).await?;
        let session = Uuid::new_v4().to_string();
        fs::create_dir_all(self.session_dir(&session)?).await?;
        Ok(session)
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put_part(
        &self,
        key: &str,
        session: &str,
        part_index: u32,
        data: Bytes,
    ) -> StorageResult<PartReceipt> {
        let dir = self.session_dir(session)?;
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::UnknownSession {
                key: key.to_string(),
                session: session.to_string(),
            });
        }
        self.write_atomic(&Self::part_path(&dir, part_index), &data)
            .await?;
        Ok(PartReceipt {
            part_index,
            etag: None,
        })
    }

    #[instrument(skip(self, parts), fields(backend = "filesystem", parts = parts.len()))]
    async fn compose_parts(
        &self,
        key: &str,
        session: &str,
        parts: &[PartReceipt],
    ) -> StorageResult<()> {
        if parts.is_empty() {
            return Err(StorageError::MissingPart(format!(
                "{key}: cannot compose an empty part list"
            )));
        }
        let dir = self.session_dir(session)?;
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::UnknownSession {
                key: key.to_string(),
                session: session.to_string(),
            });
        }

        let mut indexes: Vec<u32> = parts.iter().map(|p| p.part_index).collect();
        indexes.sort_unstable();
        indexes.dedup();

        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        let temp_path = temp_sibling(&path);
        let result = async {
            let mut out = fs::File::create(&temp_path).await?;
            for index in &indexes {
                let part_path = Self::part_path(&dir, *index);
                let mut part = fs::File::open(&part_path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        StorageError::MissingPart(format!("{key}: part {index}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                tokio::io::copy(&mut part, &mut out).await?;
            }
            out.sync_all().await?;
            Ok::<_, StorageError>(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        fs::rename(&temp_path, &path).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn abort_multipart(&self, _key: &str, session: &str) -> StorageResult<()> {
        let dir = self.session_dir(session)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| map_not_found(e, key))
    }

    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let page_size = options.normalized_page_size();

        let stream = async_stream::try_stream! {
            // A prefix may end in a partial name ("blobs/ab"); walk its directory
            // and filter on the full key.
            let dir_part = match prefix.rfind('/') {
                Some(idx) => &prefix[..idx],
                None => "",
            };
            let base_path = if dir_part.is_empty() {
                root.clone()
            } else {
                self.key_path(dir_part).await?
            };

            let base_path_exists = match fs::try_exists(&base_path).await {
                Ok(exists) => exists,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => Err(StorageError::Io(e))?,
            };
            if !base_path_exists {
                return;
            }

            let mut stack = vec![base_path];
            let mut current = Vec::with_capacity(page_size);

            while let Some(dir) = stack.pop() {
                let mut entries = fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    // file_type() does not follow symlinks; symlinks are skipped.
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    if !file_type.is_file() {
                        continue;
                    }
                    let Ok(rel) = path.strip_prefix(&root) else {
                        continue;
                    };
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if !key.starts_with(&prefix)
                        || key.starts_with(MULTIPART_DIR)
                        || key.contains(TEMP_MARKER)
                    {
                        continue;
                    }
                    let meta = entry.metadata().await?;
                    current.push(ObjectEntry {
                        key,
                        size: meta.len(),
                        last_modified: meta.modified().ok().map(|t| t.into()),
                    });

                    if current.len() >= page_size {
                        yield ListingPage {
                            entries: std::mem::replace(&mut current, Vec::with_capacity(page_size)),
                        };
                    }
                }
            }

            if !current.is_empty() {
                yield ListingPage { entries: current };
            }
        };

        Box::pin(stream)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}
