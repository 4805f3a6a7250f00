//! Object storage abstraction using trait-based design.
//!
//! Paths are `/`-separated and relative to the storage root. Table data,
//! transaction logs, cache spill files and the notebook file utilities all
//! go through this interface so that commit atomicity (`put_if_absent`) is
//! provided by `object_store` instead of ad-hoc file handling.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::{
    ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, local::LocalFileSystem,
    memory::InMemory, path::Path as ObjectPath,
};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::{CommonError, ErrorContext, Result};

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Path relative to the storage root.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time in milliseconds since the epoch.
    pub last_modified_ms: i64,
}

impl From<ObjectMeta> for ObjectEntry {
    fn from(meta: ObjectMeta) -> Self {
        Self {
            path: meta.location.to_string(),
            size: meta.size,
            last_modified_ms: meta.last_modified.timestamp_millis(),
        }
    }
}

/// One level of a hierarchical listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Child directories, relative to the storage root, without trailing slash.
    pub directories: Vec<String>,
    /// Objects directly under the listed prefix.
    pub objects: Vec<ObjectEntry>,
}

/// Generic storage trait for async path-based operations.
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Local directory backing this storage, if any.
    fn local_root(&self) -> Option<&Path>;

    /// Read an object, `None` if it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Bytes>>;

    /// Write an object, replacing any previous content.
    async fn put(&self, path: &str, value: Vec<u8>) -> Result<()>;

    /// Write an object only if nothing exists at `path`.
    ///
    /// Returns `false` when the object already exists.
    async fn put_if_absent(&self, path: &str, value: Vec<u8>) -> Result<bool>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Fetch object metadata, `None` if it does not exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectEntry>>;

    /// Check if an object exists.
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.head(path).await?.is_some())
    }

    /// Recursively list all objects under a prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectEntry>>;

    /// List one directory level under a prefix.
    async fn list_with_delimiter(&self, prefix: Option<&str>) -> Result<Listing>;

    /// Create a directory (a no-op for flat stores).
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Get storage statistics.
    async fn stats(&self) -> StorageStats;
}

/// Storage statistics.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub read_count: u64,
    pub write_count: u64,
    pub delete_count: u64,
    pub conflict_count: u64,
    pub error_count: u64,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageBackend {
    /// In-memory storage for testing and development.
    #[default]
    Memory,
    /// Local filesystem storage rooted at a directory, created on build.
    LocalFileSystem { root_path: PathBuf },
}

/// Builder for creating storage instances.
#[derive(Default)]
pub struct StorageBuilder {
    backend: StorageBackend,
}

impl StorageBuilder {
    /// Create a new storage builder with the in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend.
    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Shorthand for a local filesystem backend.
    pub fn local<P: Into<PathBuf>>(self, root_path: P) -> Self {
        self.backend(StorageBackend::LocalFileSystem {
            root_path: root_path.into(),
        })
    }

    /// Build a storage instance with the specified configuration.
    pub fn build(self) -> Result<Arc<dyn Storage>> {
        let storage = ObjectStoreStorage::new(self.backend)?;
        Ok(Arc::new(storage))
    }
}

#[derive(Debug, Default)]
struct InternalStorageStats {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    conflicts: AtomicU64,
    errors: AtomicU64,
}

impl InternalStorageStats {
    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn get_stats(&self) -> StorageStats {
        StorageStats {
            read_count: self.reads.load(Ordering::Acquire),
            write_count: self.writes.load(Ordering::Acquire),
            delete_count: self.deletes.load(Ordering::Acquire),
            conflict_count: self.conflicts.load(Ordering::Acquire),
            error_count: self.errors.load(Ordering::Acquire),
        }
    }
}

/// Object store-based storage implementation.
struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    root: Option<PathBuf>,
    stats: InternalStorageStats,
}

impl Debug for ObjectStoreStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreStorage")
            .field("root", &self.root)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ObjectStoreStorage {
    fn new(backend: StorageBackend) -> Result<Self> {
        let (store, root): (Arc<dyn ObjectStore>, Option<PathBuf>) = match backend {
            StorageBackend::Memory => (Arc::new(InMemory::new()), None),
            StorageBackend::LocalFileSystem { root_path } => {
                std::fs::create_dir_all(&root_path).with_io_context(|| {
                    format!("Failed to create storage root {}", root_path.display())
                })?;
                let fs = LocalFileSystem::new_with_prefix(&root_path).with_storage_context(|| {
                    format!(
                        "Failed to create local filesystem storage at {}",
                        root_path.display()
                    )
                })?;
                (Arc::new(fs), Some(root_path))
            }
        };
        Ok(Self {
            store,
            root,
            stats: InternalStorageStats::default(),
        })
    }

    fn object_path(path: &str) -> Result<ObjectPath> {
        ObjectPath::parse(path.trim_matches('/'))
            .with_storage_context(|| format!("Invalid object path '{path}'"))
    }

    fn convert_error(&self, error: object_store::Error) -> CommonError {
        self.stats.record_error();
        CommonError::storage("Object store operation failed", error)
    }
}

#[async_trait]
impl Storage for ObjectStoreStorage {
    fn local_root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        let location = Self::object_path(path)?;
        match self.store.get(&location).await {
            Ok(result) => {
                self.stats.record_read();
                let bytes = result.bytes().await.map_err(|e| self.convert_error(e))?;
                Ok(Some(bytes))
            }
            Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_read();
                Ok(None)
            }
            Err(e) => Err(self.convert_error(e)),
        }
    }

    async fn put(&self, path: &str, value: Vec<u8>) -> Result<()> {
        let location = Self::object_path(path)?;
        self.store
            .put(&location, PutPayload::from(value))
            .await
            .map_err(|e| self.convert_error(e))?;
        self.stats.record_write();
        Ok(())
    }

    async fn put_if_absent(&self, path: &str, value: Vec<u8>) -> Result<bool> {
        let location = Self::object_path(path)?;
        let options = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .store
            .put_opts(&location, PutPayload::from(value), options)
            .await
        {
            Ok(_) => {
                self.stats.record_write();
                Ok(true)
            }
            Err(object_store::Error::AlreadyExists { .. }) => {
                debug!("Object {} already exists", path);
                self.stats.record_conflict();
                Ok(false)
            }
            Err(e) => Err(self.convert_error(e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = Self::object_path(path)?;
        match self.store.delete(&location).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_delete();
                Ok(())
            }
            Err(e) => Err(self.convert_error(e)),
        }
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectEntry>> {
        let location = Self::object_path(path)?;
        match self.store.head(&location).await {
            Ok(meta) => {
                self.stats.record_read();
                Ok(Some(meta.into()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(self.convert_error(e)),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectEntry>> {
        let prefix = prefix
            .filter(|p| !p.trim_matches('/').is_empty())
            .map(Self::object_path)
            .transpose()?;
        let mut entries = Vec::new();
        let mut stream = self.store.list(prefix.as_ref());
        while let Some(result) = stream.next().await {
            match result {
                Ok(meta) => entries.push(ObjectEntry::from(meta)),
                Err(object_store::Error::NotFound { .. }) => break,
                Err(e) => return Err(self.convert_error(e)),
            }
        }
        self.stats.record_read();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn list_with_delimiter(&self, prefix: Option<&str>) -> Result<Listing> {
        let prefix = prefix
            .filter(|p| !p.trim_matches('/').is_empty())
            .map(Self::object_path)
            .transpose()?;
        let result = match self.store.list_with_delimiter(prefix.as_ref()).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(Listing::default()),
            Err(e) => return Err(self.convert_error(e)),
        };
        self.stats.record_read();
        let mut directories: Vec<String> = result
            .common_prefixes
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        directories.sort();
        let mut objects: Vec<ObjectEntry> =
            result.objects.into_iter().map(ObjectEntry::from).collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Listing {
            directories,
            objects,
        })
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        if let Some(root) = &self.root {
            let dir = root.join(path.trim_matches('/'));
            tokio::fs::create_dir_all(&dir)
                .await
                .with_io_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    async fn stats(&self) -> StorageStats {
        self.stats.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_storage_basic_operations() {
        let storage = StorageBuilder::new().build().expect("memory storage");

        storage
            .put("tables/t1/part-0.parquet", b"abc".to_vec())
            .await
            .expect("Failed to put");
        let value = storage.get("tables/t1/part-0.parquet").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"abc"[..]));

        assert!(storage.exists("tables/t1/part-0.parquet").await.unwrap());
        storage.delete("tables/t1/part-0.parquet").await.unwrap();
        assert!(!storage.exists("tables/t1/part-0.parquet").await.unwrap());
        // deleting twice is fine
        storage.delete("tables/t1/part-0.parquet").await.unwrap();
        assert_eq!(storage.get("tables/t1/part-0.parquet").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_if_absent_detects_conflict() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let storage = StorageBuilder::new()
            .local(temp_dir.path())
            .build()
            .expect("Failed to create local filesystem storage");

        let log_file = "_delta_log/00000000000000000000.json";
        assert!(storage.put_if_absent(log_file, b"first".to_vec()).await.unwrap());
        assert!(!storage.put_if_absent(log_file, b"second".to_vec()).await.unwrap());

        let value = storage.get(log_file).await.unwrap().unwrap();
        assert_eq!(&value[..], b"first");
        assert_eq!(storage.stats().await.conflict_count, 1);
    }

    #[tokio::test]
    async fn test_listing() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let storage = StorageBuilder::new()
            .local(temp_dir.path())
            .build()
            .unwrap();

        storage.put("FileStore/a.csv", b"x,y\n".to_vec()).await.unwrap();
        storage.put("FileStore/sub/b.csv", b"x\n".to_vec()).await.unwrap();
        storage.put("other/c.csv", b"1".to_vec()).await.unwrap();

        let all = storage.list(Some("FileStore")).await.unwrap();
        let paths: Vec<_> = all.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["FileStore/a.csv", "FileStore/sub/b.csv"]);

        let listing = storage.list_with_delimiter(Some("FileStore")).await.unwrap();
        assert_eq!(listing.directories, vec!["FileStore/sub".to_string()]);
        assert_eq!(listing.objects.len(), 1);
        assert_eq!(listing.objects[0].size, 4);

        let missing = storage.list(Some("does/not/exist")).await.unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_create_dir_local() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageBuilder::new()
            .local(temp_dir.path())
            .build()
            .unwrap();
        storage.create_dir("FileStore/empty").await.unwrap();
        assert!(temp_dir.path().join("FileStore/empty").is_dir());
        assert_eq!(storage.local_root(), Some(temp_dir.path()));
    }
}
