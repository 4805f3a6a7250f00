//! File system utilities over the local storage.
//!
//! `dbfs:/` paths resolve under the configured DBFS root directory. Plain
//! paths and `file:` URIs address the local file system directly.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use lakebook_common::{CommonError, ObjectEntry, Storage, StorageBuilder};
use tracing::info;

use crate::error::{LakebookError, Result};

pub const DBFS_SCHEME: &str = "dbfs:";
const DEFAULT_HEAD_BYTES: usize = 65_536;

/// Map a user-facing path to a local path.
pub fn resolve_path(dbfs_root: &Path, path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix(DBFS_SCHEME) {
        let relative = normalize_relative(rest)?;
        return Ok(dbfs_root.join(relative));
    }
    let local = path
        .strip_prefix("file://")
        .or_else(|| path.strip_prefix("file:"))
        .unwrap_or(path);
    Ok(std::path::absolute(local)?)
}

fn normalize_relative(path: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(LakebookError::invalid(format!(
                    "path '{path}' escapes the DBFS root"
                )));
            }
        }
    }
    Ok(out)
}

/// One entry returned by `ls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modification_time: i64,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// A path resolved to a storage and a key inside it.
struct Location {
    storage: Arc<dyn Storage>,
    key: String,
    display_prefix: String,
}

impl Location {
    fn display(&self, key: &str) -> String {
        format!("{}{}", self.display_prefix, key)
    }

    fn local_path(&self) -> Option<PathBuf> {
        self.storage.local_root().map(|root| root.join(&self.key))
    }
}

/// `dbutils.fs` equivalent.
#[derive(Debug)]
pub struct FileSystemUtils {
    dbfs: Arc<dyn Storage>,
    local: Arc<dyn Storage>,
}

impl FileSystemUtils {
    pub fn try_new(dbfs_root: &Path) -> Result<Self> {
        Ok(Self {
            dbfs: StorageBuilder::new().local(dbfs_root).build()?,
            local: StorageBuilder::new().local("/").build()?,
        })
    }

    fn locate(&self, path: &str) -> Result<Location> {
        if let Some(rest) = path.strip_prefix(DBFS_SCHEME) {
            let key = normalize_relative(rest)?.to_string_lossy().into_owned();
            return Ok(Location {
                storage: Arc::clone(&self.dbfs),
                key,
                display_prefix: "dbfs:/".to_string(),
            });
        }
        let (display_prefix, local) = if let Some(rest) = path.strip_prefix("file://") {
            ("file:///", rest)
        } else if let Some(rest) = path.strip_prefix("file:") {
            ("file:/", rest)
        } else {
            ("/", path)
        };
        let absolute = std::path::absolute(local)?;
        let key = absolute
            .to_string_lossy()
            .trim_start_matches('/')
            .to_string();
        Ok(Location {
            storage: Arc::clone(&self.local),
            key,
            display_prefix: display_prefix.to_string(),
        })
    }

    /// List a directory. Directories come first, with a trailing `/`.
    pub async fn ls(&self, path: &str) -> Result<Vec<FileInfo>> {
        let location = self.locate(path)?;
        if let Some(entry) = location.storage.head(&location.key).await? {
            return Ok(vec![file_info(&location, &entry)]);
        }
        let is_dir = match location.local_path() {
            Some(p) => tokio::fs::metadata(&p).await.is_ok_and(|m| m.is_dir()),
            None => true,
        };
        if !is_dir {
            return Err(CommonError::not_found(format!("file {path} does not exist")).into());
        }
        let listing = location
            .storage
            .list_with_delimiter(Some(&location.key))
            .await?;
        let mut files: Vec<FileInfo> = listing
            .directories
            .iter()
            .map(|dir| FileInfo {
                path: format!("{}/", location.display(dir)),
                name: format!("{}/", last_segment(dir)),
                size: 0,
                modification_time: 0,
            })
            .collect();
        files.extend(listing.objects.iter().map(|o| file_info(&location, o)));
        Ok(files)
    }

    pub async fn mkdirs(&self, path: &str) -> Result<bool> {
        let location = self.locate(path)?;
        location.storage.create_dir(&location.key).await?;
        Ok(true)
    }

    /// Write a string to a file. Returns the number of bytes written.
    pub async fn put(&self, path: &str, contents: &str, overwrite: bool) -> Result<usize> {
        let location = self.locate(path)?;
        if !overwrite && location.storage.exists(&location.key).await? {
            return Err(LakebookError::PathAlreadyExists(path.to_string()));
        }
        let bytes = contents.as_bytes().to_vec();
        let len = bytes.len();
        location.storage.put(&location.key, bytes).await?;
        info!("Wrote {} bytes to {}", len, path);
        Ok(len)
    }

    /// First `max_bytes` bytes of a file as UTF-8 text.
    pub async fn head(&self, path: &str, max_bytes: Option<usize>) -> Result<String> {
        let location = self.locate(path)?;
        let bytes = location
            .storage
            .get(&location.key)
            .await?
            .ok_or_else(|| CommonError::not_found(format!("file {path} does not exist")))?;
        let end = bytes.len().min(max_bytes.unwrap_or(DEFAULT_HEAD_BYTES));
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Remove a file or directory. Returns whether anything was removed.
    pub async fn rm(&self, path: &str, recurse: bool) -> Result<bool> {
        let location = self.locate(path)?;
        if location.storage.exists(&location.key).await? {
            location.storage.delete(&location.key).await?;
            return Ok(true);
        }
        let Some(dir) = location.local_path() else {
            return Ok(false);
        };
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(false);
        }
        let children = location.storage.list(Some(&location.key)).await?;
        if !children.is_empty() && !recurse {
            return Err(LakebookError::invalid(format!(
                "cannot remove non-empty directory {path} without recurse"
            )));
        }
        for child in &children {
            location.storage.delete(&child.path).await?;
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(true)
    }
}

fn last_segment(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or(key)
}

fn file_info(location: &Location, entry: &ObjectEntry) -> FileInfo {
    FileInfo {
        path: location.display(&entry.path),
        name: last_segment(&entry.path).to_string(),
        size: entry.size,
        modification_time: entry.last_modified_ms,
    }
}
