//! Transaction log layout and snapshot replay.

use std::sync::Arc;

use datafusion::arrow::datatypes::SchemaRef;
use lakebook_common::Storage;
use tracing::debug;

use crate::delta::actions::{Action, Add, CommitInfo, Metadata, Protocol, parse_commit_bytes};
use crate::error::{LakebookError, Result};
use crate::types::StructType;

pub const DELTA_LOG_DIR: &str = "_delta_log";

/// Path of the commit file for a version, relative to the table root.
pub fn commit_path(version: i64) -> String {
    format!("{DELTA_LOG_DIR}/{version:020}.json")
}

fn parse_commit_version(path: &str) -> Option<i64> {
    let name = path.rsplit('/').next()?;
    let digits = name.strip_suffix(".json")?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// All committed versions, ascending.
pub async fn list_versions(storage: &dyn Storage) -> Result<Vec<i64>> {
    let mut versions: Vec<i64> = storage
        .list(Some(DELTA_LOG_DIR))
        .await?
        .iter()
        .filter_map(|entry| parse_commit_version(&entry.path))
        .collect();
    versions.sort_unstable();
    Ok(versions)
}

pub async fn read_commit(storage: &dyn Storage, version: i64) -> Result<Vec<Action>> {
    let bytes = storage
        .get(&commit_path(version))
        .await?
        .ok_or_else(|| LakebookError::delta(format!("commit file for version {version} is missing")))?;
    parse_commit_bytes(&bytes)
}

/// State of a table as of one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: i64,
    protocol: Protocol,
    metadata: Metadata,
    files: Vec<Add>,
    schema: SchemaRef,
}

impl Snapshot {
    /// Replay the log up to `version` (latest when `None`).
    ///
    /// Returns `None` when the table has no commits yet.
    pub async fn try_load(storage: &dyn Storage, version: Option<i64>) -> Result<Option<Self>> {
        let versions = list_versions(storage).await?;
        let Some(&latest) = versions.last() else {
            return Ok(None);
        };
        let target = match version {
            Some(v) if v < 0 || v > latest => {
                return Err(LakebookError::delta(format!(
                    "cannot time travel to version {v}; available versions are 0 to {latest}"
                )));
            }
            Some(v) => v,
            None => latest,
        };

        let mut protocol = None;
        let mut metadata = None;
        let mut files: Vec<Add> = Vec::new();
        for v in versions.into_iter().take_while(|v| *v <= target) {
            for action in read_commit(storage, v).await? {
                match action {
                    Action::Protocol(p) => protocol = Some(p),
                    Action::Metadata(m) => metadata = Some(m),
                    Action::Add(add) => {
                        files.retain(|f| f.path != add.path);
                        files.push(add);
                    }
                    Action::Remove(remove) => files.retain(|f| f.path != remove.path),
                    Action::CommitInfo(_) => {}
                }
            }
        }
        let metadata = metadata
            .ok_or_else(|| LakebookError::delta(format!("no metadata found at version {target}")))?;
        let schema = StructType::parse(&metadata.schema_string)?.to_arrow()?;
        debug!(
            "Loaded snapshot version {} with {} active files",
            target,
            files.len()
        );
        Ok(Some(Self {
            version: target,
            protocol: protocol.unwrap_or_default(),
            metadata,
            files,
            schema,
        }))
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn files(&self) -> &[Add] {
        &self.files
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn is_active(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// Row count from file statistics, if every file carries them.
    pub fn num_records(&self) -> Option<i64> {
        self.files.iter().map(Add::num_records).sum()
    }
}

/// One entry of `DESCRIBE HISTORY`.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub version: i64,
    pub commit_info: CommitInfo,
}

/// Commit information, newest first.
pub async fn history(storage: &dyn Storage, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
    let versions = list_versions(storage).await?;
    let limit = limit.unwrap_or(usize::MAX);
    let mut entries = Vec::new();
    for version in versions.into_iter().rev().take(limit) {
        let commit_info = read_commit(storage, version)
            .await?
            .into_iter()
            .find_map(|action| match action {
                Action::CommitInfo(info) => Some(info),
                _ => None,
            })
            .unwrap_or_default();
        entries.push(HistoryEntry {
            version,
            commit_info,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_path() {
        assert_eq!(commit_path(0), "_delta_log/00000000000000000000.json");
        assert_eq!(commit_path(12), "_delta_log/00000000000000000012.json");
        assert_eq!(parse_commit_version(&commit_path(12)), Some(12));
        assert_eq!(parse_commit_version("_delta_log/00000000000000000010.checkpoint.parquet"), None);
        assert_eq!(parse_commit_version("_delta_log/_last_checkpoint"), None);
    }
}
