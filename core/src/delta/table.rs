//! Transactional table operations: write, optimize, history and time travel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use datafusion::arrow::array::{ArrayRef, new_null_array};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use datafusion::parquet::basic::Compression;
use datafusion::parquet::file::properties::WriterProperties;
use lakebook_common::{Diagnose, Storage, StorageBuilder};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delta::actions::{
    Action, Add, CommitInfo, FileStats, Format, Metadata, Protocol, to_commit_bytes,
};
use crate::delta::log::{self, DELTA_LOG_DIR, HistoryEntry, Snapshot, commit_path};
use crate::delta::provider::DeltaTableProvider;
use crate::error::{LakebookError, Result};
use crate::types::{StructType, storage_schema};
use crate::writer::SaveMode;

/// Attempts made by a blind append before giving up on conflicts.
pub const MAX_COMMIT_ATTEMPTS: usize = 10;

const ENGINE_INFO: &str = concat!("lakebook/", env!("CARGO_PKG_VERSION"));

/// Options for [`DeltaTable::write`].
#[derive(Debug, Clone, Default)]
pub struct DeltaWriteOptions {
    /// Add columns that the table does not have yet.
    pub merge_schema: bool,
    /// Replace the table schema on overwrite.
    pub overwrite_schema: bool,
    /// Table name recorded in the metadata on creation.
    pub table_name: Option<String>,
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Committed version, `None` when nothing was written.
    pub version: Option<i64>,
    pub num_files_added: usize,
    pub num_files_removed: usize,
}

/// Result of [`DeltaTable::optimize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeMetrics {
    pub version: Option<i64>,
    pub num_files_added: usize,
    pub num_files_removed: usize,
    pub num_batches: usize,
    pub total_considered_files: usize,
}

/// A transactional table rooted at a local directory.
#[derive(Debug, Clone)]
pub struct DeltaTable {
    location: PathBuf,
    storage: Arc<dyn Storage>,
}

impl DeltaTable {
    /// Open (or prepare to create) a table at `location`.
    pub fn new(location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        let storage = StorageBuilder::new().local(&location).build()?;
        Ok(Self { location, storage })
    }

    /// Check whether a directory holds a transaction log.
    pub async fn is_delta_table(location: &Path) -> bool {
        tokio::fs::metadata(location.join(DELTA_LOG_DIR))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub async fn snapshot(&self) -> Result<Option<Snapshot>> {
        Snapshot::try_load(self.storage.as_ref(), None).await
    }

    /// Latest snapshot, failing when the table has no commits.
    pub async fn latest(&self) -> Result<Snapshot> {
        self.snapshot()
            .await?
            .ok_or_else(|| self.not_a_table())
    }

    /// Snapshot as of an older version.
    pub async fn load_version(&self, version: i64) -> Result<Snapshot> {
        Snapshot::try_load(self.storage.as_ref(), Some(version))
            .await?
            .ok_or_else(|| self.not_a_table())
    }

    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        log::history(self.storage.as_ref(), limit).await
    }

    pub fn provider(&self, snapshot: Snapshot) -> DeltaTableProvider {
        DeltaTableProvider::new(self.location.clone(), snapshot)
    }

    fn not_a_table(&self) -> LakebookError {
        LakebookError::delta(format!(
            "{} is not a delta table",
            self.location.display()
        ))
    }

    /// Write partitions of record batches, one data file per non-empty partition.
    pub async fn write(
        &self,
        partitions: Vec<Vec<RecordBatch>>,
        schema: SchemaRef,
        mode: SaveMode,
        options: &DeltaWriteOptions,
    ) -> Result<WriteOutcome> {
        let snapshot = self.snapshot().await?;
        let incoming = storage_schema(&schema)?;

        let (metadata, file_schema) = match (&snapshot, mode) {
            (Some(_), SaveMode::ErrorIfExists) => {
                return Err(LakebookError::PathAlreadyExists(
                    self.location.display().to_string(),
                ));
            }
            (Some(_), SaveMode::Ignore) => {
                debug!(
                    "Table {} exists, skipping write in ignore mode",
                    self.location.display()
                );
                return Ok(WriteOutcome {
                    version: None,
                    num_files_added: 0,
                    num_files_removed: 0,
                });
            }
            (None, _) => (Some(new_metadata(&incoming, options)?), incoming.clone()),
            (Some(snapshot), SaveMode::Append) => {
                let merged = reconcile_schema(&snapshot.schema(), &incoming, options.merge_schema)?;
                let metadata = merged
                    .map(|schema| updated_metadata(snapshot.metadata(), &schema))
                    .transpose()?;
                (metadata, incoming.clone())
            }
            (Some(snapshot), SaveMode::Overwrite) => {
                if options.overwrite_schema {
                    let metadata = updated_metadata(snapshot.metadata(), &incoming)?;
                    (Some(metadata), incoming.clone())
                } else {
                    let merged =
                        reconcile_schema(&snapshot.schema(), &incoming, options.merge_schema)?;
                    let metadata = merged
                        .map(|schema| updated_metadata(snapshot.metadata(), &schema))
                        .transpose()?;
                    (metadata, incoming.clone())
                }
            }
        };

        let mut adds = Vec::new();
        for (index, batches) in partitions.iter().enumerate() {
            if batches.iter().all(|b| b.num_rows() == 0) {
                continue;
            }
            adds.push(self.write_data_file(index, batches, &file_schema, true).await?);
        }

        let removes = match (&snapshot, mode) {
            (Some(snapshot), SaveMode::Overwrite) => {
                let now = now_millis();
                snapshot
                    .files()
                    .iter()
                    .map(|f| Action::Remove(f.to_remove(now, true)))
                    .collect()
            }
            _ => Vec::new(),
        };

        let is_blind_append =
            snapshot.is_some() && mode == SaveMode::Append && metadata.is_none();
        let mut actions = Vec::new();
        if snapshot.is_none() {
            actions.push(Action::Protocol(Protocol::default()));
        }
        if let Some(metadata) = metadata {
            actions.push(Action::Metadata(metadata));
        }
        let num_files_removed = removes.len();
        let num_files_added = adds.len();
        let num_output_rows: usize = partitions.iter().flatten().map(|b| b.num_rows()).sum();
        actions.extend(removes);
        actions.extend(adds.into_iter().map(Action::Add));

        let commit_info = CommitInfo {
            timestamp: None,
            operation: Some("WRITE".to_string()),
            operation_parameters: HashMap::from([
                ("mode".to_string(), json!(mode.as_delta_str())),
                ("partitionBy".to_string(), json!("[]")),
            ]),
            read_version: snapshot.as_ref().map(Snapshot::version),
            is_blind_append: Some(is_blind_append),
            engine_info: Some(ENGINE_INFO.to_string()),
            operation_metrics: HashMap::from([
                ("numFiles".to_string(), json!(num_files_added.to_string())),
                ("numOutputRows".to_string(), json!(num_output_rows.to_string())),
            ]),
        };

        let read_version = snapshot.as_ref().map(Snapshot::version).unwrap_or(-1);
        let version = if is_blind_append {
            self.commit_with_retry(read_version, actions, commit_info, |_| true)
                .await?
        } else {
            self.commit(read_version + 1, &actions, commit_info).await?
        };
        info!(
            "Committed version {} to {} ({} files added, {} removed)",
            version,
            self.location.display(),
            num_files_added,
            num_files_removed
        );
        Ok(WriteOutcome {
            version: Some(version),
            num_files_added,
            num_files_removed,
        })
    }

    /// Compact small files into files of at most `max_file_size` bytes.
    pub async fn optimize(&self, max_file_size: u64) -> Result<OptimizeMetrics> {
        let snapshot = self.latest().await?;
        let table_schema = snapshot.schema();

        let mut candidates: Vec<&Add> = snapshot
            .files()
            .iter()
            .filter(|f| (f.size as u64) < max_file_size)
            .collect();
        candidates.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.path.cmp(&b.path)));

        let mut bins: Vec<Vec<&Add>> = Vec::new();
        let mut current: Vec<&Add> = Vec::new();
        let mut current_size = 0u64;
        for file in candidates.iter().copied() {
            let size = file.size as u64;
            if !current.is_empty() && current_size + size > max_file_size {
                bins.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current.push(file);
            current_size += size;
        }
        if !current.is_empty() {
            bins.push(current);
        }
        bins.retain(|bin| bin.len() > 1);

        let mut metrics = OptimizeMetrics {
            total_considered_files: candidates.len(),
            num_batches: bins.len(),
            ..Default::default()
        };
        if bins.is_empty() {
            info!("Nothing to optimize in {}", self.location.display());
            return Ok(metrics);
        }

        let now = now_millis();
        let mut removed_paths = Vec::new();
        let mut actions = Vec::new();
        for (index, bin) in bins.iter().enumerate() {
            let mut batches = Vec::new();
            for file in bin {
                batches.extend(self.read_data_file(&file.path, &table_schema).await?);
                removed_paths.push(file.path.clone());
                actions.push(Action::Remove(file.to_remove(now, false)));
            }
            let add = self
                .write_data_file(index, &batches, &table_schema, false)
                .await?;
            actions.push(Action::Add(add));
        }
        metrics.num_files_removed = removed_paths.len();
        metrics.num_files_added = bins.len();

        let commit_info = CommitInfo {
            timestamp: None,
            operation: Some("OPTIMIZE".to_string()),
            operation_parameters: HashMap::from([
                ("predicate".to_string(), json!("[]")),
                ("zOrderBy".to_string(), json!("[]")),
            ]),
            read_version: Some(snapshot.version()),
            is_blind_append: Some(false),
            engine_info: Some(ENGINE_INFO.to_string()),
            operation_metrics: HashMap::from([
                (
                    "numRemovedFiles".to_string(),
                    json!(metrics.num_files_removed.to_string()),
                ),
                (
                    "numAddedFiles".to_string(),
                    json!(metrics.num_files_added.to_string()),
                ),
            ]),
        };
        let version = self
            .commit_with_retry(snapshot.version(), actions, commit_info, |latest| {
                removed_paths.iter().all(|p| latest.is_active(p))
            })
            .await?;
        metrics.version = Some(version);
        info!(
            "Optimized {} at version {}: {} files compacted into {}",
            self.location.display(),
            version,
            metrics.num_files_removed,
            metrics.num_files_added
        );
        Ok(metrics)
    }

    /// Write one commit file. A lost race is a `TransactionConflict`.
    async fn commit(
        &self,
        version: i64,
        actions: &[Action],
        mut commit_info: CommitInfo,
    ) -> Result<i64> {
        commit_info.timestamp = Some(now_millis());
        let mut all = Vec::with_capacity(actions.len() + 1);
        all.push(Action::CommitInfo(commit_info));
        all.extend_from_slice(actions);
        let bytes = to_commit_bytes(&all)?;
        if self.storage.put_if_absent(&commit_path(version), bytes).await? {
            Ok(version)
        } else {
            Err(LakebookError::TransactionConflict {
                version,
                message: format!(
                    "another writer committed version {version} of {} first",
                    self.location.display()
                ),
            })
        }
    }

    /// Commit on top of `read_version`, rebasing while `can_rebase` accepts the newer snapshot.
    async fn commit_with_retry<F>(
        &self,
        read_version: i64,
        actions: Vec<Action>,
        commit_info: CommitInfo,
        can_rebase: F,
    ) -> Result<i64>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let mut version = read_version + 1;
        let mut attempt = 1;
        loop {
            match self.commit(version, &actions, commit_info.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < MAX_COMMIT_ATTEMPTS => {
                    let latest = self.latest().await?;
                    if !can_rebase(&latest) {
                        return Err(e);
                    }
                    warn!(
                        "Commit of version {} conflicted, retrying as version {} (attempt {})",
                        version,
                        latest.version() + 1,
                        attempt + 1
                    );
                    version = latest.version() + 1;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_data_file(
        &self,
        index: usize,
        batches: &[RecordBatch],
        schema: &SchemaRef,
        data_change: bool,
    ) -> Result<Add> {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, Arc::clone(schema), Some(props))?;
        let mut num_records = 0;
        for batch in batches {
            let batch = conform_batch(batch, schema)?;
            num_records += batch.num_rows() as i64;
            writer.write(&batch)?;
        }
        writer.close()?;

        let path = format!("part-{index:05}-{}-c000.snappy.parquet", Uuid::new_v4());
        let size = buffer.len() as i64;
        self.storage.put(&path, buffer).await?;
        debug!("Wrote data file {} ({} rows, {} bytes)", path, num_records, size);
        Ok(Add {
            path,
            partition_values: HashMap::new(),
            size,
            modification_time: now_millis(),
            data_change,
            stats: Some(serde_json::to_string(&FileStats { num_records })?),
        })
    }

    async fn read_data_file(&self, path: &str, schema: &SchemaRef) -> Result<Vec<RecordBatch>> {
        let bytes: Bytes = self
            .storage
            .get(path)
            .await?
            .ok_or_else(|| LakebookError::delta(format!("data file {path} is missing")))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
        reader
            .map(|batch| conform_batch(&batch?, schema))
            .collect()
    }
}

/// Reorder and cast a batch to `schema`, filling absent columns with nulls.
pub(crate) fn conform_batch(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(column) if column.data_type() == field.data_type() => Ok(Arc::clone(column)),
            Some(column) => Ok(cast(column, field.data_type())?),
            None => Ok(new_null_array(field.data_type(), batch.num_rows())),
        })
        .collect::<Result<Vec<ArrayRef>>>()?;
    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}

/// Check an incoming schema against the table schema.
///
/// Returns the merged schema when new columns are added.
fn reconcile_schema(
    table: &SchemaRef,
    incoming: &SchemaRef,
    merge_schema: bool,
) -> Result<Option<SchemaRef>> {
    let mut new_fields: Vec<Field> = Vec::new();
    for field in incoming.fields() {
        match table.field_with_name(field.name()) {
            Ok(existing) if existing.data_type() == field.data_type() => {}
            Ok(existing) => {
                return Err(LakebookError::analysis(format!(
                    "failed to merge fields '{}': incompatible types {} and {}",
                    field.name(),
                    existing.data_type(),
                    field.data_type()
                )));
            }
            Err(_) => new_fields.push(field.as_ref().clone().with_nullable(true)),
        }
    }
    if new_fields.is_empty() {
        return Ok(None);
    }
    if !merge_schema {
        let names: Vec<_> = new_fields.iter().map(|f| f.name().as_str()).collect();
        return Err(LakebookError::analysis(format!(
            "a schema mismatch detected when writing to the delta table: \
             new columns [{}]; set option mergeSchema to true to add them",
            names.join(", ")
        )));
    }
    let mut fields: Vec<Field> = table.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.extend(new_fields);
    Ok(Some(Arc::new(Schema::new(fields))))
}

fn new_metadata(schema: &Schema, options: &DeltaWriteOptions) -> Result<Metadata> {
    Ok(Metadata {
        id: Uuid::new_v4().to_string(),
        name: options.table_name.clone(),
        description: None,
        format: Format::default(),
        schema_string: StructType::try_from_arrow(schema)?.to_json()?,
        partition_columns: vec![],
        configuration: HashMap::new(),
        created_time: Some(now_millis()),
    })
}

fn updated_metadata(current: &Metadata, schema: &Schema) -> Result<Metadata> {
    Ok(Metadata {
        schema_string: StructType::try_from_arrow(schema)?.to_json()?,
        ..current.clone()
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int32Array, Int64Array};
    use datafusion::arrow::datatypes::DataType;

    fn batch(ids: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(ids))]).unwrap()
    }

    #[tokio::test]
    async fn test_create_append_and_time_travel() {
        let dir = tempfile::tempdir().unwrap();
        let table = DeltaTable::new(dir.path().join("t")).unwrap();
        let b = batch(vec![1, 2, 3]);
        let schema = b.schema();

        let outcome = table
            .write(vec![vec![b.clone()]], schema.clone(), SaveMode::ErrorIfExists, &Default::default())
            .await
            .unwrap();
        assert_eq!(outcome.version, Some(0));
        assert!(DeltaTable::is_delta_table(table.location()).await);

        let outcome = table
            .write(vec![vec![batch(vec![4])]], schema.clone(), SaveMode::Append, &Default::default())
            .await
            .unwrap();
        assert_eq!(outcome.version, Some(1));

        let latest = table.latest().await.unwrap();
        assert_eq!(latest.files().len(), 2);
        assert_eq!(latest.num_records(), Some(4));
        assert_eq!(table.load_version(0).await.unwrap().num_records(), Some(3));
        assert!(table.load_version(5).await.is_err());

        let err = table
            .write(vec![vec![b]], schema, SaveMode::ErrorIfExists, &Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LakebookError::PathAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_commit_conflict_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let table = DeltaTable::new(dir.path()).unwrap();
        table.commit(0, &[], CommitInfo::default()).await.unwrap();
        let err = table.commit(0, &[], CommitInfo::default()).await.unwrap_err();
        assert!(matches!(err, LakebookError::TransactionConflict { version: 0, .. }));
    }

    #[test]
    fn test_reconcile_schema() {
        let table = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)]));
        let wider = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        assert!(reconcile_schema(&table, &table, false).unwrap().is_none());
        assert!(reconcile_schema(&table, &wider, false).is_err());
        let merged = reconcile_schema(&table, &wider, true).unwrap().unwrap();
        assert_eq!(merged.fields().len(), 2);

        let wrong = Arc::new(Schema::new(vec![Field::new("id", DataType::Utf8, true)]));
        assert!(reconcile_schema(&table, &wrong, true).is_err());
    }

    #[test]
    fn test_conform_batch_fills_missing_columns() {
        let target = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("id", DataType::Int64, true),
        ]));
        let source = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, true)])),
            vec![Arc::new(Int32Array::from(vec![7, 8]))],
        )
        .unwrap();
        let out = conform_batch(&source, &target).unwrap();
        assert_eq!(out.num_columns(), 2);
        assert_eq!(out.column(0).null_count(), 2);
        assert_eq!(out.column(1).data_type(), &DataType::Int64);
    }
}
