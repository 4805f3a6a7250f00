//! Plan-keyed cache for dataframes.
//!
//! A cached dataframe is registered under the indented display of its
//! logical plan. Registration is lazy: the first action whose plan contains
//! the registered subtree executes it once and stores the rows. Every later
//! action rewrites its plan so that the subtree becomes a scan of the stored
//! rows.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use datafusion::arrow::datatypes::{Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::tree_node::{Transformed, TreeNode, TreeNodeRecursion};
use datafusion::common::{Column, DFSchemaRef, TableReference};
use datafusion::dataframe::DataFrame as DFDataFrame;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::datasource::{MemTable, TableProvider, provider_as_source};
use datafusion::execution::SessionState;
use datafusion::logical_expr::{Expr, LogicalPlan, LogicalPlanBuilder};
use datafusion::parquet::arrow::ArrowWriter;
use futures::future::{BoxFuture, FutureExt};
use lakebook_common::{Cache, CacheBuilder, CacheStats};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::StorageLevel;
use crate::conf::RuntimeConfig;
use crate::error::{LakebookError, Result};

const MAX_CACHED_PLANS: u64 = 1_000;

/// Rows of a materialized cache entry.
#[derive(Debug)]
enum CachedData {
    Memory {
        schema: SchemaRef,
        partitions: Vec<Vec<RecordBatch>>,
    },
    Disk {
        schema: SchemaRef,
        path: PathBuf,
    },
}

/// One registered plan.
#[derive(Debug)]
pub struct CacheEntry {
    id: String,
    level: StorageLevel,
    tables: HashSet<String>,
    data: OnceCell<CachedData>,
}

impl CacheEntry {
    pub fn level(&self) -> StorageLevel {
        self.level
    }

    pub fn is_materialized(&self) -> bool {
        self.data.initialized()
    }

    /// Whether the rows were spilled to disk.
    pub fn is_on_disk(&self) -> bool {
        matches!(self.data.get(), Some(CachedData::Disk { .. }))
    }
}

/// Session-wide registry of cached dataframes.
#[derive(Debug)]
pub struct CacheManager {
    entries: Arc<dyn Cache<String, Arc<CacheEntry>>>,
    spill_dir: PathBuf,
    conf: RuntimeConfig,
}

/// Cache key of a logical plan.
pub fn plan_key(plan: &LogicalPlan) -> String {
    plan.display_indent().to_string()
}

/// Lower-cased names of the tables a plan scans.
fn scanned_tables(plan: &LogicalPlan) -> Result<HashSet<String>> {
    let mut tables = HashSet::new();
    plan.apply(|node| {
        if let LogicalPlan::TableScan(scan) = node {
            tables.insert(scan.table_name.table().to_lowercase());
            tables.insert(scan.table_name.to_string().to_lowercase());
        }
        Ok(TreeNodeRecursion::Continue)
    })?;
    Ok(tables)
}

/// Replace scans of views with the view's own plan.
fn inline_views(plan: LogicalPlan) -> Result<LogicalPlan> {
    let transformed = plan.transform_up(|node| {
        if let LogicalPlan::TableScan(scan) = &node {
            if scan.projection.is_none() && scan.filters.is_empty() && scan.fetch.is_none() {
                if let Some(view) = scan.source.get_logical_plan() {
                    let inlined = LogicalPlanBuilder::from(view.into_owned())
                        .alias(scan.table_name.clone())?
                        .build()?;
                    return Ok(Transformed::yes(inlined));
                }
            }
        }
        Ok(Transformed::no(node))
    })?;
    Ok(transformed.data)
}

impl CacheManager {
    pub fn try_new(spill_dir: PathBuf, conf: RuntimeConfig) -> Result<Self> {
        let entries = CacheBuilder::new()
            .max_capacity(MAX_CACHED_PLANS)
            .build::<String, Arc<CacheEntry>>()?;
        Ok(Self {
            entries,
            spill_dir,
            conf,
        })
    }

    /// Register a plan for caching. Rows are computed by the next action.
    pub async fn persist(&self, plan: &LogicalPlan, level: StorageLevel) -> Result<()> {
        if !level.is_cached() {
            return Err(LakebookError::invalid(
                "cannot persist with storage level NONE",
            ));
        }
        let key = plan_key(plan);
        if let Some(existing) = self.entries.peek(&key).await {
            warn!(
                "Asked to cache already cached data (storage level {})",
                existing.level
            );
            return Ok(());
        }
        let entry = CacheEntry {
            id: Uuid::new_v4().simple().to_string(),
            level,
            tables: scanned_tables(plan)?,
            data: OnceCell::new(),
        };
        debug!("Registered cache entry {} with level {}", entry.id, level);
        self.entries.put(key, Arc::new(entry)).await;
        Ok(())
    }

    /// Drop a cached plan. Returns whether it was cached.
    pub async fn unpersist(&self, plan: &LogicalPlan) -> Result<bool> {
        match self.entries.remove(&plan_key(plan)).await {
            Some(entry) => {
                release(&entry).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn storage_level(&self, plan: &LogicalPlan) -> StorageLevel {
        self.entries
            .peek(&plan_key(plan))
            .await
            .map(|e| e.level)
            .unwrap_or_default()
    }

    pub async fn entry(&self, plan: &LogicalPlan) -> Option<Arc<CacheEntry>> {
        self.entries.peek(&plan_key(plan)).await
    }

    /// Drop every cached plan that reads `table`.
    pub async fn invalidate_table(&self, table: &str) -> usize {
        let table = table.to_lowercase();
        let mut removed = 0;
        for key in self.entries.keys().await {
            let Some(entry) = self.entries.peek(&key).await else {
                continue;
            };
            if entry.tables.contains(&table) {
                self.entries.remove(&key).await;
                release(&entry).await;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Invalidated {} cached plans reading {}", removed, table);
        }
        removed
    }

    pub async fn clear(&self) {
        for key in self.entries.keys().await {
            if let Some(entry) = self.entries.remove(&key).await {
                release(&entry).await;
            }
        }
        self.entries.clear().await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.entries.stats().await
    }

    pub async fn len(&self) -> usize {
        self.entries.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.is_empty().await
    }

    /// Rewrite a plan so cached subtrees read their stored rows.
    pub async fn prepare(&self, state: &SessionState, plan: LogicalPlan) -> Result<LogicalPlan> {
        let plan = inline_views(plan)?;
        self.rewrite(state, plan, false).await
    }

    fn rewrite<'a>(
        &'a self,
        state: &'a SessionState,
        plan: LogicalPlan,
        skip_root: bool,
    ) -> BoxFuture<'a, Result<LogicalPlan>> {
        async move {
            let keys: HashSet<String> = self.entries.keys().await.into_iter().collect();
            if keys.is_empty() {
                return self.served_uncached(plan, skip_root).await;
            }

            let mut found: Vec<(String, LogicalPlan)> = Vec::new();
            let mut at_root = true;
            plan.apply(|node| {
                if std::mem::take(&mut at_root) && skip_root {
                    return Ok(TreeNodeRecursion::Continue);
                }
                let key = plan_key(node);
                if keys.contains(&key) {
                    found.push((key, node.clone()));
                    Ok(TreeNodeRecursion::Jump)
                } else {
                    Ok(TreeNodeRecursion::Continue)
                }
            })?;
            if found.is_empty() {
                return self.served_uncached(plan, skip_root).await;
            }

            let mut replacements: HashMap<String, LogicalPlan> = HashMap::new();
            for (key, subtree) in found {
                let Some(entry) = self.entries.get(&key).await else {
                    continue;
                };
                let data = entry
                    .data
                    .get_or_try_init(|| self.materialize(state, &entry, subtree.clone()))
                    .await?;
                let replacement = scan_cached(&entry.id, data, subtree.schema())?;
                replacements.insert(key, replacement);
            }

            let transformed = plan.transform_down(|node| {
                if replacements.is_empty() {
                    return Ok(Transformed::new(node, false, TreeNodeRecursion::Stop));
                }
                match replacements.get(&plan_key(&node)) {
                    Some(replacement) => Ok(Transformed::new(
                        replacement.clone(),
                        true,
                        TreeNodeRecursion::Jump,
                    )),
                    None => Ok(Transformed::no(node)),
                }
            })?;
            Ok(transformed.data)
        }
        .boxed()
    }

    /// An action whose plan touches no cached subtree counts as one miss.
    /// Nested rewrites during materialization are not actions.
    async fn served_uncached(&self, plan: LogicalPlan, nested: bool) -> Result<LogicalPlan> {
        if !nested {
            let _ = self.entries.get(&plan_key(&plan)).await;
        }
        Ok(plan)
    }

    async fn materialize(
        &self,
        state: &SessionState,
        entry: &CacheEntry,
        plan: LogicalPlan,
    ) -> Result<CachedData> {
        let positional = positional_schema(plan.schema());
        let plan = self.rewrite(state, plan, true).await?;
        let partitions = DFDataFrame::new(state.clone(), plan)
            .collect_partitioned()
            .await?;
        let partitions = partitions
            .into_iter()
            .map(|batches| {
                batches
                    .into_iter()
                    .map(|b| RecordBatch::try_new(Arc::clone(&positional), b.columns().to_vec()))
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let size: usize = partitions
            .iter()
            .flatten()
            .map(RecordBatch::get_array_memory_size)
            .sum();

        let spill = match entry.level {
            StorageLevel::DiskOnly => true,
            StorageLevel::MemoryAndDisk => size as u64 > self.conf.cache_max_memory_bytes()?,
            _ => false,
        };
        if !spill {
            info!(
                "Cached entry {} in memory ({} bytes, {} partitions)",
                entry.id,
                size,
                partitions.len()
            );
            return Ok(CachedData::Memory {
                schema: positional,
                partitions,
            });
        }

        tokio::fs::create_dir_all(&self.spill_dir).await?;
        let path = self.spill_dir.join(format!("{}.parquet", entry.id));
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, Arc::clone(&positional), None)?;
        for batch in partitions.iter().flatten() {
            writer.write(batch)?;
        }
        writer.close()?;
        tokio::fs::write(&path, buffer).await?;
        info!(
            "Cached entry {} on disk at {} ({} bytes in memory form)",
            entry.id,
            path.display(),
            size
        );
        Ok(CachedData::Disk {
            schema: positional,
            path,
        })
    }
}

async fn release(entry: &CacheEntry) {
    if let Some(CachedData::Disk { path, .. }) = entry.data.get() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove cache spill file {}: {}", path.display(), e);
        }
    }
}

/// Arrow schema with columns renamed `c0..cN`, so duplicate names survive.
fn positional_schema(schema: &DFSchemaRef) -> SchemaRef {
    let fields: Vec<_> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| f.as_ref().clone().with_name(format!("c{i}")))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Plan reading cached rows, projected back to the original qualified schema.
fn scan_cached(id: &str, data: &CachedData, original: &DFSchemaRef) -> Result<LogicalPlan> {
    let provider: Arc<dyn TableProvider> = match data {
        CachedData::Memory { schema, partitions } => {
            Arc::new(MemTable::try_new(Arc::clone(schema), partitions.clone())?)
        }
        CachedData::Disk { schema, path } => {
            let url = ListingTableUrl::parse(path.to_string_lossy())?;
            let options = ListingOptions::new(Arc::new(ParquetFormat::default()))
                .with_file_extension(".parquet");
            let config = ListingTableConfig::new(url)
                .with_listing_options(options)
                .with_schema(Arc::clone(schema));
            Arc::new(ListingTable::try_new(config)?)
        }
    };
    let name = format!("cached_{id}");
    let relation = TableReference::bare(name.clone());
    let projection: Vec<Expr> = original
        .iter()
        .enumerate()
        .map(|(i, (qualifier, field))| {
            Expr::Column(Column::new(Some(relation.clone()), format!("c{i}")))
                .alias_qualified(qualifier.cloned(), field.name())
        })
        .collect();
    let plan = LogicalPlanBuilder::scan(name, provider_as_source(provider), None)?
        .project(projection)?
        .build()?;
    Ok(plan)
}
