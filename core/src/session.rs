//! Session: the entry point that owns configuration, catalog and caches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use datafusion::arrow::array::Int64Array;
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::TableReference;
use datafusion::dataframe::DataFrame as DFDataFrame;
use datafusion::datasource::{MemTable, provider_as_source};
use datafusion::execution::SessionStateBuilder;
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::logical_expr::LogicalPlanBuilder;
use datafusion::prelude::{SessionConfig, SessionContext};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::catalog::{Catalog, DEFAULT_CATALOG, SESSION_SCHEMA};
use crate::conf::{self, ConfListener, RuntimeConfig};
use crate::dataframe::DataFrame;
use crate::error::{LakebookError, Result};
use crate::functions::UserDefinedFunction;
use crate::reader::DataFrameReader;
use crate::utils::{NotebookUtils, fs::resolve_path};

static ACTIVE_SESSION: LazyLock<Mutex<Option<Session>>> = LazyLock::new(|| Mutex::new(None));

const DEFAULT_APP_NAME: &str = "lakebook";
const DEFAULT_MASTER: &str = "local[*]";

/// Builder for [`Session`], mirroring `SparkSession.builder`.
#[derive(Debug, Default, Clone)]
pub struct SessionBuilder {
    options: Vec<(String, String)>,
}

impl SessionBuilder {
    pub fn app_name(self, name: impl Into<String>) -> Self {
        self.config(conf::APP_NAME, name)
    }

    pub fn master(self, master: impl Into<String>) -> Self {
        self.config(conf::MASTER, master)
    }

    pub fn config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    /// Return the active session, or create one and make it active.
    ///
    /// Runtime options of this builder are applied to an existing session.
    /// Static options cannot change once a session exists and are ignored
    /// with a warning.
    pub fn get_or_create(self) -> Result<Session> {
        let mut active = ACTIVE_SESSION
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = active.as_ref() {
            self.apply_to(session)?;
            return Ok(session.clone());
        }
        let session = self.create()?;
        *active = Some(session.clone());
        Ok(session)
    }

    fn apply_to(&self, session: &Session) -> Result<()> {
        for (key, value) in &self.options {
            if conf::is_static(key) {
                if session.conf().get(key).as_deref() != Some(value.as_str()) {
                    warn!(
                        "Using an existing session; the static config {} cannot be changed to {}",
                        key, value
                    );
                }
            } else {
                session.conf().set(key, value.clone())?;
            }
        }
        Ok(())
    }

    /// Build a new session that is not registered as the active one.
    pub fn create(self) -> Result<Session> {
        let mut values: HashMap<String, String> = self.options.into_iter().collect();
        values
            .entry(conf::APP_NAME.to_string())
            .or_insert_with(|| DEFAULT_APP_NAME.to_string());
        values
            .entry(conf::MASTER.to_string())
            .or_insert_with(|| DEFAULT_MASTER.to_string());
        let master_partitions = conf::parse_master(&values[conf::MASTER])?;

        let initial = RuntimeConfig::new(values.clone());
        let target_partitions = initial.shuffle_partitions()?.unwrap_or(master_partitions);
        let mut config = SessionConfig::new()
            .with_target_partitions(target_partitions)
            .with_information_schema(true)
            .with_create_default_catalog_and_schema(true)
            .with_default_catalog_and_schema(DEFAULT_CATALOG, SESSION_SCHEMA);
        config.options_mut().execution.parquet.schema_force_view_types = false;

        let mut runtime = RuntimeEnvBuilder::new();
        if let Some(limit) = initial.driver_memory()? {
            runtime = runtime.with_memory_limit(limit as usize, 1.0);
        }
        let state = SessionStateBuilder::new()
            .with_config(config)
            .with_runtime_env(runtime.build_arc()?)
            .with_default_features()
            .build();
        let ctx = SessionContext::new_with_state(state);

        let listener_ctx = ctx.clone();
        let listener: ConfListener = Arc::new(move |key, value| {
            if key == conf::SHUFFLE_PARTITIONS {
                let partitions = value
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(master_partitions);
                listener_ctx
                    .state_ref()
                    .write()
                    .config_mut()
                    .options_mut()
                    .execution
                    .target_partitions = partitions;
                debug!("Target partitions set to {}", partitions);
            }
        });
        let conf = RuntimeConfig::new(values).with_listener(listener);

        let warehouse = std::path::absolute(
            conf.get_or(conf::WAREHOUSE_DIR, conf::DEFAULT_WAREHOUSE_DIR),
        )?;
        let dbfs_root = std::path::absolute(conf.get_or(conf::DBFS_ROOT, conf::DEFAULT_DBFS_ROOT))?;
        let id = Uuid::new_v4().to_string();
        let local_dir = std::env::temp_dir().join(format!("lakebook-{id}"));

        let catalog = Catalog::try_new(ctx.clone(), warehouse.clone())?;
        let cache_manager = CacheManager::try_new(local_dir.join("cache"), conf.clone())?;
        let utils = NotebookUtils::try_new(&dbfs_root)?;

        info!(
            "Created session {} for {} (master {}, {} target partitions, warehouse {})",
            id,
            conf.get_or(conf::APP_NAME, DEFAULT_APP_NAME),
            conf.get_or(conf::MASTER, DEFAULT_MASTER),
            target_partitions,
            warehouse.display()
        );
        Ok(Session {
            inner: Arc::new(SessionInner {
                id,
                ctx,
                conf,
                catalog,
                cache_manager,
                utils,
                warehouse,
                dbfs_root,
                local_dir,
                next_alias: AtomicU64::new(0),
            }),
        })
    }
}

struct SessionInner {
    id: String,
    ctx: SessionContext,
    conf: RuntimeConfig,
    catalog: Catalog,
    cache_manager: CacheManager,
    utils: NotebookUtils,
    warehouse: PathBuf,
    dbfs_root: PathBuf,
    local_dir: PathBuf,
    next_alias: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.local_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.local_dir) {
                warn!(
                    "Failed to remove session directory {}: {}",
                    self.local_dir.display(),
                    e
                );
            }
        }
    }
}

/// A handle to a session. Clones share all state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("app_name", &self.app_name())
            .finish()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The session registered by [`SessionBuilder::get_or_create`], if any.
    pub fn active() -> Option<Session> {
        ACTIVE_SESSION
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Release the active slot if this session holds it.
    pub fn stop(&self) {
        let mut active = ACTIVE_SESSION
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.inner, &self.inner))
        {
            *active = None;
            info!("Stopped session {}", self.inner.id);
        }
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn app_name(&self) -> String {
        self.inner.conf.get_or(conf::APP_NAME, DEFAULT_APP_NAME)
    }

    pub fn conf(&self) -> &RuntimeConfig {
        &self.inner.conf
    }

    pub fn ctx(&self) -> &SessionContext {
        &self.inner.ctx
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn cache_manager(&self) -> &CacheManager {
        &self.inner.cache_manager
    }

    pub fn utils(&self) -> &NotebookUtils {
        &self.inner.utils
    }

    pub fn udf(&self) -> UdfRegistration<'_> {
        UdfRegistration { session: self }
    }

    pub fn warehouse_dir(&self) -> &Path {
        &self.inner.warehouse
    }

    pub fn dbfs_root(&self) -> &Path {
        &self.inner.dbfs_root
    }

    pub fn local_dir(&self) -> &Path {
        &self.inner.local_dir
    }

    /// Map a user path (`dbfs:/`, `file:` or plain) to a local path.
    pub fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        resolve_path(&self.inner.dbfs_root, path)
    }

    pub fn read(&self) -> DataFrameReader {
        DataFrameReader::new(self.clone())
    }

    /// Wrap a source relation in a fresh alias so its columns can be told
    /// apart from those of other sources.
    pub(crate) fn source(&self, df: DFDataFrame) -> Result<DataFrame> {
        let n = self.inner.next_alias.fetch_add(1, Ordering::Relaxed);
        let df = df.alias(&format!("df_{n}"))?;
        Ok(DataFrame::new(self.clone(), df))
    }

    /// A persistent table or temporary view.
    pub async fn table(&self, name: &str) -> Result<DataFrame> {
        let provider = self
            .catalog()
            .lookup(name)
            .await?
            .ok_or_else(|| LakebookError::TableNotFound(name.to_string()))?;
        let (db, table) = self.catalog().resolve_name(name)?;
        let relation = if self.catalog().is_temp_view(name) {
            TableReference::bare(table)
        } else {
            TableReference::partial(db, table)
        };
        let plan = LogicalPlanBuilder::scan(relation, provider_as_source(provider), None)?.build()?;
        self.source(DFDataFrame::new(self.ctx().state(), plan))
    }

    pub async fn sql(&self, query: &str) -> Result<DataFrame> {
        crate::sql::execute(self, query).await
    }

    pub fn create_dataframe(&self, batches: Vec<RecordBatch>) -> Result<DataFrame> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| LakebookError::invalid("cannot create a dataframe from no batches"))?;
        let table = MemTable::try_new(schema, vec![batches])?;
        self.source(self.ctx().read_table(Arc::new(table))?)
    }

    pub fn create_dataframe_from_batch(&self, batch: RecordBatch) -> Result<DataFrame> {
        self.create_dataframe(vec![batch])
    }

    /// A single `id` column with values in `[start, end)`.
    pub fn range(&self, start: i64, end: i64) -> Result<DataFrame> {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let values: Int64Array = (start..end).collect();
        let batch = RecordBatch::try_new(schema, vec![Arc::new(values)])?;
        self.create_dataframe_from_batch(batch)
    }
}

/// Registers functions for use from SQL.
pub struct UdfRegistration<'a> {
    session: &'a Session,
}

impl UdfRegistration<'_> {
    pub fn register(&self, udf: &UserDefinedFunction) {
        self.session.ctx().register_udf(udf.inner().clone());
        debug!("Registered function {}", udf.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(dir: &Path) -> SessionBuilder {
        Session::builder()
            .app_name("session-test")
            .master("local[2]")
            .config(conf::WAREHOUSE_DIR, dir.join("warehouse").to_string_lossy())
            .config(conf::DBFS_ROOT, dir.join("dbfs").to_string_lossy())
    }

    #[tokio::test]
    async fn test_create_isolated_session() {
        let dir = tempfile::tempdir().unwrap();
        let session = builder(dir.path())
            .config(conf::DRIVER_MEMORY, "1g")
            .create()
            .unwrap();
        assert_eq!(session.app_name(), "session-test");
        assert_eq!(session.version(), env!("CARGO_PKG_VERSION"));
        assert_eq!(session.ctx().state().config().target_partitions(), 2);
        assert!(session.warehouse_dir().is_dir());

        session.conf().set(conf::SHUFFLE_PARTITIONS, "5").unwrap();
        assert_eq!(session.ctx().state().config().target_partitions(), 5);
        session.conf().unset(conf::SHUFFLE_PARTITIONS).unwrap();
        assert_eq!(session.ctx().state().config().target_partitions(), 2);
    }

    #[tokio::test]
    async fn test_range_and_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let session = builder(dir.path()).create().unwrap();
        assert_eq!(session.range(0, 10).unwrap().count().await.unwrap(), 10);
        let err = session.table("default.missing").await.unwrap_err();
        assert!(matches!(err, LakebookError::TableNotFound(_)));
    }
}
