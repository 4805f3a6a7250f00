//! Session catalog: databases, persistent tables and temporary views.
//!
//! Each database is a DataFusion [`SchemaProvider`] backed by a warehouse
//! directory. Tables are resolved when a query looks them up, so a
//! transactional table is always read at its latest committed version.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use datafusion::catalog::{CatalogProvider, SchemaProvider};
use datafusion::datasource::TableProvider;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::error::Result as DFResult;
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use datafusion::prelude::SessionContext;
use tracing::{debug, info};

use crate::delta::DeltaTable;
use crate::error::{LakebookError, Result};

pub const DEFAULT_CATALOG: &str = "spark_catalog";
pub const DEFAULT_DATABASE: &str = "default";
/// Schema registered with DataFusion as the default one, backed by [`SessionScope`].
pub const SESSION_SCHEMA: &str = "__session";

/// Storage format of a persistent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Delta,
    Parquet,
}

/// A database backed by one warehouse directory.
#[derive(Debug)]
pub struct DatabaseSchema {
    name: String,
    location: PathBuf,
}

impl DatabaseSchema {
    fn new(name: &str, location: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            location,
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    fn table_dir(&self, name: &str) -> Option<PathBuf> {
        let dir = self.location.join(name.to_lowercase());
        (dir.is_dir() && !is_database_dir(&dir)).then_some(dir)
    }
}

fn is_database_dir(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "db")
}

#[async_trait]
impl SchemaProvider for DatabaseSchema {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn table_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.location) else {
            return vec![];
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir() && !is_database_dir(&e.path()))
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.') && !name.starts_with('_'))
            .collect();
        names.sort();
        names
    }

    async fn table(&self, name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        match self.table_dir(name) {
            Some(dir) => {
                debug!("Loading table {}.{} from {}", self.name, name, dir.display());
                Ok(Some(load_table(&dir).await?))
            }
            None => Ok(None),
        }
    }

    fn table_exist(&self, name: &str) -> bool {
        self.table_dir(name).is_some()
    }
}

/// Namespace unqualified names resolve in: the temporary views of the
/// session, then the tables of `default`. A qualified `default.<name>`
/// goes straight to the database and never sees a view.
#[derive(Debug)]
pub struct SessionScope {
    views: RwLock<HashMap<String, Arc<dyn TableProvider>>>,
    default: Arc<DatabaseSchema>,
}

impl SessionScope {
    fn new(default: Arc<DatabaseSchema>) -> Self {
        Self {
            views: RwLock::new(HashMap::new()),
            default,
        }
    }

    fn view(&self, name: &str) -> Option<Arc<dyn TableProvider>> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_lowercase())
            .cloned()
    }
}

#[async_trait]
impl SchemaProvider for SessionScope {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for name in self.default.table_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    async fn table(&self, name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        match self.view(name) {
            Some(view) => Ok(Some(view)),
            None => self.default.table(name).await,
        }
    }

    fn register_table(
        &self,
        name: String,
        table: Arc<dyn TableProvider>,
    ) -> DFResult<Option<Arc<dyn TableProvider>>> {
        debug!("Registering temporary view {}", name);
        Ok(self
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_lowercase(), table))
    }

    fn deregister_table(&self, name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        Ok(self
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_lowercase()))
    }

    fn table_exist(&self, name: &str) -> bool {
        self.view(name).is_some() || self.default.table_exist(name)
    }
}

/// Detect the format of a table directory.
pub async fn detect_format(dir: &Path) -> TableFormat {
    if DeltaTable::is_delta_table(dir).await {
        TableFormat::Delta
    } else {
        TableFormat::Parquet
    }
}

/// Build a provider for the table stored in `dir`.
pub async fn load_table(dir: &Path) -> Result<Arc<dyn TableProvider>> {
    match detect_format(dir).await {
        TableFormat::Delta => {
            let table = DeltaTable::new(dir)?;
            let snapshot = table.latest().await?;
            Ok(Arc::new(table.provider(snapshot)))
        }
        TableFormat::Parquet => Ok(Arc::new(parquet_listing(dir).await?)),
    }
}

async fn parquet_listing(dir: &Path) -> Result<ListingTable> {
    let first = first_parquet_file(dir).await?.ok_or_else(|| {
        LakebookError::analysis(format!(
            "unable to infer schema for parquet at {}; it must be specified manually",
            dir.display()
        ))
    })?;
    let bytes = bytes::Bytes::from(tokio::fs::read(&first).await?);
    let schema = ParquetRecordBatchReaderBuilder::try_new(bytes)?
        .schema()
        .clone();
    let url = ListingTableUrl::parse(format!("{}/", dir.to_string_lossy().trim_end_matches('/')))?;
    let options = ListingOptions::new(Arc::new(ParquetFormat::default()))
        .with_file_extension(".parquet");
    let config = ListingTableConfig::new(url)
        .with_listing_options(options)
        .with_schema(schema);
    Ok(ListingTable::try_new(config)?)
}

async fn first_parquet_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "parquet") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files.into_iter().next())
}

/// Catalog of one session.
pub struct Catalog {
    ctx: SessionContext,
    warehouse: PathBuf,
    databases: RwLock<HashMap<String, Arc<DatabaseSchema>>>,
    scope: Arc<SessionScope>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("warehouse", &self.warehouse)
            .field("databases", &self.list_databases())
            .finish()
    }
}

impl Catalog {
    /// Create the catalog, registering `default` and every `<name>.db`
    /// directory found under the warehouse.
    pub fn try_new(ctx: SessionContext, warehouse: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&warehouse)?;
        let default = Arc::new(DatabaseSchema::new(DEFAULT_DATABASE, warehouse.clone()));
        let catalog = Self {
            ctx,
            warehouse,
            databases: RwLock::new(HashMap::new()),
            scope: Arc::new(SessionScope::new(Arc::clone(&default))),
        };
        catalog.attach(DEFAULT_DATABASE, default)?;
        catalog.provider()?.register_schema(
            SESSION_SCHEMA,
            Arc::clone(&catalog.scope) as Arc<dyn SchemaProvider>,
        )?;
        for entry in std::fs::read_dir(&catalog.warehouse)? {
            let path = entry?.path();
            if path.is_dir() && is_database_dir(&path) {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    catalog.register_database(name)?;
                }
            }
        }
        Ok(catalog)
    }

    pub fn warehouse(&self) -> &Path {
        &self.warehouse
    }

    fn database_location(&self, name: &str) -> PathBuf {
        if name == DEFAULT_DATABASE {
            self.warehouse.clone()
        } else {
            self.warehouse.join(format!("{name}.db"))
        }
    }

    fn provider(&self) -> Result<Arc<dyn CatalogProvider>> {
        self.ctx.catalog(DEFAULT_CATALOG).ok_or_else(|| {
            LakebookError::Analysis(format!("catalog {DEFAULT_CATALOG} is not registered"))
        })
    }

    fn register_database(&self, name: &str) -> Result<()> {
        let name = name.to_lowercase();
        let schema = Arc::new(DatabaseSchema::new(&name, self.database_location(&name)));
        self.attach(&name, schema)
    }

    fn attach(&self, name: &str, schema: Arc<DatabaseSchema>) -> Result<()> {
        self.provider()?
            .register_schema(name, Arc::clone(&schema) as Arc<dyn SchemaProvider>)?;
        self.databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), schema);
        Ok(())
    }

    fn database(&self, name: &str) -> Result<Arc<DatabaseSchema>> {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| LakebookError::analysis(format!("database '{name}' not found")))
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.database(name).is_ok()
    }

    pub fn create_database(&self, name: &str, if_not_exists: bool) -> Result<()> {
        if self.database_exists(name) {
            if if_not_exists {
                return Ok(());
            }
            return Err(LakebookError::analysis(format!(
                "database '{name}' already exists"
            )));
        }
        std::fs::create_dir_all(self.database_location(&name.to_lowercase()))?;
        self.register_database(name)?;
        info!("Created database {}", name);
        Ok(())
    }

    /// Split `db.table` or `table` into database and table names.
    pub fn resolve_name(&self, name: &str) -> Result<(String, String)> {
        let parts: Vec<&str> = name.split('.').map(|p| p.trim_matches('`')).collect();
        match parts.as_slice() {
            [table] if !table.is_empty() => {
                Ok((DEFAULT_DATABASE.to_string(), table.to_lowercase()))
            }
            [db, table] if !db.is_empty() && !table.is_empty() => {
                Ok((db.to_lowercase(), table.to_lowercase()))
            }
            [catalog, db, table] if catalog.eq_ignore_ascii_case(DEFAULT_CATALOG) => {
                Ok((db.to_lowercase(), table.to_lowercase()))
            }
            _ => Err(LakebookError::analysis(format!(
                "invalid table name '{name}'"
            ))),
        }
    }

    /// Tables of `database`. Without one, temporary views are listed too.
    pub fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let mut names = match database {
            Some(db) => self.database(db)?.table_names(),
            None => self.scope.table_names(),
        };
        names.sort();
        Ok(names)
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        if self.is_temp_view(name) {
            return Ok(true);
        }
        let (db, table) = self.resolve_name(name)?;
        Ok(self
            .database(&db)
            .map(|schema| schema.table_exist(&table))
            .unwrap_or(false))
    }

    /// Only unqualified names can refer to a temporary view.
    pub fn is_temp_view(&self, name: &str) -> bool {
        self.temp_view(name).is_some()
    }

    fn temp_view(&self, name: &str) -> Option<Arc<dyn TableProvider>> {
        if name.contains('.') {
            return None;
        }
        self.scope.view(name.trim_matches('`'))
    }

    /// Resolve a table or view to a provider, `None` if it does not exist.
    pub async fn lookup(&self, name: &str) -> Result<Option<Arc<dyn TableProvider>>> {
        if let Some(view) = self.temp_view(name) {
            return Ok(Some(view));
        }
        let (db, table) = self.resolve_name(name)?;
        let Ok(schema) = self.database(&db) else {
            return Ok(None);
        };
        Ok(schema.table(&table).await?)
    }

    pub fn register_temp_view(
        &self,
        name: &str,
        view: Arc<dyn TableProvider>,
        replace: bool,
    ) -> Result<()> {
        if name.contains('.') {
            return Err(LakebookError::analysis(format!(
                "temporary view name '{name}' cannot be qualified"
            )));
        }
        if !replace && self.scope.view(name).is_some() {
            return Err(LakebookError::TableAlreadyExists(name.to_string()));
        }
        self.scope.register_table(name.to_string(), view)?;
        Ok(())
    }

    pub fn drop_temp_view(&self, name: &str) -> Result<bool> {
        if name.contains('.') {
            return Ok(false);
        }
        Ok(self.scope.deregister_table(name)?.is_some())
    }

    /// Directory where a table is (or would be) stored.
    pub fn table_location(&self, name: &str) -> Result<PathBuf> {
        let (db, table) = self.resolve_name(name)?;
        Ok(self.database(&db)?.location().join(table))
    }

    pub async fn table_format(&self, name: &str) -> Result<Option<TableFormat>> {
        let location = self.table_location(name)?;
        if !tokio::fs::try_exists(&location).await? {
            return Ok(None);
        }
        Ok(Some(detect_format(&location).await))
    }

    /// Delete a persistent table and its data. Returns whether it existed.
    pub async fn drop_table(&self, name: &str, if_exists: bool) -> Result<bool> {
        let location = self.table_location(name)?;
        if !tokio::fs::try_exists(&location).await? {
            if if_exists {
                return Ok(false);
            }
            return Err(LakebookError::TableNotFound(name.to_string()));
        }
        tokio::fs::remove_dir_all(&location).await?;
        info!("Dropped table {} at {}", name, location.display());
        Ok(true)
    }
}
