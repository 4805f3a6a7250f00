//! `DataFrameReader`: CSV, parquet and delta sources.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::prelude::{CsvReadOptions, ParquetReadOptions};
use tracing::{debug, info};

use crate::dataframe::DataFrame;
use crate::delta::DeltaTable;
use crate::error::{LakebookError, Result};
use crate::session::Session;
use crate::writer::single_byte;

const DEFAULT_SAMPLING_ROWS: usize = 1000;

/// Builder returned by [`Session::read`].
#[derive(Debug, Clone)]
pub struct DataFrameReader {
    session: Session,
    format: Option<String>,
    options: HashMap<String, String>,
    schema: Option<SchemaRef>,
}

impl DataFrameReader {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            format: None,
            options: HashMap::new(),
            schema: None,
        }
    }

    pub fn format(mut self, format: &str) -> Self {
        self.format = Some(format.to_lowercase());
        self
    }

    /// Option keys are case-insensitive.
    pub fn option(mut self, key: &str, value: impl ToString) -> Self {
        self.options.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn options<I, K, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: ToString,
    {
        for (k, v) in options {
            self.options.insert(k.as_ref().to_lowercase(), v.to_string());
        }
        self
    }

    /// Use an explicit schema instead of inferring one.
    pub fn schema(mut self, schema: SchemaRef) -> Self {
        self.schema = Some(schema);
        self
    }

    pub async fn csv(self, path: &str) -> Result<DataFrame> {
        self.format("csv").load(path).await
    }

    pub async fn parquet(self, path: &str) -> Result<DataFrame> {
        self.format("parquet").load(path).await
    }

    pub async fn table(self, name: &str) -> Result<DataFrame> {
        self.session.table(name).await
    }

    /// Load a path. The default format is parquet.
    pub async fn load(self, path: &str) -> Result<DataFrame> {
        let location = self.session.resolve_path(path)?;
        let metadata = tokio::fs::metadata(&location).await.map_err(|_| {
            LakebookError::analysis(format!("Path does not exist: {path}"))
        })?;
        let format = self.format.clone().unwrap_or_else(|| "parquet".to_string());
        info!("Reading {} from {}", format, location.display());
        let df = match format.as_str() {
            "csv" => self.read_csv(&location, metadata.is_dir()).await?,
            "parquet" => self.read_parquet(&location, metadata.is_dir()).await?,
            "delta" => self.read_delta(&location).await?,
            other => {
                return Err(LakebookError::unsupported(format!("data source '{other}'")));
            }
        };
        self.session.source(df)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.options.get(&key.to_lowercase()) {
            None => Ok(default),
            Some(v) => v.trim().parse::<bool>().map_err(|_| {
                LakebookError::invalid(format!("option {key} expects true or false, got '{v}'"))
            }),
        }
    }

    fn usize_option(&self, key: &str, default: usize) -> Result<usize> {
        match self.options.get(&key.to_lowercase()) {
            None => Ok(default),
            Some(v) => v.trim().parse::<usize>().map_err(|_| {
                LakebookError::invalid(format!("option {key} expects a number, got '{v}'"))
            }),
        }
    }

    async fn read_csv(
        &self,
        location: &Path,
        is_dir: bool,
    ) -> Result<datafusion::dataframe::DataFrame> {
        let url = table_url(location, is_dir);
        let extension = if is_dir { ".csv" } else { "" };
        let header = self.flag("header", false)?;
        let delimiter = match self.options.get("sep").or(self.options.get("delimiter")) {
            Some(sep) => single_byte("sep", sep)?,
            None => b',',
        };
        let ctx = self.session.ctx();

        let schema = match &self.schema {
            Some(schema) => Arc::clone(schema),
            None => {
                let infer_types = self.flag("inferSchema", false)?;
                let sampling_rows = self.usize_option("samplingRows", DEFAULT_SAMPLING_ROWS)?;
                let options = CsvReadOptions::new()
                    .has_header(header)
                    .delimiter(delimiter)
                    .file_extension(extension)
                    .schema_infer_max_records(sampling_rows);
                let inferred = ctx.read_csv(url.as_str(), options).await?;
                let fields: Vec<Field> = inferred
                    .schema()
                    .fields()
                    .iter()
                    .enumerate()
                    .map(|(i, f)| {
                        let name = if header {
                            f.name().clone()
                        } else {
                            format!("_c{i}")
                        };
                        let data_type = if infer_types {
                            f.data_type().clone()
                        } else {
                            DataType::Utf8
                        };
                        Field::new(name, data_type, true)
                    })
                    .collect();
                Arc::new(Schema::new(fields))
            }
        };
        debug!("CSV schema for {}: {:?}", location.display(), schema);

        let options = CsvReadOptions::new()
            .has_header(header)
            .delimiter(delimiter)
            .file_extension(extension)
            .schema(schema.as_ref());
        Ok(ctx.read_csv(url.as_str(), options).await?)
    }

    async fn read_parquet(
        &self,
        location: &Path,
        is_dir: bool,
    ) -> Result<datafusion::dataframe::DataFrame> {
        let url = table_url(location, is_dir);
        let options = ParquetReadOptions {
            file_extension: if is_dir { ".parquet" } else { "" },
            schema: self.schema.as_deref(),
            ..Default::default()
        };
        Ok(self.session.ctx().read_parquet(url.as_str(), options).await?)
    }

    async fn read_delta(&self, location: &Path) -> Result<datafusion::dataframe::DataFrame> {
        if !DeltaTable::is_delta_table(location).await {
            return Err(LakebookError::analysis(format!(
                "{} is not a delta table",
                location.display()
            )));
        }
        let table = DeltaTable::new(location)?;
        let snapshot = match self.options.get("versionasof") {
            Some(v) => {
                let version = v.trim().parse::<i64>().map_err(|_| {
                    LakebookError::invalid(format!("versionAsOf expects a version, got '{v}'"))
                })?;
                table.load_version(version).await?
            }
            None => table.latest().await?,
        };
        debug!(
            "Reading delta table {} at version {}",
            location.display(),
            snapshot.version()
        );
        Ok(self.session.ctx().read_table(Arc::new(table.provider(snapshot)))?)
    }
}

/// Directories get a trailing slash so every file inside is listed.
fn table_url(location: &Path, is_dir: bool) -> String {
    let path = location.to_string_lossy();
    if is_dir {
        format!("{}/", path.trim_end_matches('/'))
    } else {
        path.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url() {
        assert_eq!(table_url(Path::new("/data/out"), true), "/data/out/");
        assert_eq!(table_url(Path::new("/data/out/"), true), "/data/out/");
        assert_eq!(table_url(Path::new("/data/a.csv"), false), "/data/a.csv");
    }
}
