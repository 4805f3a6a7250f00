//! `DataFrameWriter`: parquet, CSV and delta output, to paths or tables.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use datafusion::config::CsvOptions;
use datafusion::dataframe::DataFrameWriteOptions;
use tracing::{debug, info};

use crate::dataframe::DataFrame;
use crate::delta::{DeltaTable, DeltaWriteOptions};
use crate::error::{LakebookError, Result};

/// What to do when the target of a write already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SaveMode {
    Overwrite,
    Append,
    #[default]
    ErrorIfExists,
    Ignore,
}

impl SaveMode {
    /// Mode name as recorded in a delta commit.
    pub fn as_delta_str(&self) -> &'static str {
        match self {
            SaveMode::Overwrite => "Overwrite",
            SaveMode::Append => "Append",
            SaveMode::ErrorIfExists => "ErrorIfExists",
            SaveMode::Ignore => "Ignore",
        }
    }
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SaveMode::Overwrite => "overwrite",
            SaveMode::Append => "append",
            SaveMode::ErrorIfExists => "errorifexists",
            SaveMode::Ignore => "ignore",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SaveMode {
    type Err = LakebookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "overwrite" => Ok(SaveMode::Overwrite),
            "append" => Ok(SaveMode::Append),
            "errorifexists" | "error" | "default" => Ok(SaveMode::ErrorIfExists),
            "ignore" => Ok(SaveMode::Ignore),
            other => Err(LakebookError::invalid(format!(
                "unknown save mode '{other}'; accepted modes are overwrite, append, ignore, error, errorifexists"
            ))),
        }
    }
}

/// Output formats supported by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Parquet,
    Csv,
    Delta,
}

impl FromStr for OutputFormat {
    type Err = LakebookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "parquet" => Ok(OutputFormat::Parquet),
            "csv" => Ok(OutputFormat::Csv),
            "delta" => Ok(OutputFormat::Delta),
            other => Err(LakebookError::unsupported(format!(
                "output format '{other}'"
            ))),
        }
    }
}

/// Builder returned by [`DataFrame::write`].
#[derive(Debug)]
pub struct DataFrameWriter {
    df: DataFrame,
    mode: std::result::Result<SaveMode, String>,
    format: Option<String>,
    options: HashMap<String, String>,
}

impl DataFrameWriter {
    pub(crate) fn new(df: DataFrame) -> Self {
        Self {
            df,
            mode: Ok(SaveMode::default()),
            format: None,
            options: HashMap::new(),
        }
    }

    /// Accepts a [`SaveMode`] or one of its names.
    pub fn mode<M: TryIntoSaveMode>(mut self, mode: M) -> Self {
        self.mode = mode.try_into_save_mode().map_err(|e| e.to_string());
        self
    }

    fn save_mode(&self) -> Result<SaveMode> {
        self.mode.clone().map_err(LakebookError::invalid)
    }

    pub fn format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

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

    pub async fn parquet(self, path: &str) -> Result<()> {
        self.format("parquet").save(path).await
    }

    pub async fn csv(self, path: &str) -> Result<()> {
        self.format("csv").save(path).await
    }

    /// Write to a path. The default format is parquet.
    pub async fn save(self, path: &str) -> Result<()> {
        let format: OutputFormat = self.format.as_deref().unwrap_or("parquet").parse()?;
        let target = self.df.session().resolve_path(path)?;
        self.write_to(format, &target, None).await
    }

    /// Write to a catalog table. The default format is delta.
    pub async fn save_as_table(self, name: &str) -> Result<()> {
        let format: OutputFormat = self.format.as_deref().unwrap_or("delta").parse()?;
        let session = self.df.session().clone();
        let (_, table) = session.catalog().resolve_name(name)?;
        let location = session.catalog().table_location(name)?;
        let mode = self.save_mode()?;
        if mode == SaveMode::ErrorIfExists && tokio::fs::try_exists(&location).await? {
            return Err(LakebookError::TableAlreadyExists(name.to_string()));
        }
        self.write_to(format, &location, Some(&table)).await?;
        session.cache_manager().invalidate_table(&table).await;
        info!("Saved table {} at {}", name, location.display());
        Ok(())
    }

    fn flag(&self, key: &str) -> Result<bool> {
        match self.options.get(&key.to_lowercase()) {
            None => Ok(false),
            Some(v) => v.parse::<bool>().map_err(|_| {
                LakebookError::invalid(format!("option {key} expects true or false, got '{v}'"))
            }),
        }
    }

    async fn write_to(
        self,
        format: OutputFormat,
        target: &Path,
        table_name: Option<&str>,
    ) -> Result<()> {
        let mode = self.save_mode()?;
        check_duplicate_columns(&self.df.columns())?;

        if format == OutputFormat::Delta {
            return self.write_delta(mode, target, table_name).await;
        }

        let exists = tokio::fs::try_exists(target).await?;
        match mode {
            SaveMode::ErrorIfExists if exists => {
                return Err(LakebookError::PathAlreadyExists(
                    target.display().to_string(),
                ));
            }
            SaveMode::Ignore if exists => {
                debug!("Path {} exists, skipping write", target.display());
                return Ok(());
            }
            SaveMode::Overwrite if exists => {
                let metadata = tokio::fs::metadata(target).await?;
                if metadata.is_dir() {
                    tokio::fs::remove_dir_all(target).await?;
                } else {
                    tokio::fs::remove_file(target).await?;
                }
            }
            _ => {}
        }
        tokio::fs::create_dir_all(target).await?;

        let dir = format!("{}/", target.to_string_lossy().trim_end_matches('/'));
        let prepared = self.df.prepared().await?;
        let write_options = DataFrameWriteOptions::new();
        match format {
            OutputFormat::Parquet => {
                prepared.write_parquet(&dir, write_options, None).await?;
            }
            OutputFormat::Csv => {
                let mut csv = CsvOptions::default().with_has_header(self.flag("header")?);
                if let Some(sep) = self.options.get("sep").or(self.options.get("delimiter")) {
                    csv = csv.with_delimiter(single_byte("sep", sep)?);
                }
                prepared.write_csv(&dir, write_options, Some(csv)).await?;
            }
            OutputFormat::Delta => {
                return Err(LakebookError::unsupported("delta output to a file directory"));
            }
        }
        info!("Wrote {:?} output to {} (mode {})", format, target.display(), mode);
        Ok(())
    }
}

impl DataFrameWriter {
    async fn write_delta(
        self,
        mode: SaveMode,
        target: &Path,
        table_name: Option<&str>,
    ) -> Result<()> {
        let options = DeltaWriteOptions {
            merge_schema: self.flag("mergeSchema")?,
            overwrite_schema: self.flag("overwriteSchema")?,
            table_name: table_name.map(str::to_string),
        };
        let prepared = self.df.prepared().await?;
        let schema = prepared.schema().inner().clone();
        let partitions = prepared.collect_partitioned().await?;
        let outcome = DeltaTable::new(target)?
            .write(partitions, schema, mode, &options)
            .await?;
        debug!("Delta write outcome: {:?}", outcome);
        Ok(())
    }
}

/// Conversion used by [`DataFrameWriter::mode`].
pub trait TryIntoSaveMode {
    fn try_into_save_mode(self) -> Result<SaveMode>;
}

impl TryIntoSaveMode for SaveMode {
    fn try_into_save_mode(self) -> Result<SaveMode> {
        Ok(self)
    }
}

impl TryIntoSaveMode for &str {
    fn try_into_save_mode(self) -> Result<SaveMode> {
        self.parse()
    }
}

pub(crate) fn single_byte(option: &str, value: &str) -> Result<u8> {
    match value.as_bytes() {
        [b] => Ok(*b),
        _ => Err(LakebookError::invalid(format!(
            "option {option} must be a single character, got '{value}'"
        ))),
    }
}

fn check_duplicate_columns(columns: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for name in columns {
        if !seen.insert(name.to_lowercase()) {
            return Err(LakebookError::analysis(format!(
                "found duplicate column '{name}' in the data to save"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_save_mode() {
        assert_eq!("overwrite".parse::<SaveMode>().unwrap(), SaveMode::Overwrite);
        assert_eq!("Append".parse::<SaveMode>().unwrap(), SaveMode::Append);
        assert_eq!("error".parse::<SaveMode>().unwrap(), SaveMode::ErrorIfExists);
        assert_eq!("ignore".parse::<SaveMode>().unwrap(), SaveMode::Ignore);
        assert!("upsert".parse::<SaveMode>().is_err());
        assert_eq!(SaveMode::default(), SaveMode::ErrorIfExists);
        assert_eq!(SaveMode::Overwrite.as_delta_str(), "Overwrite");
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let columns = vec!["id".to_string(), "ID".to_string()];
        assert!(matches!(
            check_duplicate_columns(&columns),
            Err(LakebookError::Analysis(_))
        ));
        assert!(check_duplicate_columns(&["a".to_string(), "b".to_string()]).is_ok());
    }

    #[test]
    fn test_single_byte() {
        assert_eq!(single_byte("sep", ";").unwrap(), b';');
        assert!(single_byte("sep", "::").is_err());
    }
}
