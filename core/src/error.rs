//! Error types for lakebook-core.

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use datafusion::parquet::errors::ParquetError;
use lakebook_common::error::{CommonError, Diagnose, ErrorCategory};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LakebookError>;

#[derive(Debug, Error)]
pub enum LakebookError {
    #[error("error in DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),
    #[error("error in Arrow: {0}")]
    Arrow(#[from] ArrowError),
    #[error("error in Parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("error in object store: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("error in JSON serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("analysis error: {0}")]
    Analysis(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("table or view not found: {0}")]
    TableNotFound(String),
    #[error("table or view already exists: {0}")]
    TableAlreadyExists(String),
    #[error("path already exists: {0}")]
    PathAlreadyExists(String),
    #[error("delta error: {0}")]
    Delta(String),
    #[error("concurrent transaction conflict at version {version}: {message}")]
    TransactionConflict { version: i64, message: String },
    #[error("no widget named '{0}' is defined")]
    WidgetNotDefined(String),
    #[error("cannot modify the value of a static config: {0}")]
    StaticConfig(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl LakebookError {
    pub fn analysis(message: impl Into<String>) -> Self {
        LakebookError::Analysis(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        LakebookError::IllegalArgument(message.into())
    }

    pub fn delta(message: impl Into<String>) -> Self {
        LakebookError::Delta(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        LakebookError::NotSupported(message.into())
    }
}

impl Diagnose for LakebookError {
    fn category(&self) -> ErrorCategory {
        match self {
            LakebookError::Common(e) => e.category(),
            LakebookError::TransactionConflict { .. } => ErrorCategory::Concurrency,
            LakebookError::ObjectStore(_) | LakebookError::Io(_) => ErrorCategory::Storage,
            LakebookError::StaticConfig(_) => ErrorCategory::Configuration,
            _ => ErrorCategory::Data,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            LakebookError::TransactionConflict { .. } => true,
            LakebookError::Common(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<LakebookError> for DataFusionError {
    fn from(error: LakebookError) -> Self {
        match error {
            LakebookError::DataFusion(e) => e,
            LakebookError::Arrow(e) => e.into(),
            LakebookError::Analysis(message) => DataFusionError::Plan(message),
            other => DataFusionError::External(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let conflict = LakebookError::TransactionConflict {
            version: 3,
            message: "commit file already exists".to_string(),
        };
        assert!(conflict.is_retryable());
        assert_eq!(conflict.category(), ErrorCategory::Concurrency);

        let missing = LakebookError::TableNotFound("default.sample_table".to_string());
        assert!(!missing.is_retryable());
        assert!(missing.to_string().contains("default.sample_table"));
    }

    #[test]
    fn test_into_datafusion_error() {
        let e: DataFusionError = LakebookError::analysis("cannot resolve column").into();
        assert!(matches!(e, DataFusionError::Plan(_)));

        let e: DataFusionError = LakebookError::WidgetNotDefined("x".to_string()).into();
        assert!(matches!(e, DataFusionError::External(_)));
    }
}
