//! Errors raised by the storage and cache layers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommonError {
    /// An object store call failed. The store's own error is kept as source.
    #[error("storage failure: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// A local filesystem call made outside the object store failed.
    #[error("io failure: {message}")]
    Io {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, CommonError>;

/// Coarse grouping used in logs and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Storage,
    Configuration,
    Concurrency,
    Data,
}

/// Classification shared by the error types of the workspace.
pub trait Diagnose {
    fn category(&self) -> ErrorCategory;

    /// Whether repeating the failed operation unchanged may succeed.
    fn is_retryable(&self) -> bool;
}

impl CommonError {
    pub fn storage<S: Into<String>, E: Into<anyhow::Error>>(message: S, source: E) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }
}

impl Diagnose for CommonError {
    fn category(&self) -> ErrorCategory {
        match self {
            CommonError::Storage { .. } | CommonError::Io { .. } | CommonError::NotFound(_) => {
                ErrorCategory::Storage
            }
            CommonError::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, CommonError::Storage { .. })
    }
}

/// Attach a message to errors coming from object_store or `std::io`.
pub trait ErrorContext<T> {
    fn with_storage_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    fn with_io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn with_storage_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| CommonError::storage(f(), e))
    }

    fn with_io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| CommonError::Io {
            message: f(),
            source: e.into(),
        })
    }
}
