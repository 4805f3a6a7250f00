//! Common utilities and abstractions for the lakebook project.
//!
//! This module provides trait-based abstractions for caching and storage.

pub mod cache;
pub mod error;
pub mod storage;

pub use cache::{Cache, CacheBuilder, CacheStats};
pub use error::{CommonError, Diagnose, ErrorCategory, ErrorContext, Result};
pub use storage::{
    Listing, ObjectEntry, Storage, StorageBackend, StorageBuilder, StorageStats,
};
