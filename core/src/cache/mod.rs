//! Dataframe caching and persistence module
//!
//! This module keeps materialized dataframes so that repeated actions over
//! the same lineage reuse the computed rows.

pub mod cache_manager;
pub mod storage_level;

pub use cache_manager::{CacheEntry, CacheManager, plan_key};
pub use storage_level::StorageLevel;
