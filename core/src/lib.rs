//! Lakebook Core - a local lakehouse notebook engine in Rust
//!
//! Provides a Spark-style session, DataFrame API and SQL surface on top of
//! DataFusion, with Delta Lake tables, storage-level caching, notebook
//! utilities and linear regression.

pub mod cache;
pub mod catalog;
pub mod conf;
pub mod dataframe;
pub mod delta;
pub mod error;
pub mod functions;
pub mod ml;
pub mod reader;
pub mod session;
pub mod sql;
pub mod types;
pub mod utils;
pub mod writer;

pub use cache::{CacheManager, StorageLevel};
pub use catalog::{Catalog, TableFormat};
pub use conf::RuntimeConfig;
pub use dataframe::DataFrame;
pub use delta::DeltaTable;
pub use error::{LakebookError, Result};
pub use reader::DataFrameReader;
pub use session::{Session, SessionBuilder};
pub use utils::NotebookUtils;
pub use writer::{DataFrameWriter, SaveMode};

pub use datafusion::arrow::record_batch::RecordBatch;
pub use datafusion::logical_expr::Expr;
