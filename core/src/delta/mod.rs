//! Transactional tables stored as parquet files plus a JSON commit log.

pub mod actions;
pub mod log;
pub mod provider;
pub mod table;

pub use log::{HistoryEntry, Snapshot};
pub use provider::DeltaTableProvider;
pub use table::{DeltaTable, DeltaWriteOptions, OptimizeMetrics, WriteOutcome};
