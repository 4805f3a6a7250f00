//! Storage levels for dataframe caching

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LakebookError;

/// Defines where a cached dataframe keeps its materialized rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StorageLevel {
    /// No caching
    #[default]
    None,
    /// Cache in memory only
    MemoryOnly,
    /// Cache in memory, spill to disk if the relation is too large
    MemoryAndDisk,
    /// Cache on disk only
    DiskOnly,
}

impl StorageLevel {
    /// Check if this storage level uses memory
    pub fn use_memory(&self) -> bool {
        matches!(self, StorageLevel::MemoryOnly | StorageLevel::MemoryAndDisk)
    }

    /// Check if this storage level uses disk
    pub fn use_disk(&self) -> bool {
        matches!(self, StorageLevel::DiskOnly | StorageLevel::MemoryAndDisk)
    }

    /// Check if caching is enabled
    pub fn is_cached(&self) -> bool {
        !matches!(self, StorageLevel::None)
    }
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageLevel::None => "NONE",
            StorageLevel::MemoryOnly => "MEMORY_ONLY",
            StorageLevel::MemoryAndDisk => "MEMORY_AND_DISK",
            StorageLevel::DiskOnly => "DISK_ONLY",
        };
        write!(f, "{name}")
    }
}

impl FromStr for StorageLevel {
    type Err = LakebookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(StorageLevel::None),
            "MEMORY_ONLY" => Ok(StorageLevel::MemoryOnly),
            "MEMORY_AND_DISK" => Ok(StorageLevel::MemoryAndDisk),
            "DISK_ONLY" => Ok(StorageLevel::DiskOnly),
            _ => Err(LakebookError::invalid(format!("unknown storage level '{s}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_level_properties() {
        assert!(StorageLevel::MemoryAndDisk.use_memory());
        assert!(StorageLevel::MemoryAndDisk.use_disk());
        assert!(!StorageLevel::DiskOnly.use_memory());
        assert!(!StorageLevel::None.is_cached());
        assert_eq!(StorageLevel::default(), StorageLevel::None);
    }

    #[test]
    fn test_storage_level_names() {
        assert_eq!(StorageLevel::MemoryAndDisk.to_string(), "MEMORY_AND_DISK");
        assert_eq!(
            "disk_only".parse::<StorageLevel>().unwrap(),
            StorageLevel::DiskOnly
        );
        assert!("OFF_HEAP".parse::<StorageLevel>().is_err());
    }
}
