//! Runtime configuration of a session.
//!
//! Configuration is a flat map of Spark-style string keys. A small set of
//! keys is static: they are read once when the session is created and
//! rejected by [`RuntimeConfig::set`] afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{LakebookError, Result};

pub const DRIVER_MEMORY: &str = "spark.driver.memory";
pub const WAREHOUSE_DIR: &str = "spark.sql.warehouse.dir";
pub const MASTER: &str = "spark.master";
pub const APP_NAME: &str = "spark.app.name";
pub const SHUFFLE_PARTITIONS: &str = "spark.sql.shuffle.partitions";
pub const OPTIMIZE_MAX_FILE_SIZE: &str = "spark.databricks.delta.optimize.maxFileSize";
pub const DBFS_ROOT: &str = "lakebook.dbfs.root";
pub const CACHE_MAX_MEMORY_BYTES: &str = "lakebook.cache.maxMemoryBytes";

pub const DEFAULT_WAREHOUSE_DIR: &str = "spark-warehouse";
pub const DEFAULT_DBFS_ROOT: &str = "dbfs";
pub const DEFAULT_OPTIMIZE_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_CACHE_MAX_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

const STATIC_KEYS: &[&str] = &[DRIVER_MEMORY, WAREHOUSE_DIR, MASTER, DBFS_ROOT];

/// Listener invoked after a runtime key changes.
pub(crate) type ConfListener = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Session configuration, shared by every clone of a session.
#[derive(Clone)]
pub struct RuntimeConfig {
    values: Arc<RwLock<HashMap<String, String>>>,
    listener: Option<ConfListener>,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("values", &self.get_all())
            .finish()
    }
}

impl RuntimeConfig {
    pub(crate) fn new(values: HashMap<String, String>) -> Self {
        Self {
            values: Arc::new(RwLock::new(values)),
            listener: None,
        }
    }

    pub(crate) fn with_listener(mut self, listener: ConfListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Set a runtime key. Static keys cannot be changed once the session exists.
    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        if !self.is_modifiable(key) {
            return Err(LakebookError::StaticConfig(key.to_string()));
        }
        let value = value.into();
        validate(key, &value)?;
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        if let Some(listener) = &self.listener {
            listener(key, Some(&value));
        }
        Ok(())
    }

    pub fn unset(&self, key: &str) -> Result<()> {
        if !self.is_modifiable(key) {
            return Err(LakebookError::StaticConfig(key.to_string()));
        }
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some(listener) = &self.listener {
            listener(key, None);
        }
        Ok(())
    }

    pub fn is_modifiable(&self, key: &str) -> bool {
        !is_static(key)
    }

    /// All keys and values, sorted by key.
    pub fn get_all(&self) -> BTreeMap<String, String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn shuffle_partitions(&self) -> Result<Option<usize>> {
        self.get(SHUFFLE_PARTITIONS)
            .map(|v| parse_positive(SHUFFLE_PARTITIONS, &v))
            .transpose()
    }

    pub fn optimize_max_file_size(&self) -> Result<u64> {
        match self.get(OPTIMIZE_MAX_FILE_SIZE) {
            Some(v) => parse_byte_string(&v, ByteUnit::Byte),
            None => Ok(DEFAULT_OPTIMIZE_MAX_FILE_SIZE),
        }
    }

    pub fn cache_max_memory_bytes(&self) -> Result<u64> {
        match self.get(CACHE_MAX_MEMORY_BYTES) {
            Some(v) => parse_byte_string(&v, ByteUnit::Byte),
            None => Ok(DEFAULT_CACHE_MAX_MEMORY_BYTES),
        }
    }

    pub fn driver_memory(&self) -> Result<Option<u64>> {
        self.get(DRIVER_MEMORY)
            .map(|v| parse_byte_string(&v, ByteUnit::MiB))
            .transpose()
    }
}

pub fn is_static(key: &str) -> bool {
    STATIC_KEYS.contains(&key)
}

fn validate(key: &str, value: &str) -> Result<()> {
    match key {
        SHUFFLE_PARTITIONS => parse_positive(key, value).map(|_| ()),
        OPTIMIZE_MAX_FILE_SIZE | CACHE_MAX_MEMORY_BYTES => {
            parse_byte_string(value, ByteUnit::Byte).map(|_| ())
        }
        _ => Ok(()),
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(LakebookError::invalid(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

/// Unit applied to a byte string that carries no suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteUnit {
    Byte,
    KiB,
    MiB,
    GiB,
}

impl ByteUnit {
    fn multiplier(self) -> u64 {
        match self {
            ByteUnit::Byte => 1,
            ByteUnit::KiB => 1 << 10,
            ByteUnit::MiB => 1 << 20,
            ByteUnit::GiB => 1 << 30,
        }
    }
}

/// Parse a Spark byte string such as `4g`, `512m`, `1024kb` or `10b`.
pub fn parse_byte_string(value: &str, default_unit: ByteUnit) -> Result<u64> {
    let lower = value.trim().to_ascii_lowercase();
    let split = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (digits, suffix) = lower.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| LakebookError::invalid(format!("invalid byte string '{value}'")))?;
    let multiplier: u64 = match suffix.trim() {
        "" => default_unit.multiplier(),
        "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        "p" | "pb" => 1 << 50,
        _ => {
            return Err(LakebookError::invalid(format!(
                "invalid byte string '{value}'"
            )));
        }
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| LakebookError::invalid(format!("byte string '{value}' is too large")))
}

/// Parse a master URL into a partition count.
pub fn parse_master(master: &str) -> Result<usize> {
    let master = master.trim();
    if master == "local" {
        return Ok(1);
    }
    let inner = master
        .strip_prefix("local[")
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| {
            LakebookError::unsupported(format!(
                "master '{master}'; only local, local[N] and local[*] are available"
            ))
        })?;
    if inner == "*" {
        return Ok(num_cpus::get());
    }
    parse_positive(MASTER, inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_string() {
        assert_eq!(parse_byte_string("4g", ByteUnit::MiB).unwrap(), 4 << 30);
        assert_eq!(parse_byte_string("512m", ByteUnit::MiB).unwrap(), 512 << 20);
        assert_eq!(parse_byte_string("1024KB", ByteUnit::MiB).unwrap(), 1 << 20);
        assert_eq!(parse_byte_string("10b", ByteUnit::MiB).unwrap(), 10);
        assert_eq!(parse_byte_string("2048", ByteUnit::MiB).unwrap(), 2048 << 20);
        assert_eq!(parse_byte_string("2048", ByteUnit::Byte).unwrap(), 2048);
        assert!(parse_byte_string("lots", ByteUnit::Byte).is_err());
        assert!(parse_byte_string("4x", ByteUnit::Byte).is_err());
    }

    #[test]
    fn test_parse_master() {
        assert_eq!(parse_master("local").unwrap(), 1);
        assert_eq!(parse_master("local[3]").unwrap(), 3);
        assert_eq!(parse_master("local[*]").unwrap(), num_cpus::get());
        assert!(parse_master("local[0]").is_err());
        assert!(parse_master("yarn").is_err());
    }

    #[test]
    fn test_static_keys_rejected() {
        let conf = RuntimeConfig::new(HashMap::from([(
            DRIVER_MEMORY.to_string(),
            "4g".to_string(),
        )]));
        assert!(matches!(
            conf.set(DRIVER_MEMORY, "8g"),
            Err(LakebookError::StaticConfig(_))
        ));
        assert_eq!(conf.get(DRIVER_MEMORY).as_deref(), Some("4g"));
        assert_eq!(conf.driver_memory().unwrap(), Some(4 << 30));

        conf.set(SHUFFLE_PARTITIONS, "8").unwrap();
        assert_eq!(conf.shuffle_partitions().unwrap(), Some(8));
        assert!(conf.set(SHUFFLE_PARTITIONS, "zero").is_err());

        conf.set("my.custom.key", "value").unwrap();
        assert_eq!(conf.get_or("my.custom.key", "x"), "value");
        conf.unset("my.custom.key").unwrap();
        assert_eq!(conf.get_or("my.custom.key", "x"), "x");
    }
}
