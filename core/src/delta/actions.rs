//! Actions recorded in the transaction log.
//!
//! Each commit file holds one JSON object per line, each wrapping exactly
//! one action under its protocol name (`add`, `remove`, `metaData`, ...).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Protocol(Protocol),
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    Add(Add),
    Remove(Remove),
    CommitInfo(CommitInfo),
}

impl From<Add> for Action {
    fn from(value: Add) -> Self {
        Self::Add(value)
    }
}

impl From<Remove> for Action {
    fn from(value: Remove) -> Self {
        Self::Remove(value)
    }
}

impl From<Metadata> for Action {
    fn from(value: Metadata) -> Self {
        Self::Metadata(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub min_reader_version: i32,
    pub min_writer_version: i32,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            min_reader_version: 1,
            min_writer_version: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub provider: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub format: Format,
    pub schema_string: String,
    pub partition_columns: Vec<String>,
    #[serde(default)]
    pub configuration: HashMap<String, Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    pub path: String,
    pub partition_values: HashMap<String, Option<String>>,
    pub size: i64,
    pub modification_time: i64,
    pub data_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

/// File statistics kept in `Add::stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub num_records: i64,
}

impl Add {
    pub fn num_records(&self) -> Option<i64> {
        self.stats
            .as_deref()
            .and_then(|s| serde_json::from_str::<FileStats>(s).ok())
            .map(|s| s.num_records)
    }

    pub fn to_remove(&self, deletion_timestamp: i64, data_change: bool) -> Remove {
        Remove {
            path: self.path.clone(),
            data_change,
            deletion_timestamp: Some(deletion_timestamp),
            extended_file_metadata: Some(true),
            partition_values: Some(self.partition_values.clone()),
            size: Some(self.size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    pub path: String,
    pub data_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_file_metadata: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_values: Option<HashMap<String, Option<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operation_parameters: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_blind_append: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_info: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operation_metrics: HashMap<String, serde_json::Value>,
}

/// Serialize actions as newline-delimited JSON.
pub fn to_commit_bytes(actions: &[Action]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for action in actions {
        serde_json::to_writer(&mut out, action)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Parse a commit file, skipping blank lines and actions this reader does not model.
pub fn parse_commit_bytes(bytes: &[u8]) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    for line in bytes.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let value: serde_json::Value = serde_json::from_slice(line)?;
        let known = value.as_object().is_some_and(|obj| {
            obj.keys().any(|k| {
                matches!(
                    k.as_str(),
                    "protocol" | "metaData" | "add" | "remove" | "commitInfo"
                )
            })
        });
        if known {
            actions.push(serde_json::from_value(value)?);
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_format() {
        let add = Add {
            path: "part-00000-abc-c000.snappy.parquet".to_string(),
            partition_values: HashMap::new(),
            size: 1024,
            modification_time: 1_700_000_000_000,
            data_change: true,
            stats: Some(r#"{"numRecords":3}"#.to_string()),
        };
        let bytes = to_commit_bytes(&[
            Action::Protocol(Protocol::default()),
            Action::Add(add.clone()),
        ])
        .unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            r#"{"protocol":{"minReaderVersion":1,"minWriterVersion":2}}"#
        );
        assert!(lines[1].starts_with(r#"{"add":{"path":"part-00000-abc-c000.snappy.parquet","partitionValues":{}"#));
        assert!(lines[1].contains(r#""dataChange":true"#));

        let parsed = parse_commit_bytes(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1], Action::Add(add.clone()));
        assert_eq!(add.num_records(), Some(3));
    }

    #[test]
    fn test_metadata_uses_protocol_name() {
        let metadata = Metadata {
            id: "id-1".to_string(),
            name: None,
            description: None,
            format: Format::default(),
            schema_string: r#"{"type":"struct","fields":[]}"#.to_string(),
            partition_columns: vec![],
            configuration: HashMap::new(),
            created_time: Some(0),
        };
        let json = serde_json::to_string(&Action::from(metadata)).unwrap();
        assert!(json.starts_with(r#"{"metaData":{"id":"id-1","format":{"provider":"parquet""#));
        assert!(json.contains(r#""schemaString":"#));
    }

    #[test]
    fn test_unknown_actions_skipped() {
        let log = b"{\"txn\":{\"appId\":\"a\",\"version\":1}}\n\n{\"commitInfo\":{\"operation\":\"WRITE\"}}\n";
        let actions = parse_commit_bytes(log).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::CommitInfo(_)));
    }
}
