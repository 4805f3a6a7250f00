//! Spark type names and schema conversions.
//!
//! Arrow is the in-memory type system. This module maps it to the names
//! Spark prints (`long`, `string`, `array<double>`), to the tree rendered by
//! `printSchema`, and to the StructType JSON stored in table metadata.

use std::collections::HashMap;
use std::sync::Arc;

use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};

use crate::error::{LakebookError, Result};

/// Spark's simple name for an Arrow type.
pub fn spark_type_name(data_type: &DataType) -> String {
    match data_type {
        DataType::Null => "void".to_string(),
        DataType::Boolean => "boolean".to_string(),
        DataType::Int8 | DataType::UInt8 => "byte".to_string(),
        DataType::Int16 | DataType::UInt16 => "short".to_string(),
        DataType::Int32 | DataType::UInt32 => "integer".to_string(),
        DataType::Int64 | DataType::UInt64 => "long".to_string(),
        DataType::Float16 | DataType::Float32 => "float".to_string(),
        DataType::Float64 => "double".to_string(),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "string".to_string(),
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => "binary".to_string(),
        DataType::Date32 | DataType::Date64 => "date".to_string(),
        DataType::Timestamp(_, Some(_)) => "timestamp".to_string(),
        DataType::Timestamp(_, None) => "timestamp_ntz".to_string(),
        DataType::Decimal128(p, s) | DataType::Decimal256(p, s) => format!("decimal({p},{s})"),
        DataType::List(f) | DataType::LargeList(f) | DataType::FixedSizeList(f, _) => {
            format!("array<{}>", spark_type_name(f.data_type()))
        }
        DataType::Struct(fields) => {
            let inner = fields
                .iter()
                .map(|f| format!("{}:{}", f.name(), spark_type_name(f.data_type())))
                .collect::<Vec<_>>()
                .join(",");
            format!("struct<{inner}>")
        }
        DataType::Dictionary(_, value) => spark_type_name(value),
        other => other.to_string().to_lowercase(),
    }
}

/// Render a schema the way `printSchema` does.
pub fn tree_string(schema: &Schema) -> String {
    let mut out = String::from("root\n");
    for field in schema.fields() {
        write_field(&mut out, field.name(), field.data_type(), field.is_nullable(), "nullable", 1);
    }
    out
}

fn write_field(
    out: &mut String,
    name: &str,
    data_type: &DataType,
    nullable: bool,
    nullable_label: &str,
    depth: usize,
) {
    let prefix = " |   ".repeat(depth - 1);
    let type_name = match data_type {
        DataType::List(_)
        | DataType::LargeList(_)
        | DataType::FixedSizeList(_, _) => "array".to_string(),
        DataType::Struct(_) => "struct".to_string(),
        other => spark_type_name(other),
    };
    out.push_str(&format!(
        "{prefix} |-- {name}: {type_name} ({nullable_label} = {nullable})\n"
    ));
    match data_type {
        DataType::List(f) | DataType::LargeList(f) | DataType::FixedSizeList(f, _) => {
            write_field(
                out,
                "element",
                f.data_type(),
                f.is_nullable(),
                "containsNull",
                depth + 1,
            );
        }
        DataType::Struct(fields) => {
            for f in fields {
                write_field(out, f.name(), f.data_type(), f.is_nullable(), "nullable", depth + 1);
            }
        }
        _ => {}
    }
}

/// Schema JSON stored in the `metaData` action of a table log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    #[serde(rename = "type")]
    pub type_name: String,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: SchemaDataType,
    pub nullable: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayType {
    #[serde(rename = "type")]
    pub type_name: String,
    pub element_type: SchemaDataType,
    pub contains_null: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaDataType {
    Primitive(String),
    Array(Box<ArrayType>),
    Struct(Box<StructType>),
}

impl StructType {
    pub fn try_from_arrow(schema: &Schema) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| struct_field_from_arrow(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            type_name: "struct".to_string(),
            fields,
        })
    }

    pub fn to_arrow(&self) -> Result<SchemaRef> {
        let fields = self
            .fields
            .iter()
            .map(|f| Ok(Field::new(&f.name, f.data_type.to_arrow()?, f.nullable)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(Schema::new(fields)))
    }

    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn struct_field_from_arrow(field: &Field) -> Result<StructField> {
    Ok(StructField {
        name: field.name().clone(),
        data_type: SchemaDataType::try_from_arrow(field.data_type())?,
        nullable: field.is_nullable(),
        metadata: HashMap::new(),
    })
}

impl SchemaDataType {
    pub fn try_from_arrow(data_type: &DataType) -> Result<Self> {
        let primitive = |name: &str| Ok(SchemaDataType::Primitive(name.to_string()));
        match data_type {
            DataType::Boolean => primitive("boolean"),
            DataType::Int8 => primitive("byte"),
            DataType::Int16 => primitive("short"),
            DataType::Int32 => primitive("integer"),
            DataType::Int64 => primitive("long"),
            DataType::Float32 => primitive("float"),
            DataType::Float64 => primitive("double"),
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => primitive("string"),
            DataType::Binary | DataType::LargeBinary | DataType::BinaryView => primitive("binary"),
            DataType::Date32 | DataType::Date64 => primitive("date"),
            DataType::Timestamp(_, Some(_)) => primitive("timestamp"),
            DataType::Timestamp(_, None) => primitive("timestamp_ntz"),
            DataType::Decimal128(p, s) => primitive(&format!("decimal({p},{s})")),
            DataType::List(f) | DataType::LargeList(f) | DataType::FixedSizeList(f, _) => {
                Ok(SchemaDataType::Array(Box::new(ArrayType {
                    type_name: "array".to_string(),
                    element_type: SchemaDataType::try_from_arrow(f.data_type())?,
                    contains_null: f.is_nullable(),
                })))
            }
            DataType::Struct(fields) => {
                let fields = fields
                    .iter()
                    .map(|f| struct_field_from_arrow(f))
                    .collect::<Result<Vec<_>>>()?;
                Ok(SchemaDataType::Struct(Box::new(StructType {
                    type_name: "struct".to_string(),
                    fields,
                })))
            }
            other => Err(LakebookError::unsupported(format!(
                "data type {other} cannot be stored in a delta table"
            ))),
        }
    }

    pub fn to_arrow(&self) -> Result<DataType> {
        match self {
            SchemaDataType::Primitive(name) => primitive_to_arrow(name),
            SchemaDataType::Array(array) => Ok(DataType::List(Arc::new(Field::new_list_field(
                array.element_type.to_arrow()?,
                array.contains_null,
            )))),
            SchemaDataType::Struct(st) => {
                let fields = st
                    .fields
                    .iter()
                    .map(|f| Ok(Field::new(&f.name, f.data_type.to_arrow()?, f.nullable)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(DataType::Struct(fields.into()))
            }
        }
    }
}

fn primitive_to_arrow(name: &str) -> Result<DataType> {
    let data_type = match name {
        "boolean" => DataType::Boolean,
        "byte" => DataType::Int8,
        "short" => DataType::Int16,
        "integer" => DataType::Int32,
        "long" => DataType::Int64,
        "float" => DataType::Float32,
        "double" => DataType::Float64,
        "string" => DataType::Utf8,
        "binary" => DataType::Binary,
        "date" => DataType::Date32,
        "timestamp" => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        "timestamp_ntz" => DataType::Timestamp(TimeUnit::Microsecond, None),
        decimal if decimal.starts_with("decimal(") => parse_decimal(decimal)?,
        other => {
            return Err(LakebookError::unsupported(format!(
                "delta type '{other}'"
            )));
        }
    };
    Ok(data_type)
}

fn parse_decimal(name: &str) -> Result<DataType> {
    let invalid = || LakebookError::delta(format!("invalid decimal type '{name}'"));
    let inner = name
        .strip_prefix("decimal(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(invalid)?;
    let (p, s) = inner.split_once(',').ok_or_else(invalid)?;
    let precision: u8 = p.trim().parse().map_err(|_| invalid())?;
    let scale: i8 = s.trim().parse().map_err(|_| invalid())?;
    Ok(DataType::Decimal128(precision, scale))
}

/// Normalize an Arrow schema to the types a table stores.
pub fn storage_schema(schema: &Schema) -> Result<SchemaRef> {
    StructType::try_from_arrow(schema)?.to_arrow()
}
