//! Column roles, native storage types, and the policy mapping one to the other.
//!
//! A [`TypeMap`] assigns a [`NativeType`] to each [`ColumnRole`]. Columns with
//! the [`ColumnRole::Other`] role have their type inferred from sample values.
//! Per-column overrides in the map always win over the role policy.
//!
//! ## Responsibilities
//!
//! - SQL rendering and parsing of native types (`BIGINT`, `VARCHAR(64)`, ...)
//! - Compatibility between an existing column type and a desired one
//! - Coercion of values into the type of the column that stores them

use std::{collections::BTreeMap, fmt, fs::File, io::BufReader, path::Path, str::FromStr};

use anyhow::{Context, anyhow, bail};
use chrono::NaiveTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{
    error::{Result, StoreError},
    value::{Value, parse_boolean, parse_naive_date, parse_naive_datetime},
};

pub const DEFAULT_TEXT_LENGTH: u32 = 64;

/// Semantic role of a column in a batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Categorical,
    Numeric,
    Date,
    Symbol,
    Blob,
    Other,
}

impl ColumnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnRole::Categorical => "categorical",
            ColumnRole::Numeric => "numeric",
            ColumnRole::Date => "date",
            ColumnRole::Symbol => "symbol",
            ColumnRole::Blob => "blob",
            ColumnRole::Other => "other",
        }
    }
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Text { max_len: Option<u32> },
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Blob,
}

impl NativeType {
    pub const fn bounded_text(max_len: u32) -> Self {
        NativeType::Text {
            max_len: Some(max_len),
        }
    }

    pub const fn text() -> Self {
        NativeType::Text { max_len: None }
    }

    pub fn sql(&self) -> String {
        match self {
            NativeType::Text { max_len: Some(len) } => format!("VARCHAR({len})"),
            NativeType::Text { max_len: None } => "TEXT".to_string(),
            NativeType::Integer => "BIGINT".to_string(),
            NativeType::Float => "DOUBLE".to_string(),
            NativeType::Boolean => "BOOLEAN".to_string(),
            NativeType::Date => "DATE".to_string(),
            NativeType::DateTime => "DATETIME".to_string(),
            NativeType::Blob => "BLOB".to_string(),
        }
    }

    /// Whether a column already stored as `self` can hold values that a
    /// caller would otherwise store as `desired`.
    pub fn accepts(&self, desired: &NativeType) -> bool {
        match (self, desired) {
            (NativeType::Text { max_len: None }, NativeType::Text { .. }) => true,
            (NativeType::Text { max_len: Some(_) }, NativeType::Text { max_len: None }) => false,
            (
                NativeType::Text {
                    max_len: Some(existing),
                },
                NativeType::Text {
                    max_len: Some(wanted),
                },
            ) => wanted <= existing,
            (NativeType::Float, NativeType::Integer) => true,
            (NativeType::DateTime, NativeType::Date) => true,
            (left, right) => left == right,
        }
    }

    /// Converts `value` into the representation this column stores.
    ///
    /// Returns `None` when the value has no faithful representation.
    pub fn coerce(&self, value: Value) -> Option<Value> {
        match (self, value) {
            (NativeType::Text { .. }, Value::String(s)) => Some(Value::String(s)),
            (NativeType::Text { .. }, Value::Blob(_)) => None,
            (NativeType::Text { .. }, other) => Some(Value::String(other.as_display())),
            (NativeType::Integer, Value::Integer(i)) => Some(Value::Integer(i)),
            (NativeType::Integer, Value::Boolean(b)) => Some(Value::Integer(i64::from(b))),
            (NativeType::Integer, Value::Float(f))
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 =>
            {
                Some(Value::Integer(f as i64))
            }
            (NativeType::Integer, Value::String(s)) => s.trim().parse().ok().map(Value::Integer),
            (NativeType::Float, Value::Float(f)) => Some(Value::Float(f)),
            (NativeType::Float, Value::Integer(i)) => Some(Value::Float(i as f64)),
            (NativeType::Float, Value::String(s)) => s.trim().parse().ok().map(Value::Float),
            (NativeType::Boolean, Value::Boolean(b)) => Some(Value::Boolean(b)),
            (NativeType::Boolean, Value::Integer(0)) => Some(Value::Boolean(false)),
            (NativeType::Boolean, Value::Integer(1)) => Some(Value::Boolean(true)),
            (NativeType::Boolean, Value::String(s)) => parse_boolean(s.trim()).map(Value::Boolean),
            (NativeType::Date, Value::Date(d)) => Some(Value::Date(d)),
            (NativeType::Date, Value::DateTime(dt)) if dt.time() == NaiveTime::MIN => {
                Some(Value::Date(dt.date()))
            }
            (NativeType::Date, Value::String(s)) => parse_naive_date(s.trim()).map(Value::Date),
            (NativeType::DateTime, Value::DateTime(dt)) => Some(Value::DateTime(dt)),
            (NativeType::DateTime, Value::Date(d)) => Some(Value::DateTime(d.and_time(NaiveTime::MIN))),
            (NativeType::DateTime, Value::String(s)) => {
                let trimmed = s.trim();
                parse_naive_datetime(trimmed)
                    .or_else(|| parse_naive_date(trimmed).map(|d| d.and_time(NaiveTime::MIN)))
                    .map(Value::DateTime)
            }
            (NativeType::Blob, Value::Blob(bytes)) => Some(Value::Blob(bytes)),
            _ => None,
        }
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

impl FromStr for NativeType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        let normalized = value.trim().to_ascii_uppercase();
        let (base, args) = match normalized.split_once('(') {
            Some((base, rest)) => {
                let inner = rest
                    .strip_suffix(')')
                    .ok_or_else(|| anyhow!("Unbalanced parentheses in column type '{value}'"))?;
                (base.trim().to_string(), Some(inner.trim().to_string()))
            }
            None => (normalized.clone(), None),
        };
        let parsed = match base.as_str() {
            "VARCHAR" | "CHAR" | "CHARACTER VARYING" | "NVARCHAR" => {
                let max_len = args
                    .map(|raw| {
                        raw.parse::<u32>()
                            .with_context(|| format!("Parsing text length from '{value}'"))
                    })
                    .transpose()?;
                NativeType::Text { max_len }
            }
            "TEXT" | "STRING" | "CLOB" => NativeType::text(),
            "BIGINT" | "INT" | "INTEGER" | "SMALLINT" | "TINYINT" | "INT8" => NativeType::Integer,
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" | "REAL" | "NUMERIC" | "DECIMAL" => {
                NativeType::Float
            }
            "BOOLEAN" | "BOOL" => NativeType::Boolean,
            "DATE" => NativeType::Date,
            "DATETIME" | "TIMESTAMP" => NativeType::DateTime,
            "BLOB" | "BYTEA" | "LONGBLOB" | "BINARY" | "VARBINARY" => NativeType::Blob,
            _ => bail!("Unknown column type '{value}'"),
        };
        Ok(parsed)
    }
}

impl Serialize for NativeType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.sql())
    }
}

impl<'de> Deserialize<'de> for NativeType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NativeType::from_str(&raw).map_err(de::Error::custom)
    }
}

/// Where a column's native type came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TypeOrigin {
    /// Fixed by a role policy or an explicit override.
    Declared,
    /// Derived from sample values when the column was first seen.
    Inferred,
    /// Read back from the store's catalog.
    Stored,
}

/// Role-to-type policy with per-column overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeMap {
    pub categorical: NativeType,
    pub numeric: NativeType,
    /// Used for date columns holding timestamps; pure calendar dates map to `DATE`.
    pub date: NativeType,
    pub symbol: NativeType,
    pub blob: NativeType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, NativeType>,
}

impl Default for TypeMap {
    fn default() -> Self {
        Self::with_text_length(DEFAULT_TEXT_LENGTH)
    }
}

impl TypeMap {
    pub fn with_text_length(max_len: u32) -> Self {
        TypeMap {
            categorical: NativeType::bounded_text(max_len),
            numeric: NativeType::Float,
            date: NativeType::DateTime,
            symbol: NativeType::bounded_text(max_len),
            blob: NativeType::Blob,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, column: impl Into<String>, native: NativeType) -> Self {
        self.overrides.insert(column.into(), native);
        self
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening type map {path:?}"))?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).context("Parsing type map YAML")
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("Serializing type map to YAML")
    }

    /// Resolves the storage type of one column.
    ///
    /// `samples` are the non-null values of the column in the batch; they
    /// only matter for the `Date` and `Other` roles.
    pub fn resolve(
        &self,
        table: &str,
        column: &str,
        role: ColumnRole,
        samples: &[&Value],
    ) -> Result<(NativeType, TypeOrigin)> {
        if let Some(native) = self.overrides.get(column) {
            return Ok((*native, TypeOrigin::Declared));
        }
        let native = match role {
            ColumnRole::Categorical => self.categorical,
            ColumnRole::Numeric => self.numeric,
            ColumnRole::Symbol => self.symbol,
            ColumnRole::Blob => self.blob,
            // Without samples the policy type only applies to a new column;
            // an existing date column keeps its stored type.
            ColumnRole::Date if samples.is_empty() => {
                return Ok((self.date, TypeOrigin::Inferred));
            }
            ColumnRole::Date => {
                if samples.iter().all(|value| matches!(value, Value::Date(_))) {
                    NativeType::Date
                } else {
                    self.date
                }
            }
            ColumnRole::Other => {
                let native = infer_native_type(samples).ok_or_else(|| {
                    StoreError::SchemaInference {
                        table: table.to_string(),
                        column: column.to_string(),
                    }
                })?;
                return Ok((native, TypeOrigin::Inferred));
            }
        };
        Ok((native, TypeOrigin::Declared))
    }
}

/// Picks the narrowest type that holds every sample, or `None` when there are
/// no samples to look at.
pub fn infer_native_type(samples: &[&Value]) -> Option<NativeType> {
    let first = samples.first()?;
    let mut candidate = sample_type(first);
    for value in &samples[1..] {
        let next = sample_type(value);
        candidate = match (candidate, next) {
            (left, right) if left == right => left,
            (NativeType::Integer, NativeType::Float) | (NativeType::Float, NativeType::Integer) => {
                NativeType::Float
            }
            (NativeType::Date, NativeType::DateTime) | (NativeType::DateTime, NativeType::Date) => {
                NativeType::DateTime
            }
            _ => NativeType::text(),
        };
    }
    Some(candidate)
}

fn sample_type(value: &Value) -> NativeType {
    match value {
        Value::String(_) => NativeType::text(),
        Value::Integer(_) => NativeType::Integer,
        Value::Float(_) => NativeType::Float,
        Value::Boolean(_) => NativeType::Boolean,
        Value::Date(_) => NativeType::Date,
        Value::DateTime(_) => NativeType::DateTime,
        Value::Blob(_) => NativeType::Blob,
    }
}
