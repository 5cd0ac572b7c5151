//! Table schema model and the in-process schema registry.
//!
//! A [`TableSchema`] is the explicit column list of one table: name, role,
//! native type and where that type came from. The [`SchemaRegistry`] caches
//! the last known schema of each table together with a generation counter
//! that is bumped whenever the synchronizer changes the table.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::RwLock,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, StoreError},
    types::{ColumnRole, NativeType, TypeOrigin},
    value::Value,
};

const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub role: ColumnRole,
    pub native: NativeType,
    pub origin: TypeOrigin,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, role: ColumnRole, native: NativeType) -> Self {
        ColumnDef {
            name: name.into(),
            role,
            native,
            origin: TypeOrigin::Declared,
        }
    }

    pub fn stored(name: impl Into<String>, native: NativeType) -> Self {
        ColumnDef {
            name: name.into(),
            role: ColumnRole::Other,
            native,
            origin: TypeOrigin::Stored,
        }
    }

    /// `"name" TYPE` fragment for `CREATE TABLE` / `ADD COLUMN`.
    pub fn definition(&self) -> Result<String> {
        Ok(format!("{} {}", quote_ident(&self.name)?, self.native.sql()))
    }
}

/// Which columns identify a row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyColumns {
    pub date: Option<String>,
    pub symbol: Option<String>,
}

impl KeyColumns {
    pub fn none() -> Self {
        KeyColumns::default()
    }

    pub fn symbol_date(symbol: impl Into<String>, date: impl Into<String>) -> Self {
        KeyColumns {
            date: Some(date.into()),
            symbol: Some(symbol.into()),
        }
    }

    pub fn date_only(date: impl Into<String>) -> Self {
        KeyColumns {
            date: Some(date.into()),
            symbol: None,
        }
    }

    pub fn symbol_only(symbol: impl Into<String>) -> Self {
        KeyColumns {
            date: None,
            symbol: Some(symbol.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.date.is_none() && self.symbol.is_none()
    }

    /// Key column names, symbol first.
    pub fn names(&self) -> Vec<&str> {
        self.symbol
            .as_deref()
            .into_iter()
            .chain(self.date.as_deref())
            .collect()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.names().contains(&column)
    }
}

/// Renders a key tuple such as `(symbol=AAPL, date=2024-01-05)` for messages.
pub fn describe_key(keys: &KeyColumns, values: &[Option<Value>]) -> String {
    let parts = keys
        .names()
        .into_iter()
        .zip(values)
        .map(|(name, value)| match value {
            Some(value) => format!("{name}={value}"),
            None => format!("{name}=NULL"),
        })
        .join(", ");
    format!("({parts})")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub keys: KeyColumns,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>, keys: KeyColumns) -> Self {
        TableSchema {
            name: name.into(),
            columns,
            keys,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Ordered column name to native type mapping.
    pub fn native_types(&self) -> BTreeMap<String, NativeType> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.native))
            .collect()
    }
}

/// DDL fragments for `columns`, skipping any name listed in `exclude`.
pub fn column_definitions(columns: &[ColumnDef], exclude: &[&str]) -> Result<Vec<String>> {
    columns
        .iter()
        .filter(|c| !exclude.contains(&c.name.as_str()))
        .map(ColumnDef::definition)
        .collect()
}

pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Validates `name` and wraps it in double quotes.
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    generation: u64,
    schema: TableSchema,
}

/// Last known schema per table.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    pub fn get(&self, table: &str) -> Option<TableSchema> {
        self.entries
            .read()
            .ok()?
            .get(table)
            .map(|entry| entry.schema.clone())
    }

    pub fn generation(&self, table: &str) -> u64 {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(table).map(|entry| entry.generation))
            .unwrap_or(0)
    }

    /// Stores `schema`, bumping the generation when the column set changed.
    pub fn record(&self, schema: TableSchema) -> u64 {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let entry = entries
            .entry(schema.name.clone())
            .or_insert_with(|| RegistryEntry {
                generation: 0,
                schema: TableSchema::new(schema.name.clone(), Vec::new(), KeyColumns::none()),
            });
        let layout = |s: &TableSchema| {
            s.columns
                .iter()
                .map(|c| (c.name.clone(), c.native))
                .collect::<Vec<_>>()
        };
        if entry.generation == 0 || layout(&entry.schema) != layout(&schema) {
            entry.generation += 1;
        }
        entry.schema = schema;
        entry.generation
    }

    pub fn forget(&self, table: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(table);
        }
    }
}
