//! Additive schema synchronisation.
//!
//! [`ensure_table`] creates a missing table or appends the columns it lacks.
//! Existing columns are never dropped or retyped: a declared type that the
//! stored column cannot hold is a [`StoreError::SchemaConflict`].

use std::collections::BTreeSet;

use log::info;

use crate::{
    error::{Result, StoreError},
    schema::{ColumnDef, KeyColumns, SchemaRegistry, TableSchema, validate_identifier},
    transport::Transport,
    types::TypeOrigin,
};

/// What [`ensure_table`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: bool,
    pub added: Vec<String>,
    pub generation: u64,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.created || !self.added.is_empty()
    }
}

/// Makes sure `table` exists with at least `desired` columns.
///
/// When the table is created and `index_keys` is set, the key columns get a
/// unique index. The refreshed schema is recorded in `registry`.
pub fn ensure_table(
    conn: &mut dyn Transport,
    registry: &SchemaRegistry,
    table: &str,
    desired: &[ColumnDef],
    keys: &KeyColumns,
    index_keys: bool,
) -> Result<(TableSchema, SyncReport)> {
    validate_identifier(table)?;
    let mut seen = BTreeSet::new();
    for column in desired {
        validate_identifier(&column.name)?;
        if !seen.insert(column.name.as_str()) {
            return Err(StoreError::InvalidBatch(format!(
                "column '{}' is listed twice for table '{table}'",
                column.name
            )));
        }
    }
    let current = conn.table_columns(table)?;
    for key in keys.names() {
        if !seen.contains(key) && current.iter().all(|c| c.name != key) {
            return Err(StoreError::MissingColumn {
                table: table.to_string(),
                column: key.to_string(),
            });
        }
    }

    let mut report = SyncReport::default();

    if current.is_empty() {
        if desired.is_empty() {
            return Err(StoreError::InvalidBatch(format!(
                "cannot create table '{table}' without columns"
            )));
        }
        conn.create_table(table, desired, keys, index_keys)?;
        info!(
            "Created table '{table}' with {} column(s){}",
            desired.len(),
            if index_keys && !keys.is_empty() {
                format!(" and a unique key on {:?}", keys.names())
            } else {
                String::new()
            }
        );
        report.created = true;
        let schema = TableSchema::new(table, desired.to_vec(), keys.clone());
        report.generation = registry.record(schema.clone());
        return Ok((schema, report));
    }

    let mut columns = Vec::with_capacity(current.len() + desired.len());
    for stored in current {
        let merged = match desired.iter().find(|c| c.name == stored.name) {
            Some(wanted) => {
                if wanted.origin != TypeOrigin::Inferred && !stored.native.accepts(&wanted.native) {
                    return Err(StoreError::SchemaConflict {
                        table: table.to_string(),
                        column: stored.name.clone(),
                        existing: stored.native,
                        desired: wanted.native,
                    });
                }
                ColumnDef {
                    role: wanted.role,
                    ..stored
                }
            }
            None => stored,
        };
        columns.push(merged);
    }

    let missing = desired
        .iter()
        .filter(|wanted| columns.iter().all(|c| c.name != wanted.name))
        .cloned()
        .collect::<Vec<_>>();
    for column in missing {
        conn.add_column(table, &column)?;
        info!(
            "Added column '{}' ({}) to table '{table}'",
            column.name, column.native
        );
        report.added.push(column.name.clone());
        columns.push(column);
    }

    let schema = TableSchema::new(table, columns, keys.clone());
    report.generation = registry.record(schema.clone());
    Ok((schema, report))
}

/// Reads the stored schema of `table` without changing it.
pub fn introspect(
    conn: &mut dyn Transport,
    registry: &SchemaRegistry,
    table: &str,
    keys: &KeyColumns,
) -> Result<Option<TableSchema>> {
    validate_identifier(table)?;
    let current = conn.table_columns(table)?;
    if current.is_empty() {
        registry.forget(table);
        return Ok(None);
    }
    let schema = TableSchema::new(table, current, keys.clone());
    registry.record(schema.clone());
    Ok(Some(schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sqlite::SqliteTransport,
        types::{ColumnRole, NativeType},
    };
    use rusqlite::Connection;

    fn transport() -> SqliteTransport {
        SqliteTransport::new(Connection::open_in_memory().expect("memory db"))
    }

    fn col(name: &str, native: NativeType) -> ColumnDef {
        ColumnDef::new(name, ColumnRole::Other, native)
    }

    #[test]
    fn creates_then_adds_missing_columns_in_order() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let keys = KeyColumns::symbol_date("symbol", "date");
        let first = vec![
            col("symbol", NativeType::bounded_text(64)),
            col("date", NativeType::Date),
        ];
        let (_, report) = ensure_table(&mut conn, &registry, "prices", &first, &keys, true).unwrap();
        assert!(report.created);
        assert_eq!(report.generation, 1);

        let second = vec![
            col("symbol", NativeType::bounded_text(64)),
            col("volume", NativeType::Integer),
            col("price", NativeType::Float),
        ];
        let (schema, report) =
            ensure_table(&mut conn, &registry, "prices", &second, &keys, true).unwrap();
        assert!(!report.created);
        assert_eq!(report.added, vec!["volume".to_string(), "price".to_string()]);
        assert_eq!(report.generation, 2);
        let names = schema.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["symbol", "date", "volume", "price"]);
    }

    #[test]
    fn declared_incompatible_type_is_a_conflict() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let keys = KeyColumns::none();
        ensure_table(&mut conn, &registry, "t", &[col("v", NativeType::Integer)], &keys, false)
            .unwrap();
        let err = ensure_table(&mut conn, &registry, "t", &[col("v", NativeType::Float)], &keys, false)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SchemaConflict { existing: NativeType::Integer, desired: NativeType::Float, .. }
        ));
        let stored = conn.table_columns("t").unwrap();
        assert_eq!(stored[0].native, NativeType::Integer);
    }

    #[test]
    fn inferred_types_defer_to_stored_columns() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let keys = KeyColumns::none();
        ensure_table(&mut conn, &registry, "t", &[col("v", NativeType::Integer)], &keys, false)
            .unwrap();
        let mut inferred = col("v", NativeType::text());
        inferred.origin = TypeOrigin::Inferred;
        let (schema, report) =
            ensure_table(&mut conn, &registry, "t", &[inferred], &keys, false).unwrap();
        assert!(!report.changed());
        assert_eq!(schema.column("v").unwrap().native, NativeType::Integer);
    }

    #[test]
    fn key_columns_must_exist() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let keys = KeyColumns::symbol_date("symbol", "date");
        let err = ensure_table(
            &mut conn,
            &registry,
            "prices",
            &[col("symbol", NativeType::text())],
            &keys,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::MissingColumn { ref column, .. } if column == "date"));
    }
}
