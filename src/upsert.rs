//! Batch upsert: type resolution, schema sync, reconciliation and one write.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    batch::{Row, RowBatch},
    error::{Result, StoreError},
    reconcile::{DuplicatePolicy, NullKeyPolicy, ReconcileOptions, reconcile},
    schema::{ColumnDef, KeyColumns, SchemaRegistry, TableSchema, describe_key, validate_identifier},
    sync::{SyncReport, ensure_table, introspect},
    transport::{Filter, KeyedUpdate, MAX_IN_VALUES, Transport, WriteBatch},
    types::{ColumnRole, TypeMap, TypeOrigin},
    value::{ComparableValue, Value},
};

pub const DEFAULT_SYMBOL_COLUMN: &str = "symbol";

/// What to do when a row already names a different symbol than the one the
/// caller asked to stamp.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SymbolConflict {
    #[default]
    Overwrite,
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOptions {
    pub symbol: Option<String>,
    pub categorical: BTreeSet<String>,
    pub numeric: BTreeSet<String>,
    pub keys: KeyColumns,
    pub type_map: TypeMap,
    pub update_latest: bool,
    pub allow_schema_alter: bool,
    pub index_keys: bool,
    pub null_keys: NullKeyPolicy,
    pub duplicates: DuplicatePolicy,
    pub symbol_conflict: SymbolConflict,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        UpsertOptions::new(KeyColumns::none())
    }
}

impl UpsertOptions {
    pub fn new(keys: KeyColumns) -> Self {
        UpsertOptions {
            symbol: None,
            categorical: BTreeSet::new(),
            numeric: BTreeSet::new(),
            keys,
            type_map: TypeMap::default(),
            update_latest: false,
            allow_schema_alter: true,
            index_keys: true,
            null_keys: NullKeyPolicy::default(),
            duplicates: DuplicatePolicy::default(),
            symbol_conflict: SymbolConflict::default(),
        }
    }

    /// Stamps `symbol` into the symbol key column of every row.
    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn categorical<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categorical.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn numeric<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.numeric.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn type_map(mut self, type_map: TypeMap) -> Self {
        self.type_map = type_map;
        self
    }

    pub fn update_latest(mut self, update_latest: bool) -> Self {
        self.update_latest = update_latest;
        self
    }

    pub fn allow_schema_alter(mut self, allow: bool) -> Self {
        self.allow_schema_alter = allow;
        self
    }

    pub fn index_keys(mut self, index_keys: bool) -> Self {
        self.index_keys = index_keys;
        self
    }

    pub fn null_keys(mut self, policy: NullKeyPolicy) -> Self {
        self.null_keys = policy;
        self
    }

    pub fn duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    pub fn symbol_conflict(mut self, policy: SymbolConflict) -> Self {
        self.symbol_conflict = policy;
        self
    }

    fn symbol_column(&self) -> &str {
        self.keys.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL_COLUMN)
    }

    fn role_of(&self, column: &str, samples: &[&Value]) -> ColumnRole {
        if self.keys.symbol.as_deref() == Some(column) {
            ColumnRole::Symbol
        } else if self.keys.date.as_deref() == Some(column) {
            ColumnRole::Date
        } else if self.categorical.contains(column) {
            ColumnRole::Categorical
        } else if self.numeric.contains(column) {
            ColumnRole::Numeric
        } else if !samples.is_empty() && samples.iter().all(|v| matches!(v, Value::Blob(_))) {
            ColumnRole::Blob
        } else {
            ColumnRole::Other
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub overwritten: usize,
    pub unchanged: usize,
    pub superseded: usize,
    pub dropped_null_keys: usize,
    pub schema: SyncReport,
}

impl UpsertReport {
    pub fn written(&self) -> usize {
        self.inserted + self.overwritten
    }
}

/// Writes `batch` into `table` following `options`.
///
/// Every check (types, schema, null keys, duplicates) runs before the first
/// write; the writes themselves go through one [`Transport::write_batch`].
pub fn upsert(
    conn: &mut dyn Transport,
    registry: &SchemaRegistry,
    table: &str,
    batch: RowBatch,
    options: &UpsertOptions,
) -> Result<UpsertReport> {
    validate_identifier(table)?;
    let mut batch = batch;
    if let Some(symbol) = &options.symbol {
        stamp_symbol(table, &mut batch, options.symbol_column(), symbol, options.symbol_conflict)?;
    }
    if batch.is_empty() {
        return Ok(UpsertReport::default());
    }

    let desired = desired_columns(conn, table, &batch, options)?;
    let (schema, sync_report) = if options.allow_schema_alter {
        ensure_table(conn, registry, table, &desired, &options.keys, options.index_keys)?
    } else {
        (existing_schema(conn, registry, table, &batch, &options.keys)?, SyncReport {
            generation: registry.generation(table),
            ..SyncReport::default()
        })
    };

    let candidates = coerce_batch(table, batch, &schema)?;
    let existing = fetch_existing(conn, table, &candidates, options)?;
    let outcome = reconcile(
        table,
        &candidates,
        &existing,
        &ReconcileOptions {
            keys: options.keys.clone(),
            update_latest: options.update_latest,
            null_keys: options.null_keys,
            duplicates: options.duplicates,
        },
    )?;

    let write = write_batch_for(&candidates, &outcome.to_insert, &outcome.to_overwrite, &options.keys);
    let summary = if write.is_empty() {
        Default::default()
    } else {
        conn.write_batch(table, &write).map_err(|err| {
            err.into_write_conflict(table, || first_key(&write, &options.keys))
        })?
    };

    let report = UpsertReport {
        inserted: summary.inserted,
        overwritten: summary.updated,
        unchanged: outcome.unchanged.len(),
        superseded: outcome.superseded,
        dropped_null_keys: outcome.dropped_null_keys,
        schema: sync_report,
    };
    info!(
        "Upserted into '{table}': {} inserted, {} overwritten, {} unchanged",
        report.inserted, report.overwritten, report.unchanged
    );
    Ok(report)
}

/// Writes a single record. With a symbol, the table is keyed by symbol only
/// and a later record for the same symbol replaces the stored one; without
/// one, the record is appended.
pub fn upsert_record(
    conn: &mut dyn Transport,
    registry: &SchemaRegistry,
    table: &str,
    symbol: Option<&str>,
    fields: &BTreeMap<String, Value>,
    type_map: &TypeMap,
) -> Result<UpsertReport> {
    let batch = RowBatch::from_records(std::slice::from_ref(fields));
    let options = match symbol {
        Some(symbol) => UpsertOptions::new(KeyColumns::symbol_only(DEFAULT_SYMBOL_COLUMN))
            .symbol(symbol)
            .duplicates(DuplicatePolicy::Overwrite),
        None => UpsertOptions::new(KeyColumns::none()),
    }
    .type_map(type_map.clone());
    upsert(conn, registry, table, batch, &options)
}

fn stamp_symbol(
    table: &str,
    batch: &mut RowBatch,
    column: &str,
    symbol: &str,
    policy: SymbolConflict,
) -> Result<()> {
    let idx = batch.ensure_column(column, None);
    for row in 0..batch.len() {
        if let Some(found) = batch.rows()[row][idx].as_ref().map(Value::as_display)
            && found != symbol
            && policy == SymbolConflict::Reject
        {
            return Err(StoreError::SymbolMismatch {
                table: table.to_string(),
                column: column.to_string(),
                row,
                expected: symbol.to_string(),
                found,
            });
        }
        batch.set(row, idx, Some(Value::from(symbol)));
    }
    Ok(())
}

fn desired_columns(
    conn: &mut dyn Transport,
    table: &str,
    batch: &RowBatch,
    options: &UpsertOptions,
) -> Result<Vec<ColumnDef>> {
    let mut stored: Option<Vec<ColumnDef>> = None;
    let mut desired = Vec::with_capacity(batch.width());
    for column in batch.columns() {
        let samples = batch.column_values(column);
        let role = options.role_of(column, &samples);
        match options.type_map.resolve(table, column, role, &samples) {
            Ok((native, origin)) => desired.push(ColumnDef {
                name: column.clone(),
                role,
                native,
                origin,
            }),
            Err(StoreError::SchemaInference { .. }) if role == ColumnRole::Other => {
                // All-null column: only an already stored column can type it.
                if stored.is_none() {
                    stored = Some(conn.table_columns(table)?);
                }
                let known = stored.iter().flatten().find(|c| c.name == *column).cloned();
                let Some(known) = known else {
                    return Err(StoreError::SchemaInference {
                        table: table.to_string(),
                        column: column.clone(),
                    });
                };
                desired.push(ColumnDef {
                    name: column.clone(),
                    role,
                    native: known.native,
                    origin: TypeOrigin::Stored,
                });
            }
            Err(err) => return Err(err),
        }
    }
    Ok(desired)
}

fn existing_schema(
    conn: &mut dyn Transport,
    registry: &SchemaRegistry,
    table: &str,
    batch: &RowBatch,
    keys: &KeyColumns,
) -> Result<TableSchema> {
    let covers = |schema: &TableSchema| {
        batch.columns().iter().all(|c| schema.has_column(c))
            && keys.names().iter().all(|k| schema.has_column(k))
    };
    let schema = match registry.get(table) {
        Some(schema) if covers(&schema) => schema,
        _ => introspect(conn, registry, table, keys)?.ok_or_else(|| StoreError::NotFound {
            table: table.to_string(),
            key: "table".to_string(),
        })?,
    };
    let required = batch
        .columns()
        .iter()
        .map(String::as_str)
        .chain(keys.names());
    for column in required {
        if !schema.has_column(column) {
            return Err(StoreError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(schema)
}

fn coerce_batch(table: &str, batch: RowBatch, schema: &TableSchema) -> Result<RowBatch> {
    let columns = batch.columns().to_vec();
    let natives = columns
        .iter()
        .map(|name| schema.column(name).map(|c| c.native))
        .collect::<Vec<_>>();
    let mut rows = batch.into_rows();
    for (row_idx, row) in rows.iter_mut().enumerate() {
        for ((cell, native), name) in row.iter_mut().zip(&natives).zip(&columns) {
            let (Some(value), Some(native)) = (cell.take(), native) else {
                continue;
            };
            let kind = value.kind();
            let display = value.as_display();
            match native.coerce(value) {
                Some(coerced) => *cell = Some(coerced),
                None => {
                    return Err(StoreError::ValueType {
                        table: table.to_string(),
                        column: name.clone(),
                        row: row_idx,
                        kind,
                        value: display,
                        native: *native,
                    });
                }
            }
        }
    }
    RowBatch::with_rows(columns, rows)
}

/// Stored rows sharing a key with `candidates`, plus the latest stored row of
/// each symbol when update-latest is on.
fn fetch_existing(
    conn: &mut dyn Transport,
    table: &str,
    candidates: &RowBatch,
    options: &UpsertOptions,
) -> Result<RowBatch> {
    let keys = &options.keys;
    if keys.is_empty() {
        return Ok(RowBatch::default());
    }
    let distinct = |column: &str| {
        candidates
            .column_values(column)
            .into_iter()
            .cloned()
            .collect::<BTreeSet<_>>()
    };
    let symbols = keys.symbol.as_deref().map(distinct);
    let dates = keys.date.as_deref().map(distinct);
    let in_lists = |column: Option<&str>, values: Option<&BTreeSet<Value>>| {
        let (Some(column), Some(values)) = (column, values) else {
            return vec![None];
        };
        if values.is_empty() {
            return vec![Some((column.to_string(), Vec::new()))];
        }
        values
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .chunks(MAX_IN_VALUES)
            .map(|chunk| Some((column.to_string(), chunk.to_vec())))
            .collect::<Vec<_>>()
    };
    let symbol_chunks = in_lists(keys.symbol.as_deref(), symbols.as_ref());
    let date_chunks = in_lists(keys.date.as_deref(), dates.as_ref());

    let mut existing: Option<RowBatch> = None;
    for symbol_chunk in &symbol_chunks {
        for date_chunk in &date_chunks {
            let mut filter = Filter::all();
            for (column, values) in [symbol_chunk, date_chunk].into_iter().flatten() {
                filter = filter.is_in(column.as_str(), values.clone());
            }
            let rows = conn.select_rows(table, &filter, keys.date.as_deref())?;
            match existing.as_mut() {
                Some(found) => {
                    for row in rows.into_rows() {
                        found.push(row)?;
                    }
                }
                None => existing = Some(rows),
            }
        }
    }
    let mut existing = existing.unwrap_or_default();

    let Some(date_column) = keys.date.as_deref() else {
        return Ok(existing);
    };
    if !options.update_latest {
        return Ok(existing);
    }
    let mut known = existing
        .rows()
        .iter()
        .map(|row| key_of(&existing, row, keys))
        .collect::<BTreeSet<_>>();
    let scopes = match (keys.symbol.as_deref(), symbols) {
        (Some(column), Some(values)) => values
            .into_iter()
            .map(|symbol| Filter::all().eq(column, symbol))
            .collect(),
        _ => vec![Filter::all()],
    };
    for scope in scopes {
        let Some(latest) = conn.max_value(table, date_column, &scope)? else {
            continue;
        };
        let rows = conn.select_rows(table, &scope.eq(date_column, latest), None)?;
        for row in rows.into_rows() {
            let key = key_of(&existing, &row, keys);
            if known.insert(key) {
                existing.push(row)?;
            }
        }
    }
    Ok(existing)
}

fn key_of(batch: &RowBatch, row: &Row, keys: &KeyColumns) -> Vec<ComparableValue> {
    keys.names()
        .into_iter()
        .map(|name| ComparableValue(batch.column_index(name).and_then(|idx| row[idx].clone())))
        .collect()
}

fn write_batch_for(
    candidates: &RowBatch,
    to_insert: &RowBatch,
    to_overwrite: &RowBatch,
    keys: &KeyColumns,
) -> WriteBatch {
    let columns = candidates.columns().to_vec();
    let updates = to_overwrite
        .rows()
        .iter()
        .map(|row| {
            let mut update = KeyedUpdate {
                key: Vec::new(),
                assignments: Vec::new(),
            };
            for (name, cell) in columns.iter().zip(row) {
                match cell {
                    Some(value) if keys.contains(name) => update.key.push((name.clone(), value.clone())),
                    _ => update.assignments.push((name.clone(), cell.clone())),
                }
            }
            update
        })
        .collect();
    WriteBatch {
        columns,
        inserts: to_insert.rows().to_vec(),
        updates,
    }
}

fn first_key(write: &WriteBatch, keys: &KeyColumns) -> String {
    let Some(row) = write.inserts.first() else {
        return write
            .updates
            .first()
            .map(|update| {
                update
                    .key
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .map(|key| format!("({key})"))
            .unwrap_or_default();
    };
    let cells = keys
        .names()
        .into_iter()
        .map(|name| {
            write
                .columns
                .iter()
                .position(|c| c == name)
                .and_then(|idx| row[idx].clone())
        })
        .collect::<Vec<_>>();
    describe_key(keys, &cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteTransport;
    use chrono::NaiveDate;
    use rusqlite::Connection;

    fn transport() -> SqliteTransport {
        SqliteTransport::new(Connection::open_in_memory().expect("memory db"))
    }

    fn day(d: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(2024, 1, d).unwrap())
    }

    fn batch(rows: &[(u32, f64)]) -> RowBatch {
        RowBatch::with_rows(
            ["date", "price"],
            rows.iter()
                .map(|(d, p)| vec![Some(day(*d)), Some(Value::Float(*p))])
                .collect(),
        )
        .unwrap()
    }

    fn options() -> UpsertOptions {
        UpsertOptions::new(KeyColumns::symbol_date("symbol", "date"))
            .symbol("AAPL")
            .numeric(["price"])
    }

    #[test]
    fn stamps_symbol_and_creates_table() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let report = upsert(&mut conn, &registry, "prices", batch(&[(1, 1.0), (2, 2.0)]), &options())
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert!(report.schema.created);
        let rows = conn.select_rows("prices", &Filter::all().eq("symbol", "AAPL"), Some("date")).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn rejects_conflicting_symbol_when_asked() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let rows = RowBatch::with_rows(
            ["symbol", "date"],
            vec![vec![Some("MSFT".into()), Some(day(1))]],
        )
        .unwrap();
        let err = upsert(
            &mut conn,
            &registry,
            "prices",
            rows,
            &options().symbol_conflict(SymbolConflict::Reject),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::SymbolMismatch { ref found, .. } if found == "MSFT"));
        assert!(conn.list_tables().unwrap().is_empty());
    }

    #[test]
    fn uncoercible_value_names_row_and_column() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        upsert(&mut conn, &registry, "prices", batch(&[(1, 1.0)]), &options()).unwrap();
        let bad = RowBatch::with_rows(
            ["date", "price"],
            vec![
                vec![Some(day(2)), Some(Value::Float(2.0))],
                vec![Some(day(3)), Some("n/a".into())],
            ],
        )
        .unwrap();
        let err = upsert(&mut conn, &registry, "prices", bad, &options()).unwrap_err();
        assert!(matches!(err, StoreError::ValueType { row: 1, ref column, .. } if column == "price"));
        assert_eq!(conn.count_rows("prices", &Filter::all()).unwrap(), 1);
    }

    #[test]
    fn without_schema_alter_missing_table_and_column_fail() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let strict = options().allow_schema_alter(false);
        let err = upsert(&mut conn, &registry, "prices", batch(&[(1, 1.0)]), &strict).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        upsert(&mut conn, &registry, "prices", batch(&[(1, 1.0)]), &options()).unwrap();
        let wider = RowBatch::with_rows(
            ["date", "price", "volume"],
            vec![vec![Some(day(2)), Some(Value::Float(2.0)), Some(Value::Integer(10))]],
        )
        .unwrap();
        let err = upsert(&mut conn, &registry, "prices", wider, &strict).unwrap_err();
        assert!(matches!(err, StoreError::MissingColumn { ref column, .. } if column == "volume"));
    }

    #[test]
    fn all_null_column_uses_stored_type() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let first = RowBatch::with_rows(
            ["date", "note"],
            vec![vec![Some(day(1)), Some("first".into())]],
        )
        .unwrap();
        upsert(&mut conn, &registry, "notes", first, &options()).unwrap();
        let nulls = RowBatch::with_rows(["date", "note"], vec![vec![Some(day(2)), None]]).unwrap();
        let report = upsert(&mut conn, &registry, "notes", nulls, &options()).unwrap();
        assert_eq!(report.inserted, 1);

        let fresh = RowBatch::with_rows(["date", "memo"], vec![vec![Some(day(3)), None]]).unwrap();
        let err = upsert(&mut conn, &registry, "notes", fresh, &options()).unwrap_err();
        assert!(matches!(err, StoreError::SchemaInference { ref column, .. } if column == "memo"));
    }

    #[test]
    fn record_upload_replaces_by_symbol() {
        let mut conn = transport();
        let registry = SchemaRegistry::new();
        let mut fields = BTreeMap::new();
        fields.insert("sector".to_string(), Value::from("tech"));
        let map = TypeMap::default();
        upsert_record(&mut conn, &registry, "profile", Some("AAPL"), &fields, &map).unwrap();
        fields.insert("sector".to_string(), Value::from("hardware"));
        let report =
            upsert_record(&mut conn, &registry, "profile", Some("AAPL"), &fields, &map).unwrap();
        assert_eq!(report.overwritten, 1);
        let rows = conn.select_rows("profile", &Filter::all(), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(0, "sector"), Some(&Value::from("hardware")));
    }
}
