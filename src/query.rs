//! Read-side queries spanning one or more tables.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::{
    batch::RowBatch,
    error::{Result, StoreError},
    schema::{KeyColumns, validate_identifier},
    transport::{Filter, MAX_IN_VALUES, Transport},
    value::Value,
};

/// Column names found in any of `tables`; missing tables add nothing.
pub fn union_columns(conn: &mut dyn Transport, tables: &[&str]) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for table in tables {
        validate_identifier(table)?;
        names.extend(conn.table_columns(table)?.into_iter().map(|c| c.name));
    }
    Ok(names)
}

/// Latest date stored in `table`, for `symbol` when one is given.
///
/// A missing table or an empty result is `None`, or
/// [`StoreError::NotFound`] when `strict` is set.
pub fn latest_date(
    conn: &mut dyn Transport,
    table: &str,
    symbol: Option<&str>,
    keys: &KeyColumns,
    strict: bool,
) -> Result<Option<Value>> {
    validate_identifier(table)?;
    let Some(date_column) = keys.date.as_deref() else {
        return Err(StoreError::MissingColumn {
            table: table.to_string(),
            column: "date".to_string(),
        });
    };
    let columns = conn.table_columns(table)?;
    let mut latest = None;
    if columns.iter().any(|c| c.name == date_column) {
        let mut filter = Filter::all();
        if let (Some(symbol), Some(symbol_column)) = (symbol, keys.symbol.as_deref()) {
            if columns.iter().all(|c| c.name != symbol_column) {
                return not_found_or_none(table, symbol, strict);
            }
            filter = filter.eq(symbol_column, symbol);
        }
        latest = conn.max_value(table, date_column, &filter)?;
    }
    match latest {
        Some(date) => Ok(Some(date)),
        None => not_found_or_none(table, symbol.unwrap_or("any symbol"), strict),
    }
}

fn not_found_or_none(table: &str, key: &str, strict: bool) -> Result<Option<Value>> {
    if strict {
        Err(StoreError::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        })
    } else {
        Ok(None)
    }
}

/// Rows of `symbol` in each of `tables` (every table when `None`).
///
/// Tables without the symbol column, or with no rows for the symbol, are
/// left out of the result.
pub fn all_data_for_symbol(
    conn: &mut dyn Transport,
    symbol: &str,
    keys: &KeyColumns,
    tables: Option<&[String]>,
    drop_symbol_col: bool,
) -> Result<BTreeMap<String, RowBatch>> {
    let symbol_column = keys.symbol.as_deref().unwrap_or(crate::upsert::DEFAULT_SYMBOL_COLUMN);
    let tables = match tables {
        Some(tables) => tables.to_vec(),
        None => conn.list_tables()?,
    };
    let mut found = BTreeMap::new();
    for table in tables {
        validate_identifier(&table)?;
        let columns = conn.table_columns(&table)?;
        if columns.iter().all(|c| c.name != symbol_column) {
            debug!("Skipping '{table}': no '{symbol_column}' column");
            continue;
        }
        let order_by = keys
            .date
            .as_deref()
            .filter(|date| columns.iter().any(|c| c.name == *date));
        let mut rows = conn.select_rows(&table, &Filter::all().eq(symbol_column, symbol), order_by)?;
        if rows.is_empty() {
            continue;
        }
        if drop_symbol_col {
            rows.drop_column(symbol_column);
        }
        found.insert(table, rows);
    }
    Ok(found)
}

/// Rows of one symbol in `table`, ordered by the date key when there is one.
pub fn symbol_data(
    conn: &mut dyn Transport,
    table: &str,
    symbol: &str,
    keys: &KeyColumns,
    drop_symbol_col: bool,
) -> Result<RowBatch> {
    validate_identifier(table)?;
    let symbol_column = keys.symbol.as_deref().unwrap_or(crate::upsert::DEFAULT_SYMBOL_COLUMN);
    let mut rows = conn.select_rows(
        table,
        &Filter::all().eq(symbol_column, symbol),
        keys.date.as_deref(),
    )?;
    if drop_symbol_col {
        rows.drop_column(symbol_column);
    }
    Ok(rows)
}

/// Rows of any of `symbols` in `table`.
pub fn symbols_data(
    conn: &mut dyn Transport,
    table: &str,
    symbols: &[&str],
    symbol_column: &str,
) -> Result<RowBatch> {
    validate_identifier(table)?;
    if symbols.is_empty() {
        return conn.select_rows(table, &Filter::all().is_in(symbol_column, Vec::new()), None);
    }
    let mut found: Option<RowBatch> = None;
    for chunk in symbols.chunks(MAX_IN_VALUES) {
        let values = chunk.iter().map(|s| Value::from(*s)).collect();
        let rows = conn.select_rows(table, &Filter::all().is_in(symbol_column, values), None)?;
        match found.as_mut() {
            Some(batch) => {
                for row in rows.into_rows() {
                    batch.push(row)?;
                }
            }
            None => found = Some(rows),
        }
    }
    Ok(found.unwrap_or_default())
}

/// Whether every one of `tables` exists.
pub fn tables_exist(conn: &mut dyn Transport, tables: &[&str]) -> Result<bool> {
    let existing = conn.list_tables()?.into_iter().collect::<BTreeSet<_>>();
    Ok(tables.iter().all(|table| existing.contains(*table)))
}

/// Whether every one of `tables` holds at least one row, counting only rows
/// where `filter_column = filter_value` when a filter is given.
pub fn has_nonzero_rows(
    conn: &mut dyn Transport,
    tables: &[&str],
    filter: Option<(&str, Value)>,
) -> Result<bool> {
    if tables.is_empty() {
        return Ok(false);
    }
    if !tables_exist(conn, tables)? {
        return Ok(false);
    }
    for table in tables {
        validate_identifier(table)?;
        let scope = match &filter {
            Some((column, value)) => {
                if conn.table_columns(table)?.iter().all(|c| c.name != *column) {
                    return Ok(false);
                }
                Filter::all().eq(*column, value.clone())
            }
            None => Filter::all(),
        };
        if conn.count_rows(table, &scope)? == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn list_tables(conn: &mut dyn Transport) -> Result<Vec<String>> {
    conn.list_tables()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::SchemaRegistry,
        sqlite::SqliteTransport,
        upsert::{UpsertOptions, upsert},
    };
    use chrono::NaiveDate;
    use rusqlite::Connection;

    fn seeded() -> SqliteTransport {
        let mut conn = SqliteTransport::new(Connection::open_in_memory().expect("memory db"));
        let registry = SchemaRegistry::new();
        let day = |d| Some(Value::Date(NaiveDate::from_ymd_opt(2024, 1, d).unwrap()));
        let prices = RowBatch::with_rows(
            ["symbol", "date", "price"],
            vec![
                vec![Some("AAPL".into()), day(2), Some(Value::Float(2.0))],
                vec![Some("AAPL".into()), day(1), Some(Value::Float(1.0))],
                vec![Some("MSFT".into()), day(5), Some(Value::Float(5.0))],
            ],
        )
        .unwrap();
        let options = UpsertOptions::new(KeyColumns::symbol_date("symbol", "date"));
        upsert(&mut conn, &registry, "prices", prices, &options).unwrap();
        let notes = RowBatch::with_rows(["note"], vec![vec![Some("free".into())]]).unwrap();
        upsert(&mut conn, &registry, "notes", notes, &UpsertOptions::default()).unwrap();
        conn
    }

    fn keys() -> KeyColumns {
        KeyColumns::symbol_date("symbol", "date")
    }

    #[test]
    fn latest_date_per_symbol_and_strict_mode() {
        let mut conn = seeded();
        let latest = latest_date(&mut conn, "prices", Some("AAPL"), &keys(), false).unwrap();
        assert_eq!(latest, Some(Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())));
        assert_eq!(latest_date(&mut conn, "prices", Some("TSLA"), &keys(), false).unwrap(), None);
        assert!(matches!(
            latest_date(&mut conn, "missing", Some("AAPL"), &keys(), true),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn all_data_skips_tables_without_symbol_column() {
        let mut conn = seeded();
        let found = all_data_for_symbol(&mut conn, "AAPL", &keys(), None, true).unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), ["prices"]);
        let rows = &found["prices"];
        assert!(rows.column_index("symbol").is_none());
        assert_eq!(rows.get(0, "price"), Some(&Value::Float(1.0)));
    }

    #[test]
    fn existence_and_row_checks() {
        let mut conn = seeded();
        assert!(tables_exist(&mut conn, &["prices", "notes"]).unwrap());
        assert!(!tables_exist(&mut conn, &["prices", "missing"]).unwrap());
        assert!(has_nonzero_rows(&mut conn, &["prices"], Some(("symbol", "MSFT".into()))).unwrap());
        assert!(!has_nonzero_rows(&mut conn, &["prices"], Some(("symbol", "TSLA".into()))).unwrap());
        assert!(!has_nonzero_rows(&mut conn, &["prices", "notes"], Some(("symbol", "MSFT".into()))).unwrap());
        assert!(has_nonzero_rows(&mut conn, &["prices", "notes"], None).unwrap());
        assert!(!has_nonzero_rows(&mut conn, &[], None).unwrap());
    }

    #[test]
    fn symbols_data_filters_by_list() {
        let mut conn = seeded();
        let rows = symbols_data(&mut conn, "prices", &["MSFT", "TSLA"], "symbol").unwrap();
        assert_eq!(rows.len(), 1);
        let unions = union_columns(&mut conn, &["prices", "notes", "missing"]).unwrap();
        assert_eq!(unions.len(), 4);
    }
}
