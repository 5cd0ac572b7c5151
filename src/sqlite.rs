//! SQLite implementation of [`Transport`] and [`ConnectionPool`].
//!
//! Values are stored with SQLite's native storage classes: text for strings,
//! dates (`%Y-%m-%d`) and datetimes (`%Y-%m-%d %H:%M:%S[.fff]`), integers for
//! integers and booleans, reals for floats, blobs for payloads. On the way
//! back each cell is coerced into the declared type of its column.

use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{NaiveDateTime, Timelike};
use itertools::Itertools;
use log::{debug, warn};
use rusqlite::{
    Connection, OpenFlags, params_from_iter,
    types::{Value as SqlValue, ValueRef},
};
use uuid::Uuid;

use crate::{
    batch::RowBatch,
    config::StoreConfig,
    error::{Result, TransportError},
    schema::{ColumnDef, KeyColumns, quote_ident, validate_identifier},
    transport::{Clause, ConnectionPool, Filter, Transport, WriteBatch, WriteSummary, ensure_open},
    types::NativeType,
    value::Value,
};

pub const MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq)]
enum SqliteTarget {
    File(PathBuf),
    /// Shared-cache URI; every pooled connection sees the same database.
    Memory(String),
}

pub struct SqliteTransport {
    conn: Connection,
}

impl SqliteTransport {
    pub fn new(conn: Connection) -> Self {
        SqliteTransport { conn }
    }

    fn decode_row(row: &rusqlite::Row<'_>, columns: &[ColumnDef]) -> rusqlite::Result<Vec<Option<Value>>> {
        columns
            .iter()
            .enumerate()
            .map(|(idx, column)| Ok(decode_cell(row.get_ref(idx)?, &column.native)))
            .collect()
    }
}

impl Transport for SqliteTransport {
    fn ping(&mut self) -> Result<()> {
        let one: i64 = self.conn.query_row("SELECT 1", [], |row| row.get(0))?;
        if one == 1 {
            Ok(())
        } else {
            Err(TransportError::Other(format!("liveness query returned {one}")).into())
        }
    }

    fn list_tables(&mut self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnDef>> {
        validate_identifier(table)?;
        let mut stmt = self
            .conn
            .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
        let raw = stmt
            .query_map([table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let columns = raw
            .into_iter()
            .map(|(name, declared)| {
                let native = NativeType::from_str(&declared).unwrap_or_else(|err| {
                    warn!("Column '{table}.{name}' has unrecognised type '{declared}' ({err}); treating it as TEXT");
                    NativeType::text()
                });
                ColumnDef::stored(name, native)
            })
            .collect();
        Ok(columns)
    }

    fn create_table(
        &mut self,
        table: &str,
        columns: &[ColumnDef],
        keys: &KeyColumns,
        unique_keys: bool,
    ) -> Result<()> {
        let quoted = quote_ident(table)?;
        let definitions = columns
            .iter()
            .map(ColumnDef::definition)
            .collect::<Result<Vec<_>>>()?;
        let sql = format!("CREATE TABLE {quoted} ({})", definitions.join(", "));
        debug!("{sql}");
        let tx = self.conn.transaction()?;
        tx.execute(&sql, [])?;
        if unique_keys && !keys.is_empty() {
            let key_list = keys
                .names()
                .into_iter()
                .map(quote_ident)
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            let index_sql =
                format!("CREATE UNIQUE INDEX \"ux_{table}_keys\" ON {quoted} ({key_list})");
            debug!("{index_sql}");
            tx.execute(&index_sql, [])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table)?,
            column.definition()?
        );
        debug!("{sql}");
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    fn write_batch(&mut self, table: &str, batch: &WriteBatch) -> Result<WriteSummary> {
        let quoted = quote_ident(table)?;
        let mut summary = WriteSummary::default();
        if batch.is_empty() {
            return Ok(summary);
        }
        let tx = self.conn.transaction()?;
        if !batch.inserts.is_empty() {
            let column_list = batch
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            let placeholders = (1..=batch.columns.len()).map(|i| format!("?{i}")).join(", ");
            let sql = format!("INSERT INTO {quoted} ({column_list}) VALUES ({placeholders})");
            let mut stmt = tx.prepare(&sql)?;
            for row in &batch.inserts {
                stmt.execute(params_from_iter(row.iter().map(|cell| to_sql(cell.as_ref()))))?;
                summary.inserted += 1;
            }
        }
        for update in &batch.updates {
            if update.assignments.is_empty() || update.key.is_empty() {
                continue;
            }
            let mut params = Vec::with_capacity(update.assignments.len() + update.key.len());
            let mut sets = Vec::with_capacity(update.assignments.len());
            for (column, value) in &update.assignments {
                params.push(to_sql(value.as_ref()));
                sets.push(format!("{} = ?{}", quote_ident(column)?, params.len()));
            }
            let mut predicates = Vec::with_capacity(update.key.len());
            for (column, value) in &update.key {
                params.push(to_sql(Some(value)));
                predicates.push(format!("{} = ?{}", quote_ident(column)?, params.len()));
            }
            let sql = format!(
                "UPDATE {quoted} SET {} WHERE {}",
                sets.join(", "),
                predicates.join(" AND ")
            );
            summary.updated += tx.execute(&sql, params_from_iter(params))?;
        }
        tx.commit()?;
        Ok(summary)
    }

    fn select_rows(
        &mut self,
        table: &str,
        filter: &Filter,
        order_by: Option<&str>,
    ) -> Result<RowBatch> {
        let columns = self.table_columns(table)?;
        let names = columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        if columns.is_empty() || filter.matches_nothing() {
            return Ok(RowBatch::new(names));
        }
        let column_list = names
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let (predicate, params) = where_clause(filter)?;
        let mut sql = format!("SELECT {column_list} FROM {}{predicate}", quote_ident(table)?);
        if let Some(order) = order_by {
            sql.push_str(&format!(" ORDER BY {}", quote_ident(order)?));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                SqliteTransport::decode_row(row, &columns)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        RowBatch::with_rows(names, rows)
    }

    fn max_value(&mut self, table: &str, column: &str, filter: &Filter) -> Result<Option<Value>> {
        let columns = self.table_columns(table)?;
        let Some(def) = columns.iter().find(|c| c.name == column) else {
            return Ok(None);
        };
        if filter.matches_nothing() {
            return Ok(None);
        }
        let (predicate, params) = where_clause(filter)?;
        let sql = format!(
            "SELECT MAX({}) FROM {}{predicate}",
            quote_ident(column)?,
            quote_ident(table)?
        );
        let native = def.native;
        let value = self
            .conn
            .query_row(&sql, params_from_iter(params), |row| {
                Ok(decode_cell(row.get_ref(0)?, &native))
            })?;
        Ok(value)
    }

    fn count_rows(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        if filter.matches_nothing() {
            return Ok(0);
        }
        let (predicate, params) = where_clause(filter)?;
        let sql = format!("SELECT COUNT(*) FROM {}{predicate}", quote_ident(table)?);
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

fn where_clause(filter: &Filter) -> Result<(String, Vec<SqlValue>)> {
    if filter.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut params = Vec::new();
    let mut predicates = Vec::with_capacity(filter.clauses.len());
    for clause in &filter.clauses {
        match clause {
            Clause::Eq(column, value) => {
                params.push(to_sql(Some(value)));
                predicates.push(format!("{} = ?{}", quote_ident(column)?, params.len()));
            }
            Clause::In(column, values) => {
                let mut slots = Vec::with_capacity(values.len());
                for value in values {
                    params.push(to_sql(Some(value)));
                    slots.push(format!("?{}", params.len()));
                }
                predicates.push(format!("{} IN ({})", quote_ident(column)?, slots.join(", ")));
            }
            Clause::IsNull(column) => {
                predicates.push(format!("{} IS NULL", quote_ident(column)?));
            }
        }
    }
    Ok((format!(" WHERE {}", predicates.join(" AND ")), params))
}

fn format_datetime(dt: &NaiveDateTime) -> String {
    let base = dt.format("%Y-%m-%d %H:%M:%S").to_string();
    let nanos = dt.nanosecond() % 1_000_000_000;
    if nanos == 0 {
        base
    } else {
        let fraction = format!("{nanos:09}");
        format!("{base}.{}", fraction.trim_end_matches('0'))
    }
}

fn to_sql(value: Option<&Value>) -> SqlValue {
    match value {
        None => SqlValue::Null,
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(Value::Integer(i)) => SqlValue::Integer(*i),
        Some(Value::Float(f)) => SqlValue::Real(*f),
        Some(Value::Boolean(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Date(d)) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        Some(Value::DateTime(dt)) => SqlValue::Text(format_datetime(dt)),
        Some(Value::Blob(bytes)) => SqlValue::Blob(bytes.clone()),
    }
}

fn decode_cell(cell: ValueRef<'_>, native: &NativeType) -> Option<Value> {
    let raw = match cell {
        ValueRef::Null => return None,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    };
    Some(native.coerce(raw.clone()).unwrap_or(raw))
}

/// Pool of SQLite connections to one database.
pub struct SqlitePool {
    target: SqliteTarget,
    busy_timeout: Duration,
    max_idle: usize,
    idle: Mutex<Vec<Box<dyn Transport>>>,
    /// Keeps a shared in-memory database alive between loans.
    keeper: Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl SqlitePool {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let target = if config.database == MEMORY_DATABASE {
            SqliteTarget::Memory(format!(
                "file:series-store-{}?mode=memory&cache=shared",
                Uuid::new_v4()
            ))
        } else {
            SqliteTarget::File(PathBuf::from(&config.database))
        };
        let pool = SqlitePool {
            target,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            max_idle: config.pool_size.max(1),
            idle: Mutex::new(Vec::new()),
            keeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        let first = pool.connect()?;
        match &pool.target {
            SqliteTarget::Memory(_) => {
                if let Ok(mut keeper) = pool.keeper.lock() {
                    *keeper = Some(first);
                }
            }
            SqliteTarget::File(_) => {
                first.pragma_update_and_check(None, "journal_mode", "wal", |row| {
                    row.get::<_, String>(0)
                })?;
                pool.release(Box::new(SqliteTransport::new(first)));
            }
        }
        Ok(pool)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = match &self.target {
            SqliteTarget::File(path) => Connection::open(path)?,
            SqliteTarget::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

impl ConnectionPool for SqlitePool {
    fn acquire(&self) -> Result<Box<dyn Transport>> {
        ensure_open(self.closed.load(Ordering::Acquire))?;
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        match reused {
            Some(connection) => Ok(connection),
            None => Ok(Box::new(SqliteTransport::new(self.connect()?))),
        }
    }

    fn release(&self, connection: Box<dyn Transport>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < self.max_idle
        {
            idle.push(connection);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
        if let Ok(mut keeper) = self.keeper.lock() {
            keeper.take();
        }
    }
}

impl Drop for SqlitePool {
    fn drop(&mut self) {
        self.close();
    }
}
