//! Seams to the SQL store: a connection-level [`Transport`] and the
//! [`ConnectionPool`] that hands transports out.
//!
//! Every public store operation borrows one connection through a
//! [`PooledConnection`] guard, which gives it back to the pool when dropped,
//! on error paths included.

use std::ops::{Deref, DerefMut};

use crate::{
    batch::{Row, RowBatch},
    error::{Result, StoreError},
    schema::{ColumnDef, KeyColumns},
    value::Value,
};

/// Largest value list callers put in one [`Clause::In`]. Longer lists are
/// split across queries; SQLite caps bound parameters per statement.
pub const MAX_IN_VALUES: usize = 500;

/// One predicate on a column. Clauses in a [`Filter`] are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

impl Filter {
    pub fn all() -> Self {
        Filter::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(column.into(), value.into()));
        self
    }

    pub fn is_in(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::In(column.into(), values));
        self
    }

    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.clauses.push(Clause::IsNull(column.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether an `In` clause with no values makes the filter unsatisfiable.
    pub fn matches_nothing(&self) -> bool {
        self.clauses
            .iter()
            .any(|clause| matches!(clause, Clause::In(_, values) if values.is_empty()))
    }
}

/// In-place update of the row identified by `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedUpdate {
    pub key: Vec<(String, Value)>,
    pub assignments: Vec<(String, Option<Value>)>,
}

/// Inserts and keyed updates that belong to one upsert call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub columns: Vec<String>,
    pub inserts: Vec<Row>,
    pub updates: Vec<KeyedUpdate>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

/// Rows written by [`Transport::write_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// SQL-shaped operations on one connection.
pub trait Transport: Send {
    fn ping(&mut self) -> Result<()>;

    fn list_tables(&mut self) -> Result<Vec<String>>;

    /// Columns of `table` in catalog order; empty when the table is missing.
    fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnDef>>;

    /// Creates `table`. When `unique_keys` is set, the key columns get a
    /// unique index so concurrent duplicate inserts fail.
    fn create_table(
        &mut self,
        table: &str,
        columns: &[ColumnDef],
        keys: &KeyColumns,
        unique_keys: bool,
    ) -> Result<()>;

    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<()>;

    /// Applies every insert and update of `batch`. Implementations should
    /// apply it atomically when the store allows it.
    fn write_batch(&mut self, table: &str, batch: &WriteBatch) -> Result<WriteSummary>;

    /// Rows of `table` matching `filter`, optionally ordered by one column.
    fn select_rows(
        &mut self,
        table: &str,
        filter: &Filter,
        order_by: Option<&str>,
    ) -> Result<RowBatch>;

    fn max_value(&mut self, table: &str, column: &str, filter: &Filter) -> Result<Option<Value>>;

    fn count_rows(&mut self, table: &str, filter: &Filter) -> Result<u64>;
}

/// Source of short-lived connections.
pub trait ConnectionPool: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn Transport>>;

    fn release(&self, connection: Box<dyn Transport>);

    /// Drops idle connections and refuses further `acquire` calls.
    fn close(&self);
}

/// A connection on loan from a pool; returned on drop.
pub struct PooledConnection<'a> {
    pool: &'a dyn ConnectionPool,
    connection: Option<Box<dyn Transport>>,
}

impl<'a> PooledConnection<'a> {
    pub fn acquire(pool: &'a dyn ConnectionPool) -> Result<Self> {
        let connection = pool.acquire()?;
        Ok(PooledConnection {
            pool,
            connection: Some(connection),
        })
    }
}

impl Deref for PooledConnection<'_> {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        match &self.connection {
            Some(connection) => connection.as_ref(),
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.connection {
            Some(connection) => connection.as_mut(),
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

/// Fails with [`StoreError::PoolClosed`] when `closed` is set.
pub(crate) fn ensure_open(closed: bool) -> Result<()> {
    if closed {
        Err(StoreError::PoolClosed)
    } else {
        Ok(())
    }
}
