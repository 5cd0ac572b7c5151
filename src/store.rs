//! The public facade: one pool, one schema registry, one type policy.
//!
//! Each method borrows a pooled connection for its own read/modify/write
//! sequence and hands it back before returning.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use log::info;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    batch::RowBatch,
    config::StoreConfig,
    error::Result,
    object::{self, Codec},
    query,
    schema::{ColumnDef, KeyColumns, SchemaRegistry, TableSchema},
    sqlite::SqlitePool,
    sync::{self, SyncReport},
    transport::{ConnectionPool, PooledConnection},
    types::{ColumnRole, TypeMap},
    upsert::{self, UpsertOptions, UpsertReport},
    value::Value,
};

pub struct Store {
    pool: Box<dyn ConnectionPool>,
    registry: SchemaRegistry,
    type_map: TypeMap,
}

impl Store {
    /// Opens the SQLite database named by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = SqlitePool::open(config)?;
        info!("Opened store at '{}'", config.database);
        Ok(Store::with_pool(Box::new(pool), config.type_map()))
    }

    /// Wraps any [`ConnectionPool`].
    pub fn with_pool(pool: Box<dyn ConnectionPool>, type_map: TypeMap) -> Self {
        Store {
            pool,
            registry: SchemaRegistry::new(),
            type_map,
        }
    }

    pub fn type_map(&self) -> &TypeMap {
        &self.type_map
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Upsert options carrying this store's type map.
    pub fn upsert_options(&self, keys: KeyColumns) -> UpsertOptions {
        UpsertOptions::new(keys).type_map(self.type_map.clone())
    }

    fn connection(&self) -> Result<PooledConnection<'_>> {
        PooledConnection::acquire(self.pool.as_ref())
    }

    pub fn close(self) {
        self.pool.close();
        info!("Store closed");
    }

    /// Runs a trivial query on a pooled connection.
    pub fn ping(&self) -> Result<()> {
        self.connection()?.ping()
    }

    /// Creates (or widens) `table` from column roles alone.
    ///
    /// Roles that need sample values to resolve (`Other`) must be covered by
    /// an override in `type_map`.
    pub fn create_table(
        &self,
        table: &str,
        columns: &[(&str, ColumnRole)],
        keys: &KeyColumns,
        type_map: &TypeMap,
    ) -> Result<SyncReport> {
        let desired = columns
            .iter()
            .map(|(name, role)| {
                let (native, origin) = type_map.resolve(table, name, *role, &[])?;
                Ok(ColumnDef {
                    name: (*name).to_string(),
                    role: *role,
                    native,
                    origin,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.ensure_table(table, &desired, keys, true)
    }

    pub fn ensure_table(
        &self,
        table: &str,
        desired: &[ColumnDef],
        keys: &KeyColumns,
        index_keys: bool,
    ) -> Result<SyncReport> {
        let mut conn = self.connection()?;
        let (_, report) =
            sync::ensure_table(&mut *conn, &self.registry, table, desired, keys, index_keys)?;
        Ok(report)
    }

    /// Stored schema of `table`, or `None` when it does not exist.
    pub fn table_schema(&self, table: &str, keys: &KeyColumns) -> Result<Option<TableSchema>> {
        let mut conn = self.connection()?;
        sync::introspect(&mut *conn, &self.registry, table, keys)
    }

    pub fn upsert(&self, table: &str, batch: RowBatch, options: &UpsertOptions) -> Result<UpsertReport> {
        let mut conn = self.connection()?;
        upsert::upsert(&mut *conn, &self.registry, table, batch, options)
    }

    pub fn upsert_record(
        &self,
        table: &str,
        symbol: Option<&str>,
        fields: &BTreeMap<String, Value>,
    ) -> Result<UpsertReport> {
        let mut conn = self.connection()?;
        upsert::upsert_record(&mut *conn, &self.registry, table, symbol, fields, &self.type_map)
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.connection()?;
        query::list_tables(&mut *conn)
    }

    pub fn union_columns(&self, tables: &[&str]) -> Result<BTreeSet<String>> {
        let mut conn = self.connection()?;
        query::union_columns(&mut *conn, tables)
    }

    pub fn latest_date(
        &self,
        table: &str,
        symbol: Option<&str>,
        keys: &KeyColumns,
        strict: bool,
    ) -> Result<Option<Value>> {
        let mut conn = self.connection()?;
        query::latest_date(&mut *conn, table, symbol, keys, strict)
    }

    pub fn all_data_for_symbol(
        &self,
        symbol: &str,
        keys: &KeyColumns,
        tables: Option<&[String]>,
        drop_symbol_col: bool,
    ) -> Result<BTreeMap<String, RowBatch>> {
        let mut conn = self.connection()?;
        query::all_data_for_symbol(&mut *conn, symbol, keys, tables, drop_symbol_col)
    }

    pub fn symbol_data(
        &self,
        table: &str,
        symbol: &str,
        keys: &KeyColumns,
        drop_symbol_col: bool,
    ) -> Result<RowBatch> {
        let mut conn = self.connection()?;
        query::symbol_data(&mut *conn, table, symbol, keys, drop_symbol_col)
    }

    pub fn symbols_data(&self, table: &str, symbols: &[&str], symbol_column: &str) -> Result<RowBatch> {
        let mut conn = self.connection()?;
        query::symbols_data(&mut *conn, table, symbols, symbol_column)
    }

    pub fn tables_exist(&self, tables: &[&str]) -> Result<bool> {
        let mut conn = self.connection()?;
        query::tables_exist(&mut *conn, tables)
    }

    pub fn has_nonzero_rows(&self, tables: &[&str], filter: Option<(&str, Value)>) -> Result<bool> {
        let mut conn = self.connection()?;
        query::has_nonzero_rows(&mut *conn, tables, filter)
    }

    pub fn store_payload(
        &self,
        table: &str,
        symbol: &str,
        date: NaiveDateTime,
        payload: &[u8],
    ) -> Result<UpsertReport> {
        let mut conn = self.connection()?;
        object::store(&mut *conn, &self.registry, table, symbol, date, payload, &self.type_map)
    }

    pub fn fetch_payload(&self, table: &str, symbol: &str, date: NaiveDateTime) -> Result<Vec<u8>> {
        let mut conn = self.connection()?;
        object::fetch(&mut *conn, table, symbol, date)
    }

    pub fn fetch_latest_payload(&self, table: &str, symbol: &str) -> Result<(NaiveDateTime, Vec<u8>)> {
        let mut conn = self.connection()?;
        object::fetch_latest(&mut *conn, table, symbol)
    }

    pub fn store_object<T: Serialize, C: Codec>(
        &self,
        table: &str,
        symbol: &str,
        date: NaiveDateTime,
        value: &T,
        codec: &C,
    ) -> Result<UpsertReport> {
        let payload = codec.encode(value)?;
        self.store_payload(table, symbol, date, &payload)
    }

    /// Decodes the object stored at `date`, or the latest one when `date` is
    /// `None`.
    pub fn fetch_object<T: DeserializeOwned, C: Codec>(
        &self,
        table: &str,
        symbol: &str,
        date: Option<NaiveDateTime>,
        codec: &C,
    ) -> Result<T> {
        let mut conn = self.connection()?;
        object::fetch_object(&mut *conn, table, symbol, date, codec)
    }
}
