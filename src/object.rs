//! Opaque payloads stored under a (symbol, date) key.
//!
//! Object tables hold `symbol`, `date` and `payload` columns with a unique
//! index on the key; storing twice under the same key replaces the payload.

use chrono::NaiveDateTime;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    batch::RowBatch,
    error::{Result, StoreError},
    reconcile::DuplicatePolicy,
    schema::{KeyColumns, SchemaRegistry, describe_key, validate_identifier},
    transport::{Filter, Transport},
    types::{NativeType, TypeMap},
    upsert::{UpsertOptions, UpsertReport, upsert},
    value::Value,
};

pub const SYMBOL_COLUMN: &str = "symbol";
pub const DATE_COLUMN: &str = "date";
pub const PAYLOAD_COLUMN: &str = "payload";

/// Turns values into payload bytes and back.
pub trait Codec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// bincode 2 with the standard configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|err| StoreError::Codec(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|err| StoreError::Codec(err.to_string()))?;
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|err| StoreError::Codec(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|err| StoreError::Codec(err.to_string()))
    }
}

fn object_keys() -> KeyColumns {
    KeyColumns::symbol_date(SYMBOL_COLUMN, DATE_COLUMN)
}

fn describe(symbol: &str, date: &NaiveDateTime) -> String {
    describe_key(
        &object_keys(),
        &[Some(Value::from(symbol)), Some(Value::DateTime(*date))],
    )
}

/// Stores `payload` under (`symbol`, `date`), replacing any earlier payload.
pub fn store(
    conn: &mut dyn Transport,
    registry: &SchemaRegistry,
    table: &str,
    symbol: &str,
    date: NaiveDateTime,
    payload: &[u8],
    type_map: &TypeMap,
) -> Result<UpsertReport> {
    let batch = RowBatch::with_rows(
        [SYMBOL_COLUMN, DATE_COLUMN, PAYLOAD_COLUMN],
        vec![vec![
            Some(Value::from(symbol)),
            Some(Value::DateTime(date)),
            Some(Value::Blob(payload.to_vec())),
        ]],
    )?;
    let options = UpsertOptions::new(object_keys())
        .type_map(
            type_map
                .clone()
                .with_override(DATE_COLUMN, NativeType::DateTime)
                .with_override(PAYLOAD_COLUMN, NativeType::Blob),
        )
        .duplicates(DuplicatePolicy::Overwrite);
    upsert(conn, registry, table, batch, &options)
}

/// Payload stored under exactly (`symbol`, `date`).
pub fn fetch(
    conn: &mut dyn Transport,
    table: &str,
    symbol: &str,
    date: NaiveDateTime,
) -> Result<Vec<u8>> {
    validate_identifier(table)?;
    let filter = Filter::all()
        .eq(SYMBOL_COLUMN, symbol)
        .eq(DATE_COLUMN, Value::DateTime(date));
    let rows = conn.select_rows(table, &filter, None)?;
    rows.get(0, PAYLOAD_COLUMN)
        .and_then(Value::as_blob)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| StoreError::NotFound {
            table: table.to_string(),
            key: describe(symbol, &date),
        })
}

/// Most recent payload of `symbol` with its date.
pub fn fetch_latest(
    conn: &mut dyn Transport,
    table: &str,
    symbol: &str,
) -> Result<(NaiveDateTime, Vec<u8>)> {
    validate_identifier(table)?;
    let latest = conn
        .max_value(table, DATE_COLUMN, &Filter::all().eq(SYMBOL_COLUMN, symbol))?
        .and_then(|value| value.as_datetime());
    let Some(date) = latest else {
        return Err(StoreError::NotFound {
            table: table.to_string(),
            key: describe_key(&object_keys(), &[Some(Value::from(symbol)), None]),
        });
    };
    Ok((date, fetch(conn, table, symbol, date)?))
}

pub fn fetch_object<T: DeserializeOwned, C: Codec>(
    conn: &mut dyn Transport,
    table: &str,
    symbol: &str,
    date: Option<NaiveDateTime>,
    codec: &C,
) -> Result<T> {
    let payload = match date {
        Some(date) => fetch(conn, table, symbol, date)?,
        None => fetch_latest(conn, table, symbol)?.1,
    };
    codec.decode(&payload)
}
