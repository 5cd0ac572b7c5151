mod common;

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use common::TestWorkspace;
use serde::{Deserialize, Serialize};
use series_store::{BincodeCodec, JsonCodec, KeyColumns, StoreError, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Position {
    when: NaiveDateTime,
    quantities: Vec<i64>,
    tags: BTreeMap<String, String>,
}

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 3)
        .unwrap()
        .and_hms_micro_opt(hour, minute, 5, 123_456)
        .unwrap()
}

fn position(hour: u32) -> Position {
    let mut tags = BTreeMap::new();
    tags.insert("desk".to_string(), "equities".to_string());
    Position {
        when: at(hour, 0),
        quantities: vec![1, 2, 3],
        tags,
    }
}

#[test]
fn payload_round_trips_through_a_file_database() {
    let workspace = TestWorkspace::new();
    let store = workspace.open();
    let payload = vec![0u8, 159, 146, 150, 255];
    store
        .store_payload("object_store", "AAPL", at(9, 15), &payload)
        .expect("store payload");
    store.close();

    let store = workspace.open();
    assert_eq!(
        store.fetch_payload("object_store", "AAPL", at(9, 15)).unwrap(),
        payload
    );
    let (date, latest) = store.fetch_latest_payload("object_store", "AAPL").unwrap();
    assert_eq!(date, at(9, 15));
    assert_eq!(latest, payload);
}

#[test]
fn missing_objects_are_not_found() {
    let workspace = TestWorkspace::new();
    let store = workspace.open();
    assert!(matches!(
        store.fetch_payload("object_store", "AAPL", at(9, 0)),
        Err(StoreError::NotFound { .. })
    ));
    store
        .store_payload("object_store", "AAPL", at(9, 0), b"x")
        .unwrap();
    assert!(matches!(
        store.fetch_latest_payload("object_store", "MSFT"),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn typed_objects_keep_one_row_per_key() {
    let workspace = TestWorkspace::new();
    let store = workspace.open();
    let first = position(9);
    let mut second = position(9);
    second.quantities.push(4);

    store
        .store_object("positions", "AAPL", at(9, 0), &first, &BincodeCodec)
        .unwrap();
    let report = store
        .store_object("positions", "AAPL", at(9, 0), &second, &BincodeCodec)
        .unwrap();
    assert_eq!(report.overwritten, 1);
    store
        .store_object("positions", "AAPL", at(7, 0), &first, &BincodeCodec)
        .unwrap();

    let latest: Position = store
        .fetch_object("positions", "AAPL", None, &BincodeCodec)
        .unwrap();
    assert_eq!(latest, second);
    let rows = store
        .symbol_data("positions", "AAPL", &KeyColumns::symbol_date("symbol", "date"), true)
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(matches!(rows.get(0, "payload"), Some(Value::Blob(_))));
}

#[test]
fn codec_mismatch_is_reported() {
    let workspace = TestWorkspace::new();
    let store = workspace.open();
    store
        .store_object("positions", "AAPL", at(9, 0), &position(9), &BincodeCodec)
        .unwrap();
    let err = store
        .fetch_object::<Position, _>("positions", "AAPL", Some(at(9, 0)), &JsonCodec)
        .unwrap_err();
    assert!(matches!(err, StoreError::Codec(_)));
}
