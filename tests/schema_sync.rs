use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use series_store::{
    ColumnDef, ColumnRole, KeyColumns, NativeType, Store, StoreConfig, StoreError, TypeOrigin,
    schema::column_definitions,
};

const POOL: [(&str, NativeType); 6] = [
    ("open", NativeType::Float),
    ("close", NativeType::Float),
    ("volume", NativeType::Integer),
    ("venue", NativeType::Text { max_len: Some(16) }),
    ("halted", NativeType::Boolean),
    ("traded_at", NativeType::DateTime),
];

fn desired(mask: &[bool]) -> Vec<ColumnDef> {
    POOL.iter()
        .zip(mask)
        .filter(|(_, keep)| **keep)
        .map(|((name, native), _)| ColumnDef::new(*name, ColumnRole::Other, *native))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn stored_columns_are_the_union_of_requests(
        masks in proptest::collection::vec(proptest::collection::vec(any::<bool>(), POOL.len()), 1..6)
    ) {
        let store = Store::open(&StoreConfig::in_memory()).unwrap();
        let mut expected: BTreeMap<String, NativeType> = BTreeMap::new();
        for mask in &masks {
            let columns = desired(mask);
            if columns.is_empty() && expected.is_empty() {
                continue;
            }
            store.ensure_table("bars", &columns, &KeyColumns::none(), false).unwrap();
            for column in columns {
                expected.entry(column.name).or_insert(column.native);
            }
            let schema = store
                .table_schema("bars", &KeyColumns::none())
                .unwrap()
                .expect("table exists");
            prop_assert_eq!(schema.native_types(), expected.clone());
        }
    }
}

#[test]
fn bounded_text_widening_is_a_conflict() {
    let store = Store::open(&StoreConfig::in_memory()).unwrap();
    let narrow = ColumnDef::new("venue", ColumnRole::Categorical, NativeType::bounded_text(8));
    store.ensure_table("bars", &[narrow], &KeyColumns::none(), false).unwrap();

    let shorter = ColumnDef::new("venue", ColumnRole::Categorical, NativeType::bounded_text(4));
    assert!(store.ensure_table("bars", &[shorter], &KeyColumns::none(), false).is_ok());

    let wider = ColumnDef::new("venue", ColumnRole::Categorical, NativeType::bounded_text(32));
    let err = store
        .ensure_table("bars", &[wider], &KeyColumns::none(), false)
        .unwrap_err();
    assert!(matches!(err, StoreError::SchemaConflict { .. }));
}

#[test]
fn conflict_aborts_before_adding_columns() {
    let store = Store::open(&StoreConfig::in_memory()).unwrap();
    store
        .ensure_table(
            "bars",
            &[ColumnDef::new("volume", ColumnRole::Numeric, NativeType::Integer)],
            &KeyColumns::none(),
            false,
        )
        .unwrap();
    let request = [
        ColumnDef::new("extra", ColumnRole::Numeric, NativeType::Float),
        ColumnDef::new("volume", ColumnRole::Categorical, NativeType::text()),
    ];
    assert!(store.ensure_table("bars", &request, &KeyColumns::none(), false).is_err());
    let columns = store.union_columns(&["bars"]).unwrap();
    assert_eq!(columns, BTreeSet::from(["volume".to_string()]));
}

#[test]
fn invalid_identifiers_are_refused() {
    let store = Store::open(&StoreConfig::in_memory()).unwrap();
    let column = ColumnDef::new("price", ColumnRole::Numeric, NativeType::Float);
    let err = store
        .ensure_table("prices; DROP TABLE x", &[column], &KeyColumns::none(), false)
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidIdentifier(_)));
}

#[test]
fn ddl_fragments_skip_excluded_columns() {
    let columns = [
        ColumnDef::new("symbol", ColumnRole::Symbol, NativeType::bounded_text(64)),
        ColumnDef::new("metric_a", ColumnRole::Numeric, NativeType::Float),
        ColumnDef::new("metric_b", ColumnRole::Categorical, NativeType::bounded_text(64)),
    ];
    let fragments = column_definitions(&columns, &["symbol"]).unwrap();
    assert_eq!(fragments, ["\"metric_a\" DOUBLE", "\"metric_b\" VARCHAR(64)"]);
    assert_eq!(columns[1].origin, TypeOrigin::Declared);
}
