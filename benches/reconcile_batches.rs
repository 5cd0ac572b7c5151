use chrono::NaiveDate;
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use series_store::{
    DuplicatePolicy, KeyColumns, NullKeyPolicy, RowBatch, Store, StoreConfig, Value,
    reconcile::{ReconcileOptions, reconcile},
};

const SYMBOLS: [&str; 4] = ["AAPL", "MSFT", "TSLA", "NVDA"];

fn generate_prices(days: usize, bump: f64) -> RowBatch {
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).expect("start date");
    let mut batch = RowBatch::new(["symbol", "date", "price", "venue"]);
    for day in 0..days {
        let date = start + chrono::Days::new(day as u64);
        for (idx, symbol) in SYMBOLS.iter().enumerate() {
            batch
                .push(vec![
                    Some(Value::from(*symbol)),
                    Some(Value::Date(date)),
                    Some(Value::Float(100.0 + idx as f64 + day as f64 * 0.01 + bump)),
                    Some(Value::from(if day % 2 == 0 { "XNAS" } else { "XNYS" })),
                ])
                .expect("row");
        }
    }
    batch
}

fn options(update_latest: bool) -> ReconcileOptions {
    ReconcileOptions {
        keys: KeyColumns::symbol_date("symbol", "date"),
        update_latest,
        null_keys: NullKeyPolicy::Keep,
        duplicates: DuplicatePolicy::Keep,
    }
}

fn bench_reconcile(c: &mut Criterion) {
    let stored = generate_prices(2_000, 0.0);
    let candidates = generate_prices(2_000, 0.5);

    c.bench_function("reconcile_latest_8k_rows", |b| {
        b.iter(|| reconcile("prices", &candidates, &stored, &options(true)).expect("reconcile"))
    });

    c.bench_function("reconcile_append_only_8k_rows", |b| {
        b.iter(|| reconcile("prices", &candidates, &stored, &options(false)).expect("reconcile"))
    });
}

fn bench_upsert(c: &mut Criterion) {
    c.bench_function("upsert_into_memory_store_2k_rows", |b| {
        b.iter_batched(
            || {
                let store = Store::open(&StoreConfig::in_memory()).expect("open store");
                store
                    .upsert(
                        "prices",
                        generate_prices(250, 0.0),
                        &store
                            .upsert_options(KeyColumns::symbol_date("symbol", "date"))
                            .numeric(["price"])
                            .categorical(["venue"]),
                    )
                    .expect("seed");
                store
            },
            |store| {
                let options = store
                    .upsert_options(KeyColumns::symbol_date("symbol", "date"))
                    .numeric(["price"])
                    .categorical(["venue"])
                    .update_latest(true);
                store
                    .upsert("prices", generate_prices(500, 0.5), &options)
                    .expect("upsert");
                store.close();
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_reconcile, bench_upsert);
criterion_main!(benches);
