#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use series_store::{RowBatch, Store, StoreConfig, Value};
use tempfile::{TempDir, tempdir};

/// Scratch directory holding a database file; removed on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn database(&self) -> PathBuf {
        self.temp_dir.path().join("store.db")
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig::with_database_path(&self.database())
    }

    /// Opens (or reopens) the workspace database.
    pub fn open(&self) -> Store {
        Store::open(&self.config()).expect("open store")
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }
}

pub fn day(d: u32) -> Value {
    Value::Date(NaiveDate::from_ymd_opt(2024, 1, d).expect("valid day"))
}

/// `(date, symbol, price, note)` rows for AAPL on 2024-01-01 onwards.
pub fn prices(prices: &[f64]) -> RowBatch {
    let rows = prices
        .iter()
        .enumerate()
        .map(|(idx, price)| {
            vec![
                Some(day(idx as u32 + 1)),
                Some(Value::from("AAPL")),
                Some(Value::Float(*price)),
                Some(Value::from("ok")),
            ]
        })
        .collect();
    RowBatch::with_rows(["date", "symbol", "price", "note"], rows).expect("prices batch")
}

pub fn price_at(store: &Store, d: u32) -> Option<Value> {
    let keys = series_store::KeyColumns::symbol_date("symbol", "date");
    let rows = store
        .symbol_data("prices", "AAPL", &keys, false)
        .expect("read prices");
    (0..rows.len())
        .find(|idx| rows.get(*idx, "date") == Some(&day(d)))
        .and_then(|idx| rows.get(idx, "price").cloned())
}
