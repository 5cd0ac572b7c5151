//! Ordered, homogeneous row container shared by writes and reads.

use std::{collections::BTreeMap, path::Path};

use anyhow::Context;

use crate::{
    error::{Result, StoreError},
    value::{Value, infer_value},
};

pub type Row = Vec<Option<Value>>;

/// Rows sharing one column list. Cells are positional; `None` is NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl RowBatch {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RowBatch {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn with_rows<I, S>(columns: I, rows: Vec<Row>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut batch = RowBatch::new(columns);
        for row in rows {
            batch.push(row)?;
        }
        Ok(batch)
    }

    /// Builds a batch from name/value records; the column list is the union
    /// of keys in first-seen order and missing cells become NULL.
    pub fn from_records(records: &[BTreeMap<String, Value>]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for name in record.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        let rows = records
            .iter()
            .map(|record| columns.iter().map(|c| record.get(c).cloned()).collect())
            .collect();
        RowBatch { columns, rows }
    }

    /// Reads a CSV file with a header row; each cell is typed with
    /// [`infer_value`].
    pub fn from_csv_path(path: &Path, delimiter: u8) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .from_path(path)
            .with_context(|| format!("Opening CSV file {path:?}"))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Reading headers of {path:?}"))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        let mut batch = RowBatch::new(headers);
        for (idx, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("Reading row {} in {path:?}", idx + 2))?;
            let row = (0..batch.width())
                .map(|col| record.get(col).and_then(infer_value))
                .collect();
            batch
                .push(row)
                .with_context(|| format!("Row {} in {path:?}", idx + 2))?;
        }
        Ok(batch)
    }

    pub fn push(&mut self, row: Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(StoreError::InvalidBatch(format!(
                "row has {} cell(s) but the batch has {} column(s)",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_ref()
    }

    pub fn row(&self, row: usize) -> Option<&Row> {
        self.rows.get(row)
    }

    /// Non-null values of one column, in row order.
    pub fn column_values(&self, column: &str) -> Vec<&Value> {
        match self.column_index(column) {
            Some(idx) => self.rows.iter().filter_map(|row| row[idx].as_ref()).collect(),
            None => Vec::new(),
        }
    }

    /// Appends `column` (filled with `fill`) when absent, returning its index.
    pub fn ensure_column(&mut self, column: &str, fill: Option<Value>) -> usize {
        if let Some(idx) = self.column_index(column) {
            return idx;
        }
        self.columns.push(column.to_string());
        for row in &mut self.rows {
            row.push(fill.clone());
        }
        self.columns.len() - 1
    }

    pub fn set(&mut self, row: usize, column: usize, value: Option<Value>) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(column)) {
            *cell = value;
        }
    }

    pub fn drop_column(&mut self, column: &str) {
        if let Some(idx) = self.column_index(column) {
            self.columns.remove(idx);
            for row in &mut self.rows {
                row.remove(idx);
            }
        }
    }

    /// Copy of the selected rows, in the given order.
    pub fn select(&self, indices: &[usize]) -> RowBatch {
        RowBatch {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|idx| self.rows.get(*idx).cloned())
                .collect(),
        }
    }
}
