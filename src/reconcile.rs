//! Classification of candidate rows against stored rows.
//!
//! Each candidate lands in exactly one bucket: insert, overwrite, unchanged,
//! superseded (an earlier duplicate of a key later in the same batch) or
//! dropped (a null key under [`NullKeyPolicy::Drop`]).
//!
//! With `update_latest` set, only the row holding the latest known date of
//! its symbol may be rewritten in place; older rows are append-only. The
//! latest date is taken over candidates and stored rows together, so callers
//! should include each symbol's latest stored row in `existing`.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    batch::RowBatch,
    error::{Result, StoreError},
    schema::{KeyColumns, describe_key},
    value::{ComparableValue, Value, cells_equal},
};

/// What to do with a candidate whose key columns are not all set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NullKeyPolicy {
    /// Insert it as a new row; it is never deduplicated.
    #[default]
    Keep,
    /// Discard it.
    Drop,
    /// Abort the batch with [`StoreError::NullKey`].
    Reject,
}

/// What to do with a candidate whose key is already stored, when the
/// update-latest rule does not apply to it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Leave the stored row as it is.
    #[default]
    Keep,
    /// Leave identical rows alone; differing values abort the batch.
    RequireIdentical,
    /// Rewrite the stored row in place.
    Overwrite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub keys: KeyColumns,
    pub update_latest: bool,
    pub null_keys: NullKeyPolicy,
    pub duplicates: DuplicatePolicy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub to_insert: RowBatch,
    pub to_overwrite: RowBatch,
    pub unchanged: RowBatch,
    pub superseded: usize,
    pub dropped_null_keys: usize,
}

type KeyTuple = Vec<ComparableValue>;

struct KeyIndex {
    positions: Vec<Option<usize>>,
    symbol: Option<usize>,
    date: Option<usize>,
}

impl KeyIndex {
    fn new(batch: &RowBatch, keys: &KeyColumns) -> Self {
        let lookup = |name: &str| batch.column_index(name);
        KeyIndex {
            positions: keys.names().into_iter().map(lookup).collect(),
            symbol: keys.symbol.as_deref().and_then(lookup),
            date: keys.date.as_deref().and_then(lookup),
        }
    }

    /// Key tuple of `row`, or `None` when any key cell is missing or NULL.
    fn key(&self, row: &[Option<Value>]) -> Option<KeyTuple> {
        self.positions
            .iter()
            .map(|pos| {
                pos.and_then(|idx| row[idx].clone())
                    .map(|value| ComparableValue(Some(value)))
            })
            .collect()
    }

    fn missing_column<'a>(&self, row: &[Option<Value>], keys: &'a KeyColumns) -> &'a str {
        keys.names()
            .into_iter()
            .zip(&self.positions)
            .find(|(_, pos)| pos.and_then(|idx| row[idx].as_ref()).is_none())
            .map(|(name, _)| name)
            .unwrap_or_default()
    }

    fn symbol_of(&self, row: &[Option<Value>]) -> ComparableValue {
        ComparableValue(self.symbol.and_then(|idx| row[idx].clone()))
    }

    fn date_of<'r>(&self, row: &'r [Option<Value>]) -> Option<&'r Value> {
        self.date.and_then(|idx| row[idx].as_ref())
    }
}

/// Splits `candidates` into insert / overwrite / unchanged against
/// `existing`.
pub fn reconcile(
    table: &str,
    candidates: &RowBatch,
    existing: &RowBatch,
    options: &ReconcileOptions,
) -> Result<Reconciliation> {
    let columns = candidates.columns().to_vec();
    let mut outcome = Reconciliation {
        to_insert: RowBatch::new(columns.clone()),
        to_overwrite: RowBatch::new(columns.clone()),
        unchanged: RowBatch::new(columns),
        superseded: 0,
        dropped_null_keys: 0,
    };

    if options.keys.is_empty() {
        for row in candidates.rows() {
            outcome.to_insert.push(row.clone())?;
        }
        return Ok(outcome);
    }

    let candidate_keys = KeyIndex::new(candidates, &options.keys);
    let stored_keys = KeyIndex::new(existing, &options.keys);

    let mut stored: BTreeMap<KeyTuple, usize> = BTreeMap::new();
    let mut latest: BTreeMap<ComparableValue, Value> = BTreeMap::new();
    for (idx, row) in existing.rows().iter().enumerate() {
        if let Some(key) = stored_keys.key(row) {
            stored.insert(key, idx);
            track_latest(&mut latest, stored_keys.symbol_of(row), stored_keys.date_of(row));
        }
    }

    // Later duplicates win; remember the surviving position of every key.
    let mut survivors: BTreeMap<KeyTuple, usize> = BTreeMap::new();
    let mut null_key_rows = BTreeSet::new();
    for (idx, row) in candidates.rows().iter().enumerate() {
        match candidate_keys.key(row) {
            Some(key) => {
                track_latest(
                    &mut latest,
                    candidate_keys.symbol_of(row),
                    candidate_keys.date_of(row),
                );
                if survivors.insert(key, idx).is_some() {
                    outcome.superseded += 1;
                }
            }
            None => match options.null_keys {
                NullKeyPolicy::Reject => {
                    return Err(StoreError::NullKey {
                        table: table.to_string(),
                        column: candidate_keys.missing_column(row, &options.keys).to_string(),
                        row: idx,
                    });
                }
                NullKeyPolicy::Drop => outcome.dropped_null_keys += 1,
                NullKeyPolicy::Keep => {
                    null_key_rows.insert(idx);
                }
            },
        }
    }
    let surviving: BTreeMap<usize, KeyTuple> =
        survivors.into_iter().map(|(key, idx)| (idx, key)).collect();

    for (idx, row) in candidates.rows().iter().enumerate() {
        if null_key_rows.contains(&idx) {
            outcome.to_insert.push(row.clone())?;
            continue;
        }
        let Some(key) = surviving.get(&idx) else {
            continue;
        };
        let Some(stored_idx) = stored.get(key) else {
            outcome.to_insert.push(row.clone())?;
            continue;
        };
        let identical = same_content(candidates, idx, existing, *stored_idx);
        let is_latest = match candidate_keys.date_of(row) {
            Some(date) => latest
                .get(&candidate_keys.symbol_of(row))
                .is_some_and(|max| max == date),
            None => true,
        };

        let overwrite = if options.update_latest && is_latest {
            !identical
        } else {
            match options.duplicates {
                DuplicatePolicy::Keep => false,
                DuplicatePolicy::Overwrite => !identical,
                DuplicatePolicy::RequireIdentical if identical => false,
                DuplicatePolicy::RequireIdentical => {
                    return Err(StoreError::DuplicateMismatch {
                        table: table.to_string(),
                        key: describe_key(&options.keys, &key_cells(key)),
                        row: idx,
                    });
                }
            }
        };
        if overwrite {
            outcome.to_overwrite.push(row.clone())?;
        } else {
            outcome.unchanged.push(row.clone())?;
        }
    }

    debug!(
        "Reconciled {} candidate(s) for '{table}': {} insert, {} overwrite, {} unchanged, {} superseded, {} dropped",
        candidates.len(),
        outcome.to_insert.len(),
        outcome.to_overwrite.len(),
        outcome.unchanged.len(),
        outcome.superseded,
        outcome.dropped_null_keys
    );
    Ok(outcome)
}

fn track_latest(
    latest: &mut BTreeMap<ComparableValue, Value>,
    symbol: ComparableValue,
    date: Option<&Value>,
) {
    let Some(date) = date else {
        return;
    };
    latest
        .entry(symbol)
        .and_modify(|current| {
            if *date > *current {
                *current = date.clone();
            }
        })
        .or_insert_with(|| date.clone());
}

fn key_cells(key: &KeyTuple) -> Vec<Option<Value>> {
    key.iter().map(|cell| cell.0.clone()).collect()
}

/// Whether every candidate cell equals the stored cell of the same column.
/// Columns the stored row lacks count as NULL there.
fn same_content(candidates: &RowBatch, row: usize, existing: &RowBatch, stored_row: usize) -> bool {
    let (Some(candidate), Some(stored)) = (candidates.row(row), existing.row(stored_row)) else {
        return false;
    };
    candidates
        .columns()
        .iter()
        .zip(candidate)
        .all(|(column, cell)| {
            let stored_cell = existing
                .column_index(column)
                .and_then(|idx| stored[idx].as_ref());
            cells_equal(cell.as_ref(), stored_cell)
        })
}

/// Candidate rows that already appear in `stored`, comparing the columns the
/// two batches share.
pub fn existing_rows(candidates: &RowBatch, stored: &RowBatch) -> RowBatch {
    let shared = candidates
        .columns()
        .iter()
        .filter_map(|c| Some((candidates.column_index(c)?, stored.column_index(c)?)))
        .collect::<Vec<_>>();
    if shared.is_empty() {
        return RowBatch::new(candidates.columns().to_vec());
    }
    let stored_tuples = stored
        .rows()
        .iter()
        .map(|row| {
            shared
                .iter()
                .map(|(_, idx)| ComparableValue(row[*idx].clone()))
                .collect::<Vec<_>>()
        })
        .collect::<BTreeSet<_>>();
    let matching = candidates
        .rows()
        .iter()
        .enumerate()
        .filter(|(_, row)| {
            let tuple = shared
                .iter()
                .map(|(idx, _)| ComparableValue(row[*idx].clone()))
                .collect::<Vec<_>>();
            stored_tuples.contains(&tuple)
        })
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>();
    candidates.select(&matching)
}
