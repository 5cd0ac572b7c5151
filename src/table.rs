use std::borrow::Cow;
use std::fmt::Write as _;

use crate::{batch::RowBatch, value::Value};

const NULL_MARKER: &str = "NULL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
}

/// Renders a batch as an aligned text table. Numeric columns are right
/// aligned and NULL cells print as `NULL`.
pub fn render_batch(batch: &RowBatch) -> String {
    let aligns = batch
        .columns()
        .iter()
        .map(|column| {
            let values = batch.column_values(column);
            let numeric = !values.is_empty()
                && values
                    .iter()
                    .all(|v| matches!(v, Value::Integer(_) | Value::Float(_)));
            if numeric { Align::Right } else { Align::Left }
        })
        .collect::<Vec<_>>();
    let rows = batch
        .rows()
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Some(Value::Blob(bytes)) => format!("<{} bytes>", bytes.len()),
                    Some(value) => value.as_display(),
                    None => NULL_MARKER.to_string(),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    render(batch.columns(), &rows, &aligns)
}

pub fn print_batch(batch: &RowBatch) {
    print!("{}", render_batch(batch));
}

/// Renders plain string cells, all left aligned.
pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    render(headers, rows, &vec![Align::Left; headers.len()])
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn render(headers: &[String], rows: &[Vec<String>], aligns: &[Align]) -> String {
    let mut widths = headers
        .iter()
        .map(|h| h.chars().count().max(3))
        .collect::<Vec<_>>();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(sanitize(cell).chars().count());
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", line(headers, &widths, aligns));
    let rule = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", line(&rule, &widths, aligns));
    for row in rows {
        let _ = writeln!(output, "{}", line(row, &widths, aligns));
    }
    output
}

fn line(cells: &[String], widths: &[usize], aligns: &[Align]) -> String {
    let mut rendered = cells
        .iter()
        .zip(widths)
        .zip(aligns)
        .map(|((cell, width), align)| {
            let cell = sanitize(cell);
            match align {
                Align::Left => format!("{cell:<width$}"),
                Align::Right => format!("{cell:>width$}"),
            }
        })
        .collect::<Vec<_>>()
        .join("  ");
    let trimmed = rendered.trim_end().len();
    rendered.truncate(trimmed);
    rendered
}

fn sanitize(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}
