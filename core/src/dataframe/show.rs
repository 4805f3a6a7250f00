use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::{ArrayFormatter, FormatOptions};

use crate::error::Result;

const MIN_COLUMN_WIDTH: usize = 3;

/// Render rows the way Spark's `show` does. Rows beyond `limit` are not
/// printed and produce the `only showing top` footer.
pub(crate) fn format_table(
    columns: &[String],
    batches: &[RecordBatch],
    limit: usize,
    truncate: Option<usize>,
) -> Result<String> {
    let options = FormatOptions::default().with_null("NULL");
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut total = 0;
    for batch in batches {
        total += batch.num_rows();
        if rows.len() >= limit {
            continue;
        }
        let formatters = batch
            .columns()
            .iter()
            .map(|array| ArrayFormatter::try_new(array.as_ref(), &options))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for row in 0..batch.num_rows() {
            if rows.len() >= limit {
                break;
            }
            let cells = formatters
                .iter()
                .map(|f| cut(f.value(row).to_string(), truncate))
                .collect();
            rows.push(cells);
        }
    }

    let header: Vec<String> = columns.iter().map(|c| cut(c.clone(), truncate)).collect();
    let widths: Vec<usize> = header
        .iter()
        .enumerate()
        .map(|(i, name)| {
            rows.iter()
                .map(|r| r[i].chars().count())
                .chain([name.chars().count(), MIN_COLUMN_WIDTH])
                .max()
                .unwrap_or(MIN_COLUMN_WIDTH)
        })
        .collect();

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(*w)))
        .collect::<String>()
        + "+\n";
    let line = |cells: &[String]| -> String {
        let mut out = String::new();
        for (cell, width) in cells.iter().zip(&widths) {
            let padded = if truncate.is_some() {
                format!("|{cell:>width$}")
            } else {
                format!("|{cell:<width$}")
            };
            out.push_str(&padded);
        }
        out.push_str("|\n");
        out
    };

    let mut out = separator.clone();
    out.push_str(&line(&header));
    out.push_str(&separator);
    for row in &rows {
        out.push_str(&line(row));
    }
    out.push_str(&separator);
    if total > limit {
        let noun = if limit == 1 { "row" } else { "rows" };
        out.push_str(&format!("only showing top {limit} {noun}\n"));
    }
    Ok(out)
}

fn cut(value: String, truncate: Option<usize>) -> String {
    match truncate {
        Some(max) if value.chars().count() > max => {
            if max < 4 {
                value.chars().take(max).collect()
            } else {
                let kept: String = value.chars().take(max - 3).collect();
                kept + "..."
            }
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 22, 333])),
                Arc::new(StringArray::from(vec![
                    Some("Alice"),
                    None,
                    Some("a rather long name that overflows"),
                ])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_format_table() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let out = format_table(&columns, &[batch()], 2, Some(20)).unwrap();
        let expected = "\
+---+-----+
| id| name|
+---+-----+
|  1|Alice|
| 22| NULL|
+---+-----+
only showing top 2 rows
";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_truncation() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let out = format_table(&columns, &[batch()], 10, Some(20)).unwrap();
        assert!(out.contains("|a rather long nam...|"));
        assert!(!out.contains("only showing"));

        let full = format_table(&columns, &[batch()], 10, None).unwrap();
        assert!(full.contains("|a rather long name that overflows|"));
    }
}
