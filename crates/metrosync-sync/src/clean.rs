//! Raw sheet records to typed rows.

use std::collections::BTreeMap;

use metrosync_core::{MetroSchema, RawRecord, Row};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("key column {column:?} is absent from every record; check the table selector")]
    MissingKeyColumn { column: String },
}

/// Filter out keyless records, number the survivors from 1 and coerce the
/// numeric columns.
pub fn clean(raw: &[RawRecord], schema: &MetroSchema) -> Result<Vec<Row>, SchemaError> {
    if !raw.iter().any(|record| record.contains_key(&schema.key_column)) {
        return Err(SchemaError::MissingKeyColumn {
            column: schema.key_column.clone(),
        });
    }

    Ok(raw
        .iter()
        .filter_map(|record| {
            let key = key_text(record.get(&schema.key_column))?;
            let fields: BTreeMap<String, u64> = schema
                .numeric_columns()
                .map(|column| (column.to_string(), coerce_count(record.get(column))))
                .collect();
            Some((key, fields))
        })
        .enumerate()
        .map(|(index, (key, fields))| Row {
            key,
            sequence_id: index as u64 + 1,
            fields,
        })
        .collect())
}

/// `None` for null, missing, empty or literal `"null"` keys.
fn key_text(value: Option<&JsonValue>) -> Option<String> {
    let text = match value? {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => return None,
    };
    if text.is_empty() || text == "null" {
        None
    } else {
        Some(text)
    }
}

/// Parse a cell as a count. Anything unparsable, negative or non-finite is 0;
/// fractions truncate toward zero.
pub fn coerce_count(value: Option<&JsonValue>) -> u64 {
    match value {
        Some(JsonValue::Number(n)) => match n.as_u64() {
            Some(v) => v,
            None => n.as_f64().map(float_to_count).unwrap_or(0),
        },
        Some(JsonValue::String(s)) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(float_to_count))
                .unwrap_or(0)
        }
        Some(JsonValue::Bool(b)) => u64::from(*b),
        _ => 0,
    }
}

fn float_to_count(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.trunc() as u64
}
