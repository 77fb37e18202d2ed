use crate::schema::{FieldKind, FieldSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A typed row: field name to coerced value.
pub type Record = Map<String, Value>;

/// Record set of one table, keyed by the key column's value.
pub type RecordSet = BTreeMap<String, Record>;

const TRUE_WORDS: &[&str] = &["true", "1", "yes", "y", "是"];
const FALSE_WORDS: &[&str] = &["false", "0", "no", "n", "否"];

/// Output of transforming one table's data rows
#[derive(Debug, Clone, PartialEq)]
pub struct TableRecords {
    pub schema: FieldSchema,
    pub records: RecordSet,
    pub warnings: Vec<TransformWarning>,
}

impl TableRecords {
    /// Rebuild from a previously published snapshot (no warnings carried).
    pub fn from_parts(schema: FieldSchema, records: RecordSet) -> Self {
        TableRecords {
            schema,
            records,
            warnings: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A cell that could not be coerced to its field kind and was kept as the
/// raw string instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoercionWarning {
    pub row: usize,
    pub field: String,
    pub kind: FieldKind,
    pub raw: String,
    pub reason: String,
}

/// Non-fatal issues found while transforming rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformWarning {
    Coercion(CoercionWarning),
    MissingKey { row: usize },
    DuplicateKey { row: usize, key: String },
}

impl fmt::Display for TransformWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformWarning::Coercion(w) => write!(
                f,
                "row {}: field '{}' kept raw '{}' ({} coercion failed: {})",
                w.row,
                w.field,
                w.raw,
                w.kind.as_str(),
                w.reason
            ),
            TransformWarning::MissingKey { row } => write!(f, "row {row}: key column is empty, row dropped"),
            TransformWarning::DuplicateKey { row, key } => {
                write!(f, "row {row}: duplicate key '{key}', earlier row replaced")
            }
        }
    }
}

/// Transform data rows into typed records.
///
/// Never fails: malformed cells degrade to their raw string with a warning,
/// rows without a key value are dropped with a warning, fully empty rows are
/// skipped. `row` numbers in warnings are 1-based data row positions.
pub fn transform_rows(rows: &[Vec<String>], schema: &FieldSchema) -> TableRecords {
    let mut records = RecordSet::new();
    let mut warnings = Vec::new();

    for (idx, row) in rows.iter().enumerate() {
        let row_no = idx + 1;
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }

        let (key, record) = transform_row(row_no, row, schema, &mut warnings);
        let Some(key) = key else {
            log::warn!("row {row_no}: key column '{}' is empty, dropping row", schema.key_field().name);
            warnings.push(TransformWarning::MissingKey { row: row_no });
            continue;
        };

        if records.insert(key.clone(), record).is_some() {
            log::warn!("row {row_no}: duplicate key '{key}', later row wins");
            warnings.push(TransformWarning::DuplicateKey { row: row_no, key });
        }
    }

    log::debug!("transformed {} rows into {} records", rows.len(), records.len());

    TableRecords {
        schema: schema.clone(),
        records,
        warnings,
    }
}

/// Transform a single row. Cells are aligned positionally; missing trailing
/// cells become null and cells beyond the header are ignored.
pub fn transform_row(
    row_no: usize,
    cells: &[String],
    schema: &FieldSchema,
    warnings: &mut Vec<TransformWarning>,
) -> (Option<String>, Record) {
    let mut record = Record::new();
    let mut key = None;

    for (col, field) in schema.fields().iter().enumerate() {
        let value = match cells.get(col) {
            None => Value::Null,
            Some(raw) => {
                let (value, failure) = coerce_cell(raw, field.kind);
                if let Some(reason) = failure {
                    log::warn!(
                        "row {row_no}: field '{}' ({}) kept raw value '{raw}': {reason}",
                        field.name,
                        field.kind.as_str()
                    );
                    warnings.push(TransformWarning::Coercion(CoercionWarning {
                        row: row_no,
                        field: field.name.clone(),
                        kind: field.kind,
                        raw: raw.clone(),
                        reason,
                    }));
                }
                value
            }
        };

        if field.key_column {
            key = key_string(&value);
        }
        record.insert(field.name.clone(), value);
    }

    (key, record)
}

/// Canonical key string for an indexed value; `None` for null, blanks and
/// empty containers.
fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Coerce one raw cell into a value of `kind`.
///
/// Returns the value plus a failure reason when the cell had to be kept as
/// its raw string.
pub fn coerce_cell(raw: &str, kind: FieldKind) -> (Value, Option<String>) {
    let trimmed = raw.trim();

    match kind {
        FieldKind::String => {
            if trimmed.is_empty() {
                (Value::Null, None)
            } else {
                (Value::String(raw.to_string()), None)
            }
        }
        FieldKind::Array => (parse_array(trimmed), None),
        _ if trimmed.is_empty() => (Value::Null, None),
        FieldKind::Int => match parse_int(trimmed) {
            Some(n) => (Value::Number(n.into()), None),
            None => fallback(raw, "not an integer"),
        },
        FieldKind::Float => match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => (Value::Number(n), None),
            None => fallback(raw, "not a finite number"),
        },
        FieldKind::Bool => {
            let lower = trimmed.to_lowercase();
            if TRUE_WORDS.contains(&lower.as_str()) {
                (Value::Bool(true), None)
            } else if FALSE_WORDS.contains(&lower.as_str()) {
                (Value::Bool(false), None)
            } else {
                fallback(raw, "not a recognised boolean")
            }
        }
        FieldKind::Json => match parse_json(trimmed) {
            Some(v) => (v, None),
            None => fallback(raw, "malformed JSON"),
        },
    }
}

fn fallback(raw: &str, reason: &str) -> (Value, Option<String>) {
    (Value::String(raw.to_string()), Some(reason.to_string()))
}

fn parse_int(s: &str) -> Option<i64> {
    if let Ok(n) = s.parse::<i64>() {
        return Some(n);
    }
    let f = s.parse::<f64>().ok()?;
    // i64::MAX as f64 rounds up to 2^63, which does not fit
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// JSON array, then comma split, then semicolon split, then a single element.
fn parse_array(s: &str) -> Value {
    if s.is_empty() {
        return Value::Array(Vec::new());
    }

    if s.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(s) {
            return Value::Array(items);
        }
    }

    let items: Vec<&str> = if s.contains(',') {
        s.split(',').map(str::trim).filter(|i| !i.is_empty()).collect()
    } else if s.contains(';') {
        s.split(';').map(str::trim).filter(|i| !i.is_empty()).collect()
    } else {
        vec![s]
    };

    Value::Array(type_items(&items))
}

/// All-numeric item lists become numbers; anything else stays strings.
fn type_items(items: &[&str]) -> Vec<Value> {
    if let Some(ints) = items.iter().map(|i| i.parse::<i64>().ok()).collect::<Option<Vec<_>>>() {
        return ints.into_iter().map(|n| Value::Number(n.into())).collect();
    }
    if let Some(floats) = items
        .iter()
        .map(|i| i.parse::<f64>().ok().and_then(Number::from_f64))
        .collect::<Option<Vec<_>>>()
    {
        return floats.into_iter().map(Value::Number).collect();
    }
    items.iter().map(|i| Value::String(i.to_string())).collect()
}

/// Strict JSON first, then `key:value` pairs separated by commas.
fn parse_json(s: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(s) {
        return Some(v);
    }

    if !s.contains(':') || s.starts_with("http") {
        return None;
    }

    let mut pairs = Map::new();
    for pair in s.split(',') {
        if let Some((k, v)) = pair.split_once(':') {
            let k = k.trim();
            if !k.is_empty() {
                pairs.insert(k.to_string(), Value::String(v.trim().to_string()));
            }
        }
    }

    if pairs.is_empty() {
        None
    } else {
        Some(Value::Object(pairs))
    }
}
