use super::types::{FieldDef, FieldKind, FieldSchema, SchemaOverride};
use crate::error::SchemaError;
use std::collections::HashSet;

/// Derive a field schema from a header row.
///
/// Every header cell becomes a field named by its trimmed text (empty cells
/// are named `Column{n}`). Kinds default to `string`; array and json column
/// sets take precedence over type hints. The key column is matched exactly
/// first and case-insensitively second.
pub fn infer_schema(
    header: &[String],
    overrides: &SchemaOverride,
    default_key_column: &str,
) -> Result<FieldSchema, SchemaError> {
    if header.is_empty() {
        return Err(SchemaError::EmptyHeader);
    }

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(header.len());

    for (idx, cell) in header.iter().enumerate() {
        let trimmed = cell.trim();
        let name = if trimmed.is_empty() {
            format!("Column{}", idx + 1)
        } else {
            trimmed.to_string()
        };

        if !seen.insert(name.clone()) {
            return Err(SchemaError::DuplicateField(name));
        }

        let kind = if overrides.array_columns.contains(&name) {
            FieldKind::Array
        } else if overrides.json_columns.contains(&name) {
            FieldKind::Json
        } else {
            overrides
                .type_hints
                .get(&name)
                .copied()
                .unwrap_or(FieldKind::String)
        };

        fields.push(FieldDef {
            name,
            kind,
            key_column: false,
        });
    }

    let key_name = overrides
        .key_column
        .as_deref()
        .unwrap_or(default_key_column);
    let key_index = find_key_column(&fields, key_name)
        .ok_or_else(|| SchemaError::MissingKeyColumn(key_name.to_string()))?;
    fields[key_index].key_column = true;

    Ok(FieldSchema::new(fields, key_index))
}

fn find_key_column(fields: &[FieldDef], key_name: &str) -> Option<usize> {
    fields
        .iter()
        .position(|f| f.name == key_name)
        .or_else(|| {
            let lower = key_name.to_lowercase();
            fields.iter().position(|f| f.name.to_lowercase() == lower)
        })
}
