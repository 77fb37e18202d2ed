use crate::digest::StableHasher;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The kind a column's cells are coerced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Int,
    Float,
    Bool,
    String,
    Array,
    Json,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::String => "string",
            FieldKind::Array => "array",
            FieldKind::Json => "json",
        }
    }
}

/// A single column of an inferred schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub key_column: bool,
}

/// Ordered field list derived from a table's header row.
///
/// Exactly one field carries `key_column`; the schema is immutable once
/// inferred and is replaced wholesale when the header changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    fields: Vec<FieldDef>,
    key_index: usize,
}

impl FieldSchema {
    pub(crate) fn new(fields: Vec<FieldDef>, key_index: usize) -> Self {
        FieldSchema { fields, key_index }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn key_field(&self) -> &FieldDef {
        &self.fields[self.key_index]
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.field(name).map(|f| f.kind)
    }

    /// Stable fingerprint over names, kinds and the key column.
    /// Used to detect header changes between syncs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = StableHasher::new();
        hasher.count(self.fields.len());
        for field in &self.fields {
            hasher
                .part(&field.name)
                .part(field.kind.as_str())
                .part([u8::from(field.key_column)]);
        }
        hasher.finish()
    }
}

/// Per-table overrides applied on top of header-driven inference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaOverride {
    #[serde(default)]
    pub key_column: Option<String>,
    #[serde(default)]
    pub type_hints: BTreeMap<String, FieldKind>,
    #[serde(default)]
    pub array_columns: BTreeSet<String>,
    #[serde(default)]
    pub json_columns: BTreeSet<String>,
}
