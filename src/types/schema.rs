// Columns and schemas.
//
// A `Schema` is an ordered sequence of `Column`s plus a name lookup map.
// The fixed portion of the tuple size and the presence of variable-length
// columns are precomputed at construction.

use crate::crdt::MergePolicy;
use crate::error::{DbError, Result};
use crate::types::value::{DataType, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Column definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    /// CRDT merge policy applied on `ON CONFLICT MERGE`.
    pub merge_policy: Option<MergePolicy>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
            merge_policy: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = Some(policy);
        self
    }

    /// Whether this column stores CRDT state (tag pairs, stamped register
    /// values, stamped map entries) rather than a plain value of its
    /// declared type.
    pub fn stores_crdt_state(&self) -> bool {
        matches!(
            self.merge_policy,
            Some(MergePolicy::OrSet) | Some(MergePolicy::MvRegister) | Some(MergePolicy::MapLww)
        )
    }

    /// Fixed serialized size, 0 for variable-length types.
    pub fn fixed_size(&self) -> usize {
        if self.stores_crdt_state() {
            return 0;
        }
        self.data_type.fixed_size().unwrap_or(0)
    }

    pub fn is_variable(&self) -> bool {
        self.stores_crdt_state() || self.data_type.is_variable()
    }
}

/// Ordered column list with a name index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
    #[serde(skip)]
    name_index: HashMap<String, usize>,
    fixed_size: usize,
    has_variable: bool,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
    }
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        let name_index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        let fixed_size = columns.iter().map(|c| c.fixed_size()).sum();
        let has_variable = columns.iter().any(|c| c.is_variable());
        Self {
            columns,
            name_index,
            fixed_size,
            has_variable,
        }
    }

    /// Rebuilds the skipped name index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.name_index = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.index_of(name).and_then(|i| self.columns.get(i))
    }

    /// Index of the primary-key column, if one was declared.
    pub fn primary_key_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.primary_key)
    }

    /// Sum of the fixed-width column sizes.
    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    pub fn has_variable_columns(&self) -> bool {
        self.has_variable
    }

    /// Validates a row of values against this schema: arity, nullability
    /// and type compatibility (exact, numeric widening, VARCHAR<->TEXT).
    pub fn validate(&self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(DbError::Semantic(format!(
                "expected {} values, got {}",
                self.columns.len(),
                values.len()
            )));
        }
        for (value, column) in values.iter().zip(&self.columns) {
            if value.is_null() {
                if !column.nullable {
                    return Err(DbError::NotNullViolation(column.name.clone()));
                }
                continue;
            }
            if column.stores_crdt_state() {
                if matches!(value, Value::Array(_)) {
                    continue;
                }
                return Err(DbError::DataType(format!(
                    "column {} carries merge state and requires array values",
                    column.name
                )));
            }
            if !Self::compatible(value, &column.data_type) {
                return Err(DbError::DataType(format!(
                    "value of type {} is not compatible with column {} ({})",
                    value.type_name(),
                    column.name,
                    column.data_type
                )));
            }
        }
        Ok(())
    }

    fn compatible(value: &Value, ty: &DataType) -> bool {
        match (value, ty) {
            (Value::Boolean(_), DataType::Boolean) => true,
            (v, t) if v.as_i64().is_some() && t.is_numeric() => true,
            (Value::Double(_), DataType::Double) => true,
            (Value::Varchar(_) | Value::Text(_), DataType::Varchar(_) | DataType::Text) => true,
            (Value::Timestamp(_), DataType::Timestamp) => true,
            (Value::Date(_), DataType::Date) => true,
            (Value::Time(_), DataType::Time) => true,
            (Value::Blob(_), DataType::Blob) => true,
            (Value::Vector(v), DataType::Vector(d)) => v.len() == *d,
            (Value::Array(_), DataType::Set(_)) => true,
            _ => false,
        }
    }
}
