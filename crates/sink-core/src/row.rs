//! Column-level view of records and tables.

use serde_json::Value;

use crate::DestinationKey;

/// A record mapped to columns: primary-key columns first, then value columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub key: Vec<(String, Value)>,
    pub fields: Vec<(String, Value)>,
}

impl Row {
    pub fn new(key: Vec<(String, Value)>, fields: Vec<(String, Value)>) -> Self {
        Self { key, fields }
    }

    /// All columns, key columns first.
    pub fn columns(&self) -> impl Iterator<Item = &(String, Value)> + Clone {
        self.key.iter().chain(self.fields.iter())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// What a record asks the target to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Upsert(Row),
    Delete { key: Vec<(String, Value)> },
}

impl RowChange {
    pub fn key(&self) -> &[(String, Value)] {
        match self {
            RowChange::Upsert(row) => &row.key,
            RowChange::Delete { key } => key,
        }
    }
}

/// Column types the sink infers from JSON values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Text,
    Jsonb,
}

impl ColumnType {
    /// Infer a column type from a value; `None` for JSON null.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::BigInt),
            Value::Number(_) => Some(ColumnType::Double),
            Value::String(_) => Some(ColumnType::Text),
            Value::Array(_) | Value::Object(_) => Some(ColumnType::Jsonb),
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
            ColumnType::Jsonb => "JSONB",
        }
    }

    /// Map a PostgreSQL `information_schema` data type back to a column type.
    pub fn from_sql_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "boolean" => ColumnType::Boolean,
            "bigint" | "integer" | "smallint" => ColumnType::BigInt,
            "double precision" | "real" | "numeric" => ColumnType::Double,
            "json" | "jsonb" => ColumnType::Jsonb,
            _ => ColumnType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }
}

/// Union of the columns seen in the records routed to one destination.
///
/// Column types are taken from the first non-null value seen; columns only
/// ever seen as null resolve to `TEXT`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableShape {
    key_columns: Vec<(String, Option<ColumnType>)>,
    columns: Vec<(String, Option<ColumnType>)>,
}

impl TableShape {
    pub fn from_change(change: &RowChange) -> Self {
        let mut shape = Self::default();
        shape.merge(change);
        shape
    }

    /// Merge the columns of a change into the shape. Returns `true` when a
    /// new column was added or a column type became known.
    pub fn merge(&mut self, change: &RowChange) -> bool {
        let mut changed = false;
        for (name, value) in change.key() {
            changed |= merge_column(&mut self.key_columns, name, value);
        }
        if let RowChange::Upsert(row) = change {
            for (name, value) in &row.fields {
                if self.key_columns.iter().any(|(k, _)| k == name) {
                    continue;
                }
                changed |= merge_column(&mut self.columns, name, value);
            }
        }
        changed
    }

    pub fn key_column_names(&self) -> Vec<String> {
        self.key_columns.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Column definitions, key columns (non-nullable) first.
    pub fn column_defs(&self) -> Vec<ColumnDef> {
        let keys = self
            .key_columns
            .iter()
            .map(|(n, t)| ColumnDef::new(n, t.unwrap_or(ColumnType::Text), false));
        let values = self
            .columns
            .iter()
            .map(|(n, t)| ColumnDef::new(n, t.unwrap_or(ColumnType::Text), true));
        keys.chain(values).collect()
    }
}

fn merge_column(
    columns: &mut Vec<(String, Option<ColumnType>)>,
    name: &str,
    value: &Value,
) -> bool {
    let inferred = ColumnType::infer(value);
    match columns.iter_mut().find(|(n, _)| n == name) {
        Some((_, existing)) => {
            if existing.is_none() && inferred.is_some() {
                *existing = inferred;
                true
            } else {
                false
            }
        }
        None => {
            columns.push((name.to_string(), inferred));
            true
        }
    }
}

/// The target's view of a table: ordered columns and primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescription {
    pub table: DestinationKey,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
}

impl TableDescription {
    pub fn new(table: DestinationKey, columns: Vec<ColumnDef>, primary_key: Vec<String>) -> Self {
        Self {
            table,
            columns,
            primary_key,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Columns of `shape` that the table does not have yet.
    pub fn missing_columns(&self, shape: &TableShape) -> Vec<ColumnDef> {
        shape
            .column_defs()
            .into_iter()
            .filter(|c| !self.has_column(&c.name))
            .map(|mut c| {
                // Columns added to an existing table cannot be NOT NULL.
                c.nullable = true;
                c
            })
            .collect()
    }
}
