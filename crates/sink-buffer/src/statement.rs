//! Structured statements and their PostgreSQL / Greenplum rendering.
//!
//! Buffers stage [`Statement`]s rather than SQL text so that the in-memory
//! target can apply them structurally and the update-mode de-duplication can
//! look at keys. Literals are rendered as untyped single-quoted strings and
//! left to the server to coerce to the column type.

use serde_json::Value;
use sink_core::destination::quote_identifier;
use sink_core::{ColumnDef, DestinationKey, FormatConfig, Row};

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert {
        table: DestinationKey,
        row: Row,
    },
    /// Insert, or update the value columns when the key already exists.
    Upsert {
        table: DestinationKey,
        row: Row,
    },
    /// Update the value columns of the row with the given key.
    Update {
        table: DestinationKey,
        row: Row,
    },
    Delete {
        table: DestinationKey,
        key: Vec<(String, Value)>,
    },
    /// Pull rows from a stream endpoint into the table.
    ExternalLoad(ExternalLoad),
}

/// Pull of a stream endpoint through a temporary readable external table.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalLoad {
    pub table: DestinationKey,
    /// `gpfdist://host:port/data`
    pub location: String,
    pub delimiter: char,
    pub quote: char,
    pub null_string: String,
    /// Segment reject limit; 0 disables error logging
    pub error_limit: u32,
}

impl ExternalLoad {
    pub fn new(
        table: DestinationKey,
        location: impl Into<String>,
        format: &FormatConfig,
        error_limit: u32,
    ) -> Self {
        Self {
            table,
            location: location.into(),
            delimiter: format.delimiter,
            quote: format.quote,
            null_string: format.null_string.clone(),
            error_limit,
        }
    }

    fn external_table_name(&self) -> String {
        let sanitized: String = self
            .table
            .table
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        quote_identifier(&format!("ext_{sanitized}"))
    }

    fn to_sql(&self) -> String {
        let ext = self.external_table_name();
        let reject = if self.error_limit > 0 {
            format!(" LOG ERRORS SEGMENT REJECT LIMIT {} ROWS", self.error_limit)
        } else {
            String::new()
        };
        format!(
            "DROP EXTERNAL TABLE IF EXISTS {ext}; \
             CREATE READABLE EXTERNAL TEMPORARY TABLE {ext} (LIKE {table}) \
             LOCATION ({location}) \
             FORMAT 'CSV' (DELIMITER {delimiter} QUOTE {quote} NULL {null} FILL MISSING FIELDS){reject}; \
             INSERT INTO {table} SELECT * FROM {ext}; \
             DROP EXTERNAL TABLE IF EXISTS {ext}",
            table = self.table.quoted(),
            location = quote_literal(&self.location),
            delimiter = quote_literal(&self.delimiter.to_string()),
            quote = quote_literal(&self.quote.to_string()),
            null = quote_literal(&self.null_string),
        )
    }
}

impl Statement {
    pub fn table(&self) -> &DestinationKey {
        match self {
            Statement::Insert { table, .. }
            | Statement::Upsert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
            Statement::ExternalLoad(load) => &load.table,
        }
    }

    /// Primary-key columns the statement addresses; empty when keyless.
    pub fn key(&self) -> &[(String, Value)] {
        match self {
            Statement::Insert { row, .. }
            | Statement::Upsert { row, .. }
            | Statement::Update { row, .. } => &row.key,
            Statement::Delete { key, .. } => key,
            Statement::ExternalLoad(_) => &[],
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Statement::Insert { table, row } => insert_sql(table, row),
            Statement::Upsert { table, row } => {
                let mut sql = insert_sql(table, row);
                let conflict = column_list(row.key.iter().map(|(n, _)| n));
                if row.fields.is_empty() {
                    sql.push_str(&format!(" ON CONFLICT ({conflict}) DO NOTHING"));
                } else {
                    let updates = row
                        .fields
                        .iter()
                        .map(|(n, _)| {
                            let col = quote_identifier(n);
                            format!("{col} = EXCLUDED.{col}")
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(" ON CONFLICT ({conflict}) DO UPDATE SET {updates}"));
                }
                sql
            }
            Statement::Update { table, row } => {
                let assignments = assignments(&row.fields, ", ");
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    table.quoted(),
                    assignments,
                    predicate(&row.key)
                )
            }
            Statement::Delete { table, key } => {
                format!("DELETE FROM {} WHERE {}", table.quoted(), predicate(key))
            }
            Statement::ExternalLoad(load) => load.to_sql(),
        }
    }
}

/// Schema changes issued by the schema manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Ddl {
    CreateTable {
        table: DestinationKey,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    },
    AddColumns {
        table: DestinationKey,
        columns: Vec<ColumnDef>,
    },
}

impl Ddl {
    pub fn table(&self) -> &DestinationKey {
        match self {
            Ddl::CreateTable { table, .. } | Ddl::AddColumns { table, .. } => table,
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Ddl::CreateTable {
                table,
                columns,
                primary_key,
            } => {
                let mut parts: Vec<String> = columns.iter().map(column_sql).collect();
                if !primary_key.is_empty() {
                    parts.push(format!("PRIMARY KEY ({})", column_list(primary_key.iter())));
                }
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    table.quoted(),
                    parts.join(", ")
                )
            }
            Ddl::AddColumns { table, columns } => {
                let adds = columns
                    .iter()
                    .map(|c| format!("ADD COLUMN {}", column_sql(c)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("ALTER TABLE {} {}", table.quoted(), adds)
            }
        }
    }
}

fn column_sql(column: &ColumnDef) -> String {
    let null = if column.nullable { "" } else { " NOT NULL" };
    format!(
        "{} {}{}",
        quote_identifier(&column.name),
        column.column_type.sql_name(),
        null
    )
}

fn insert_sql(table: &DestinationKey, row: &Row) -> String {
    let names = column_list(row.columns().map(|(n, _)| n));
    let values = row
        .columns()
        .map(|(_, v)| render_value(v))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({names}) VALUES ({values})", table.quoted())
}

fn column_list<'a>(names: impl Iterator<Item = &'a String>) -> String {
    names
        .map(|n| quote_identifier(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn assignments(columns: &[(String, Value)], separator: &str) -> String {
    columns
        .iter()
        .map(|(n, v)| format!("{} = {}", quote_identifier(n), render_value(v)))
        .collect::<Vec<_>>()
        .join(separator)
}

fn predicate(key: &[(String, Value)]) -> String {
    key.iter()
        .map(|(n, v)| match v {
            Value::Null => format!("{} IS NULL", quote_identifier(n)),
            _ => format!("{} = {}", quote_identifier(n), render_value(v)),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Render a JSON value as a SQL literal.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => quote_literal(s),
        Value::Bool(b) => quote_literal(&b.to_string()),
        Value::Number(n) => quote_literal(&n.to_string()),
        Value::Array(_) | Value::Object(_) => quote_literal(&value.to_string()),
    }
}

pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
