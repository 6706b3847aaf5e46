//! Delimited-text encoding of rows for the stream and file backends.
//!
//! Fields follow the table's column order. NULL is written as the bare null
//! string and every other value that could be mistaken for it, or that
//! contains the delimiter, the quote character or a line break, is quoted.
//! New columns are only ever appended to a table, so rows encoded before a
//! table evolved simply lack trailing fields.

use bytes::Bytes;
use serde_json::Value;
use sink_core::{FormatConfig, Row, TableDescription};

#[derive(Debug, Clone)]
pub struct RowEncoder {
    delimiter: char,
    quote: char,
    null_string: String,
}

impl RowEncoder {
    pub fn new(format: &FormatConfig) -> Self {
        Self {
            delimiter: format.delimiter,
            quote: format.quote,
            null_string: format.null_string.clone(),
        }
    }

    /// One newline-terminated line for `row`.
    pub fn encode(&self, row: &Row, table: &TableDescription) -> Bytes {
        let fields: Vec<String> = table
            .columns
            .iter()
            .map(|column| match row.get(&column.name) {
                None | Some(Value::Null) => self.null_string.clone(),
                Some(Value::String(s)) => self.field(s),
                Some(other) => self.field(&other.to_string()),
            })
            .collect();
        self.line(&fields)
    }

    /// Header line naming the table's columns.
    pub fn header(&self, table: &TableDescription) -> Bytes {
        let fields: Vec<String> = table.columns.iter().map(|c| self.field(&c.name)).collect();
        self.line(&fields)
    }

    fn line(&self, fields: &[String]) -> Bytes {
        let mut line = fields.join(&self.delimiter.to_string());
        line.push('\n');
        Bytes::from(line)
    }

    fn field(&self, value: &str) -> String {
        let needs_quotes = value.is_empty()
            || value == self.null_string
            || value
                .chars()
                .any(|c| c == self.delimiter || c == self.quote || c == '\n' || c == '\r');
        if !needs_quotes {
            return value.to_string();
        }
        let q = self.quote.to_string();
        format!("{q}{}{q}", value.replace(self.quote, &format!("{q}{q}")))
    }
}
