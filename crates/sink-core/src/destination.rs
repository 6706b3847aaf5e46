//! Destination table identity and the topic → table naming rule.

use crate::{Result, SinkError};

/// Placeholder substituted with the record's topic in a table name format.
pub const TOPIC_PLACEHOLDER: &str = "${topic}";

/// Resolved identity of a destination table.
///
/// Equality is structural; ordering is by schema then table so that buffer
/// maps iterate in a stable order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationKey {
    pub schema: Option<String>,
    pub table: String,
}

impl DestinationKey {
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            schema,
            table: table.into(),
        }
    }

    /// Parse a possibly schema-qualified identifier (`table` or
    /// `schema.table`). Unqualified names take `default_schema`.
    pub fn parse(name: &str, default_schema: Option<&str>) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SinkError::Routing(
                "destination table name is empty".to_string(),
            ));
        }

        let parts: Vec<&str> = name.split('.').map(str::trim).collect();
        let (schema, table) = match parts.as_slice() {
            [table] => (default_schema.map(str::to_string), *table),
            [schema, table] => (Some(schema.to_string()), *table),
            _ => {
                return Err(SinkError::Routing(format!(
                    "destination table name '{name}' has too many qualifiers"
                )))
            }
        };

        validate_identifier(name, table)?;
        if let Some(schema) = &schema {
            validate_identifier(name, schema)?;
        }

        Ok(Self::new(schema, table))
    }

    /// Identifier with every part double-quoted, for SQL rendering.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.table)),
            None => quote_identifier(&self.table),
        }
    }
}

impl std::fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

fn validate_identifier(full: &str, part: &str) -> Result<()> {
    if part.is_empty() {
        return Err(SinkError::Routing(format!(
            "destination table name '{full}' has an empty identifier"
        )));
    }
    if part.chars().any(|c| c == '\0' || c.is_control()) {
        return Err(SinkError::Routing(format!(
            "destination table name '{full}' contains control characters"
        )));
    }
    Ok(())
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Format string turning a topic name into a destination table name.
///
/// `kafka_${topic}` maps the topic `orders` to the table `kafka_orders`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNameFormat {
    format: String,
    default_schema: Option<String>,
}

impl TableNameFormat {
    pub fn new(format: impl Into<String>, default_schema: Option<String>) -> Self {
        Self {
            format: format.into().trim().to_string(),
            default_schema: default_schema.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn destination(&self, topic: &str) -> Result<DestinationKey> {
        let table_name = self.format.replace(TOPIC_PLACEHOLDER, topic);
        if table_name.trim().is_empty() {
            return Err(SinkError::Routing(format!(
                "Destination table name for topic '{topic}' is empty using the format string '{}'",
                self.format
            )));
        }
        DestinationKey::parse(&table_name, self.default_schema.as_deref())
    }
}

impl Default for TableNameFormat {
    fn default() -> Self {
        Self::new(TOPIC_PLACEHOLDER, None)
    }
}
