use sink_core::{ColumnDef, ColumnType, DestinationKey, Result, SinkError, TableDescription};
use tokio_postgres::Client;

const COLUMNS_QUERY: &str = "
    SELECT column_name::text, data_type::text, is_nullable::text
    FROM information_schema.columns
    WHERE table_schema = COALESCE($1::text, current_schema()::text)
    AND table_name = $2::text
    ORDER BY ordinal_position
";

const PRIMARY_KEY_QUERY: &str = "
    SELECT a.attname::text
    FROM pg_index i
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
    WHERE i.indrelid = $1::text::regclass
    AND i.indisprimary
    ORDER BY a.attnum
";

/// Columns and primary key of `table`, or `None` when it does not exist.
pub async fn describe_table(
    client: &Client,
    table: &DestinationKey,
) -> Result<Option<TableDescription>> {
    let rows = client
        .query(COLUMNS_QUERY, &[&table.schema, &table.table])
        .await
        .map_err(|e| database_error(&format!("describe {table}"), e))?;
    if rows.is_empty() {
        return Ok(None);
    }

    let columns = rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let data_type: String = row.get(1);
            let nullable: String = row.get(2);
            ColumnDef::new(
                name,
                ColumnType::from_sql_name(&data_type),
                nullable.eq_ignore_ascii_case("YES"),
            )
        })
        .collect();

    let primary_key = client
        .query(PRIMARY_KEY_QUERY, &[&table.quoted()])
        .await
        .map_err(|e| database_error(&format!("read the primary key of {table}"), e))?
        .iter()
        .map(|row| row.get::<_, String>(0))
        .collect();

    Ok(Some(TableDescription::new(
        table.clone(),
        columns,
        primary_key,
    )))
}

/// Message of the server-side error when there is one.
pub(crate) fn error_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{}: {}", db.code().code(), db.message()),
        None => e.to_string(),
    }
}

pub(crate) fn database_error(action: &str, e: tokio_postgres::Error) -> SinkError {
    SinkError::Database(format!("Failed to {action}: {}", error_message(&e)))
}
