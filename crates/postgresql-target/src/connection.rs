use sink_buffer::{BatchOutcome, Ddl, Statement, TargetConnection, TargetDatabase};
use sink_core::{DestinationKey, Result, SinkError, TableDescription};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error, info};

use crate::catalog::{database_error, describe_table, error_message};

/// Connects to the warehouse with a libpq-style connection string.
#[derive(Debug, Clone)]
pub struct PostgresTarget {
    url: String,
}

impl PostgresTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl TargetDatabase for PostgresTarget {
    async fn connect(&self) -> Result<Box<dyn TargetConnection>> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(|e| database_error("connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {e}");
            }
        });

        info!("Connected to the target database");
        Ok(Box::new(PostgresConnection::new(client)))
    }
}

pub struct PostgresConnection {
    client: Client,
    in_transaction: bool,
}

impl PostgresConnection {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            in_transaction: false,
        }
    }

    async fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.client
                .batch_execute("BEGIN")
                .await
                .map_err(|e| database_error("begin a transaction", e))?;
            self.in_transaction = true;
        }
        Ok(())
    }

    async fn finish(&mut self, command: &str) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client
            .batch_execute(command)
            .await
            .map_err(|e| database_error(&command.to_ascii_lowercase(), e))
    }
}

/// Sum of the row counts reported for every command of a batch.
fn rows_affected(messages: &[SimpleQueryMessage]) -> u64 {
    messages
        .iter()
        .map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => *n,
            _ => 0,
        })
        .sum()
}

/// Join statements into one simple-query batch.
fn batch_sql(statements: &[Statement]) -> String {
    let mut sql = String::new();
    for statement in statements {
        sql.push_str(&statement.to_sql());
        sql.push_str(";\n");
    }
    sql
}

#[async_trait::async_trait]
impl TargetConnection for PostgresConnection {
    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<BatchOutcome> {
        let Some(first) = statements.first() else {
            return Ok(BatchOutcome::default());
        };
        self.begin().await?;

        let sql = batch_sql(statements);
        debug!("Executing {} statements on {}", statements.len(), first.table());
        match self.client.simple_query(&sql).await {
            Ok(messages) => Ok(BatchOutcome {
                statements: statements.len(),
                rows_affected: rows_affected(&messages),
            }),
            // The batch runs as one unit: a failure rejects all of it.
            Err(e) => Err(SinkError::Load {
                table: first.table().clone(),
                applied: 0,
                rejected: statements.len() as u64,
                reason: error_message(&e),
            }),
        }
    }

    async fn describe_table(&mut self, table: &DestinationKey) -> Result<Option<TableDescription>> {
        describe_table(&self.client, table).await
    }

    async fn execute_ddl(&mut self, ddl: &Ddl) -> Result<()> {
        self.begin().await?;
        let sql = ddl.to_sql();
        debug!("{sql}");
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| SinkError::Schema(format!("{}: {}", ddl.table(), error_message(&e))))
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    async fn is_valid(&mut self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sink_core::Row;

    #[test]
    fn test_rows_affected_sums_command_counts() {
        let messages = vec![
            SimpleQueryMessage::CommandComplete(2),
            SimpleQueryMessage::CommandComplete(0),
            SimpleQueryMessage::CommandComplete(5),
        ];
        assert_eq!(rows_affected(&messages), 7);
        assert_eq!(rows_affected(&[]), 0);
    }

    #[test]
    fn test_batch_sql_terminates_every_statement() {
        let table = DestinationKey::new(None, "users");
        let delete = |id: i64| Statement::Delete {
            table: table.clone(),
            key: vec![("id".to_string(), id.into())],
        };
        let insert = Statement::Insert {
            table: table.clone(),
            row: Row::new(vec![("id".to_string(), 3.into())], vec![]),
        };
        let sql = batch_sql(&[delete(1), delete(2), insert]);
        assert_eq!(sql.matches(";\n").count(), 3);
        assert!(sql.starts_with("DELETE FROM \"users\""));
    }
}
