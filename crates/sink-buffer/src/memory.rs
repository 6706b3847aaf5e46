//! In-memory target database.
//!
//! Statements are applied structurally to a private working copy of the
//! tables and only become visible to readers on commit. DDL takes effect
//! immediately. External loads pull their endpoint like a database segment
//! would. Used by `--dry-run` and by the tests, which can also make it
//! reject batches for a table or refuse connections.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value};
use sink_core::{DestinationKey, Result, SinkError, TableDescription};
use tokio::sync::Mutex;
use tracing::info;

use crate::pull;
use crate::statement::{Ddl, ExternalLoad, Statement};
use crate::target::{BatchOutcome, TargetConnection, TargetDatabase};

#[derive(Debug, Clone)]
struct MemoryTable {
    description: TableDescription,
    rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<DestinationKey, MemoryTable>,
    failures: HashMap<DestinationKey, String>,
    failing_connects: u32,
    external_loads: Vec<ExternalLoad>,
    connects: u32,
    commits: u64,
    rollbacks: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<MemoryState>>,
    log_statements: bool,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every executed statement and DDL at info level.
    pub fn with_statement_logging(mut self) -> Self {
        self.log_statements = true;
        self
    }

    pub async fn create_table(&self, description: TableDescription) {
        let mut state = self.state.lock().await;
        state.tables.insert(
            description.table.clone(),
            MemoryTable {
                description,
                rows: Vec::new(),
            },
        );
    }

    /// Committed rows of a table, as JSON objects.
    pub async fn rows(&self, table: &DestinationKey) -> Vec<Value> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    pub async fn table(&self, table: &DestinationKey) -> Option<TableDescription> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.description.clone())
    }

    /// Reject every batch for `table` until cleared.
    pub async fn fail_table(&self, table: DestinationKey, reason: impl Into<String>) {
        self.state.lock().await.failures.insert(table, reason.into());
    }

    pub async fn clear_failure(&self, table: &DestinationKey) {
        self.state.lock().await.failures.remove(table);
    }

    /// Refuse the next `count` connection attempts.
    pub async fn fail_connects(&self, count: u32) {
        self.state.lock().await.failing_connects = count;
    }

    /// Committed external-table pulls, in commit order.
    pub async fn external_loads(&self) -> Vec<ExternalLoad> {
        self.state.lock().await.external_loads.clone()
    }

    pub async fn connects(&self) -> u32 {
        self.state.lock().await.connects
    }

    pub async fn commits(&self) -> u64 {
        self.state.lock().await.commits
    }

    pub async fn rollbacks(&self) -> u64 {
        self.state.lock().await.rollbacks
    }
}

#[async_trait::async_trait]
impl TargetDatabase for MemoryTarget {
    async fn connect(&self) -> Result<Box<dyn TargetConnection>> {
        let mut state = self.state.lock().await;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(SinkError::Database("connection refused".to_string()));
        }
        state.connects += 1;
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            working: None,
            loads: Vec::new(),
            log_statements: self.log_statements,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    /// Uncommitted copy of the tables, taken at the first batch of a
    /// transaction.
    working: Option<BTreeMap<DestinationKey, MemoryTable>>,
    loads: Vec<ExternalLoad>,
    log_statements: bool,
}

#[async_trait::async_trait]
impl TargetConnection for MemoryConnection {
    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<BatchOutcome> {
        let Some(first) = statements.first() else {
            return Ok(BatchOutcome::default());
        };
        let table = first.table().clone();
        let load_error = |applied: usize, reason: String| SinkError::Load {
            table: table.clone(),
            applied: applied as u64,
            rejected: (statements.len() - applied) as u64,
            reason,
        };

        if let Some(reason) = self.state.lock().await.failures.get(&table) {
            return Err(load_error(0, reason.clone()));
        }

        // Pulls read their endpoint before the batch is applied.
        let mut pulled = VecDeque::new();
        for (i, statement) in statements.iter().enumerate() {
            if let Statement::ExternalLoad(load) = statement {
                let description = self.describe_table(&load.table).await?.ok_or_else(|| {
                    load_error(i, format!("relation {} does not exist", load.table))
                })?;
                let data = pull::fetch(&load.location)
                    .await
                    .map_err(|e| load_error(i, e.to_string()))?;
                let rows = pull::parse_rows(&data, load, &description.columns)
                    .map_err(|e| load_error(i, e.to_string()))?;
                pulled.push_back(rows);
            }
        }

        let state = self.state.lock().await;
        let working = self.working.get_or_insert_with(|| state.tables.clone());
        let mut scratch = working.clone();
        let mut loads = Vec::new();
        let mut rows_affected = 0;

        for (i, statement) in statements.iter().enumerate() {
            if self.log_statements {
                info!("{};", statement.to_sql());
            }
            match apply(&mut scratch, statement, &mut pulled) {
                Ok(Applied::Rows(n)) => rows_affected += n,
                Ok(Applied::Pull(load, n)) => {
                    rows_affected += n;
                    loads.push(load);
                }
                Err(reason) => return Err(load_error(i, reason)),
            }
        }

        *working = scratch;
        self.loads.extend(loads);
        Ok(BatchOutcome {
            statements: statements.len(),
            rows_affected,
        })
    }

    async fn describe_table(&mut self, table: &DestinationKey) -> Result<Option<TableDescription>> {
        let state = self.state.lock().await;
        Ok(state.tables.get(table).map(|t| t.description.clone()))
    }

    async fn execute_ddl(&mut self, ddl: &Ddl) -> Result<()> {
        if self.log_statements {
            info!("{};", ddl.to_sql());
        }
        let mut state = self.state.lock().await;
        match ddl {
            Ddl::CreateTable {
                table,
                columns,
                primary_key,
            } => {
                let description =
                    TableDescription::new(table.clone(), columns.clone(), primary_key.clone());
                for tables in [Some(&mut state.tables), self.working.as_mut()].into_iter().flatten() {
                    tables.entry(table.clone()).or_insert_with(|| MemoryTable {
                        description: description.clone(),
                        rows: Vec::new(),
                    });
                }
            }
            Ddl::AddColumns { table, columns } => {
                for tables in [Some(&mut state.tables), self.working.as_mut()].into_iter().flatten() {
                    let existing = tables.get_mut(table).ok_or_else(|| {
                        SinkError::Schema(format!("relation {table} does not exist"))
                    })?;
                    for column in columns {
                        if !existing.description.has_column(&column.name) {
                            existing.description.columns.push(column.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(working) = self.working.take() {
            for (key, table) in working {
                if let Some(committed) = state.tables.get_mut(&key) {
                    committed.rows = table.rows;
                }
            }
        }
        state.external_loads.append(&mut self.loads);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.working = None;
        self.loads.clear();
        self.state.lock().await.rollbacks += 1;
        Ok(())
    }

    async fn is_valid(&mut self) -> bool {
        true
    }
}

enum Applied {
    Rows(u64),
    Pull(ExternalLoad, u64),
}

fn apply(
    tables: &mut BTreeMap<DestinationKey, MemoryTable>,
    statement: &Statement,
    pulled: &mut VecDeque<Vec<Map<String, Value>>>,
) -> std::result::Result<Applied, String> {
    let key = statement.table();
    let table = tables
        .get_mut(key)
        .ok_or_else(|| format!("relation {key} does not exist"))?;

    match statement {
        Statement::Insert { row, .. } => {
            let record = to_record(&table.description, row.columns())?;
            if !table.description.primary_key.is_empty() {
                let pk: Vec<(String, Value)> = table
                    .description
                    .primary_key
                    .iter()
                    .map(|c| (c.clone(), record.get(c).cloned().unwrap_or(Value::Null)))
                    .collect();
                if table.rows.iter().any(|r| matches_key(r, &pk)) {
                    return Err(format!("duplicate key value violates unique constraint on {key}"));
                }
            }
            table.rows.push(record);
            Ok(Applied::Rows(1))
        }
        Statement::Upsert { row, .. } => {
            let record = to_record(&table.description, row.columns())?;
            match table.rows.iter_mut().find(|r| matches_key(r, &row.key)) {
                Some(existing) => {
                    for (name, value) in &row.fields {
                        existing.insert(name.clone(), value.clone());
                    }
                }
                None => table.rows.push(record),
            }
            Ok(Applied::Rows(1))
        }
        Statement::Update { row, .. } => {
            check_columns(&table.description, row.columns())?;
            let mut updated = 0;
            for existing in table.rows.iter_mut().filter(|r| matches_key(r, &row.key)) {
                for (name, value) in &row.fields {
                    existing.insert(name.clone(), value.clone());
                }
                updated += 1;
            }
            Ok(Applied::Rows(updated))
        }
        Statement::Delete { key: pk, .. } => {
            let before = table.rows.len();
            table.rows.retain(|r| !matches_key(r, pk));
            Ok(Applied::Rows((before - table.rows.len()) as u64))
        }
        Statement::ExternalLoad(load) => {
            let rows = pulled.pop_front().unwrap_or_default();
            let count = rows.len() as u64;
            for row in rows {
                check_not_null(&table.description, &row)?;
                table.rows.push(row);
            }
            Ok(Applied::Pull(load.clone(), count))
        }
    }
}

fn check_columns<'a>(
    description: &TableDescription,
    columns: impl Iterator<Item = &'a (String, Value)>,
) -> std::result::Result<(), String> {
    for (name, _) in columns {
        if !description.has_column(name) {
            return Err(format!(
                "column \"{name}\" of relation {} does not exist",
                description.table
            ));
        }
    }
    Ok(())
}

fn to_record<'a>(
    description: &TableDescription,
    columns: impl Iterator<Item = &'a (String, Value)> + Clone,
) -> std::result::Result<Map<String, Value>, String> {
    check_columns(description, columns.clone())?;
    let record: Map<String, Value> = columns.map(|(n, v)| (n.clone(), v.clone())).collect();
    check_not_null(description, &record)?;
    Ok(record)
}

fn check_not_null(
    description: &TableDescription,
    record: &Map<String, Value>,
) -> std::result::Result<(), String> {
    for column in &description.columns {
        if !column.nullable && record.get(&column.name).map_or(true, Value::is_null) {
            return Err(format!(
                "null value in column \"{}\" violates not-null constraint",
                column.name
            ));
        }
    }
    Ok(())
}

fn matches_key(record: &Map<String, Value>, key: &[(String, Value)]) -> bool {
    !key.is_empty() && key.iter().all(|(name, value)| record.get(name) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sink_core::{ColumnDef, ColumnType, Row};

    fn users() -> DestinationKey {
        DestinationKey::new(None, "users")
    }

    async fn target_with_users() -> MemoryTarget {
        let target = MemoryTarget::new();
        target
            .create_table(TableDescription::new(
                users(),
                vec![
                    ColumnDef::new("id", ColumnType::BigInt, false),
                    ColumnDef::new("name", ColumnType::Text, true),
                ],
                vec!["id".into()],
            ))
            .await;
        target
    }

    fn row(id: i64, name: &str) -> Row {
        Row::new(vec![("id".into(), json!(id))], vec![("name".into(), json!(name))])
    }

    #[tokio::test]
    async fn test_rows_visible_only_after_commit() {
        let target = target_with_users().await;
        let mut conn = target.connect().await.unwrap();
        conn.execute_batch(&[Statement::Insert {
            table: users(),
            row: row(1, "a"),
        }])
        .await
        .unwrap();
        assert!(target.rows(&users()).await.is_empty());

        conn.commit().await.unwrap();
        assert_eq!(target.rows(&users()).await, vec![json!({"id": 1, "name": "a"})]);
    }

    #[tokio::test]
    async fn test_rollback_discards_work() {
        let target = target_with_users().await;
        let mut conn = target.connect().await.unwrap();
        conn.execute_batch(&[Statement::Insert {
            table: users(),
            row: row(1, "a"),
        }])
        .await
        .unwrap();
        conn.rollback().await.unwrap();
        conn.commit().await.unwrap();
        assert!(target.rows(&users()).await.is_empty());
        assert_eq!(target.rollbacks().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_reports_applied_count() {
        let target = target_with_users().await;
        let mut conn = target.connect().await.unwrap();
        let err = conn
            .execute_batch(&[
                Statement::Insert {
                    table: users(),
                    row: row(1, "a"),
                },
                Statement::Insert {
                    table: users(),
                    row: row(1, "b"),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SinkError::Load {
                applied: 1,
                rejected: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_upsert_update_delete() {
        let target = target_with_users().await;
        let mut conn = target.connect().await.unwrap();
        let outcome = conn
            .execute_batch(&[
                Statement::Upsert {
                    table: users(),
                    row: row(1, "a"),
                },
                Statement::Upsert {
                    table: users(),
                    row: row(1, "b"),
                },
                Statement::Upsert {
                    table: users(),
                    row: row(2, "c"),
                },
                Statement::Update {
                    table: users(),
                    row: row(2, "d"),
                },
                Statement::Delete {
                    table: users(),
                    key: vec![("id".into(), json!(1))],
                },
            ])
            .await
            .unwrap();
        assert_eq!(outcome.statements, 5);
        conn.commit().await.unwrap();
        assert_eq!(target.rows(&users()).await, vec![json!({"id": 2, "name": "d"})]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let target = target_with_users().await;
        target.fail_connects(1).await;
        assert!(target.connect().await.is_err());

        let mut conn = target.connect().await.unwrap();
        target.fail_table(users(), "disk full").await;
        let err = conn
            .execute_batch(&[Statement::Insert {
                table: users(),
                row: row(1, "a"),
            }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));

        target.clear_failure(&users()).await;
        assert!(conn
            .execute_batch(&[Statement::Insert {
                table: users(),
                row: row(1, "a"),
            }])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ddl() {
        let target = MemoryTarget::new();
        let mut conn = target.connect().await.unwrap();
        conn.execute_ddl(&Ddl::CreateTable {
            table: users(),
            columns: vec![ColumnDef::new("id", ColumnType::BigInt, false)],
            primary_key: vec!["id".into()],
        })
        .await
        .unwrap();
        conn.execute_ddl(&Ddl::AddColumns {
            table: users(),
            columns: vec![ColumnDef::new("name", ColumnType::Text, true)],
        })
        .await
        .unwrap();

        let description = conn.describe_table(&users()).await.unwrap().unwrap();
        assert_eq!(description.column_names(), vec!["id", "name"]);
        assert!(conn
            .describe_table(&DestinationKey::new(None, "other"))
            .await
            .unwrap()
            .is_none());
    }
}
