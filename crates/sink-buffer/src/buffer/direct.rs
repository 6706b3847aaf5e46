use std::collections::HashMap;

use sink_core::{
    DestinationKey, InsertMode, Result, RowChange, TableDescription, UpdateMode,
};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Buffer, FlushStats};
use crate::statement::Statement;
use crate::target::TargetConnection;

/// Stages statements and executes them as one batch per flush.
pub struct DirectBuffer {
    destination: DestinationKey,
    insert_mode: InsertMode,
    update_mode: UpdateMode,
    batch_size: usize,
    statements: Vec<Statement>,
    /// Statements at the front of `statements` executed in the open
    /// transaction
    executed: usize,
    created_at: Instant,
}

impl DirectBuffer {
    pub fn new(
        destination: DestinationKey,
        insert_mode: InsertMode,
        update_mode: UpdateMode,
        batch_size: usize,
    ) -> Self {
        Self {
            destination,
            insert_mode,
            update_mode,
            batch_size,
            statements: Vec::new(),
            executed: 0,
            created_at: Instant::now(),
        }
    }

    fn statement_for(&self, change: RowChange) -> Option<Statement> {
        let table = self.destination.clone();
        match change {
            RowChange::Delete { key } => Some(Statement::Delete { table, key }),
            RowChange::Upsert(row) => match self.insert_mode {
                InsertMode::Insert => Some(Statement::Insert { table, row }),
                InsertMode::Upsert => Some(Statement::Upsert { table, row }),
                // Nothing to set.
                InsertMode::Update if row.fields.is_empty() => None,
                InsertMode::Update => Some(Statement::Update { table, row }),
            },
        }
    }
}

/// Collapse statements addressing the same key. Keyless statements are
/// never collapsed.
fn deduplicate(statements: &[Statement], mode: UpdateMode) -> Vec<Statement> {
    if mode == UpdateMode::Default {
        return statements.to_vec();
    }

    let key_of = |s: &Statement| -> Option<String> {
        let key = s.key();
        (!key.is_empty()).then(|| serde_json::to_string(key).unwrap_or_default())
    };

    // Index of the statement that survives for each key.
    let mut chosen: HashMap<String, usize> = HashMap::new();
    for (i, statement) in statements.iter().enumerate() {
        if let Some(key) = key_of(statement) {
            match mode {
                UpdateMode::FirstRowOnly => {
                    chosen.entry(key).or_insert(i);
                }
                UpdateMode::LastRowOnly | UpdateMode::Default => {
                    chosen.insert(key, i);
                }
            }
        }
    }

    statements
        .iter()
        .enumerate()
        .filter(|(i, s)| key_of(*s).map_or(true, |key| chosen.get(&key) == Some(i)))
        .map(|(_, s)| s.clone())
        .collect()
}

#[async_trait::async_trait]
impl Buffer for DirectBuffer {
    fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    async fn add(&mut self, change: RowChange, _table: &TableDescription) -> Result<()> {
        match self.statement_for(change) {
            Some(statement) => self.statements.push(statement),
            None => trace!("Skipping update without value columns for {}", self.destination),
        }
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.pending() >= self.batch_size
    }

    fn pending(&self) -> usize {
        self.statements.len() - self.executed
    }

    async fn flush(
        &mut self,
        conn: &mut dyn TargetConnection,
        _table: &TableDescription,
    ) -> Result<FlushStats> {
        let unexecuted = &self.statements[self.executed..];
        if unexecuted.is_empty() {
            return Ok(FlushStats::default());
        }

        let batch = deduplicate(unexecuted, self.update_mode);
        let outcome = conn.execute_batch(&batch).await?;
        let rows = unexecuted.len();
        self.executed = self.statements.len();

        debug!(
            "Flushed {} rows ({} statements) to {}",
            rows, outcome.statements, self.destination
        );
        Ok(FlushStats {
            rows,
            statements: outcome.statements,
            rows_affected: outcome.rows_affected,
        })
    }

    fn committed(&mut self) {
        self.statements.drain(..self.executed);
        self.executed = 0;
    }

    fn rolled_back(&mut self) {
        self.executed = 0;
    }

    async fn close(&mut self) -> Result<()> {
        if !self.statements.is_empty() {
            debug!(
                "Closing buffer for {} with {} staged statements",
                self.destination,
                self.statements.len()
            );
        }
        self.statements.clear();
        self.executed = 0;
        Ok(())
    }

    fn last_flush_time(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTarget;
    use crate::target::TargetDatabase;
    use serde_json::json;
    use sink_core::{ColumnDef, ColumnType, Row};

    fn users() -> DestinationKey {
        DestinationKey::new(None, "users")
    }

    fn table() -> TableDescription {
        TableDescription::new(
            users(),
            vec![
                ColumnDef::new("id", ColumnType::BigInt, false),
                ColumnDef::new("name", ColumnType::Text, true),
            ],
            vec!["id".into()],
        )
    }

    fn change(id: i64, name: &str) -> RowChange {
        RowChange::Upsert(Row::new(
            vec![("id".into(), json!(id))],
            vec![("name".into(), json!(name))],
        ))
    }

    async fn target() -> MemoryTarget {
        let target = MemoryTarget::new();
        target.create_table(table()).await;
        target
    }

    #[test]
    fn test_deduplicate_modes() {
        let statements: Vec<Statement> = [(1, "a"), (2, "b"), (1, "c")]
            .iter()
            .map(|(id, name)| Statement::Upsert {
                table: users(),
                row: Row::new(
                    vec![("id".into(), json!(id))],
                    vec![("name".into(), json!(name))],
                ),
            })
            .collect();

        assert_eq!(deduplicate(&statements, UpdateMode::Default).len(), 3);

        let first = deduplicate(&statements, UpdateMode::FirstRowOnly);
        assert_eq!(first, vec![statements[0].clone(), statements[1].clone()]);

        let last = deduplicate(&statements, UpdateMode::LastRowOnly);
        assert_eq!(last, vec![statements[1].clone(), statements[2].clone()]);
    }

    #[tokio::test]
    async fn test_flush_commit_cycle() {
        let target = target().await;
        let mut conn = target.connect().await.unwrap();
        let mut buffer = DirectBuffer::new(users(), InsertMode::Upsert, UpdateMode::Default, 2);

        buffer.add(change(1, "a"), &table()).await.unwrap();
        assert!(!buffer.is_full());
        buffer.add(change(2, "b"), &table()).await.unwrap();
        assert!(buffer.is_full());

        let stats = buffer.flush(conn.as_mut(), &table()).await.unwrap();
        assert_eq!(stats.rows, 2);
        assert_eq!(buffer.pending(), 0);

        // A second flush in the same transaction executes nothing new.
        let stats = buffer.flush(conn.as_mut(), &table()).await.unwrap();
        assert_eq!(stats, FlushStats::default());

        conn.commit().await.unwrap();
        buffer.committed();
        assert_eq!(target.rows(&users()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_rolled_back_work_is_replayed() {
        let target = target().await;
        let mut conn = target.connect().await.unwrap();
        let mut buffer = DirectBuffer::new(users(), InsertMode::Insert, UpdateMode::Default, 10);

        buffer.add(change(1, "a"), &table()).await.unwrap();
        buffer.flush(conn.as_mut(), &table()).await.unwrap();
        conn.rollback().await.unwrap();
        buffer.rolled_back();
        assert_eq!(buffer.pending(), 1);

        buffer.add(change(2, "b"), &table()).await.unwrap();
        let stats = buffer.flush(conn.as_mut(), &table()).await.unwrap();
        assert_eq!(stats.rows, 2);
        conn.commit().await.unwrap();
        buffer.committed();
        assert_eq!(target.rows(&users()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_update_mode_skips_key_only_rows() {
        let mut buffer = DirectBuffer::new(users(), InsertMode::Update, UpdateMode::Default, 10);
        let key_only = RowChange::Upsert(Row::new(vec![("id".into(), json!(1))], vec![]));
        buffer.add(key_only, &table()).await.unwrap();
        assert_eq!(buffer.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_without_flush() {
        let mut buffer = DirectBuffer::new(users(), InsertMode::Insert, UpdateMode::Default, 10);
        buffer.add(change(1, "a"), &table()).await.unwrap();
        buffer.close().await.unwrap();
        assert_eq!(buffer.pending(), 0);
    }
}
