//! Destination table preparation: describe, auto-create, auto-evolve.

use std::collections::HashMap;

use sink_core::{DestinationKey, Result, RowChange, SinkError, TableDescription, TableShape};
use tracing::{debug, info};

use crate::statement::Ddl;
use crate::target::TargetConnection;

/// Keeps the target's table descriptions in step with the records routed to
/// them.
///
/// The description cache is only valid inside the transaction that filled
/// it; it is cleared on rollback since DDL may have been rolled back too.
/// The record shapes survive so that tables can be re-created before a
/// retried flush.
#[derive(Debug, Default)]
pub struct SchemaManager {
    auto_create: bool,
    auto_evolve: bool,
    tables: HashMap<DestinationKey, TableDescription>,
    shapes: HashMap<DestinationKey, TableShape>,
}

impl SchemaManager {
    pub fn new(auto_create: bool, auto_evolve: bool) -> Self {
        Self {
            auto_create,
            auto_evolve,
            ..Default::default()
        }
    }

    /// Make sure the table for `key` can take `change`.
    pub async fn ensure(
        &mut self,
        conn: &mut dyn TargetConnection,
        key: &DestinationKey,
        change: &RowChange,
    ) -> Result<TableDescription> {
        let shape_changed = match self.shapes.get_mut(key) {
            Some(shape) => shape.merge(change),
            None => {
                self.shapes.insert(key.clone(), TableShape::from_change(change));
                true
            }
        };

        match self.tables.get(key) {
            Some(table) if !shape_changed => Ok(table.clone()),
            _ => self.sync(conn, key).await,
        }
    }

    /// Description of a table a buffer is about to flush to, re-creating or
    /// re-evolving it when the cache was invalidated.
    pub async fn ensure_known(
        &mut self,
        conn: &mut dyn TargetConnection,
        key: &DestinationKey,
    ) -> Result<TableDescription> {
        match self.tables.get(key) {
            Some(table) => Ok(table.clone()),
            None => self.sync(conn, key).await,
        }
    }

    /// Forget every cached description.
    pub fn invalidate(&mut self) {
        self.tables.clear();
    }

    pub fn cached(&self, key: &DestinationKey) -> Option<&TableDescription> {
        self.tables.get(key)
    }

    async fn sync(
        &mut self,
        conn: &mut dyn TargetConnection,
        key: &DestinationKey,
    ) -> Result<TableDescription> {
        let shape = self.shapes.get(key).cloned().unwrap_or_default();

        let table = match conn.describe_table(key).await? {
            Some(table) => table,
            None if self.auto_create => {
                let ddl = Ddl::CreateTable {
                    table: key.clone(),
                    columns: shape.column_defs(),
                    primary_key: shape.key_column_names(),
                };
                info!("Creating table {key}");
                conn.execute_ddl(&ddl).await?;
                self.describe_existing(conn, key).await?
            }
            None => {
                return Err(SinkError::Routing(format!(
                    "Table {key} is missing and auto-creation is disabled"
                )))
            }
        };

        let missing = table.missing_columns(&shape);
        let table = if missing.is_empty() {
            table
        } else if self.auto_evolve {
            let names: Vec<&str> = missing.iter().map(|c| c.name.as_str()).collect();
            info!("Adding columns {names:?} to {key}");
            conn.execute_ddl(&Ddl::AddColumns {
                table: key.clone(),
                columns: missing,
            })
            .await?;
            self.describe_existing(conn, key).await?
        } else {
            let names: Vec<&str> = missing.iter().map(|c| c.name.as_str()).collect();
            return Err(SinkError::Schema(format!(
                "Table {key} is missing columns {names:?} and auto-evolution is disabled"
            )));
        };

        debug!("Table {key} has columns {:?}", table.column_names());
        self.tables.insert(key.clone(), table.clone());
        Ok(table)
    }

    async fn describe_existing(
        &self,
        conn: &mut dyn TargetConnection,
        key: &DestinationKey,
    ) -> Result<TableDescription> {
        conn.describe_table(key)
            .await?
            .ok_or_else(|| SinkError::Schema(format!("Table {key} not found after DDL")))
    }
}
