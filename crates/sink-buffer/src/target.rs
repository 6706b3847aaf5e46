//! The database seam.
//!
//! A [`TargetDatabase`] hands out [`TargetConnection`]s with autocommit off:
//! everything executed on a connection is part of one transaction until
//! [`TargetConnection::commit`] or [`TargetConnection::rollback`].

use sink_core::{DestinationKey, Result, TableDescription};

use crate::statement::{Ddl, Statement};

/// What a successfully executed batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub statements: usize,
    pub rows_affected: u64,
}

#[async_trait::async_trait]
pub trait TargetDatabase: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TargetConnection>>;
}

#[async_trait::async_trait]
pub trait TargetConnection: Send {
    /// Execute a batch of statements for one table in a single round trip.
    ///
    /// A rejected batch fails with `SinkError::Load`, reporting how many
    /// statements were applied before the rejection.
    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<BatchOutcome>;

    /// Describe a table, `None` when it does not exist.
    async fn describe_table(&mut self, table: &DestinationKey) -> Result<Option<TableDescription>>;

    async fn execute_ddl(&mut self, ddl: &Ddl) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Whether the connection can still be used.
    async fn is_valid(&mut self) -> bool;
}
