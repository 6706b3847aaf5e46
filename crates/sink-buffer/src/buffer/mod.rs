//! Per-destination buffers.
//!
//! Every buffer follows the same lifecycle under the buffer manager:
//!
//! 1. `add` rows (possibly across several cycles)
//! 2. `flush` inside the cycle transaction, executing whatever has not been
//!    executed yet; executed work is kept until the outcome is known
//! 3. `committed` drops the executed work, `rolled_back` marks it for
//!    replay by the next flush
//! 4. `close` once the buffer has been flushed and committed
//!
//! The variant is chosen once per buffer from the configured load mode.

mod direct;
mod file;
mod windowed;

pub use direct::DirectBuffer;
pub use file::ExternalFileBuffer;
pub use windowed::WindowedLoadBuffer;

use sink_core::{DestinationKey, Result, RowChange, TableDescription};
use tokio::time::Instant;

use crate::target::TargetConnection;

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Rows taken by this flush
    pub rows: usize,
    /// Statements executed against the target
    pub statements: usize,
    /// Rows the target reported as affected
    pub rows_affected: u64,
}

#[async_trait::async_trait]
pub trait Buffer: Send {
    fn destination(&self) -> &DestinationKey;

    /// Stage one row change. `table` is the current description of the
    /// destination table.
    async fn add(&mut self, change: RowChange, table: &TableDescription) -> Result<()>;

    /// Whether enough rows are waiting to flush before the sweep would.
    fn is_full(&self) -> bool;

    /// Rows staged and not yet executed.
    fn pending(&self) -> usize;

    async fn flush(
        &mut self,
        conn: &mut dyn TargetConnection,
        table: &TableDescription,
    ) -> Result<FlushStats>;

    fn committed(&mut self);

    fn rolled_back(&mut self);

    /// Release the buffer's resources. Safe without a prior flush.
    async fn close(&mut self) -> Result<()>;

    /// Time the buffer was created; the sweep measures its age from here.
    fn last_flush_time(&self) -> Instant;
}
