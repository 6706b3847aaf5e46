//! The sink task: write cycles with retry on top of the buffer manager.

use std::sync::Arc;
use std::time::Duration;

use sink_buffer::{BufferManager, CycleReport, TargetDatabase};
use sink_core::{Result, SinkConfig, SinkRecord};
use tracing::{error, info, warn};

/// Totals over the life of a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub cycles: u64,
    pub records: u64,
    pub flushed_rows: u64,
    pub retries: u64,
}

pub struct Sink {
    manager: BufferManager,
    max_retries: u32,
    retry_backoff: Duration,
    stats: SinkStats,
}

impl Sink {
    pub fn new(config: SinkConfig, target: Arc<dyn TargetDatabase>) -> Result<Self> {
        let max_retries = config.writer.max_retries;
        let retry_backoff = config.writer.retry_backoff();
        Ok(Self {
            manager: BufferManager::new(config, target)?,
            max_retries,
            retry_backoff,
            stats: SinkStats::default(),
        })
    }

    /// Hand `records` to the next write cycle.
    ///
    /// A retriable failure is retried with backlog-only cycles, up to
    /// `max_retries` times. Once this returns `Ok`, every record passed in
    /// has been routed and the cycle that took it committed; rows may still
    /// sit in buffers that are not due yet, see [`Sink::is_drained`].
    pub async fn write(&mut self, records: Vec<SinkRecord>) -> Result<CycleReport> {
        let mut result = self.manager.process_cycle(records).await;
        let mut retries = 0;

        let report = loop {
            match result {
                Ok(report) => break report,
                Err(e) if e.is_retriable() && retries < self.max_retries => {
                    retries += 1;
                    self.stats.retries += 1;
                    warn!(
                        "Write cycle failed (retry {retries}/{}), retrying in {:?}: {e}",
                        self.max_retries, self.retry_backoff
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                    result = self.manager.process_cycle(vec![]).await;
                }
                Err(e) => {
                    if e.is_retriable() {
                        error!("Giving up after {retries} retries: {e}");
                    } else {
                        error!("Write cycle failed: {e}");
                    }
                    return Err(e);
                }
            }
        };

        self.stats.cycles += 1;
        self.stats.records += report.records as u64;
        self.stats.flushed_rows += report.flushed_rows as u64;
        Ok(report)
    }

    /// Flush whatever is buffered and release every resource.
    pub async fn close(&mut self) -> Result<()> {
        let result = self.manager.close().await;
        info!(
            "Sink closed after {} cycles: {} records, {} rows flushed, {} retries",
            self.stats.cycles, self.stats.records, self.stats.flushed_rows, self.stats.retries
        );
        result
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    pub fn pending_rows(&self) -> usize {
        self.manager.pending_rows()
    }

    /// No record handed to [`Sink::write`] is still held in memory: the
    /// backlog is empty and every buffered row has been flushed by a
    /// committed cycle.
    pub fn is_drained(&self) -> bool {
        self.manager.pending_rows() == 0 && self.manager.backlog_len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.manager.is_closed()
    }
}
