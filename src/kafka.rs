//! Kafka ingestion loop.
//!
//! Offsets are held back while any consumed record is still buffered in
//! memory and committed once a committed cycle has written all of them, so
//! delivery is at least once: whatever was not yet written when the process
//! dies is consumed again after a restart.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use sink_core::SinkRecord;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warehouse_sink_kafka_source::{commit_positions, Consumer, ConsumerConfig};

use crate::sink::Sink;

/// Next-to-consume offsets of records written to the sink but not yet
/// committed to Kafka.
#[derive(Debug, Default)]
pub struct PendingOffsets {
    positions: BTreeMap<(String, i32), i64>,
}

impl PendingOffsets {
    pub fn track(&mut self, records: &[SinkRecord]) {
        for (partition, next) in commit_positions(records) {
            let offset = self.positions.entry(partition).or_insert(next);
            *offset = (*offset).max(next);
        }
    }

    /// Hand out the offsets to commit once the sink holds none of the
    /// tracked records any more.
    pub fn take_if_drained(&mut self, sink: &Sink) -> Option<BTreeMap<(String, i32), i64>> {
        if self.positions.is_empty() || !sink.is_drained() {
            return None;
        }
        Some(std::mem::take(&mut self.positions))
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Consume until `timeout` elapses or Ctrl-C, then close the sink.
pub async fn run(
    config: ConsumerConfig,
    mut sink: Sink,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let consumer = Consumer::new(config).context("Failed to create Kafka consumer")?;
    let deadline = timeout.map(|t| Instant::now() + t);
    if let Some(timeout) = timeout {
        info!("Will consume for {timeout:?}");
    }

    let mut pending = PendingOffsets::default();
    let result = consume(&consumer, &mut sink, &mut pending, deadline).await;
    if let Err(e) = &result {
        warn!("Stopping after failure: {e:#}");
    }
    sink.close().await.context("Failed to close the sink")?;

    // Closing flushed everything that was left.
    if let Some(positions) = pending.take_if_drained(&sink) {
        consumer
            .commit_offsets(&positions)
            .context("Failed to commit Kafka offsets")?;
    }
    result
}

async fn consume(
    consumer: &Consumer,
    sink: &mut Sink,
    pending: &mut PendingOffsets,
    deadline: Option<Instant>,
) -> anyhow::Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Deadline reached, shutting down");
            return Ok(());
        }

        let records = tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
            batch = consumer.receive_batch() => batch.context("Failed to receive from Kafka")?,
        };

        pending.track(&records);
        sink.write(records).await.context("Write cycle failed")?;

        match pending.take_if_drained(sink) {
            Some(positions) => consumer
                .commit_offsets(&positions)
                .context("Failed to commit Kafka offsets")?,
            None if !pending.is_empty() => {
                debug!("{} rows still buffered, holding back offsets", sink.pending_rows())
            }
            None => {}
        }
    }
}
