use bytes::Bytes;
use sink_core::{DestinationKey, FormatConfig, Result, RowChange, SinkError, TableDescription};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Buffer, FlushStats};
use crate::encode::RowEncoder;
use crate::endpoints::StreamEndpoint;
use crate::statement::{ExternalLoad, Statement};
use crate::target::TargetConnection;

/// Streams encoded rows into the destination's aggregator.
///
/// On flush the open window is closed and, when configured, the database is
/// asked to pull the endpoint through a temporary external table inside the
/// cycle transaction. One pull takes at most `batch_count` chunks, so pulls
/// are repeated until every flushed row has been read. Rows pulled by a
/// transaction that is rolled back are streamed again before the next pull.
pub struct WindowedLoadBuffer {
    destination: DestinationKey,
    endpoint: StreamEndpoint,
    encoder: RowEncoder,
    format: FormatConfig,
    batch_size: usize,
    pull_on_flush: bool,
    error_limit: u32,
    /// Rows appended since the last flush
    unflushed: usize,
    /// Rows in the aggregator that no pull has read yet
    outstanding: Vec<Bytes>,
    /// Rows pulled in the open transaction
    in_flight: Vec<Bytes>,
    /// Rows of a rolled back pull, streamed again on the next flush
    replay: Vec<Bytes>,
    created_at: Instant,
}

impl WindowedLoadBuffer {
    pub fn new(
        destination: DestinationKey,
        endpoint: StreamEndpoint,
        format: &FormatConfig,
        batch_size: usize,
        pull_on_flush: bool,
        error_limit: u32,
    ) -> Self {
        Self {
            destination,
            endpoint,
            encoder: RowEncoder::new(format),
            format: format.clone(),
            batch_size,
            pull_on_flush,
            error_limit,
            unflushed: 0,
            outstanding: Vec::new(),
            in_flight: Vec::new(),
            replay: Vec::new(),
            created_at: Instant::now(),
        }
    }

    /// Rebuild the aggregator contents after a rollback: whatever the failed
    /// pull left queued is dropped and the replayed rows go in ahead of the
    /// rows appended since.
    async fn restream(&mut self) -> Result<usize> {
        let replayed = self.replay.len();
        let dropped = self.endpoint.aggregator.discard().await;
        debug!(
            "Restreaming {replayed} rolled back rows to {} ({dropped} stale entries dropped)",
            self.destination
        );

        let mut rows = std::mem::take(&mut self.replay);
        rows.append(&mut self.outstanding);
        for line in &rows {
            self.endpoint.aggregator.append(line.clone()).await?;
        }
        self.outstanding = rows;
        Ok(replayed)
    }

    async fn pull(
        &mut self,
        conn: &mut dyn TargetConnection,
        stats: &mut FlushStats,
    ) -> Result<()> {
        let statement = Statement::ExternalLoad(ExternalLoad::new(
            self.destination.clone(),
            self.endpoint.location.clone(),
            &self.format,
            self.error_limit,
        ));
        let expected = self.outstanding.len() as u64;
        // From here on a rollback has to stream these rows again.
        self.in_flight.append(&mut self.outstanding);

        let mut pulled = 0;
        while pulled < expected {
            let outcome = conn.execute_batch(std::slice::from_ref(&statement)).await?;
            stats.statements += outcome.statements;
            stats.rows_affected += outcome.rows_affected;
            pulled += outcome.rows_affected;

            if outcome.rows_affected == 0 {
                let queued = self.endpoint.aggregator.queued_chunks();
                if queued > 0 {
                    return Err(SinkError::Protocol(format!(
                        "pull of {} read no rows with {queued} chunks still queued",
                        self.endpoint.location
                    )));
                }
                break;
            }
        }

        if pulled < expected {
            warn!(
                "Pulled {pulled} of {expected} rows into {}; the rest were rejected",
                self.destination
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Buffer for WindowedLoadBuffer {
    fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    async fn add(&mut self, change: RowChange, table: &TableDescription) -> Result<()> {
        let row = match change {
            RowChange::Upsert(row) => row,
            RowChange::Delete { .. } => {
                return Err(SinkError::Config(format!(
                    "cannot stream a delete to {}",
                    self.destination
                )))
            }
        };
        let line = self.encoder.encode(&row, table);
        self.endpoint.aggregator.append(line.clone()).await?;
        if self.pull_on_flush {
            self.outstanding.push(line);
        }
        self.unflushed += 1;
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.unflushed >= self.batch_size
    }

    fn pending(&self) -> usize {
        self.unflushed + self.replay.len()
    }

    async fn flush(
        &mut self,
        conn: &mut dyn TargetConnection,
        _table: &TableDescription,
    ) -> Result<FlushStats> {
        let replayed = if self.replay.is_empty() {
            0
        } else {
            self.restream().await?
        };
        let rows = self.unflushed + replayed;
        if rows == 0 {
            return Ok(FlushStats::default());
        }

        self.endpoint.aggregator.flush().await?;
        self.unflushed = 0;

        let mut stats = FlushStats {
            rows,
            ..Default::default()
        };
        if self.pull_on_flush {
            self.pull(conn, &mut stats).await?;
        }

        debug!(
            "Flushed {} rows of {} to {}",
            rows, self.destination, self.endpoint.location
        );
        Ok(stats)
    }

    fn committed(&mut self) {
        self.in_flight.clear();
    }

    fn rolled_back(&mut self) {
        if !self.in_flight.is_empty() {
            let mut replay = std::mem::take(&mut self.in_flight);
            replay.append(&mut self.replay);
            self.replay = replay;
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.unflushed > 0 || !self.replay.is_empty() {
            warn!(
                "Closing stream buffer for {} with {} rows not yet flushed",
                self.destination,
                self.pending()
            );
        }
        self.outstanding.clear();
        self.in_flight.clear();
        self.replay.clear();
        self.unflushed = 0;
        Ok(())
    }

    fn last_flush_time(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::StreamEndpoints;
    use crate::memory::MemoryTarget;
    use crate::target::TargetDatabase;
    use serde_json::json;
    use sink_core::{ColumnDef, ColumnType, Row, StreamConfig};

    fn events() -> DestinationKey {
        DestinationKey::new(None, "events")
    }

    fn table() -> TableDescription {
        TableDescription::new(
            events(),
            vec![
                ColumnDef::new("id", ColumnType::BigInt, false),
                ColumnDef::new("kind", ColumnType::Text, true),
            ],
            vec![],
        )
    }

    fn change(id: i64, kind: &str) -> RowChange {
        RowChange::Upsert(Row::new(
            vec![],
            vec![("id".into(), json!(id)), ("kind".into(), json!(kind))],
        ))
    }

    fn endpoints() -> StreamEndpoints {
        StreamEndpoints::new(StreamConfig {
            listen_host: "127.0.0.1".to_string(),
            port_range: vec![0],
            flush_time_secs: 0,
            batch_timeout_secs: 1,
            ..Default::default()
        })
    }

    async fn target() -> MemoryTarget {
        let target = MemoryTarget::new();
        target.create_table(table()).await;
        target
    }

    #[tokio::test]
    async fn test_flush_pulls_rows_into_the_table() {
        let target = target().await;
        let mut conn = target.connect().await.unwrap();
        let mut endpoints = endpoints();
        let endpoint = endpoints.endpoint(&events()).await.unwrap();
        let mut buffer =
            WindowedLoadBuffer::new(events(), endpoint, &FormatConfig::default(), 10, true, 0);

        buffer.add(change(1, "click"), &table()).await.unwrap();
        buffer.add(change(2, "view, full"), &table()).await.unwrap();
        assert_eq!(buffer.pending(), 2);

        let stats = buffer.flush(conn.as_mut(), &table()).await.unwrap();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.rows_affected, 2);
        assert_eq!(buffer.pending(), 0);

        conn.commit().await.unwrap();
        buffer.committed();
        assert_eq!(
            target.rows(&events()).await,
            vec![
                json!({"id": 1, "kind": "click"}),
                json!({"id": 2, "kind": "view, full"})
            ]
        );
        assert_eq!(target.external_loads().await.len(), 1);
        endpoints.shutdown().await;
    }

    #[tokio::test]
    async fn test_rolled_back_pull_is_replayed() {
        let target = target().await;
        let mut conn = target.connect().await.unwrap();
        let mut endpoints = endpoints();
        let endpoint = endpoints.endpoint(&events()).await.unwrap();
        let mut buffer =
            WindowedLoadBuffer::new(events(), endpoint, &FormatConfig::default(), 10, true, 0);

        buffer.add(change(1, "click"), &table()).await.unwrap();
        buffer.flush(conn.as_mut(), &table()).await.unwrap();
        conn.rollback().await.unwrap();
        buffer.rolled_back();
        assert_eq!(buffer.pending(), 1);

        buffer.add(change(2, "view"), &table()).await.unwrap();
        let stats = buffer.flush(conn.as_mut(), &table()).await.unwrap();
        assert_eq!(stats.rows, 2);
        conn.commit().await.unwrap();
        buffer.committed();

        let ids: Vec<i64> = target
            .rows(&events())
            .await
            .iter()
            .filter_map(|r| r["id"].as_i64())
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(buffer.pending(), 0);
        endpoints.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_pulls_until_every_row_is_read() {
        let target = target().await;
        let mut conn = target.connect().await.unwrap();
        let mut endpoints = StreamEndpoints::new(StreamConfig {
            listen_host: "127.0.0.1".to_string(),
            port_range: vec![0],
            flush_count: 1,
            flush_time_secs: 0,
            batch_count: 2,
            batch_timeout_secs: 1,
            ..Default::default()
        });
        let endpoint = endpoints.endpoint(&events()).await.unwrap();
        let aggregator = endpoint.aggregator.clone();
        let mut buffer =
            WindowedLoadBuffer::new(events(), endpoint, &FormatConfig::default(), 10, true, 0);

        for id in 1..=5 {
            buffer.add(change(id, "click"), &table()).await.unwrap();
        }
        assert_eq!(aggregator.queued_chunks(), 5);

        // Each pull takes at most two chunks.
        let stats = buffer.flush(conn.as_mut(), &table()).await.unwrap();
        assert_eq!(stats.rows, 5);
        assert_eq!(stats.rows_affected, 5);
        assert_eq!(stats.statements, 3);
        assert_eq!(aggregator.queued_chunks(), 0);

        conn.commit().await.unwrap();
        buffer.committed();
        assert_eq!(target.rows(&events()).await.len(), 5);
        endpoints.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_pull_is_restreamed_once() {
        let target = target().await;
        let mut conn = target.connect().await.unwrap();
        let mut endpoints = endpoints();
        let endpoint = endpoints.endpoint(&events()).await.unwrap();
        let aggregator = endpoint.aggregator.clone();
        let mut buffer =
            WindowedLoadBuffer::new(events(), endpoint, &FormatConfig::default(), 10, true, 0);

        // The pull is refused before it reads the endpoint, so its chunk
        // stays queued.
        target.fail_table(events(), "segment down").await;
        buffer.add(change(1, "click"), &table()).await.unwrap();
        assert!(buffer.flush(conn.as_mut(), &table()).await.is_err());
        conn.rollback().await.unwrap();
        buffer.rolled_back();
        assert_eq!(aggregator.queued_chunks(), 1);
        assert_eq!(buffer.pending(), 1);

        target.clear_failure(&events()).await;
        buffer.add(change(2, "view"), &table()).await.unwrap();
        let stats = buffer.flush(conn.as_mut(), &table()).await.unwrap();
        assert_eq!(stats.rows, 2);
        conn.commit().await.unwrap();
        buffer.committed();

        let ids: Vec<i64> = target
            .rows(&events())
            .await
            .iter()
            .filter_map(|r| r["id"].as_i64())
            .collect();
        assert_eq!(ids, vec![1, 2]);
        endpoints.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_without_pull_leaves_chunk_queued() {
        let target = target().await;
        let mut conn = target.connect().await.unwrap();
        let mut endpoints = endpoints();
        let endpoint = endpoints.endpoint(&events()).await.unwrap();
        let aggregator = endpoint.aggregator.clone();
        let mut buffer =
            WindowedLoadBuffer::new(events(), endpoint, &FormatConfig::default(), 2, false, 0);

        buffer.add(change(1, "click"), &table()).await.unwrap();
        buffer.add(change(2, "view"), &table()).await.unwrap();
        assert!(buffer.is_full());

        let stats = buffer.flush(conn.as_mut(), &table()).await.unwrap();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.statements, 0);
        assert_eq!(aggregator.queued_chunks(), 1);
        assert!(target.external_loads().await.is_empty());
        endpoints.shutdown().await;
    }

    #[tokio::test]
    async fn test_deletes_are_rejected() {
        let mut endpoints = endpoints();
        let endpoint = endpoints.endpoint(&events()).await.unwrap();
        let mut buffer =
            WindowedLoadBuffer::new(events(), endpoint, &FormatConfig::default(), 10, true, 0);
        let delete = RowChange::Delete {
            key: vec![("id".into(), json!(1))],
        };
        assert!(matches!(
            buffer.add(delete, &table()).await,
            Err(SinkError::Config(_))
        ));
        endpoints.shutdown().await;
    }
}
