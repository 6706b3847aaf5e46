//! The buffer manager: routes records into per-destination buffers and runs
//! one transaction per write cycle.
//!
//! A cycle routes the pending records, flushes early every buffer that
//! filled up, sweeps the buffers older than `max_batch_wait` and commits.
//! Any failure rolls the whole cycle back: buffers keep their rows and
//! replay executed work on their next flush, and only buffers whose flush
//! was committed are closed and dropped.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use sink_core::{
    DestinationKey, LoadMode, Result, SinkConfig, SinkError, SinkRecord,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::{Buffer, DirectBuffer, ExternalFileBuffer, WindowedLoadBuffer};
use crate::endpoints::StreamEndpoints;
use crate::router::{RecordRouter, RowMapper};
use crate::schema::SchemaManager;
use crate::target::{TargetConnection, TargetDatabase};

/// Outcome of one successful write cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records taken from the backlog
    pub records: usize,
    /// Records added to a buffer
    pub routed: usize,
    /// Tombstones ignored because deletes are disabled
    pub skipped: usize,
    /// Flushes triggered by a full buffer
    pub early_flushes: usize,
    /// Buffers flushed by the sweep, committed and closed
    pub flushed_buffers: usize,
    /// Rows flushed in this cycle, early flushes included
    pub flushed_rows: usize,
    /// Buffers still live after the cycle
    pub live_buffers: usize,
}

/// Creates the buffer variant selected by the load mode.
struct BufferFactory {
    config: SinkConfig,
    endpoints: StreamEndpoints,
    file_sequence: Arc<AtomicU64>,
}

impl BufferFactory {
    async fn create(&mut self, key: &DestinationKey) -> Result<Box<dyn Buffer>> {
        let writer = &self.config.writer;
        let buffer: Box<dyn Buffer> = match writer.load_mode {
            LoadMode::Direct => Box::new(DirectBuffer::new(
                key.clone(),
                writer.insert_mode,
                writer.update_mode,
                writer.batch_size,
            )),
            LoadMode::WindowedStream => {
                let endpoint = self.endpoints.endpoint(key).await?;
                Box::new(WindowedLoadBuffer::new(
                    key.clone(),
                    endpoint,
                    &self.config.format,
                    writer.batch_size,
                    self.config.stream.pull_on_flush,
                    self.config.stream.error_limit,
                ))
            }
            LoadMode::ExternalFile => Box::new(ExternalFileBuffer::new(
                key.clone(),
                &self.config.format,
                &self.config.file,
                writer.insert_mode,
                self.config.stream.error_limit,
                writer.batch_size,
                Arc::clone(&self.file_sequence),
            )),
        };
        debug!("Created {} buffer for {key}", writer.load_mode);
        Ok(buffer)
    }
}

pub struct BufferManager {
    config: SinkConfig,
    target: Arc<dyn TargetDatabase>,
    connection: Option<Box<dyn TargetConnection>>,
    router: RecordRouter,
    mapper: RowMapper,
    schema: SchemaManager,
    factory: BufferFactory,
    buffers: BTreeMap<DestinationKey, Box<dyn Buffer>>,
    /// Records accepted but not yet added to a buffer
    backlog: VecDeque<SinkRecord>,
    closed: bool,
}

impl BufferManager {
    pub fn new(config: SinkConfig, target: Arc<dyn TargetDatabase>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            router: RecordRouter::new(config.table_name_format()),
            mapper: RowMapper::new(&config.writer),
            schema: SchemaManager::new(config.writer.auto_create, config.writer.auto_evolve),
            factory: BufferFactory {
                config: config.clone(),
                endpoints: StreamEndpoints::new(config.stream.clone()),
                file_sequence: Arc::new(AtomicU64::new(0)),
            },
            config,
            target,
            connection: None,
            buffers: BTreeMap::new(),
            backlog: VecDeque::new(),
            closed: false,
        })
    }

    /// Run one write cycle over `records` plus any backlog left by a failed
    /// cycle. Pass no records to resume the backlog and sweep.
    pub async fn process_cycle(&mut self, records: Vec<SinkRecord>) -> Result<CycleReport> {
        if self.closed {
            return Err(SinkError::Closed("buffer manager".to_string()));
        }
        self.backlog.extend(records);
        self.run_cycle(false).await
    }

    /// Flush everything in a final cycle, close all buffers and stop the
    /// stream endpoints. Calling it again does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = if self.buffers.is_empty() && self.backlog.is_empty() {
            Ok(())
        } else {
            self.run_cycle(true).await.map(|_| ())
        };

        for (key, mut buffer) in std::mem::take(&mut self.buffers) {
            if buffer.pending() > 0 {
                warn!("Discarding {} unflushed rows for {key}", buffer.pending());
            }
            if let Err(e) = buffer.close().await {
                warn!("Failed to close buffer for {key}: {e}");
            }
        }
        if !self.backlog.is_empty() {
            warn!("Discarding {} unrouted records", self.backlog.len());
            self.backlog.clear();
        }
        self.factory.endpoints.shutdown().await;
        self.connection = None;
        info!("Buffer manager closed");
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn live_buffers(&self) -> Vec<DestinationKey> {
        self.buffers.keys().cloned().collect()
    }

    /// Rows staged in live buffers and not yet executed.
    pub fn pending_rows(&self) -> usize {
        self.buffers.values().map(|b| b.pending()).sum()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    async fn run_cycle(&mut self, force: bool) -> Result<CycleReport> {
        let mut conn = self.acquire_connection().await?;
        let mut report = CycleReport::default();

        let flushed = match self.cycle(conn.as_mut(), force, &mut report).await {
            Ok(flushed) => flushed,
            Err(e) => {
                error!("Write cycle failed, rolling back: {e}");
                self.abort(conn).await;
                return Err(e);
            }
        };

        if let Err(e) = conn.commit().await {
            error!("Commit failed, rolling back: {e}");
            self.abort(conn).await;
            return Err(e);
        }
        self.connection = Some(conn);

        for buffer in self.buffers.values_mut() {
            buffer.committed();
        }
        for key in &flushed {
            if let Some(mut buffer) = self.buffers.remove(key) {
                if let Err(e) = buffer.close().await {
                    warn!("Failed to close buffer for {key}: {e}");
                }
            }
        }

        report.flushed_buffers = flushed.len();
        report.live_buffers = self.buffers.len();
        if report.records > 0 || report.flushed_buffers > 0 {
            info!(
                "Cycle committed: {} records, {} flushed buffers ({} rows), {} live buffers",
                report.records, report.flushed_buffers, report.flushed_rows, report.live_buffers
            );
        } else {
            debug!("Cycle committed with nothing to do");
        }
        Ok(report)
    }

    /// Route the backlog and sweep. Returns the buffers flushed by the
    /// sweep.
    async fn cycle(
        &mut self,
        conn: &mut dyn TargetConnection,
        force: bool,
        report: &mut CycleReport,
    ) -> Result<Vec<DestinationKey>> {
        while let Some(record) = self.backlog.pop_front() {
            let key = match self.route(conn, &record, report).await {
                Ok(key) => key,
                Err(e @ SinkError::Routing(_)) => {
                    warn!(
                        "Discarding record {}/{}/{}: {e}",
                        record.topic, record.partition, record.offset
                    );
                    return Err(e);
                }
                Err(e) => {
                    self.backlog.push_front(record);
                    return Err(e);
                }
            };
            report.records += 1;

            let Some(key) = key else { continue };
            if let Some(buffer) = self.buffers.get_mut(&key) {
                if buffer.is_full() {
                    let table = self.schema.ensure_known(conn, &key).await?;
                    let stats = buffer.flush(conn, &table).await?;
                    report.early_flushes += 1;
                    report.flushed_rows += stats.rows;
                }
            }
        }

        self.sweep(conn, force, report).await
    }

    /// Add one record to its buffer. Returns the destination, or `None`
    /// when the record maps to nothing.
    async fn route(
        &mut self,
        conn: &mut dyn TargetConnection,
        record: &SinkRecord,
        report: &mut CycleReport,
    ) -> Result<Option<DestinationKey>> {
        let key = self.router.route(record)?;
        let Some(change) = self.mapper.map(record)? else {
            report.skipped += 1;
            return Ok(None);
        };
        let table = self.schema.ensure(conn, &key, &change).await?;

        let buffer = match self.buffers.entry(key.clone()) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(self.factory.create(&key).await?)
            }
        };
        buffer.add(change, &table).await?;
        report.routed += 1;
        Ok(Some(key))
    }

    /// Flush every buffer whose age reached `max_batch_wait`, or every
    /// buffer when `force` is set. The first failure aborts the sweep.
    async fn sweep(
        &mut self,
        conn: &mut dyn TargetConnection,
        force: bool,
        report: &mut CycleReport,
    ) -> Result<Vec<DestinationKey>> {
        let max_wait = self.config.writer.max_batch_wait();
        let now = Instant::now();
        let due: Vec<DestinationKey> = self
            .buffers
            .iter()
            .filter(|(_, b)| force || now.saturating_duration_since(b.last_flush_time()) >= max_wait)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &due {
            let Some(buffer) = self.buffers.get_mut(key) else {
                continue;
            };
            let table = self.schema.ensure_known(conn, key).await?;
            let stats = buffer.flush(conn, &table).await?;
            report.flushed_rows += stats.rows;
        }
        Ok(due)
    }

    async fn abort(&mut self, mut conn: Box<dyn TargetConnection>) {
        match conn.rollback().await {
            Ok(()) => self.connection = Some(conn),
            Err(e) => warn!("Rollback failed, dropping the connection: {e}"),
        }
        for buffer in self.buffers.values_mut() {
            buffer.rolled_back();
        }
        self.schema.invalidate();
    }

    async fn acquire_connection(&mut self) -> Result<Box<dyn TargetConnection>> {
        if let Some(mut conn) = self.connection.take() {
            if conn.is_valid().await {
                return Ok(conn);
            }
            warn!("Database connection is no longer valid, reconnecting");
        }

        let attempts = self.config.connection.attempts.max(1);
        let backoff = self.config.connection.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.target.connect().await {
                Ok(conn) => {
                    debug!("Connected to the database on attempt {attempt}");
                    return Ok(conn);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Unable to connect to the database (attempt {attempt}/{attempts}), retrying in {backoff:?}: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!("Unable to connect to the database after {attempts} attempts: {e}");
                    return Err(e);
                }
            }
        }
    }
}
