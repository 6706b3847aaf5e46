use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_yaml::{Mapping, Value};
use sink_core::{
    DestinationKey, FileConfig, FormatConfig, InsertMode, Result, RowChange, SinkError,
    TableDescription,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Buffer, FlushStats};
use crate::encode::RowEncoder;
use crate::target::TargetConnection;

/// Writes a delimited data file and a load control file per flush, for an
/// external loader to pick up.
pub struct ExternalFileBuffer {
    destination: DestinationKey,
    encoder: RowEncoder,
    format: FormatConfig,
    file: FileConfig,
    insert_mode: InsertMode,
    error_limit: u32,
    batch_size: usize,
    rows: Vec<Bytes>,
    executed: usize,
    /// Files written in the open transaction
    written: Vec<PathBuf>,
    sequence: Arc<AtomicU64>,
    created_at: Instant,
}

impl ExternalFileBuffer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destination: DestinationKey,
        format: &FormatConfig,
        file: &FileConfig,
        insert_mode: InsertMode,
        error_limit: u32,
        batch_size: usize,
        sequence: Arc<AtomicU64>,
    ) -> Self {
        Self {
            destination,
            encoder: RowEncoder::new(format),
            format: format.clone(),
            file: file.clone(),
            insert_mode,
            error_limit,
            batch_size,
            rows: Vec::new(),
            executed: 0,
            written: Vec::new(),
            sequence,
            created_at: Instant::now(),
        }
    }

    fn file_stem(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name: String = self
            .destination
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        format!("{name}-{millis}-{seq:06}")
    }

    fn control_file(&self, data_path: &Path, table: &TableDescription) -> Result<String> {
        let columns: Vec<Value> = table
            .columns
            .iter()
            .map(|c| item(&c.name, c.column_type.sql_name().into()))
            .collect();

        let mut source = Mapping::new();
        source.insert(
            "FILE".into(),
            vec![data_path.display().to_string()].into(),
        );

        let mut input = vec![
            item("SOURCE", Value::Mapping(source)),
            item("COLUMNS", Value::Sequence(columns)),
            item("FORMAT", "csv".into()),
            item("DELIMITER", self.format.delimiter.to_string().into()),
            item("QUOTE", self.format.quote.to_string().into()),
            item("NULL_AS", self.format.null_string.clone().into()),
            item("HEADER", self.file.csv_header.into()),
            item("FILL_MISSING_FIELDS", true.into()),
        ];
        if self.error_limit > 0 {
            input.push(item("ERROR_LIMIT", self.error_limit.into()));
        }

        let mode = match self.insert_mode {
            InsertMode::Insert => "insert",
            InsertMode::Upsert => "merge",
            InsertMode::Update => "update",
        };
        let mut output = vec![
            item("TABLE", self.destination.to_string().into()),
            item("MODE", mode.into()),
        ];
        if self.insert_mode != InsertMode::Insert {
            let update_columns: Vec<String> = table
                .column_names()
                .into_iter()
                .filter(|c| !table.primary_key.iter().any(|k| k == c))
                .map(str::to_string)
                .collect();
            output.push(item("MATCH_COLUMNS", table.primary_key.clone().into()));
            output.push(item("UPDATE_COLUMNS", update_columns.into()));
        }

        let mut gpload = Mapping::new();
        gpload.insert("INPUT".into(), Value::Sequence(input));
        gpload.insert("OUTPUT".into(), Value::Sequence(output));
        let mut control = Mapping::new();
        control.insert("VERSION".into(), "1.0.0.1".into());
        control.insert("GPLOAD".into(), Value::Mapping(gpload));

        serde_yaml::to_string(&control).map_err(|e| SinkError::Encoding(e.to_string()))
    }
}

/// Single-entry mapping, the shape of every INPUT/OUTPUT item.
fn item(key: &str, value: Value) -> Value {
    let mut mapping = Mapping::new();
    mapping.insert(key.into(), value);
    Value::Mapping(mapping)
}

/// Write `contents` to `path` through a temporary file in the same
/// directory, so readers never see a partial file.
async fn write_atomically(path: PathBuf, contents: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| SinkError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| SinkError::Io(std::io::Error::other(e)))?
}

#[async_trait::async_trait]
impl Buffer for ExternalFileBuffer {
    fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    async fn add(&mut self, change: RowChange, table: &TableDescription) -> Result<()> {
        match change {
            RowChange::Upsert(row) => {
                self.rows.push(self.encoder.encode(&row, table));
                Ok(())
            }
            RowChange::Delete { .. } => Err(SinkError::Config(format!(
                "cannot write a delete for {} to a load file",
                self.destination
            ))),
        }
    }

    fn is_full(&self) -> bool {
        self.pending() >= self.batch_size
    }

    fn pending(&self) -> usize {
        self.rows.len() - self.executed
    }

    async fn flush(
        &mut self,
        _conn: &mut dyn TargetConnection,
        table: &TableDescription,
    ) -> Result<FlushStats> {
        let unwritten = &self.rows[self.executed..];
        if unwritten.is_empty() {
            return Ok(FlushStats::default());
        }

        tokio::fs::create_dir_all(&self.file.output_dir).await?;
        let stem = self.file_stem();
        let data_path = self.file.output_dir.join(format!("{stem}.csv"));
        let control_path = self.file.output_dir.join(format!("{stem}.yml"));

        let mut data = Vec::new();
        if self.file.csv_header {
            data.extend_from_slice(&self.encoder.header(table));
        }
        for line in unwritten {
            data.extend_from_slice(line);
        }
        let rows = unwritten.len();
        let control = self.control_file(&data_path, table)?;

        write_atomically(data_path.clone(), data).await?;
        self.written.push(data_path.clone());
        write_atomically(control_path.clone(), control.into_bytes()).await?;
        self.written.push(control_path.clone());

        self.executed = self.rows.len();
        info!(
            "Wrote {} rows for {} to {}",
            rows,
            self.destination,
            data_path.display()
        );
        Ok(FlushStats {
            rows,
            statements: 0,
            rows_affected: rows as u64,
        })
    }

    fn committed(&mut self) {
        self.rows.drain(..self.executed);
        self.executed = 0;
        self.written.clear();
    }

    fn rolled_back(&mut self) {
        for path in self.written.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {e}", path.display()),
            }
        }
        self.executed = 0;
    }

    async fn close(&mut self) -> Result<()> {
        self.rows.clear();
        self.executed = 0;
        Ok(())
    }

    fn last_flush_time(&self) -> Instant {
        self.created_at
    }
}
