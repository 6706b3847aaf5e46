//! Sink configuration.
//!
//! The configuration is loaded from a TOML document with one table per
//! concern. Every field has a default, so an empty document is a valid
//! (direct-mode, insert-only) configuration.
//!
//! ```toml
//! [connection]
//! url = "host=localhost user=gpadmin dbname=warehouse"
//!
//! [writer]
//! table_name_format = "kafka_${topic}"
//! load_mode = "windowed-stream"
//! max_batch_wait_ms = 5000
//!
//! [stream]
//! port_range = [8000, 8100]
//! flush_count = 500
//! flush_time_secs = 2
//! ```

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::destination::TOPIC_PLACEHOLDER;
use crate::{Result, SinkError, TableNameFormat};

/// Default names of the primary-key columns in `kafka` primary-key mode.
pub const DEFAULT_KAFKA_PK_NAMES: [&str; 3] =
    ["__connect_topic", "__connect_partition", "__connect_offset"];

/// How buffered records are realized against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    /// Batched statements executed over the connection.
    #[default]
    #[serde(alias = "none")]
    Direct,
    /// Rows streamed through the pull endpoint.
    #[serde(alias = "gpfdist")]
    WindowedStream,
    /// Rows written to a data file plus a load manifest.
    #[serde(alias = "gpload")]
    ExternalFile,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Direct => write!(f, "direct"),
            LoadMode::WindowedStream => write!(f, "windowed-stream"),
            LoadMode::ExternalFile => write!(f, "external-file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InsertMode {
    #[default]
    Insert,
    Upsert,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKeyMode {
    /// No keys utilized.
    #[default]
    None,
    /// Topic, partition and offset of the record form the key.
    Kafka,
    /// Field(s) from the record key.
    RecordKey,
    /// Field(s) from the record value.
    RecordValue,
}

/// De-duplication applied to a batch of keyed rows before it is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    #[default]
    Default,
    FirstRowOnly,
    LastRowOnly,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub connection: ConnectionConfig,
    pub writer: WriterConfig,
    pub stream: StreamConfig,
    pub format: FormatConfig,
    pub file: FileConfig,
}

impl SinkConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SinkConfig =
            toml::from_str(s).map_err(|e| SinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.writer.validate()?;
        self.stream.validate()?;
        self.format.validate()?;

        let rows_per_pull = self.stream.flush_count.saturating_mul(self.stream.batch_count);
        if self.writer.load_mode == LoadMode::WindowedStream
            && self.stream.pull_on_flush
            && self.writer.batch_size > rows_per_pull
        {
            return Err(SinkError::Config(format!(
                "writer.batch_size ({}) must not exceed stream.flush_count * stream.batch_count ({rows_per_pull}) when pulling on flush",
                self.writer.batch_size
            )));
        }
        Ok(())
    }

    pub fn table_name_format(&self) -> TableNameFormat {
        TableNameFormat::new(
            self.writer.table_name_format.clone(),
            self.writer.db_schema.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connection string understood by the target client
    pub url: String,
    /// Maximum number of attempts to obtain a connection
    pub attempts: u32,
    /// Backoff between connection attempts in milliseconds
    pub backoff_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "host=localhost user=postgres".to_string(),
            attempts: 3,
            backoff_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(SinkError::Config(
                "connection.attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Destination table name format; may contain `${topic}`
    pub table_name_format: String,
    /// Schema applied to unqualified table names
    pub db_schema: Option<String>,
    pub load_mode: LoadMode,
    pub insert_mode: InsertMode,
    pub pk_mode: PrimaryKeyMode,
    pub pk_fields: Vec<String>,
    /// Value fields to keep; empty keeps all
    pub fields_whitelist: Vec<String>,
    pub update_mode: UpdateMode,
    /// Treat null record values as deletes (requires `record_key` pk mode)
    pub delete_enabled: bool,
    /// Rows a buffer may hold before it is flushed inside the current cycle
    pub batch_size: usize,
    /// Age after which the sweep flushes a buffer
    pub max_batch_wait_ms: u64,
    pub auto_create: bool,
    pub auto_evolve: bool,
    /// Attempts for a failed write cycle before the task fails
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            table_name_format: TOPIC_PLACEHOLDER.to_string(),
            db_schema: None,
            load_mode: LoadMode::default(),
            insert_mode: InsertMode::default(),
            pk_mode: PrimaryKeyMode::default(),
            pk_fields: vec![],
            fields_whitelist: vec![],
            update_mode: UpdateMode::default(),
            delete_enabled: false,
            batch_size: 3000,
            max_batch_wait_ms: 60_000,
            auto_create: false,
            auto_evolve: false,
            max_retries: 10,
            retry_backoff_ms: 3000,
        }
    }
}

impl WriterConfig {
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SinkError::Config(
                "writer.batch_size must be at least 1".to_string(),
            ));
        }
        if self.delete_enabled && self.pk_mode != PrimaryKeyMode::RecordKey {
            return Err(SinkError::Config(
                "Primary key mode must be 'record_key' when delete support is enabled".to_string(),
            ));
        }
        if self.pk_mode == PrimaryKeyMode::Kafka
            && !self.pk_fields.is_empty()
            && self.pk_fields.len() != DEFAULT_KAFKA_PK_NAMES.len()
        {
            return Err(SinkError::Config(format!(
                "PK mode for kafka requires exactly three pk_fields, got {}",
                self.pk_fields.len()
            )));
        }
        if self.insert_mode != InsertMode::Insert && self.pk_mode == PrimaryKeyMode::None {
            return Err(SinkError::Config(format!(
                "insert_mode '{:?}' requires a primary key mode other than 'none'",
                self.insert_mode
            )));
        }
        if self.delete_enabled && self.load_mode != LoadMode::Direct {
            return Err(SinkError::Config(format!(
                "delete support is only available in direct load mode, not '{}'",
                self.load_mode
            )));
        }
        if self.load_mode == LoadMode::WindowedStream && self.insert_mode != InsertMode::Insert {
            return Err(SinkError::Config(
                "windowed-stream load mode only supports insert_mode 'insert'".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the windowed stream backend and its pull endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Address the pull endpoints bind to
    pub listen_host: String,
    /// Host name the database uses to reach the endpoints; defaults to the
    /// local host name
    pub advertise_host: Option<String>,
    /// One port, or an inclusive `[first, last]` range; `[0]` binds an
    /// ephemeral port
    pub port_range: Vec<u16>,
    pub flush_count: usize,
    pub flush_time_secs: u64,
    pub batch_timeout_secs: u64,
    pub batch_count: usize,
    pub queue_capacity: usize,
    /// Time a client may take to send its request head
    pub request_timeout_secs: u64,
    /// Issue an external-table pull through the cycle transaction on flush
    pub pull_on_flush: bool,
    /// Segment reject limit for the pull; 0 disables error logging
    pub error_limit: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            advertise_host: None,
            port_range: vec![8000, 9000],
            flush_count: 100,
            flush_time_secs: 2,
            batch_timeout_secs: 4,
            batch_count: 100,
            queue_capacity: 8192,
            request_timeout_secs: 30,
            pull_on_flush: true,
            error_limit: 0,
        }
    }
}

impl StreamConfig {
    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            flush_count: self.flush_count,
            flush_time: Duration::from_secs(self.flush_time_secs),
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            batch_count: self.batch_count,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ports(&self) -> Result<RangeInclusive<u16>> {
        match self.port_range.as_slice() {
            [port] => Ok(*port..=*port),
            [first, last] if first <= last => Ok(*first..=*last),
            other => Err(SinkError::Config(format!(
                "stream.port_range must be one port or an ascending [first, last] pair, got {other:?}"
            ))),
        }
    }

    fn validate(&self) -> Result<()> {
        self.ports()?;
        self.window_spec().validate()
    }
}

/// Cadence and caps of the stream aggregator and its pull sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// Events that close a window
    pub flush_count: usize,
    /// Window age that closes a window; zero disables the timer
    pub flush_time: Duration,
    /// Idle time after which a pull session terminates
    pub batch_timeout: Duration,
    /// Chunks a single pull session may take
    pub batch_count: usize,
    /// Emitted chunks buffered before producers block
    pub queue_capacity: usize,
}

impl WindowSpec {
    pub fn validate(&self) -> Result<()> {
        if self.flush_count == 0 {
            return Err(SinkError::Config(
                "stream.flush_count must be greater than 0".to_string(),
            ));
        }
        if self.batch_count == 0 {
            return Err(SinkError::Config(
                "stream.batch_count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(SinkError::Config(
                "stream.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn time_trigger_enabled(&self) -> bool {
        !self.flush_time.is_zero()
    }
}

impl Default for WindowSpec {
    fn default() -> Self {
        StreamConfig::default().window_spec()
    }
}

/// Delimited text encoding shared by the stream and file backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub delimiter: char,
    pub quote: char,
    /// Representation of SQL NULL
    pub null_string: String,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            null_string: String::new(),
        }
    }
}

impl FormatConfig {
    fn validate(&self) -> Result<()> {
        if !self.delimiter.is_ascii() || !self.quote.is_ascii() {
            return Err(SinkError::Config(
                "format.delimiter and format.quote must be ASCII characters".to_string(),
            ));
        }
        if self.delimiter == self.quote {
            return Err(SinkError::Config(
                "format.delimiter and format.quote must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory receiving data files and load manifests
    pub output_dir: PathBuf,
    /// Write a header line into data files
    pub csv_header: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("load-files"),
            csv_header: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SinkConfig::from_toml_str("").unwrap();
        assert_eq!(config.writer.load_mode, LoadMode::Direct);
        assert_eq!(config.writer.batch_size, 3000);
        assert_eq!(config.writer.max_batch_wait(), Duration::from_secs(60));
        assert_eq!(config.stream.ports().unwrap(), 8000..=9000);
        assert_eq!(config.stream.window_spec().flush_count, 100);
    }

    #[test]
    fn test_parse_full_document() {
        let config = SinkConfig::from_toml_str(
            r#"
            [connection]
            url = "host=gp user=gpadmin"
            attempts = 5

            [writer]
            table_name_format = "kafka_${topic}"
            db_schema = "staging"
            load_mode = "gpfdist"
            pk_mode = "record_value"
            pk_fields = ["id"]
            update_mode = "last_row_only"
            batch_size = 300

            [stream]
            port_range = [9100]
            flush_count = 3
            flush_time_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.attempts, 5);
        assert_eq!(config.writer.load_mode, LoadMode::WindowedStream);
        assert_eq!(config.writer.insert_mode, InsertMode::Insert);
        assert_eq!(config.writer.batch_size, 300);
        assert_eq!(config.writer.pk_mode, PrimaryKeyMode::RecordValue);
        assert_eq!(config.writer.update_mode, UpdateMode::LastRowOnly);
        assert_eq!(config.stream.ports().unwrap(), 9100..=9100);
        assert!(!config.stream.window_spec().time_trigger_enabled());
        assert_eq!(
            config.table_name_format().destination("orders").unwrap().to_string(),
            "staging.kafka_orders"
        );
    }

    #[test]
    fn test_delete_requires_record_key() {
        let err = SinkConfig::from_toml_str(
            r#"
            [writer]
            delete_enabled = true
            pk_mode = "record_value"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("record_key"));
    }

    #[test]
    fn test_stream_mode_is_insert_only() {
        let err = SinkConfig::from_toml_str(
            r#"
            [writer]
            load_mode = "windowed-stream"
            insert_mode = "upsert"
            pk_mode = "record_value"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("windowed-stream"));

        let err = SinkConfig::from_toml_str(
            r#"
            [writer]
            load_mode = "external-file"
            delete_enabled = true
            pk_mode = "record_key"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("direct load mode"));
    }

    #[test]
    fn test_upsert_requires_primary_key() {
        let err = SinkConfig::from_toml_str(
            r#"
            [writer]
            insert_mode = "upsert"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[test]
    fn test_window_spec_invariants() {
        assert!(SinkConfig::from_toml_str("[stream]\nflush_count = 0").is_err());
        assert!(SinkConfig::from_toml_str("[stream]\nbatch_count = 0").is_err());
        assert!(SinkConfig::from_toml_str("[stream]\nport_range = [9000, 8000]").is_err());
        assert!(SinkConfig::from_toml_str("[stream]\nport_range = []").is_err());
    }

    #[test]
    fn test_stream_batch_must_fit_the_pulls() {
        let err = SinkConfig::from_toml_str(
            r#"
            [writer]
            load_mode = "windowed-stream"
            batch_size = 301

            [stream]
            flush_count = 3
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("flush_count * stream.batch_count (300)"));

        // Without pulls the endpoint is read by someone else.
        assert!(SinkConfig::from_toml_str(
            r#"
            [writer]
            load_mode = "windowed-stream"
            batch_size = 301

            [stream]
            flush_count = 3
            pull_on_flush = false
            "#,
        )
        .is_ok());
    }

    #[test]
    fn test_unknown_load_mode_is_rejected() {
        assert!(SinkConfig::from_toml_str("[writer]\nload_mode = \"carrier-pigeon\"").is_err());
    }
}
