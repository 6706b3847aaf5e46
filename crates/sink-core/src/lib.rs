//! Core types for the warehouse-sink framework.
//!
//! This crate provides the foundational types shared by every other crate
//! in the workspace:
//!
//! - [`SinkRecord`] - A change record as delivered by an upstream source
//! - [`DestinationKey`] - The resolved target table identity of a record
//! - [`Row`] / [`RowChange`] - The column-level view of a record
//! - [`TableShape`] / [`TableDescription`] - What the records look like vs.
//!   what the target table looks like
//! - [`SinkConfig`] - Configuration loaded from TOML
//! - [`SinkError`] - The error taxonomy of the sink
//!
//! # Architecture
//!
//! ```text
//! sink-core (this crate)
//!    │
//!    ├─── load-protocol              (stream aggregator + pull server)
//!    ├─── sink-buffer                (buffers, buffer manager, statements)
//!    ├─── warehouse-sink-postgresql  (tokio-postgres target)
//!    └─── warehouse-sink-kafka-source
//! ```

pub mod config;
pub mod destination;
pub mod error;
pub mod record;
pub mod row;

// Re-exports for convenience
pub use config::{
    ConnectionConfig, FileConfig, FormatConfig, InsertMode, LoadMode, PrimaryKeyMode, SinkConfig,
    StreamConfig, UpdateMode, WindowSpec, WriterConfig,
};
pub use destination::{DestinationKey, TableNameFormat};
pub use error::{Result, SinkError};
pub use record::SinkRecord;
pub use row::{ColumnDef, ColumnType, Row, RowChange, TableDescription, TableShape};
