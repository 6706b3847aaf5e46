//! Table-scoped buffering and transactional write cycles.
//!
//! The [`BufferManager`] routes [`SinkRecord`](sink_core::SinkRecord)s to a
//! buffer per destination table and flushes them inside one database
//! transaction per cycle. Three buffer variants share the [`Buffer`]
//! lifecycle:
//!
//! - [`DirectBuffer`] executes insert, upsert, update and delete statements
//! - [`WindowedLoadBuffer`] streams rows to a pull endpoint served by
//!   [`load_protocol`] and has the database read them through an external
//!   table
//! - [`ExternalFileBuffer`] writes data files with a loader control file
//!
//! The database itself sits behind [`TargetDatabase`]; [`MemoryTarget`] is
//! the in-process implementation used for dry runs and tests.

pub mod buffer;
pub mod encode;
pub mod endpoints;
pub mod manager;
pub mod memory;
pub mod pull;
pub mod router;
pub mod schema;
pub mod statement;
pub mod target;

pub use buffer::{Buffer, DirectBuffer, ExternalFileBuffer, FlushStats, WindowedLoadBuffer};
pub use encode::RowEncoder;
pub use endpoints::{StreamEndpoint, StreamEndpoints};
pub use manager::{BufferManager, CycleReport};
pub use memory::MemoryTarget;
pub use router::{RecordRouter, RowMapper};
pub use schema::SchemaManager;
pub use statement::{Ddl, ExternalLoad, Statement};
pub use target::{BatchOutcome, TargetConnection, TargetDatabase};
