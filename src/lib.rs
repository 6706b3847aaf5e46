//! warehouse-sink
//!
//! Delivers streams of JSON change records into a PostgreSQL / Greenplum
//! compatible warehouse. Records are routed to one buffer per destination
//! table and loaded with batched statements (`direct`), through a gpfdist
//! pull endpoint (`windowed`), or as data files plus a load-control manifest
//! for an external loader (`file`).
//!
//! # CLI Usage
//!
//! ```bash
//! # Consume from Kafka
//! warehouse-sink --config sink.toml kafka --brokers localhost:9092 --topics users,orders
//!
//! # Replay JSONL files, logging the statements instead of executing them
//! warehouse-sink --config sink.toml replay users.jsonl orders.jsonl --dry-run
//!
//! # Validate a configuration file
//! warehouse-sink --config sink.toml check-config
//! ```

pub mod config;
pub mod kafka;
pub mod replay;
pub mod sink;

pub use config::AppConfig;
pub use sink::{Sink, SinkStats};
