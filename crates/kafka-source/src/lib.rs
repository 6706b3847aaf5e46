//! Kafka consumer feeding the sink.
//!
//! Messages are JSON documents. The consumer hands them out in batches as
//! [`SinkRecord`](sink_core::SinkRecord)s and commits offsets only when told
//! to, once the records have been written by a committed cycle.

pub mod consumer;
pub mod error;

pub use consumer::{commit_positions, Consumer, ConsumerConfig};
pub use error::{Error, Result};
