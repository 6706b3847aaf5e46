//! PostgreSQL (and Greenplum) implementation of the sink's database seam.
//!
//! Every connection runs with an explicit transaction that is opened by the
//! first statement of a write cycle and ended by the buffer manager's
//! commit or rollback.

mod catalog;
mod connection;

pub use catalog::describe_table;
pub use connection::{PostgresConnection, PostgresTarget};
