//! Streaming batch aggregation and the pull endpoint an external bulk loader
//! reads from.
//!
//! Producers append small encoded events to a [`StreamAggregator`], which
//! closes windows by event count or window age and hands the concatenated
//! chunks to a bounded queue. A [`ProtocolServer`] serves that queue over
//! HTTP: each pull request takes up to `batch_count` chunks, framed with
//! [`FrameCodec`], and ends with a zero-length sentinel frame.
//!
//! ```text
//! append ──► [window: count | time] ──► bounded queue ──► GET /data ──► D|len|bytes … D|0
//! ```

pub mod aggregator;
pub mod codec;
pub mod http;
pub mod server;
pub mod session;

pub use aggregator::{StreamAggregator, Subscription};
pub use codec::FrameCodec;
pub use server::{ProtocolServer, DATA_PATH};
pub use session::{PullSession, SessionReport, SessionState};
