//! One pull request against the endpoint.
//!
//! ```text
//! AwaitFirstChunk ──chunk──► Streaming ──batch_count reached──┐
//!        │                      │                             ▼
//!        └──────batch_timeout idle──────────────────────► Terminating ──sentinel──► Closed
//! ```
//!
//! Whatever happens, a session that got as far as its response head ends
//! with exactly one zero-length frame or with an error; the subscription it
//! holds is released when the session returns.

use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use sink_core::{Result, WindowSpec};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

use crate::aggregator::Subscription;
use crate::codec::FrameCodec;
use crate::http::stream_response_head;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitFirstChunk,
    Streaming,
    Terminating,
    Closed,
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: u64,
    pub chunks: usize,
    pub bytes: u64,
    /// The session ended because no chunk arrived within `batch_timeout`.
    pub idle_timeout: bool,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct PullSession {
    id: u64,
    emitted: usize,
    bytes: u64,
    started_at: Instant,
    state: SessionState,
    batch_count: usize,
    batch_timeout: Duration,
}

impl PullSession {
    pub fn new(id: u64, spec: &WindowSpec) -> Self {
        Self {
            id,
            emitted: 0,
            bytes: 0,
            started_at: Instant::now(),
            state: SessionState::AwaitFirstChunk,
            batch_count: spec.batch_count,
            batch_timeout: spec.batch_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Write the response head, stream chunks and terminate with the
    /// sentinel frame. On a write failure the chunk being written is handed
    /// back to the subscription before the error is returned.
    pub async fn run<W>(&mut self, mut writer: W, mut subscription: Subscription) -> Result<SessionReport>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.stream(&mut writer, &mut subscription).await;
        self.state = SessionState::Closed;
        result?;

        Ok(SessionReport {
            id: self.id,
            chunks: self.emitted,
            bytes: self.bytes,
            idle_timeout: self.emitted < self.batch_count,
            elapsed: self.started_at.elapsed(),
        })
    }

    async fn stream<W>(&mut self, writer: &mut W, subscription: &mut Subscription) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(stream_response_head().as_bytes()).await?;
        let mut frames = FramedWrite::new(writer, FrameCodec);

        while self.emitted < self.batch_count {
            let chunk = match tokio::time::timeout(self.batch_timeout, subscription.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    debug!("Session {}: aggregator closed", self.id);
                    break;
                }
                Err(_) => {
                    trace!(
                        "Session {}: idle for {:?} after {} chunks",
                        self.id,
                        self.batch_timeout,
                        self.emitted
                    );
                    break;
                }
            };

            let len = chunk.len() as u64;
            if let Err(e) = frames.send(chunk.clone()).await {
                subscription.requeue(chunk);
                return Err(e);
            }
            self.emitted += 1;
            self.bytes += len;
            self.state = SessionState::Streaming;
        }

        self.state = SessionState::Terminating;
        frames.send(Bytes::new()).await?;
        frames.close().await?;
        Ok(())
    }
}
