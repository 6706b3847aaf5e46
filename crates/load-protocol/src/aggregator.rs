//! Dual-trigger window aggregation over appended byte chunks.
//!
//! A window opens with the first event appended to it and closes when either
//! `flush_count` events have accumulated or `flush_time` has elapsed since it
//! opened, whichever happens first. Closing a window concatenates its events
//! in append order and pushes the result onto a bounded queue. When the
//! queue is full the closing party (producer or timer) waits; nothing is
//! dropped.
//!
//! The window contents and the window-open timestamp live behind a single
//! async mutex, and chunks are sent to the queue while that mutex is held,
//! so emission order always equals append order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sink_core::{Result, SinkError, WindowSpec};
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Default)]
struct Window {
    events: Vec<Bytes>,
    opened_at: Option<Instant>,
}

impl Window {
    /// Take the window contents as one chunk, resetting the window.
    fn take_chunk(&mut self) -> Option<Bytes> {
        self.opened_at = None;
        if self.events.is_empty() {
            return None;
        }
        let len = self.events.iter().map(Bytes::len).sum();
        let mut chunk = BytesMut::with_capacity(len);
        for event in self.events.drain(..) {
            chunk.extend_from_slice(&event);
        }
        Some(chunk.freeze())
    }
}

/// Receiving end of the queue plus chunks handed back by failed sessions.
struct Consumer {
    rx: mpsc::Receiver<Bytes>,
    redeliver: VecDeque<Bytes>,
}

struct Inner {
    name: String,
    spec: WindowSpec,
    window: Arc<Mutex<Window>>,
    queue: mpsc::Sender<Bytes>,
    consumer: Arc<Mutex<Consumer>>,
    window_opened: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Windowed aggregator for one destination. Cheap to clone.
#[derive(Clone)]
pub struct StreamAggregator {
    inner: Arc<Inner>,
}

impl StreamAggregator {
    /// Create an aggregator. When `spec` enables the time trigger a timer
    /// task is spawned, so this must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, spec: WindowSpec) -> Result<Self> {
        spec.validate()?;

        let name = name.into();
        let (tx, rx) = mpsc::channel(spec.queue_capacity);
        let inner = Inner {
            name,
            spec,
            window: Arc::new(Mutex::new(Window::default())),
            queue: tx,
            consumer: Arc::new(Mutex::new(Consumer {
                rx,
                redeliver: VecDeque::new(),
            })),
            window_opened: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        };

        if spec.time_trigger_enabled() {
            tokio::spawn(run_window_timer(
                inner.name.clone(),
                spec.flush_time,
                Arc::clone(&inner.window),
                Arc::clone(&inner.window_opened),
                inner.queue.clone(),
                inner.shutdown.clone(),
            ));
        }

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn spec(&self) -> &WindowSpec {
        &self.inner.spec
    }

    /// Append one event to the open window, closing the window when it
    /// reaches `flush_count` events. Waits while the queue is full.
    ///
    /// An empty event carries no row: it is ignored and does not count
    /// towards `flush_count`.
    pub async fn append(&self, event: Bytes) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SinkError::Closed(format!("aggregator {}", self.inner.name)));
        }
        if event.is_empty() {
            return Ok(());
        }

        let mut window = self.inner.window.lock().await;
        if window.opened_at.is_none() {
            window.opened_at = Some(Instant::now());
            self.inner.window_opened.notify_one();
        }
        window.events.push(event);

        if window.events.len() >= self.inner.spec.flush_count {
            if let Some(chunk) = window.take_chunk() {
                trace!(
                    "Window of {} closed by count ({} bytes)",
                    self.inner.name,
                    chunk.len()
                );
                self.send(chunk).await?;
            }
        }
        Ok(())
    }

    /// Close the open window early. Returns `true` when a chunk was emitted.
    pub async fn flush(&self) -> Result<bool> {
        let mut window = self.inner.window.lock().await;
        match window.take_chunk() {
            Some(chunk) => {
                debug!(
                    "Window of {} closed by flush ({} bytes)",
                    self.inner.name,
                    chunk.len()
                );
                self.send(chunk).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Attach the single reader of the emitted chunks.
    ///
    /// Only one subscription may exist at a time; the handle is released
    /// when the returned [`Subscription`] is dropped.
    pub fn subscribe(&self) -> Result<Subscription> {
        match Arc::clone(&self.inner.consumer).try_lock_owned() {
            Ok(consumer) => Ok(Subscription { consumer }),
            Err(_) => Err(SinkError::SessionConflict(self.inner.name.clone())),
        }
    }

    /// Events in the currently open window.
    pub async fn pending_events(&self) -> usize {
        self.inner.window.lock().await.events.len()
    }

    /// Emitted chunks waiting in the queue.
    pub fn queued_chunks(&self) -> usize {
        self.inner.queue.max_capacity() - self.inner.queue.capacity()
    }

    /// Drop the open window and every emitted chunk no reader has taken,
    /// waiting for an open session to end first. Returns the number of
    /// events and chunks dropped.
    pub async fn discard(&self) -> usize {
        let mut window = self.inner.window.lock().await;
        let mut consumer = self.inner.consumer.lock().await;

        let mut dropped = window.events.len() + consumer.redeliver.len();
        window.events.clear();
        window.opened_at = None;
        consumer.redeliver.clear();
        while consumer.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Discarded {dropped} events and chunks of {}", self.inner.name);
        }
        dropped
    }

    /// Stop the window timer and refuse further appends. Chunks already in
    /// the queue stay available to subscribers.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn send(&self, chunk: Bytes) -> Result<()> {
        self.inner
            .queue
            .send(chunk)
            .await
            .map_err(|_| SinkError::Closed(format!("queue of {}", self.inner.name)))
    }
}

async fn run_window_timer(
    name: String,
    flush_time: Duration,
    window: Arc<Mutex<Window>>,
    window_opened: Arc<Notify>,
    queue: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let deadline = window.lock().await.opened_at.map(|t| t + flush_time);

        match deadline {
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = window_opened.notified() => continue,
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        }

        let mut guard = window.lock().await;
        let expired = guard
            .opened_at
            .is_some_and(|opened| opened.elapsed() >= flush_time);
        if !expired {
            continue;
        }
        if let Some(chunk) = guard.take_chunk() {
            trace!("Window of {name} closed by time ({} bytes)", chunk.len());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                sent = queue.send(chunk) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!("Window timer of {name} stopped");
}

/// Exclusive receive handle on an aggregator's queue.
pub struct Subscription {
    consumer: OwnedMutexGuard<Consumer>,
}

impl Subscription {
    /// Next chunk, waiting until one is available. `None` once the
    /// aggregator is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<Bytes> {
        if let Some(chunk) = self.consumer.redeliver.pop_front() {
            return Some(chunk);
        }
        self.consumer.rx.recv().await
    }

    /// Hand a chunk back so the next reader receives it first.
    pub fn requeue(&mut self, chunk: Bytes) {
        self.consumer.redeliver.push_front(chunk);
    }
}
