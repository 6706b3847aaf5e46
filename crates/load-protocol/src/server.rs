//! TCP listener serving an aggregator's queue to pull clients.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use sink_core::{Result, SinkError};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::StreamAggregator;
use crate::http::{read_request_head, write_simple_response};
use crate::session::PullSession;

/// The only path the endpoint serves.
pub const DATA_PATH: &str = "/data";

/// Pull endpoint for one aggregator.
pub struct ProtocolServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl ProtocolServer {
    /// Bind the first free port of `ports` on `host` and start accepting.
    pub async fn bind(
        host: &str,
        ports: RangeInclusive<u16>,
        aggregator: StreamAggregator,
        request_timeout: Duration,
    ) -> Result<Self> {
        let listener = bind_in_range(host, ports).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!(
            "Pull endpoint for {} listening on {}",
            aggregator.name(),
            local_addr
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            aggregator,
            request_timeout,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL under which the database reaches this endpoint.
    pub fn location(&self, host: &str) -> String {
        format!("gpfdist://{host}:{}{DATA_PATH}", self.local_addr.port())
    }

    /// Stop accepting connections. Sessions already running finish on
    /// their own.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop on {} ended abnormally: {e}", self.local_addr);
            }
        }
    }
}

impl Drop for ProtocolServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn bind_in_range(host: &str, ports: RangeInclusive<u16>) -> Result<TcpListener> {
    let (first, last) = (*ports.start(), *ports.end());
    for port in ports {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!("Port {port} on {host} in use");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(SinkError::Protocol(format!(
        "no free port in {first}..={last} on {host}"
    )))
}

async fn accept_loop(
    listener: TcpListener,
    aggregator: StreamAggregator,
    request_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut next_id = 1u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id;
                    next_id += 1;
                    let aggregator = aggregator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(id, stream, peer, aggregator, request_timeout).await {
                            match e {
                                SinkError::SessionConflict(_) | SinkError::ProtocolTimeout(_) => {
                                    warn!("Session {id} from {peer} rejected: {e}");
                                }
                                _ => error!("Load session {id} from {peer} failed: {e}"),
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {e}");
                }
            }
        }
    }
    debug!("Pull endpoint for {} stopped", aggregator.name());
}

async fn handle_connection(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    aggregator: StreamAggregator,
    request_timeout: Duration,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let head = match tokio::time::timeout(request_timeout, read_request_head(&mut reader)).await {
        Ok(head) => head?,
        Err(_) => {
            let _ = write_simple_response(&mut write_half, 408, "Request Timeout", "").await;
            return Err(SinkError::ProtocolTimeout(format!(
                "no request head from {peer} within {request_timeout:?}"
            )));
        }
    };

    if head.route() != DATA_PATH {
        debug!("Session {id}: {} {} not found", head.method, head.path);
        return write_simple_response(&mut write_half, 404, "Not Found", "not found\n").await;
    }
    if head.method != "GET" {
        debug!("Session {id}: method {} not allowed", head.method);
        return write_simple_response(&mut write_half, 405, "Method Not Allowed", "").await;
    }

    let subscription = match aggregator.subscribe() {
        Ok(subscription) => subscription,
        Err(e) => {
            write_simple_response(&mut write_half, 409, "Conflict", "session in progress\n").await?;
            return Err(e);
        }
    };

    info!("Session {id} from {peer} pulling {}", aggregator.name());
    let mut session = PullSession::new(id, aggregator.spec());
    let report = session.run(write_half, subscription).await?;
    info!(
        "Session {id} for {} complete: {} chunks, {} bytes in {:?}",
        aggregator.name(),
        report.chunks,
        report.bytes,
        report.elapsed
    );
    Ok(())
}
