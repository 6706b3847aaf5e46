//! Per-destination stream endpoints: one aggregator plus the pull server
//! serving it. Endpoints outlive the buffers that feed them.

use std::collections::BTreeMap;

use load_protocol::{ProtocolServer, StreamAggregator};
use sink_core::{DestinationKey, Result, StreamConfig};
use tracing::info;

/// Handle a buffer keeps on its endpoint.
#[derive(Clone)]
pub struct StreamEndpoint {
    pub aggregator: StreamAggregator,
    /// URL the database pulls from
    pub location: String,
}

struct Running {
    endpoint: StreamEndpoint,
    server: ProtocolServer,
}

pub struct StreamEndpoints {
    config: StreamConfig,
    advertise_host: String,
    running: BTreeMap<DestinationKey, Running>,
}

impl StreamEndpoints {
    pub fn new(config: StreamConfig) -> Self {
        let advertise_host = advertise_host(&config);
        Self {
            config,
            advertise_host,
            running: BTreeMap::new(),
        }
    }

    /// The endpoint of `key`, starting it on first use.
    pub async fn endpoint(&mut self, key: &DestinationKey) -> Result<StreamEndpoint> {
        if let Some(running) = self.running.get(key) {
            return Ok(running.endpoint.clone());
        }

        let aggregator = StreamAggregator::new(key.to_string(), self.config.window_spec())?;
        let server = ProtocolServer::bind(
            &self.config.listen_host,
            self.config.ports()?,
            aggregator.clone(),
            self.config.request_timeout(),
        )
        .await?;
        let endpoint = StreamEndpoint {
            aggregator,
            location: server.location(&self.advertise_host),
        };
        info!("Streaming {key} through {}", endpoint.location);

        self.running.insert(
            key.clone(),
            Running {
                endpoint: endpoint.clone(),
                server,
            },
        );
        Ok(endpoint)
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Stop every endpoint. Chunks still queued are dropped with the
    /// aggregators.
    pub async fn shutdown(&mut self) {
        for (key, mut running) in std::mem::take(&mut self.running) {
            running.endpoint.aggregator.shutdown();
            running.server.shutdown().await;
            info!("Stopped stream endpoint for {key}");
        }
    }
}

/// Host name the database should use to reach the endpoints.
fn advertise_host(config: &StreamConfig) -> String {
    if let Some(host) = config.advertise_host.as_deref().filter(|h| !h.is_empty()) {
        return host.to_string();
    }
    match config.listen_host.as_str() {
        "0.0.0.0" | "::" | "" => std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string()),
        host => host.to_string(),
    }
}
