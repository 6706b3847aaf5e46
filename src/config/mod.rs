//! Configuration file handling.
//!
//! The file is TOML: the sink sections (`[connection]`, `[writer]`,
//! `[stream]`, `[format]`, `[file]`) plus an optional `[kafka]` section
//! for the consumer. Every key has a default.

mod duration;

pub use duration::parse_duration;

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sink_core::SinkConfig;
use warehouse_sink_kafka_source::ConsumerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub kafka: ConsumerConfig,
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s).context("Failed to parse configuration")?;
        config.sink.validate().context("Invalid sink configuration")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {path:?}"))?;
        Self::from_toml_str(&contents).with_context(|| format!("In {path:?}"))
    }
}
