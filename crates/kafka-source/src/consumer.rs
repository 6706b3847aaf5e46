use std::collections::BTreeMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as RdkafkaConsumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message as RdkafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sink_core::SinkRecord;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Configuration for the Kafka consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    /// Consumer group ID
    pub group_id: String,
    /// Topics to consume from; each topic maps to a destination table
    pub topics: Vec<String>,
    /// Auto offset reset strategy ("earliest" or "latest")
    ///
    /// "earliest" is the safe choice for change streams: a group without
    /// committed offsets starts from the beginning instead of skipping
    /// updates.
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,
    /// Upper bound on the records returned by one `receive_batch`
    #[serde(alias = "batch_size")]
    pub max_poll_records: usize,
    /// Time `receive_batch` waits for the first record
    pub poll_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "warehouse-sink".to_string(),
            topics: vec![],
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 6000,
            max_poll_records: 500,
            poll_timeout_ms: 1000,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topics.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one topic is required".to_string(),
            ));
        }
        if !matches!(self.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(Error::InvalidConfig(format!(
                "auto_offset_reset must be 'earliest' or 'latest', got '{}'",
                self.auto_offset_reset
            )));
        }
        if self.max_poll_records == 0 {
            return Err(Error::InvalidConfig(
                "max_poll_records must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Kafka consumer with manual offset management.
///
/// Auto commit is always off: offsets are committed with [`Consumer::commit`]
/// or [`Consumer::commit_offsets`] once the records have been written.
pub struct Consumer {
    consumer: StreamConsumer,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| Error::Consumer(format!("Failed to create consumer: {e}")))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| Error::Consumer(format!("Failed to subscribe to topics: {e}")))?;
        info!(
            "Subscribed to {:?} as group {}",
            config.topics, config.group_id
        );

        Ok(Self { consumer, config })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Receive up to `max_poll_records` records. Waits at most the poll
    /// timeout for the first one and returns an empty batch when none
    /// arrived, so the caller can still run time-based flushes.
    pub async fn receive_batch(&self) -> Result<Vec<SinkRecord>> {
        let mut records = Vec::new();

        match tokio::time::timeout(self.config.poll_timeout(), self.consumer.recv()).await {
            Ok(Ok(msg)) => records.push(decode_message(&msg)?),
            Ok(Err(e)) => return Err(Error::Consumer(format!("Error receiving message: {e}"))),
            Err(_) => return Ok(records),
        }

        // Take whatever else is already available.
        while records.len() < self.config.max_poll_records {
            match tokio::time::timeout(Duration::from_millis(10), self.consumer.recv()).await {
                Ok(Ok(msg)) => records.push(decode_message(&msg)?),
                Ok(Err(e)) => {
                    return Err(Error::Consumer(format!("Error receiving message: {e}")))
                }
                Err(_) => break,
            }
        }

        debug!("Received {} records", records.len());
        Ok(records)
    }

    /// Commit the offsets following `records`.
    pub fn commit(&self, records: &[SinkRecord]) -> Result<()> {
        self.commit_offsets(&commit_positions(records))
    }

    /// Commit next-to-consume offsets per topic partition.
    pub fn commit_offsets(&self, positions: &BTreeMap<(String, i32), i64>) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in positions {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(*offset))
                .map_err(|e| Error::Consumer(format!("Failed to add partition offset: {e}")))?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| Error::Consumer(format!("Failed to commit offset: {e}")))?;
        debug!("Committed offsets for {} partitions", positions.len());
        Ok(())
    }
}

/// Next offset to consume for every partition present in `records`.
pub fn commit_positions(records: &[SinkRecord]) -> BTreeMap<(String, i32), i64> {
    let mut positions = BTreeMap::new();
    for record in records {
        let next = record.offset + 1;
        positions
            .entry((record.topic.clone(), record.partition))
            .and_modify(|offset: &mut i64| *offset = (*offset).max(next))
            .or_insert(next);
    }
    positions
}

fn decode_message(msg: &BorrowedMessage) -> Result<SinkRecord> {
    let decode_error = |reason: String| Error::Decode {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        reason,
    };

    let value = msg.payload().map(decode_value).transpose().map_err(decode_error)?;
    let key = msg.key().map(decode_key);

    let mut record = SinkRecord::new(msg.topic(), key, value)
        .with_position(msg.partition(), msg.offset());
    record.timestamp = msg.timestamp().to_millis();
    Ok(record)
}

/// Message values must be JSON. An empty payload is a tombstone.
pub fn decode_value(payload: &[u8]) -> std::result::Result<Value, String> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload).map_err(|e| format!("value is not valid JSON: {e}"))
}

/// Keys are JSON when they parse as JSON, otherwise plain strings.
pub fn decode_key(key: &[u8]) -> Value {
    serde_json::from_slice(key)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(key).into_owned()))
}
