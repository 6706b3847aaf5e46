//! Change records as delivered by an upstream source.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single change record.
///
/// Records carry the name of the topic they were read from; the topic is
/// what the router turns into a destination table. `value` is `None` for
/// tombstones (deletes, when delete support is enabled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    /// Topic (or stream) name the record was read from
    pub topic: String,
    /// Source partition
    #[serde(default)]
    pub partition: i32,
    /// Offset within the partition
    #[serde(default)]
    pub offset: i64,
    /// Record key (primitive or object)
    #[serde(default)]
    pub key: Option<Value>,
    /// Record value; must be a JSON object when present
    #[serde(default)]
    pub value: Option<Value>,
    /// Record timestamp (milliseconds since epoch)
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl SinkRecord {
    pub fn new(topic: impl Into<String>, key: Option<Value>, value: Option<Value>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key,
            value,
            timestamp: None,
        }
    }

    /// Set the source coordinates of the record.
    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, None | Some(Value::Null))
    }
}
