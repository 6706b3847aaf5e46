//! Replay of change records from JSONL files.
//!
//! Each non-empty line is either a full record (an object with a `topic`
//! field, plus optional `partition`, `offset`, `key`, `value` and
//! `timestamp`) or a bare value. Bare values are attributed to a topic named
//! after the file stem and take their line number as offset.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context};
use serde_json::Value;
use sink_core::SinkRecord;
use tracing::info;

use crate::sink::Sink;

/// Parse every record of a JSONL stream.
pub fn read_records(reader: impl Read, default_topic: &str) -> anyhow::Result<Vec<SinkRecord>> {
    let mut records = Vec::new();
    for (line_count, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        let line_count = line_count + 1;
        if line.trim().is_empty() {
            continue;
        }

        let json_value: Value = serde_json::from_str(&line)
            .map_err(|e| anyhow!("Error parsing JSON at line {line_count}: {e}"))?;
        let record = if json_value.get("topic").is_some_and(Value::is_string) {
            serde_json::from_value(json_value)
                .map_err(|e| anyhow!("Invalid record at line {line_count}: {e}"))?
        } else {
            SinkRecord::new(default_topic, None, Some(json_value))
                .with_position(0, line_count as i64)
        };
        records.push(record);
    }
    Ok(records)
}

/// Topic for bare values read from `path`.
pub fn default_topic(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("records")
        .to_string()
}

/// Replay `paths` through `sink` in cycles of `chunk_size` records, then
/// close the sink. Returns the number of records written.
pub async fn replay_files(
    sink: &mut Sink,
    paths: &[impl AsRef<Path>],
    chunk_size: usize,
) -> anyhow::Result<usize> {
    let chunk_size = chunk_size.max(1);
    let mut total = 0;

    for path in paths {
        let path = path.as_ref();
        let file = std::fs::File::open(path).with_context(|| format!("Failed to open {path:?}"))?;
        let records = read_records(file, &default_topic(path))
            .with_context(|| format!("Failed to read records from {path:?}"))?;
        info!("Replaying {} records from {path:?}", records.len());

        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let chunk: Vec<SinkRecord> = records.by_ref().take(chunk_size).collect();
            let count = chunk.len();
            sink.write(chunk)
                .await
                .with_context(|| format!("Failed to write records from {path:?}"))?;
            total += count;
        }
    }

    sink.close().await.context("Failed to close the sink")?;
    info!("Replay complete: {total} records");
    Ok(total)
}
