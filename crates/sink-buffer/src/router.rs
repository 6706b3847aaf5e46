//! Record classification: which table a record goes to and which columns
//! it becomes.

use serde_json::{Map, Value};
use sink_core::config::DEFAULT_KAFKA_PK_NAMES;
use sink_core::{
    DestinationKey, PrimaryKeyMode, Result, Row, RowChange, SinkError, SinkRecord,
    TableNameFormat, WriterConfig,
};

/// Resolves the destination table of a record from its topic.
#[derive(Debug, Clone, Default)]
pub struct RecordRouter {
    format: TableNameFormat,
}

impl RecordRouter {
    pub fn new(format: TableNameFormat) -> Self {
        Self { format }
    }

    pub fn route(&self, record: &SinkRecord) -> Result<DestinationKey> {
        self.format.destination(&record.topic)
    }
}

/// Maps a record to the row change it asks the target to perform.
#[derive(Debug, Clone)]
pub struct RowMapper {
    pk_mode: PrimaryKeyMode,
    pk_fields: Vec<String>,
    whitelist: Vec<String>,
    delete_enabled: bool,
}

impl RowMapper {
    pub fn new(config: &WriterConfig) -> Self {
        Self {
            pk_mode: config.pk_mode,
            pk_fields: config.pk_fields.clone(),
            whitelist: config.fields_whitelist.clone(),
            delete_enabled: config.delete_enabled,
        }
    }

    /// Map a record. Tombstones map to `None` unless deletes are enabled.
    pub fn map(&self, record: &SinkRecord) -> Result<Option<RowChange>> {
        if record.is_tombstone() {
            if !self.delete_enabled {
                return Ok(None);
            }
            let key = self.record_key_columns(record)?;
            return Ok(Some(RowChange::Delete { key }));
        }

        let Some(Value::Object(value)) = &record.value else {
            return Err(SinkError::Routing(format!(
                "record {}/{}/{} has a non-object value: {}",
                record.topic,
                record.partition,
                record.offset,
                record.value.as_ref().map_or("null", type_name)
            )));
        };

        let key = match self.pk_mode {
            PrimaryKeyMode::None => Vec::new(),
            PrimaryKeyMode::Kafka => self.kafka_columns(record),
            PrimaryKeyMode::RecordKey => self.record_key_columns(record)?,
            PrimaryKeyMode::RecordValue => self.value_key_columns(record, value)?,
        };

        let fields = value
            .iter()
            .filter(|(name, _)| !key.iter().any(|(k, _)| k == *name))
            .filter(|(name, _)| self.whitelist.is_empty() || self.whitelist.contains(name))
            .map(|(name, v)| (name.clone(), v.clone()))
            .collect();

        Ok(Some(RowChange::Upsert(Row::new(key, fields))))
    }

    fn kafka_columns(&self, record: &SinkRecord) -> Vec<(String, Value)> {
        let names: Vec<String> = if self.pk_fields.is_empty() {
            DEFAULT_KAFKA_PK_NAMES.iter().map(|s| s.to_string()).collect()
        } else {
            self.pk_fields.clone()
        };
        let values = [
            Value::from(record.topic.clone()),
            Value::from(record.partition),
            Value::from(record.offset),
        ];
        names.into_iter().zip(values).collect()
    }

    fn record_key_columns(&self, record: &SinkRecord) -> Result<Vec<(String, Value)>> {
        match &record.key {
            None | Some(Value::Null) => Err(SinkError::Routing(format!(
                "record {}/{}/{} has no key but primary key mode is record_key",
                record.topic, record.partition, record.offset
            ))),
            Some(Value::Object(map)) => self.pick(map, record, "key"),
            Some(primitive) => match self.pk_fields.as_slice() {
                [name] => Ok(vec![(name.clone(), primitive.clone())]),
                _ => Err(SinkError::Routing(format!(
                    "primitive record key of {} needs exactly one pk_fields entry, got {}",
                    record.topic,
                    self.pk_fields.len()
                ))),
            },
        }
    }

    fn value_key_columns(
        &self,
        record: &SinkRecord,
        value: &Map<String, Value>,
    ) -> Result<Vec<(String, Value)>> {
        self.pick(value, record, "value")
    }

    /// The configured pk fields of `map`, or all of its fields when none
    /// are configured.
    fn pick(
        &self,
        map: &Map<String, Value>,
        record: &SinkRecord,
        what: &str,
    ) -> Result<Vec<(String, Value)>> {
        if self.pk_fields.is_empty() {
            return Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        }
        self.pk_fields
            .iter()
            .map(|name| match map.get(name) {
                Some(Value::Null) | None => Err(SinkError::Routing(format!(
                    "record {}/{}/{} is missing primary key field '{name}' in its {what}",
                    record.topic, record.partition, record.offset
                ))),
                Some(v) => Ok((name.clone(), v.clone())),
            })
            .collect()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
