//! Client side of the pull protocol, as a database segment reads it.
//!
//! The in-memory target uses it to execute external loads, so stream mode
//! works end to end without a warehouse.

use bytes::BytesMut;
use load_protocol::FrameCodec;
use serde_json::{Map, Value};
use sink_core::{ColumnDef, ColumnType, Result, SinkError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::statement::ExternalLoad;

/// Split `gpfdist://host:port/path` into the socket address and path.
fn parse_location(location: &str) -> Result<(&str, &str)> {
    let rest = location
        .strip_prefix("gpfdist://")
        .ok_or_else(|| SinkError::Protocol(format!("unsupported location {location}")))?;
    match rest.find('/') {
        Some(i) => Ok((&rest[..i], &rest[i..])),
        None => Ok((rest, "/")),
    }
}

/// Fetch one session's data from the load's location. Returns the
/// concatenated chunk payloads, up to the end-of-data frame.
pub async fn fetch(location: &str) -> Result<Vec<u8>> {
    let (authority, path) = parse_location(location)?;
    let mut stream = TcpStream::connect(authority).await?;
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {authority}\r\nX-GP-PROTO: 1\r\nAccept: */*\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    let head_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| SinkError::Protocol("response without a complete head".to_string()))?;
    let status_line = String::from_utf8_lossy(&response[..head_end])
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    if !status_line.starts_with("HTTP/1.1 200") {
        return Err(SinkError::Protocol(format!(
            "pull from {location} failed: {status_line}"
        )));
    }

    let mut body = BytesMut::from(&response[head_end + 4..]);
    let mut codec = FrameCodec;
    let mut data = Vec::new();
    loop {
        match codec.decode(&mut body)? {
            Some(payload) if payload.is_empty() => break,
            Some(payload) => data.extend_from_slice(&payload),
            None => {
                return Err(SinkError::Protocol(format!(
                    "pull from {location} ended without the end-of-data frame"
                )))
            }
        }
    }
    debug!("Fetched {} bytes from {location}", data.len());
    Ok(data)
}

/// Parse fetched data into rows keyed by `columns`, in column order.
/// Missing trailing fields are NULL. A field equal to the null string is
/// NULL even when it was quoted.
pub fn parse_rows(
    data: &[u8],
    load: &ExternalLoad,
    columns: &[ColumnDef],
) -> Result<Vec<Map<String, Value>>> {
    let (Ok(delimiter), Ok(quote)) = (u8::try_from(load.delimiter), u8::try_from(load.quote))
    else {
        return Err(SinkError::Encoding(
            "delimiter and quote must be single-byte characters".to_string(),
        ));
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .quote(quote)
        .from_reader(data);

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| SinkError::Encoding(e.to_string()))?;
        if record.len() > columns.len() {
            return Err(SinkError::Encoding(format!(
                "line {}: extra data after last expected column",
                line + 1
            )));
        }
        let mut row = Map::new();
        for (i, column) in columns.iter().enumerate() {
            let value = match record.get(i) {
                None => Value::Null,
                Some(field) if field == load.null_string => Value::Null,
                Some(field) => typed(field, column)
                    .map_err(|reason| SinkError::Encoding(format!("line {}: {reason}", line + 1)))?,
            };
            row.insert(column.name.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn typed(field: &str, column: &ColumnDef) -> std::result::Result<Value, String> {
    let invalid = || format!("invalid input for column \"{}\": {field:?}", column.name);
    match column.column_type {
        ColumnType::Text => Ok(Value::String(field.to_string())),
        ColumnType::BigInt => field.parse::<i64>().map(Value::from).map_err(|_| invalid()),
        ColumnType::Double => field.parse::<f64>().map(Value::from).map_err(|_| invalid()),
        ColumnType::Boolean => match field {
            "true" | "t" => Ok(Value::Bool(true)),
            "false" | "f" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        ColumnType::Jsonb => serde_json::from_str(field).map_err(|_| invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sink_core::{DestinationKey, FormatConfig};

    fn load() -> ExternalLoad {
        ExternalLoad::new(
            DestinationKey::new(None, "t"),
            "gpfdist://127.0.0.1:8000/data",
            &FormatConfig::default(),
            0,
        )
    }

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", ColumnType::BigInt, false),
            ColumnDef::new("name", ColumnType::Text, true),
            ColumnDef::new("tags", ColumnType::Jsonb, true),
        ]
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(
            parse_location("gpfdist://etl-1:8001/data").unwrap(),
            ("etl-1:8001", "/data")
        );
        assert!(parse_location("http://etl-1:8001/data").is_err());
    }

    #[test]
    fn test_parse_rows() {
        let data = b"1,\"a, b\",\"[1,2]\"\n2,,\n3,c\n";
        let rows = parse_rows(data, &load(), &columns()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            Value::Object(rows[0].clone()),
            json!({"id": 1, "name": "a, b", "tags": [1, 2]})
        );
        assert_eq!(
            Value::Object(rows[1].clone()),
            json!({"id": 2, "name": null, "tags": null})
        );
        assert_eq!(rows[2]["tags"], Value::Null);
    }

    #[test]
    fn test_parse_rows_rejects_bad_values() {
        assert!(parse_rows(b"x,a\n", &load(), &columns()).is_err());
        assert!(parse_rows(b"1,a,[],extra\n", &load(), &columns()).is_err());
    }
}
