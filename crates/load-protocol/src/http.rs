//! Minimal HTTP/1.1 handling for the pull endpoint.
//!
//! The endpoint only ever answers one request per connection, so parsing
//! stops at the end of the request head and responses are written by hand:
//! no chunked transfer encoding, no content length, and the body runs until
//! the connection closes.

use sink_core::{Result, SinkError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the size of a request head.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

/// Protocol version advertised to the loader.
pub const GPFDIST_VERSION: &str = "1.0.0";
/// Protocol generation advertised to the loader.
pub const GP_PROTO: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request path without the query string.
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }
}

/// Read a request head up to and including the blank line.
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0usize;
    let mut line = String::new();

    let request_line = loop {
        read += read_line(reader, &mut line, read).await?;
        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        // Tolerate blank lines before the request line.
        if !trimmed.is_empty() {
            break trimmed.to_string();
        }
        line.clear();
    };

    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version), None) if version.starts_with("HTTP/") => {
            (method.to_string(), path.to_string(), version.to_string())
        }
        _ => {
            return Err(SinkError::Protocol(format!(
                "malformed request line: {request_line:?}"
            )))
        }
    };

    let mut headers = Vec::new();
    loop {
        line.clear();
        read += read_line(reader, &mut line, read).await?;
        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| SinkError::Protocol(format!("malformed header: {trimmed:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        path,
        version,
        headers,
    })
}

async fn read_line<R>(reader: &mut R, line: &mut String, already_read: usize) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = reader.read_line(line).await?;
    if n == 0 {
        return Err(SinkError::Protocol(
            "connection closed before the request head was complete".to_string(),
        ));
    }
    if already_read + n > MAX_HEAD_LEN {
        return Err(SinkError::Protocol(format!(
            "request head exceeds {MAX_HEAD_LEN} bytes"
        )));
    }
    Ok(n)
}

/// Response head of a data stream.
pub fn stream_response_head() -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Expires: 0\r\n\
         X-GPFDIST-VERSION: {GPFDIST_VERSION}\r\n\
         X-GP-PROTO: {GP_PROTO}\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\
         \r\n"
    )
}

/// Write a complete short response with a plain-text body.
pub async fn write_simple_response<W>(writer: &mut W, status: u16, reason: &str, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
