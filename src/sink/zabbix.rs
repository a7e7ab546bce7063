//! Zabbix trapper sink.
//!
//! Speaks the "sender data" protocol directly over TCP: a `ZBXD\x01` header,
//! an 8-byte little-endian body length, and a JSON body - the same frame the
//! stock zabbix_sender tool emits.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{MetricsSink, SinkError};

const ZBX_HEADER: &[u8; 5] = b"ZBXD\x01";

/// Upper bound on an accepted response body; trapper replies are tiny.
const MAX_RESPONSE_LEN: usize = 16 * 1024;

#[derive(Debug, Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: Vec<SenderItem<'a>>,
}

#[derive(Debug, Serialize)]
struct SenderItem<'a> {
    host: &'a str,
    key: &'a str,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SenderResponse {
    response: String,
    #[serde(default)]
    info: String,
}

/// Sink pushing to a Zabbix trapper endpoint.
///
/// Each push opens its own connection and drops it when the call returns,
/// so concurrent pushes never share a stream.
pub struct ZabbixSink {
    server: String,
    port: u16,
    io_timeout: Duration,
}

impl ZabbixSink {
    pub fn new(server: &str, port: u16) -> Self {
        Self {
            server: server.to_string(),
            port,
            io_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl MetricsSink for ZabbixSink {
    async fn push(&self, hostname: &str, key: &str, value: f64) -> Result<(), SinkError> {
        validate_key(key)?;

        let frame = encode_frame(&SenderRequest {
            request: "sender data",
            data: vec![SenderItem {
                host: hostname,
                key,
                value: value.to_string(),
            }],
        })?;

        let addr = format!("{}:{}", self.server, self.port);
        let mut stream = tokio::time::timeout(self.io_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SinkError::Transient(format!("connect to {} timed out", addr)))?
            .map_err(|e| SinkError::Transient(format!("connect to {} failed: {}", addr, e)))?;

        stream
            .write_all(&frame)
            .await
            .map_err(|e| SinkError::Transient(format!("send to {} failed: {}", addr, e)))?;

        let response = tokio::time::timeout(self.io_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| SinkError::Transient(format!("response from {} timed out", addr)))??;

        check_response(&response)
    }
}

/// Keys the collector would reject unconditionally never hit the network.
fn validate_key(key: &str) -> Result<(), SinkError> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(SinkError::Permanent(format!("invalid metric key {:?}", key)));
    }
    Ok(())
}

fn encode_frame(request: &SenderRequest<'_>) -> Result<Vec<u8>, SinkError> {
    let body = serde_json::to_vec(request)
        .map_err(|e| SinkError::Permanent(format!("encode failed: {}", e)))?;

    let mut frame = Vec::with_capacity(ZBX_HEADER.len() + 8 + body.len());
    frame.extend_from_slice(ZBX_HEADER);
    frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

async fn read_frame(stream: &mut TcpStream) -> Result<SenderResponse, SinkError> {
    let mut header = [0u8; 13];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| SinkError::Transient(format!("read header failed: {}", e)))?;

    if &header[..5] != ZBX_HEADER {
        return Err(SinkError::Transient("malformed response header".to_string()));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[5..13]);
    let len = u64::from_le_bytes(len_bytes) as usize;

    if len > MAX_RESPONSE_LEN {
        return Err(SinkError::Transient(format!(
            "response body of {} bytes is implausible",
            len
        )));
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| SinkError::Transient(format!("read body failed: {}", e)))?;

    serde_json::from_slice(&body)
        .map_err(|e| SinkError::Transient(format!("malformed response body: {}", e)))
}

fn check_response(response: &SenderResponse) -> Result<(), SinkError> {
    if response.response != "success" {
        return Err(SinkError::Transient(format!(
            "collector answered {:?}: {}",
            response.response, response.info
        )));
    }

    match parse_failed_count(&response.info) {
        // Older proxies omit the info line; a bare success is accepted
        Some(0) | None => Ok(()),
        Some(_) => Err(SinkError::Permanent(format!(
            "collector rejected item: {}",
            response.info
        ))),
    }
}

/// Parse the `failed: N` field out of an info string like
/// `processed: 1; failed: 0; total: 1; seconds spent: 0.000054`.
fn parse_failed_count(info: &str) -> Option<u64> {
    info.split(';')
        .filter_map(|part| part.trim().strip_prefix("failed:"))
        .next()
        .and_then(|v| v.trim().parse().ok())
}
