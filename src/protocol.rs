//! Wire protocol for the lock service.
//!
//! Messages are JSON objects carried in length-prefixed frames: a 4-byte
//! big-endian length followed by the UTF-8 JSON body. The transport is
//! assumed to deliver whole frames in order on a stable TCP connection.
//!
//! A request is `{id, method, params}`; the matching response is
//! `{id, result}` on success or `{id, error: {name, message}}` on failure.
//! The server echoes the request id verbatim, so ids may be strings or
//! integers; the client library issues integers.

use crate::error::LockstepError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Method name for lock acquisition.
pub const METHOD_LOCK: &str = "lock";
/// Method name for lease extension.
pub const METHOD_EXTEND_LOCK: &str = "extend-lock";
/// Method name for lock release.
pub const METHOD_RELEASE_LOCK: &str = "release-lock";

/// An RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed back in the response.
    pub id: Value,
    /// Method name.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// An RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request this answers.
    pub id: Value,
    /// Result value on success. `null` results are serialized explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    /// Build a success response.
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn err(id: Value, error: &LockstepError) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError {
                name: error.wire_name().to_string(),
                message: error.wire_message(),
            }),
        }
    }
}

/// Error payload inside a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Error kind name, e.g. `LockingTimeout`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
}

/// Options object of the `lock` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockParams {
    /// Lease duration in seconds.
    pub ttl: f64,
    /// Bound on how long the acquire may wait, in seconds.
    #[serde(rename = "lockingTimeout")]
    pub locking_timeout: f64,
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame too large",
        ));
    }

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame too large",
        ));
    }

    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}
