//! Per-connection server plumbing: frame reads, RPC dispatch, response
//! writes, and lock reclamation on disconnect.
//!
//! Requests on one connection may be in flight concurrently; each is handled
//! in its own task and completions are funnelled through a single writer
//! task, so responses may interleave in any order. The request id is the
//! correlation key.

use crate::error::{LockstepError, Result};
use crate::protocol::{self, LockParams, Request, Response};
use crate::server::manager::{ConnectionId, LockManager};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Serve one accepted connection until it closes, then reclaim its locks.
pub(crate) async fn handle_connection(
    manager: Arc<LockManager>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let connection = manager.register_connection().await;
    debug!(connection, addr = %peer, "client connected");

    let (mut reader, mut writer) = stream.into_split();
    let (responses, mut outbox) = mpsc::channel::<Response>(64);

    let writer_task = tokio::spawn(async move {
        while let Some(response) = outbox.recv().await {
            let data = match serde_json::to_vec(&response) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "failed to encode response");
                    continue;
                }
            };
            if protocol::write_frame(&mut writer, &data).await.is_err() {
                break;
            }
        }
    });

    loop {
        let data = match protocol::read_frame(&mut reader).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(connection, "client disconnected");
                break;
            }
            Err(e) => {
                warn!(connection, error = %e, "read error");
                break;
            }
        };

        // A frame that is not a request object cannot be answered; skip it.
        let request: Request = match serde_json::from_slice(&data) {
            Ok(request) => request,
            Err(e) => {
                warn!(connection, error = %e, "invalid request frame");
                continue;
            }
        };

        let manager = Arc::clone(&manager);
        let responses = responses.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let response = match dispatch(&manager, connection, request).await {
                Ok(result) => Response::ok(id, result),
                // The connection went away while the call was parked; there
                // is nobody left to answer.
                Err(LockstepError::Cancelled) => return,
                Err(e) => Response::err(id, &e),
            };
            let _ = responses.send(response).await;
        });
    }

    manager.close_connection(connection).await;
    drop(responses);
    let _ = writer_task.await;
}

/// Route a request to the lock manager.
async fn dispatch(
    manager: &Arc<LockManager>,
    connection: ConnectionId,
    request: Request,
) -> Result<Value> {
    let mut params = request.params.into_iter();

    match request.method.as_str() {
        protocol::METHOD_LOCK => {
            let resources: Vec<String> = required_param(params.next(), "resources")?;
            let options: LockParams = required_param(params.next(), "options")?;
            let lock_id = manager
                .acquire(connection, resources, options.ttl, options.locking_timeout)
                .await?;
            Ok(Value::String(lock_id))
        }
        protocol::METHOD_EXTEND_LOCK => {
            let lock_id: String = required_param(params.next(), "lockId")?;
            let ttl: Option<f64> = match params.next() {
                Some(value) => serde_json::from_value(value)
                    .map_err(|e| LockstepError::InvalidRequest(format!("invalid ttl: {}", e)))?,
                None => None,
            };
            manager.extend(connection, &lock_id, ttl).await?;
            Ok(Value::Null)
        }
        protocol::METHOD_RELEASE_LOCK => {
            let lock_id: String = required_param(params.next(), "lockId")?;
            manager.release(connection, &lock_id).await?;
            Ok(Value::Null)
        }
        other => Err(LockstepError::InvalidRequest(format!(
            "unknown method: {}",
            other
        ))),
    }
}

fn required_param<T: serde::de::DeserializeOwned>(
    value: Option<Value>,
    name: &str,
) -> Result<T> {
    let value =
        value.ok_or_else(|| LockstepError::InvalidRequest(format!("missing param: {}", name)))?;
    serde_json::from_value(value)
        .map_err(|e| LockstepError::InvalidRequest(format!("invalid param {}: {}", name, e)))
}
