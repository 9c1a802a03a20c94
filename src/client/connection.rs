//! A single-socket RPC connection with id-correlated completions.
//!
//! One reader task resolves pending calls as responses arrive; writes go
//! through a mutex on the write half. When the socket closes, every pending
//! call fails with `ConnectionLost` and the closed flag flips, which the
//! session observes to start reconnecting. Calls are never retried here.

use crate::error::{LockstepError, Result};
use crate::protocol::{self, Request, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// One TCP connection to the lock server.
pub(crate) struct Connection {
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingMap>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Receiver<bool>,
    /// Error that terminated the reader, if it was not a clean close.
    close_reason: Arc<Mutex<Option<String>>>,
}

impl Connection {
    /// Open a connection and start its reader task.
    pub async fn connect(addr: &str) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| LockstepError::ConnectionFailed(e.to_string()))?;
        let (reader, writer) = stream.into_split();

        let pending = Arc::new(Mutex::new(PendingMap::new()));
        let close_reason = Arc::new(Mutex::new(None));
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&close_reason),
            closed_tx,
        ));

        Ok(Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            closed: closed_rx,
            close_reason,
        }))
    }

    /// Issue an RPC and await its response.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending.lock().await.insert(id, tx);

        // The reader flips the closed flag before draining the map, so a
        // completion registered after the drain is caught here.
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(LockstepError::ConnectionLost);
        }

        let request = Request {
            id: Value::from(id),
            method: method.to_string(),
            params,
        };
        let data = serde_json::to_vec(&request)?;

        let written = {
            let mut writer = self.writer.lock().await;
            protocol::write_frame(&mut *writer, &data).await
        };
        if written.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(LockstepError::ConnectionLost);
        }

        rx.await.map_err(|_| LockstepError::ConnectionLost)?
    }

    /// Check whether the socket has closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the socket closes.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Error that terminated the connection, if any.
    pub async fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().await.clone()
    }

    /// Close the write side. The server observes end-of-stream and reclaims
    /// this connection's locks; the reader then drains pending calls.
    pub async fn shutdown(&self) {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        pending: Arc<Mutex<PendingMap>>,
        close_reason: Arc<Mutex<Option<String>>>,
        closed_tx: watch::Sender<bool>,
    ) {
        loop {
            let data = match protocol::read_frame(&mut reader).await {
                Ok(data) => data,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        *close_reason.lock().await = Some(e.to_string());
                    }
                    debug!(error = %e, "connection reader stopped");
                    break;
                }
            };

            let response: Response = match serde_json::from_slice(&data) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "invalid response frame");
                    continue;
                }
            };

            let Some(id) = response.id.as_u64() else {
                warn!(id = %response.id, "response with unknown id shape");
                continue;
            };

            let completion = pending.lock().await.remove(&id);
            let Some(completion) = completion else {
                // At-most-once delivery: a duplicate or unsolicited response
                // has nothing to resolve.
                continue;
            };

            let result = match response.error {
                Some(wire) => Err(LockstepError::from_wire(&wire.name, &wire.message)),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            let _ = completion.send(result);
        }

        // Flip the flag before draining so late registrations observe it.
        let _ = closed_tx.send(true);
        let mut pending = pending.lock().await;
        for (_, completion) in pending.drain() {
            let _ = completion.send(Err(LockstepError::ConnectionLost));
        }
    }
}
