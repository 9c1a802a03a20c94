//! Reconnecting session that owns the current-connection handle.
//!
//! One background task runs the connect loop. Awaiters of the current
//! connection park on a watch channel and receive whichever connection is
//! established next after a disconnect, without re-registering.
//!
//! The backoff schedule: the first attempt after startup or a disconnect is
//! immediate; each subsequent attempt sleeps the current interval and then
//! grows it by `interval_multiplier`, capped at `max_interval`. A successful
//! connection resets the interval to `initial_interval`.

use crate::client::connection::Connection;
use crate::config::ClientConfig;
use crate::error::{LockstepError, Result};
use crate::events::SessionEvents;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Floor applied to `initial_interval` so an explicit zero cannot produce a
/// busy reconnect loop.
const MIN_RECONNECT_INTERVAL: f64 = 0.01;

/// The reconnecting session.
pub(crate) struct Session {
    current: watch::Receiver<Option<Arc<Connection>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start the session's connect loop.
    pub fn start(config: ClientConfig, events: SessionEvents) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(run(config, tx, events));

        Self {
            current: rx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Await the current connection, parking across reconnects.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        let mut rx = self.current.clone();
        loop {
            let connection = rx.borrow().clone();
            if let Some(connection) = connection {
                if !connection.is_closed() {
                    return Ok(connection);
                }
            }
            rx.changed()
                .await
                .map_err(|_| LockstepError::ConnectionLost)?;
        }
    }

    /// Stop reconnecting and close the current connection.
    pub async fn close(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        let connection = self.current.borrow().clone();
        if let Some(connection) = connection {
            connection.shutdown().await;
        }
    }
}

async fn run(
    config: ClientConfig,
    current: watch::Sender<Option<Arc<Connection>>>,
    events: SessionEvents,
) {
    let addr = config.connect.addr();
    let schedule = config.reconnect;
    let initial = schedule.initial_interval.max(MIN_RECONNECT_INTERVAL);

    let mut interval = initial;
    let mut immediate = true;

    loop {
        if !immediate {
            events.connect_delay(interval);
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
            interval = schedule
                .max_interval
                .min(interval.max(initial) * schedule.interval_multiplier);
        }
        immediate = false;

        if current.is_closed() {
            return;
        }

        match Connection::connect(&addr).await {
            Ok(connection) => {
                debug!(addr = %addr, "connected");
                events.connected();
                interval = initial;

                if current.send(Some(Arc::clone(&connection))).is_err() {
                    return;
                }

                connection.closed().await;

                if let Some(reason) = connection.close_reason().await {
                    events.connection_error(&LockstepError::Network(reason));
                }
                events.disconnected();
                let _ = current.send(None);
                immediate = true;
            }
            Err(e) => {
                events.connect_error(&e);
            }
        }
    }
}
