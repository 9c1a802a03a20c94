//! Session event stream for the lock client.
//!
//! The client surfaces its lifecycle through a broadcast channel rather than
//! inheritance: embedders subscribe and receive [`SessionEvent`]s. Connection
//! transitions are first-class (`Connected`/`Disconnected`); everything else
//! flows through the `Log` stream as `{type, data}` entries.

use crate::error::LockstepError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Log entry kinds emitted by the session and lock API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    /// A reconnect delay is about to be slept; `data` carries `{delay}`.
    ConnectDelay,
    /// A connect attempt failed; `data` carries `{error}`.
    ConnectError,
    /// An established connection failed; `data` carries `{error}`.
    ConnectionError,
    /// A connection was established.
    Connected,
    /// The connection was closed.
    Disconnected,
    /// A background extend failed; `data` carries `{error, lockId}`.
    ExtendLockError,
    /// A cleanup release failed; `data` carries `{error, lockId}`.
    ReleaseLockError,
}

/// A log stream entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry kind.
    #[serde(rename = "type")]
    pub kind: LogKind,
    /// Kind-specific payload.
    pub data: Value,
}

/// An event surfaced to embedders of the client.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection to the server was established.
    Connected,
    /// The connection to the server was lost or closed.
    Disconnected,
    /// A log entry.
    Log(LogEntry),
}

/// Broadcast registry the session and lock API publish into.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    fn log(&self, kind: LogKind, data: Value) {
        let _ = self.tx.send(SessionEvent::Log(LogEntry { kind, data }));
    }

    fn error_payload(error: &LockstepError) -> Value {
        json!({
            "name": error.wire_name(),
            "message": error.to_string(),
        })
    }

    pub(crate) fn connect_delay(&self, delay: f64) {
        debug!(delay, "delaying reconnect");
        self.log(LogKind::ConnectDelay, json!({ "delay": delay }));
    }

    pub(crate) fn connect_error(&self, error: &LockstepError) {
        debug!(error = %error, "connect attempt failed");
        self.log(
            LogKind::ConnectError,
            json!({ "error": Self::error_payload(error) }),
        );
    }

    pub(crate) fn connection_error(&self, error: &LockstepError) {
        warn!(error = %error, "connection error");
        self.log(
            LogKind::ConnectionError,
            json!({ "error": Self::error_payload(error) }),
        );
    }

    pub(crate) fn connected(&self) {
        let _ = self.tx.send(SessionEvent::Connected);
        self.log(LogKind::Connected, json!({}));
    }

    pub(crate) fn disconnected(&self) {
        let _ = self.tx.send(SessionEvent::Disconnected);
        self.log(LogKind::Disconnected, json!({}));
    }

    pub(crate) fn extend_lock_error(&self, error: &LockstepError, lock_id: &str) {
        warn!(error = %error, lock_id, "extend failed");
        self.log(
            LogKind::ExtendLockError,
            json!({ "error": Self::error_payload(error), "lockId": lock_id }),
        );
    }

    pub(crate) fn release_lock_error(&self, error: &LockstepError, lock_id: &str) {
        warn!(error = %error, lock_id, "release failed");
        self.log(
            LogKind::ReleaseLockError,
            json!({ "error": Self::error_payload(error), "lockId": lock_id }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_kind_serializes_kebab_case() {
        let encoded = serde_json::to_string(&LogKind::ConnectDelay).unwrap();
        assert_eq!(encoded, "\"connect-delay\"");

        let encoded = serde_json::to_string(&LogKind::ExtendLockError).unwrap();
        assert_eq!(encoded, "\"extend-lock-error\"");
    }

    #[test]
    fn test_log_entry_shape() {
        let entry = LogEntry {
            kind: LogKind::ConnectDelay,
            data: json!({ "delay": 1.5 }),
        };
        let encoded = serde_json::to_value(&entry).unwrap();
        assert_eq!(encoded["type"], json!("connect-delay"));
        assert_eq!(encoded["data"]["delay"], json!(1.5));
    }

    #[tokio::test]
    async fn test_connected_emits_event_and_log() {
        let events = SessionEvents::new();
        let mut rx = events.subscribe();

        events.connected();

        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Connected));
        match rx.recv().await.unwrap() {
            SessionEvent::Log(entry) => assert_eq!(entry.kind, LogKind::Connected),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_payload_carries_name_and_message() {
        let events = SessionEvents::new();
        let mut rx = events.subscribe();

        events.extend_lock_error(&LockstepError::UnknownLock("l-1".into()), "l-1");

        match rx.recv().await.unwrap() {
            SessionEvent::Log(entry) => {
                assert_eq!(entry.kind, LogKind::ExtendLockError);
                assert_eq!(entry.data["error"]["name"], json!("UnknownLock"));
                assert_eq!(entry.data["lockId"], json!("l-1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let events = SessionEvents::new();
        events.connect_delay(1.0);
        events.disconnected();
    }
}
