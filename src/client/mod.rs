//! Client library for the lock service.
//!
//! [`LockClient`] keeps one reconnecting session to the server and exposes
//! the lock API: [`LockClient::lock`], [`LockClient::with_lock`],
//! [`LockClient::extend_lock`] and [`LockClient::release_lock`].
//!
//! `with_lock` runs a handler inside the critical section and, when an
//! [`Extends`] policy allows it, keeps the lease alive from a background
//! extender task for as long as the handler runs.
//!
//! # Example
//!
//! ```no_run
//! use lockstep::{ClientConfig, Extends, LockClient, LockOptions};
//!
//! #[tokio::main]
//! async fn main() -> lockstep::Result<()> {
//!     let client = LockClient::connect(ClientConfig::new("127.0.0.1", 3292))?;
//!     let options = LockOptions::new(10.0, 30.0).extends(Extends::Count(5));
//!
//!     let total = client
//!         .with_lock(["inventory", "orders"], &options, |_lock| async move {
//!             // both resources are exclusively ours here
//!             Ok(42)
//!         })
//!         .await?;
//!
//!     assert_eq!(total, 42);
//!     Ok(())
//! }
//! ```

mod connection;
mod session;

use crate::config::ClientConfig;
use crate::error::{LockstepError, Result};
use crate::events::{SessionEvent, SessionEvents};
use crate::protocol;
use serde_json::{json, Value};
use session::Session;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// The set of resource ids a lock call targets.
///
/// A single id is normalized to a one-element set; duplicate ids are
/// deduplicated by the server while preserving first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSet(Vec<String>);

impl ResourceSet {
    /// The resource ids in request order.
    pub fn ids(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for ResourceSet {
    fn from(id: &str) -> Self {
        Self(vec![id.to_string()])
    }
}

impl From<String> for ResourceSet {
    fn from(id: String) -> Self {
        Self(vec![id])
    }
}

impl From<Vec<String>> for ResourceSet {
    fn from(ids: Vec<String>) -> Self {
        Self(ids)
    }
}

impl From<&[&str]> for ResourceSet {
    fn from(ids: &[&str]) -> Self {
        Self(ids.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ResourceSet {
    fn from(ids: [&str; N]) -> Self {
        Self(ids.iter().map(|s| s.to_string()).collect())
    }
}

/// What the auto-extender should do on one of its ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtendDecision {
    /// Stop extending.
    Stop,
    /// Extend with the ttl given at acquire.
    Extend,
    /// Extend with this ttl, in seconds. Non-positive values stop.
    ExtendFor(f64),
}

impl From<bool> for ExtendDecision {
    fn from(extend: bool) -> Self {
        if extend {
            ExtendDecision::Extend
        } else {
            ExtendDecision::Stop
        }
    }
}

impl From<f64> for ExtendDecision {
    fn from(ttl: f64) -> Self {
        if ttl > 0.0 {
            ExtendDecision::ExtendFor(ttl)
        } else {
            ExtendDecision::Stop
        }
    }
}

/// Auto-extend policy for [`LockClient::with_lock`].
#[derive(Clone)]
pub enum Extends {
    /// Permit up to this many extensions, each with the acquire-time ttl.
    /// `Count(0)` disables auto-extend.
    Count(u32),
    /// Ask a decision function on each tick; it receives the attempt counter
    /// starting at 0.
    Decide(Arc<dyn Fn(u32) -> ExtendDecision + Send + Sync>),
}

impl Extends {
    fn decide(&self, attempt: u32) -> ExtendDecision {
        match self {
            Extends::Count(limit) => {
                if attempt < *limit {
                    ExtendDecision::Extend
                } else {
                    ExtendDecision::Stop
                }
            }
            Extends::Decide(f) => f(attempt),
        }
    }

    fn enabled(&self) -> bool {
        !matches!(self, Extends::Count(0))
    }
}

impl fmt::Debug for Extends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extends::Count(limit) => f.debug_tuple("Count").field(limit).finish(),
            Extends::Decide(_) => f.write_str("Decide(..)"),
        }
    }
}

/// Options of one lock call. Durations are seconds, fractional allowed.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease duration.
    pub ttl: f64,
    /// Bound on how long the acquire may wait.
    pub locking_timeout: f64,
    /// Fraction of the ttl between auto-extend ticks.
    pub extend_schedule: f64,
    /// Auto-extend policy for `with_lock`.
    pub extends: Extends,
}

impl LockOptions {
    /// Options with the given ttl and locking timeout.
    pub fn new(ttl: f64, locking_timeout: f64) -> Self {
        Self {
            ttl,
            locking_timeout,
            extend_schedule: 0.5,
            extends: Extends::Count(0),
        }
    }

    /// Set the extend schedule fraction (must be in `(0, 1)`).
    pub fn extend_schedule(mut self, fraction: f64) -> Self {
        self.extend_schedule = fraction;
        self
    }

    /// Set the auto-extend policy.
    pub fn extends(mut self, extends: Extends) -> Self {
        self.extends = extends;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.ttl > 0.0 && self.ttl.is_finite()) {
            return Err(LockstepError::InvalidRequest(
                "ttl must be positive".to_string(),
            ));
        }
        if !(self.locking_timeout >= 0.0 && self.locking_timeout.is_finite()) {
            return Err(LockstepError::InvalidRequest(
                "lockingTimeout must not be negative".to_string(),
            ));
        }
        if !(self.extend_schedule > 0.0 && self.extend_schedule < 1.0) {
            return Err(LockstepError::InvalidRequest(
                "extendSchedule must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handle to a held lock, passed to `with_lock` handlers.
#[derive(Clone)]
pub struct LockHandle {
    client: LockClient,
    lock_id: String,
}

impl LockHandle {
    /// The lock id.
    pub fn id(&self) -> &str {
        &self.lock_id
    }

    /// Reset the lease to `now + ttl`; defaults to the acquire-time ttl.
    pub async fn extend(&self, ttl: Option<f64>) -> Result<()> {
        self.client.extend_lock(&self.lock_id, ttl).await
    }
}

struct ClientInner {
    session: Session,
    events: SessionEvents,
}

/// Client for the lock service.
#[derive(Clone)]
pub struct LockClient {
    inner: Arc<ClientInner>,
}

impl LockClient {
    /// Create a client and start its reconnecting session.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let events = SessionEvents::new();
        let session = Session::start(config, events.clone());

        Ok(Self {
            inner: Arc::new(ClientInner { session, events }),
        })
    }

    /// Subscribe to session and log events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the session: no further reconnects, current connection dropped.
    pub async fn close(&self) {
        self.inner.session.close().await;
    }

    /// Acquire a lock and return its id.
    pub async fn lock(
        &self,
        resources: impl Into<ResourceSet>,
        options: &LockOptions,
    ) -> Result<String> {
        options.validate()?;
        let resources = resources.into();
        if resources.0.is_empty() {
            return Err(LockstepError::InvalidRequest(
                "resources must be non-empty".to_string(),
            ));
        }

        let connection = self.inner.session.connection().await?;
        let result = connection
            .call(
                protocol::METHOD_LOCK,
                vec![
                    json!(resources.0),
                    json!({
                        "ttl": options.ttl,
                        "lockingTimeout": options.locking_timeout,
                    }),
                ],
            )
            .await?;

        match result {
            Value::String(lock_id) => Ok(lock_id),
            other => Err(LockstepError::Internal(format!(
                "unexpected lock result: {}",
                other
            ))),
        }
    }

    /// Reset a lock's lease to `now + ttl`; defaults to the acquire-time ttl.
    pub async fn extend_lock(&self, lock_id: &str, ttl: Option<f64>) -> Result<()> {
        let connection = self.inner.session.connection().await?;
        let mut params = vec![json!(lock_id)];
        if let Some(ttl) = ttl {
            params.push(json!(ttl));
        }
        connection.call(protocol::METHOD_EXTEND_LOCK, params).await?;
        Ok(())
    }

    /// Release a lock.
    pub async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let connection = self.inner.session.connection().await?;
        connection
            .call(protocol::METHOD_RELEASE_LOCK, vec![json!(lock_id)])
            .await?;
        Ok(())
    }

    /// Run `handler` while holding a lock on `resources`.
    ///
    /// The lock is acquired first; the auto-extender keeps it alive per the
    /// options while the handler runs. On handler completion or failure the
    /// extender is stopped, awaited, and the lock released. Release errors
    /// are swallowed into the log stream: the handler result is the outcome
    /// and the server reclaims the lease at ttl regardless.
    pub async fn with_lock<R, F, Fut, T>(
        &self,
        resources: R,
        options: &LockOptions,
        handler: F,
    ) -> Result<T>
    where
        R: Into<ResourceSet>,
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock_id = self.lock(resources, options).await?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let extender = if options.extends.enabled() {
            Some(tokio::spawn(run_extender(
                self.clone(),
                lock_id.clone(),
                options.ttl,
                options.extend_schedule,
                options.extends.clone(),
                Arc::clone(&cancelled),
                Arc::clone(&wake),
            )))
        } else {
            None
        };

        let handle = LockHandle {
            client: self.clone(),
            lock_id: lock_id.clone(),
        };
        let result = handler(handle).await;

        cancelled.store(true, Ordering::Release);
        // notify_one stores a permit, so the extender wakes promptly even if
        // it has not parked on the Notify yet.
        wake.notify_one();
        if let Some(extender) = extender {
            let _ = extender.await;
        }

        if let Err(e) = self.release_lock(&lock_id).await {
            self.inner.events.release_lock_error(&e, &lock_id);
        }

        result
    }
}

/// Background auto-extender bound to one `with_lock` invocation.
///
/// The cancellation flag is checked before and after every sleep so a
/// finished handler never triggers a trailing extend. Extend failures are
/// logged and stop the extender; the handler is left to run.
async fn run_extender(
    client: LockClient,
    lock_id: String,
    ttl: f64,
    extend_schedule: f64,
    extends: Extends,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    let interval = Duration::from_secs_f64(ttl * extend_schedule);
    let mut attempt: u32 = 0;

    loop {
        if cancelled.load(Ordering::Acquire) {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {}
        }

        if cancelled.load(Ordering::Acquire) {
            return;
        }

        let ttl_override = match extends.decide(attempt) {
            ExtendDecision::Stop => return,
            ExtendDecision::Extend => None,
            ExtendDecision::ExtendFor(ttl) if ttl > 0.0 => Some(ttl),
            ExtendDecision::ExtendFor(_) => return,
        };

        if let Err(e) = client.extend_lock(&lock_id, ttl_override).await {
            client.inner.events.extend_lock_error(&e, &lock_id);
            return;
        }
        attempt += 1;
    }
}
