//! lockstep - A single-threaded ordered distributed lock service.
//!
//! Multiple distributed clients acquire named locks on one or more resources
//! from a central server. The server grants locks in strict request arrival
//! order (FIFO per resource) and enforces TTL-based expiry; the client
//! library auto-extends leases while a critical section runs and
//! transparently reconnects to the server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        lockstep                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  Client: Lock API | Auto-Extender | Reconnecting Session │
//! ├──────────────────────────────────────────────────────────┤
//! │  Wire: length-prefixed JSON request/response RPC         │
//! ├──────────────────────────────────────────────────────────┤
//! │  Server: RPC Dispatcher | Lock Manager | TTL Expiry      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock state is in-memory only and forgotten on server restart; a single
//! server is the correctness boundary.
//!
//! # Quick Start
//!
//! ```no_run
//! use lockstep::config::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> lockstep::Result<()> {
//!     // Use development configuration
//!     let config = ServerConfig::development();
//!
//!     // Start the lock server
//!     lockstep::run(config).await
//! }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod shutdown;

// Re-exports
pub use client::{ExtendDecision, Extends, LockClient, LockHandle, LockOptions, ResourceSet};
pub use config::{ClientConfig, ConnectConfig, ReconnectConfig, ServerConfig};
pub use error::{LockstepError, Result};
pub use events::{LogEntry, LogKind, SessionEvent};
pub use server::{LockManager, LockServer};

use shutdown::ShutdownCoordinator;
use tracing::{debug, info};

/// Run the lock server with the given configuration.
pub async fn run(config: ServerConfig) -> Result<()> {
    config.validate()?;

    // Initialize observability
    observability::init(&config.observability)?;

    info!(addr = %config.bind_addr, "Starting lockstep server");

    let coordinator = ShutdownCoordinator::new();
    let server = LockServer::bind(config.bind_addr).await?;

    // Start signal handler in background
    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        shutdown::wait_for_signal(signal_coordinator).await;
    });

    // Periodic status line
    let manager = server.manager();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = manager.stats().await;
            debug!(
                held = stats.held_locks,
                waiting = stats.waiting_acquisitions,
                connections = stats.connections,
                acquired = stats.acquired,
                "lock manager status"
            );
        }
    });

    server.run_until(coordinator).await?;

    info!("lockstep shutdown complete");
    Ok(())
}
