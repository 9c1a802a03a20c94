//! TCP server for the lock service.
//!
//! This module provides the listener that accepts client connections and
//! hands each one to the per-connection handler in [`connection`].

mod connection;
pub mod manager;

pub use manager::{ConnectionId, LockManager, LockManagerStats};

use crate::config::ServerConfig;
use crate::error::{LockstepError, Result};
use crate::shutdown::ShutdownCoordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// The lock server: a bound listener plus the shared lock manager.
pub struct LockServer {
    listener: TcpListener,
    manager: Arc<LockManager>,
    local_addr: SocketAddr,
}

impl LockServer {
    /// Bind the listener and create the lock manager.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LockstepError::ConnectionFailed(format!("Failed to bind: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| LockstepError::Network(e.to_string()))?;

        Ok(Self {
            listener,
            manager: LockManager::new(),
            local_addr,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to the lock manager.
    pub fn manager(&self) -> Arc<LockManager> {
        Arc::clone(&self.manager)
    }

    /// Accept connections until shutdown is requested.
    pub async fn run_until(self, shutdown: ShutdownCoordinator) -> Result<()> {
        info!(addr = %self.local_addr, "lock server listening");

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("lock server stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let manager = Arc::clone(&self.manager);
                        tokio::spawn(async move {
                            connection::handle_connection(manager, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
        }
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(ShutdownCoordinator::new()).await
    }
}

/// Bind and run a lock server with the given configuration.
pub async fn run_server(config: ServerConfig, shutdown: ShutdownCoordinator) -> Result<()> {
    let server = LockServer::bind(config.bind_addr).await?;
    server.run_until(shutdown).await
}
