//! Common test utilities for integration tests.

use lockstep::server::LockManager;
use lockstep::shutdown::ShutdownCoordinator;
use lockstep::{ClientConfig, LockClient, LockServer, ReconnectConfig};
use std::net::SocketAddr;
use std::sync::Arc;

/// Find an available port for testing.
pub fn find_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port");
    listener.local_addr().unwrap().port()
}

/// A lock server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub manager: Arc<LockManager>,
    shutdown: ShutdownCoordinator,
}

impl TestServer {
    /// Start a server on an ephemeral loopback port.
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap()).await
    }

    /// Start a server on a specific address.
    pub async fn start_on(addr: SocketAddr) -> Self {
        let server = LockServer::bind(addr).await.expect("bind test server");
        let addr = server.local_addr();
        let manager = server.manager();
        let shutdown = ShutdownCoordinator::new();

        let run_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = server.run_until(run_shutdown).await;
        });

        Self {
            addr,
            manager,
            shutdown,
        }
    }

    /// A client connected to this server with a fast reconnect schedule.
    pub fn client(&self) -> LockClient {
        client_for(self.addr)
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        self.shutdown.shutdown();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

/// Build a client for the given address with a fast reconnect schedule.
pub fn client_for(addr: SocketAddr) -> LockClient {
    let config = ClientConfig::new(addr.ip().to_string(), addr.port())
        .with_reconnect(fast_reconnect());
    LockClient::connect(config).expect("valid client config")
}

/// A reconnect schedule scaled down for tests.
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_interval: 0.05,
        max_interval: 0.2,
        interval_multiplier: 1.5,
    }
}
