//! Configuration for lockstep servers and clients.
//!
//! All durations that cross the wire are expressed in seconds as `f64`
//! (fractional values allowed), matching the protocol unit.

use crate::error::{LockstepError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Default TCP port for the lock service.
pub const DEFAULT_PORT: u16 = 3292;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the lock server.
    pub bind_addr: SocketAddr,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}")
                .parse()
                .expect("valid socket address"),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LockstepError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| LockstepError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.port() == 0 {
            return Err(LockstepError::InvalidConfig {
                field: "bind_addr".to_string(),
                reason: "Port must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Create a loopback configuration for local development.
    pub fn development() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{DEFAULT_PORT}")
                .parse()
                .expect("valid socket address"),
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server to connect to.
    pub connect: ConnectConfig,
    /// Reconnect behaviour after failed attempts and disconnections.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    /// Configuration for a server on the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            connect: ConnectConfig {
                host: host.into(),
                port,
            },
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Set the reconnect schedule.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connect.host.is_empty() {
            return Err(LockstepError::InvalidConfig {
                field: "connect.host".to_string(),
                reason: "Host must be non-empty".to_string(),
            });
        }
        self.reconnect.validate()
    }
}

/// Connection destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
}

impl ConnectConfig {
    /// The `host:port` address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Reconnect schedule: exponential backoff between connect attempts.
///
/// The first attempt after startup or a disconnect is immediate; each
/// subsequent attempt waits the current interval, then grows it by the
/// multiplier up to the maximum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Starting interval between attempts, in seconds.
    pub initial_interval: f64,
    /// Upper bound on the interval, in seconds.
    pub max_interval: f64,
    /// Growth factor applied after each failed attempt.
    pub interval_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval: 1.0,
            max_interval: 5.0,
            interval_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Validate the schedule.
    pub fn validate(&self) -> Result<()> {
        if self.initial_interval < 0.0 {
            return Err(LockstepError::InvalidConfig {
                field: "reconnect.initial_interval".to_string(),
                reason: "Interval must not be negative".to_string(),
            });
        }
        if self.max_interval < self.initial_interval {
            return Err(LockstepError::InvalidConfig {
                field: "reconnect.max_interval".to_string(),
                reason: "Maximum must not be below the initial interval".to_string(),
            });
        }
        if self.interval_multiplier < 1.0 {
            return Err(LockstepError::InvalidConfig {
                field: "reconnect.interval_multiplier".to_string(),
                reason: "Multiplier must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
