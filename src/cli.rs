//! Command-line interface for lockstep.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// lockstep - A single-threaded ordered distributed lock service.
#[derive(Parser)]
#[command(name = "lockstep")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOCKSTEP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a lock server
    Server {
        /// Bind address
        #[arg(short, long, env = "LOCKSTEP_BIND")]
        bind: Option<SocketAddr>,

        /// Configuration file path
        #[arg(short, long, env = "LOCKSTEP_CONFIG")]
        config: Option<PathBuf>,

        /// Emit JSON logs
        #[arg(long)]
        json_logs: bool,
    },

    /// Acquire a lock and hold it, auto-extending, until released
    Lock {
        /// Resource ids to lock
        #[arg(required = true)]
        resources: Vec<String>,

        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:3292")]
        addr: String,

        /// Lease duration in seconds
        #[arg(long, default_value_t = 30.0)]
        ttl: f64,

        /// How long to wait for the lock, in seconds
        #[arg(long, default_value_t = 30.0)]
        locking_timeout: f64,

        /// Hold the lock for this many seconds (default: until Ctrl+C)
        #[arg(long)]
        hold: Option<f64>,
    },

    /// Release a lock id obtained elsewhere
    Release {
        /// Lock id to release
        lock_id: String,

        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:3292")]
        addr: String,
    },

    /// Show version information
    Version,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
