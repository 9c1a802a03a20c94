//! lockstep - Main entry point.

use lockstep::cli::{Cli, Commands};
use lockstep::{ClientConfig, Extends, LockClient, LockOptions, ServerConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Server {
            bind,
            config,
            json_logs,
        } => {
            let mut config = match config {
                Some(path) => ServerConfig::from_file(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            config.observability.log_level = cli.log_level;
            if json_logs {
                config.observability.json_logs = true;
            }

            lockstep::run(config).await?;
        }

        Commands::Lock {
            resources,
            addr,
            ttl,
            locking_timeout,
            hold,
        } => {
            let (host, port) = split_addr(&addr)?;
            let client = LockClient::connect(ClientConfig::new(host, port))?;

            let options =
                LockOptions::new(ttl, locking_timeout).extends(Extends::Count(u32::MAX));

            let held = client
                .with_lock(resources, &options, |lock| async move {
                    println!("{}", lock.id());
                    match hold {
                        Some(seconds) => {
                            tokio::time::sleep(Duration::from_secs_f64(seconds)).await
                        }
                        None => {
                            let _ = tokio::signal::ctrl_c().await;
                        }
                    }
                    Ok(())
                })
                .await;

            client.close().await;

            if let Err(e) = held {
                eprintln!("Error acquiring lock: {}", e);
                std::process::exit(1);
            }
        }

        Commands::Release { lock_id, addr } => {
            let (host, port) = split_addr(&addr)?;
            let client = LockClient::connect(ClientConfig::new(host, port))?;

            let released = client.release_lock(&lock_id).await;
            client.close().await;

            match released {
                Ok(()) => println!("Released: {}", lock_id),
                Err(e) => {
                    eprintln!("Error releasing lock: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("lockstep v{}", env!("CARGO_PKG_VERSION"));
            println!("A single-threaded ordered distributed lock service");
        }
    }

    Ok(())
}

/// Split a `host:port` address string.
fn split_addr(addr: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid address: {}", addr))?;
    Ok((host.to_string(), port.parse()?))
}
