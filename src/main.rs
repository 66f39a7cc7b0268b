//! HTTP API gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────────┐
//!                      │                        GATEWAY                            │
//!                      │                                                           │
//!   Client Request     │  ┌─────────┐   ┌──────────┐   ┌────────────────────────┐  │
//!   ───────────────────┼─▶│  http   │──▶│  router  │──▶│ dispatch nodes (batches)│  │
//!                      │  │ server  │   │  (trie)  │   │ filter pre → forward →  │──┼──▶ Backends
//!                      │  └─────────┘   └──────────┘   │ filter post / post_err  │  │
//!                      │       ▲                       └───────────┬────────────┘  │
//!   Client Response    │       │          ┌────────────┐           │               │
//!   ◀──────────────────┼───────┴──────────│   render   │◀──────────┘               │
//!                      │                  └────────────┘                           │
//!                      │                                                           │
//!                      │  store ──watch──▶ dispatch table ◀── health checks        │
//!                      │  (catalog)        (snapshots)        timing wheel          │
//!                      └──────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

use gateway_proxy::config::{load_config, ProxyConfig};
use gateway_proxy::lifecycle::{start, Signal, Signals};
use gateway_proxy::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "gateway-proxy")]
#[command(about = "HTTP API gateway", long_about = None)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(short, long)]
    addr: Option<String>,

    /// Grace period for in-flight work on shutdown, in seconds.
    #[arg(long, default_value_t = 30)]
    drain_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(addr) = args.addr {
        config.addr = addr;
    }

    logging::init_logging(config.log_format);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.addr,
        namespace = %config.namespace,
        store = ?config.store.driver,
        "gateway-proxy starting"
    );

    if let Some(address) = &config.metrics.address {
        metrics::init_metrics(address.parse()?);
    }

    let listener = TcpListener::bind(&config.addr).await?;
    let running = start(config, listener).await?;

    let mut signals = Signals::register()?;
    let mut fatal = running.shutdown.subscribe();
    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Signal::Reload => {
                    tracing::info!("Reload signal received");
                    running.reload_catalog().await;
                }
                Signal::Terminate => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            },
            _ = fatal.recv() => {
                tracing::error!("Gateway shutting down after a fatal error");
                break;
            }
        }
    }

    running.stop(Duration::from_secs(args.drain_secs)).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
