//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Start background tasks (timer, health status loop, store watch, lease)
//! - Bind listeners and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The catalog is fully loaded before the listener starts
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::schema::{ProxyConfig, StoreDriver};
use crate::config::{CatalogWatcher, ConfigError};
use crate::dispatch::DispatchTable;
use crate::filter::{FilterChain, FilterError};
use crate::http::HttpServer;
use crate::lifecycle::{drain, Shutdown};
use crate::model::ProxyInfo;
use crate::net::{load_tls_config, TlsError};
use crate::observability::Analysis;
use crate::proxy::Gateway;
use crate::store::{Keys, MemoryStore, PollingStore, Registration, Store, StoreError, StoreWatcher};
use crate::timer::TimingWheel;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("filter chain: {0}")]
    Filter(#[from] FilterError),

    #[error("tls: {0}")]
    Tls(#[from] TlsError),

    #[error("listener: {0}")]
    Io(#[from] std::io::Error),
}

/// A started gateway.
pub struct Running {
    pub gateway: Arc<Gateway>,
    /// The catalog store; writes here reach the dispatch table through the watch.
    pub store: Arc<MemoryStore>,
    pub keys: Keys,
    pub local_addr: SocketAddr,
    pub shutdown: Shutdown,
    catalog: Option<Arc<CatalogWatcher>>,
    handles: Vec<JoinHandle<()>>,
    server: JoinHandle<()>,
}

impl Running {
    /// Publish the catalog file again, if one is configured.
    pub async fn reload_catalog(&self) {
        let Some(catalog) = &self.catalog else {
            tracing::info!("No catalog file configured, nothing to reload");
            return;
        };
        if let Err(e) = catalog.publish().await {
            tracing::error!(error = %e, "Catalog reload failed");
        }
    }

    /// Stop accepting, let in-flight requests finish, stop every task.
    pub async fn stop(self, deadline: Duration) {
        self.gateway.stop();
        self.shutdown.trigger();

        let mut handles = self.handles;
        handles.push(self.server);
        let aborted = drain(handles, deadline).await;
        tracing::info!(aborted, "Gateway shut down");
    }
}

/// Build every subsystem and start serving on `listener`.
pub async fn start(config: ProxyConfig, listener: TcpListener) -> Result<Running, StartupError> {
    let shutdown = Shutdown::new();
    let mut handles = Vec::new();
    let local_addr = listener.local_addr()?;

    let wheel = TimingWheel::new(
        Duration::from_millis(config.timer.tick_ms),
        config.timer.slots,
        config.timer.wheels,
    );
    handles.push(wheel.start(shutdown.subscribe()));

    let analysis = Arc::new(Analysis::new(wheel.clone()));
    let table = DispatchTable::new(
        wheel,
        analysis,
        Duration::from_secs(config.limits.health_check_max_interval_secs),
        config.store.event_buffer,
    );
    handles.push(tokio::spawn(table.clone().run(shutdown.subscribe())));

    let store = MemoryStore::new(config.store.event_buffer);
    handles.push(tokio::spawn(store.clone().run_sweeper(
        Duration::from_millis(config.store.sweep_interval_ms),
        shutdown.subscribe(),
    )));
    let keys = Keys::new(&config.namespace);

    let catalog = match &config.store.catalog_file {
        Some(path) => {
            let watcher = Arc::new(CatalogWatcher::new(path, store.clone(), keys.clone()));
            watcher.publish().await?;
            Some(watcher)
        }
        None => None,
    };

    let watched: Arc<dyn Store> = match config.store.driver {
        StoreDriver::Memory => store.clone(),
        StoreDriver::Polling => Arc::new(PollingStore::new(
            store.clone(),
            Duration::from_millis(config.store.poll_interval_ms),
            config.store.event_buffer,
        )),
    };
    let watcher = StoreWatcher::new(watched, table.clone(), keys.clone(), &config.store);
    let watch = watcher.open().await?;
    watcher.sync().await?;
    let fatal = shutdown.clone();
    let stop = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        if let Err(e) = watcher.run(watch, stop).await {
            tracing::error!(error = %e, "Store watch lost, shutting down");
            fatal.trigger();
        }
    }));

    let advertised = if config.addr_rpc.is_empty() {
        local_addr.to_string()
    } else {
        config.addr_rpc.clone()
    };
    let registration = Registration::new(
        store.clone(),
        &keys,
        ProxyInfo {
            addr: local_addr.to_string(),
            addr_rpc: advertised,
        },
        &config.registration,
    );
    registration.register().await?;
    handles.push(tokio::spawn(
        registration.run(table.wheel().clone(), shutdown.subscribe()),
    ));

    let chain = FilterChain::build(&config).await?;
    let gateway = Gateway::new(&config, table, chain);
    handles.extend(gateway.start(&shutdown));

    if let Some(watcher) = catalog.clone() {
        let stop = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = watcher.run(stop).await {
                tracing::error!(error = %e, "Catalog watcher failed");
            }
        }));
    }

    let server = HttpServer::new(gateway.clone(), &config);
    let server = match &config.tls {
        Some(tls) => {
            let tls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
            let stop = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run_tls(listener, tls, stop).await {
                    tracing::error!(error = %e, "HTTPS server failed");
                }
            })
        }
        None => {
            let stop = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(listener, stop).await {
                    tracing::error!(error = %e, "HTTP server failed");
                }
            })
        }
    };

    tracing::info!(address = %local_addr, "Gateway started");
    Ok(Running {
        gateway,
        store,
        keys,
        local_addr,
        shutdown,
        catalog,
        handles,
        server,
    })
}
