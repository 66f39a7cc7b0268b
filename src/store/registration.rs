//! Proxy lease.
//!
//! The gateway writes `/proxy/<addr>` with a short TTL and refreshes it on
//! a periodic timing-wheel entry, so a crashed gateway disappears from the
//! proxy set on its own and the remaining gateways resize their per-server
//! QPS shares.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use super::watcher::put_record;
use super::{Keys, Store, StoreError};
use crate::config::schema::RegistrationConfig;
use crate::model::ProxyInfo;
use crate::timer::TimingWheel;

pub struct Registration {
    store: Arc<dyn Store>,
    key: String,
    info: ProxyInfo,
    refresh: Duration,
    ttl: Duration,
}

impl Registration {
    pub fn new(store: Arc<dyn Store>, keys: &Keys, info: ProxyInfo, config: &RegistrationConfig) -> Self {
        let refresh = config.refresh().max(Duration::from_millis(10));
        // the lease must outlive one refresh plus jitter
        let ttl = config.lease_ttl().max(refresh + Duration::from_secs(2));
        Self {
            store,
            key: keys.proxy(&info.addr),
            info,
            refresh,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn register(&self) -> Result<(), StoreError> {
        put_record(self.store.as_ref(), &self.key, &self.info, Some(self.ttl)).await
    }

    /// Refresh the lease on every `refresh` period of `wheel` until
    /// shutdown, then delete it. Wheel tasks must not block, so the entry
    /// only wakes this task, which does the store write.
    pub async fn run(self, wheel: Arc<TimingWheel>, mut shutdown: broadcast::Receiver<()>) {
        let due = Arc::new(Notify::new());
        let wake = due.clone();
        let periodic = wheel.schedule_periodic(self.refresh, move || wake.notify_one());

        loop {
            tokio::select! {
                _ = due.notified() => {
                    if let Err(e) = self.register().await {
                        tracing::warn!(key = %self.key, error = %e, "Proxy lease refresh failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        periodic.cancel();

        match self.store.delete(&self.key).await {
            Ok(_) => tracing::info!(key = %self.key, "Proxy lease released"),
            Err(e) => tracing::warn!(key = %self.key, error = %e, "Proxy lease release failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_lease_refresh_and_release() {
        let store = MemoryStore::new(16);
        let keys = Keys::new("/gw");
        let config = RegistrationConfig {
            refresh_ms: 20,
            lease_ttl_ms: 100,
        };
        let info = ProxyInfo {
            addr: "127.0.0.1:8080".into(),
            addr_rpc: String::new(),
        };
        let reg = Registration::new(store.clone(), &keys, info, &config);
        assert!(reg.ttl() >= Duration::from_secs(2));

        let (stop, rx) = broadcast::channel(2);
        let wheel = TimingWheel::new(Duration::from_millis(5), 64, 1);
        let driver = wheel.start(stop.subscribe());
        let handle = tokio::spawn(reg.run(wheel.clone(), rx));

        // Nothing registered up front: the lease appears once the wheel fires.
        let key = keys.proxy("127.0.0.1:8080");
        let mut refreshed = false;
        for _ in 0..50 {
            if store.get(&key).await.unwrap().is_some() {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refreshed);

        stop.send(()).unwrap();
        handle.await.unwrap();
        driver.await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
