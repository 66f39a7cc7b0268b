//! Keeps the dispatch table in sync with the store.
//!
//! # Responsibilities
//! - Full load of every record family in dependency order
//! - Translate watch events into table mutations
//! - Repair a lost watch: backoff, re-watch, re-list and reconcile
//!
//! The watcher is the only catalog writer of the table after startup.

use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use super::keys::{decode_api_suffix, parse_bind_suffix};
use super::{EventKind, Keys, Prefix, Store, StoreError, WatchEvent};
use crate::config::schema::StoreConfig;
use crate::dispatch::{DispatchTable, Mutation, Snapshot};
use crate::model::{Api, AppliedPlugins, Bind, Cluster, Plugin, ProxyInfo, Routing, Server};
use crate::resilience::backoff::calculate_backoff;

/// A decoded catalog record.
#[derive(Debug, Clone, PartialEq)]
enum Record {
    Api(Api),
    Cluster(Cluster),
    Server(Server),
    Bind(Bind),
    Routing(Routing),
    Proxy(ProxyInfo),
    Plugin(Plugin),
    AppliedPlugins(AppliedPlugins),
}

/// Identity of a record for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Ident {
    Api(u64),
    Cluster(u64),
    Server(u64),
    Bind(u64, u64),
    Routing(u64),
    Proxy(String),
    Plugin(u64),
}

pub struct StoreWatcher {
    store: Arc<dyn Store>,
    table: Arc<DispatchTable>,
    keys: Keys,
    resync_attempts: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl StoreWatcher {
    pub fn new(store: Arc<dyn Store>, table: Arc<DispatchTable>, keys: Keys, config: &StoreConfig) -> Self {
        Self {
            store,
            table,
            keys,
            resync_attempts: config.resync_attempts.max(1),
            backoff_base_ms: config.resync_backoff_ms,
            backoff_max_ms: config.resync_backoff_max_ms,
        }
    }

    /// List every family and make the table match it.
    ///
    /// Listed records are added or updated in load order, then entities the
    /// store no longer has are removed.
    pub async fn sync(&self) -> Result<(), StoreError> {
        let mut listed = HashSet::new();
        let mut applied_seen = false;

        for prefix in Prefix::LOAD_ORDER {
            let records = self.store.list(&self.keys.dir(prefix)).await?;
            for kv in records {
                match decode(prefix, &kv.key, &kv.value, self.keys.classify(&kv.key).map(|(_, s)| s)) {
                    Ok(record) => {
                        if let Some(ident) = ident(&record) {
                            listed.insert(ident);
                        }
                        applied_seen |= matches!(record, Record::AppliedPlugins(_));
                        self.upsert(record);
                    }
                    Err(e) => tracing::warn!(key = %kv.key, error = %e, "Skipping malformed record"),
                }
            }
        }

        self.remove_unlisted(&listed, applied_seen);

        let snapshot = self.table.snapshot();
        tracing::info!(
            apis = snapshot.apis.len(),
            clusters = snapshot.clusters.len(),
            servers = snapshot.servers.len(),
            routings = snapshot.routings.len(),
            proxies = snapshot.proxies.len(),
            "Catalog loaded from store"
        );
        Ok(())
    }

    /// Subscribe to every key of the namespace. Open the stream before
    /// `sync` so no write between the listing and the subscription is lost;
    /// events overlapping the listing are applied twice, which is a no-op.
    pub async fn open(&self) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        self.store.watch(&self.prefix()).await
    }

    fn prefix(&self) -> String {
        format!("{}/", self.keys.namespace())
    }

    /// Consume `watch` until shutdown. A lost stream is re-opened, then the
    /// table is reconciled with a fresh listing. Errors only after
    /// `resync_attempts` consecutive failures to restore the watch.
    pub async fn run(
        self,
        watch: mpsc::Receiver<WatchEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), StoreError> {
        let prefix = self.prefix();
        let mut current = Some(watch);
        let mut failures = 0u32;
        tracing::info!(prefix = %prefix, "Store watch started");

        loop {
            if let Some(mut rx) = current.take() {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => self.apply(event),
                            None => break,
                        },
                        _ = shutdown.recv() => {
                            tracing::info!("Store watcher stopped");
                            return Ok(());
                        }
                    }
                }
                tracing::warn!(prefix = %prefix, "Store watch closed");
            }

            failures += 1;
            if failures > self.resync_attempts {
                tracing::error!(attempts = failures, "Store watch could not be restored");
                return Err(StoreError::WatchClosed);
            }

            let delay = calculate_backoff(failures, self.backoff_base_ms, self.backoff_max_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return Ok(()),
            }

            let restored = match self.store.watch(&prefix).await {
                Ok(rx) => self.sync().await.map(|()| rx),
                Err(e) => Err(e),
            };
            match restored {
                Ok(rx) => {
                    tracing::info!(prefix = %prefix, "Store watch restored");
                    failures = 0;
                    current = Some(rx);
                }
                Err(e) => {
                    tracing::warn!(prefix = %prefix, error = %e, attempt = failures, "Store watch failed");
                }
            }
        }
    }

    /// Apply one watch event. Bad records are logged and dropped.
    pub fn apply(&self, event: WatchEvent) {
        let Some((prefix, suffix)) = self.keys.classify(&event.key) else {
            tracing::warn!(key = %event.key, "Unknown store key");
            return;
        };
        tracing::debug!(key = %event.key, kind = ?event.kind, "Store event");

        match event.kind {
            EventKind::New | EventKind::Update => {
                let Some(value) = event.value.as_deref() else {
                    tracing::warn!(key = %event.key, "Store event without value");
                    return;
                };
                match decode(prefix, &event.key, value, Some(suffix)) {
                    Ok(record) => self.upsert(record),
                    Err(e) => tracing::warn!(key = %event.key, error = %e, "Skipping malformed record"),
                }
            }
            EventKind::Delete => match self.removal(prefix, suffix) {
                Some(mutation) => self.mutate(mutation),
                None => tracing::debug!(key = %event.key, "Delete for unknown record ignored"),
            },
        }
    }

    fn upsert(&self, record: Record) {
        let snapshot = self.table.snapshot();
        let mutation = match record {
            Record::Api(api) if snapshot.apis.contains_key(&api.id) => {
                if snapshot.apis.get(&api.id).is_some_and(|old| **old == api) {
                    return;
                }
                Mutation::UpdateApi(api)
            }
            Record::Api(api) => Mutation::AddApi(api),
            Record::Cluster(c) if snapshot.clusters.contains_key(&c.id) => {
                if snapshot.cluster(c.id).is_some_and(|old| old.meta == c) {
                    return;
                }
                Mutation::UpdateCluster(c)
            }
            Record::Cluster(c) => Mutation::AddCluster(c),
            Record::Server(s) if snapshot.servers.contains_key(&s.id) => {
                if snapshot.server(s.id).is_some_and(|old| old.meta == s) {
                    return;
                }
                Mutation::UpdateServer(s)
            }
            Record::Server(s) => Mutation::AddServer(s),
            Record::Bind(b) => {
                if snapshot.bound(b.cluster_id).contains(&b.server_id) {
                    return;
                }
                Mutation::AddBind(b)
            }
            Record::Routing(r) => match snapshot.routings.iter().find(|old| old.id == r.id) {
                Some(old) if **old == r => return,
                Some(_) => Mutation::UpdateRouting(r),
                None => Mutation::AddRouting(r),
            },
            Record::Proxy(p) => match snapshot.proxies.get(&p.addr) {
                Some(old) if *old == p => return,
                Some(_) => Mutation::UpdateProxy(p),
                None => Mutation::AddProxy(p),
            },
            Record::Plugin(p) => match snapshot.plugins.get(&p.id) {
                Some(old) if **old == p => return,
                Some(_) => Mutation::UpdatePlugin(p),
                None => Mutation::AddPlugin(p),
            },
            Record::AppliedPlugins(a) => {
                if snapshot.applied_plugins == a {
                    return;
                }
                Mutation::SetAppliedPlugins(a)
            }
        };
        self.mutate(mutation);
    }

    fn removal(&self, prefix: Prefix, suffix: &str) -> Option<Mutation> {
        match prefix {
            Prefix::Apis => {
                let (url, method) = decode_api_suffix(suffix)?;
                let snapshot = self.table.snapshot();
                let api = snapshot
                    .apis
                    .values()
                    .find(|a| a.url_pattern == url && a.method == method)?;
                Some(Mutation::RemoveApi(api.id))
            }
            Prefix::Clusters => suffix.parse().ok().map(Mutation::RemoveCluster),
            Prefix::Servers => suffix.parse().ok().map(Mutation::RemoveServer),
            Prefix::Binds => parse_bind_suffix(suffix).map(|(cluster_id, server_id)| {
                Mutation::RemoveBind(Bind { cluster_id, server_id })
            }),
            Prefix::Routings => suffix.parse().ok().map(Mutation::RemoveRouting),
            Prefix::Proxies => Some(Mutation::RemoveProxy(suffix.to_string())),
            Prefix::Plugins => suffix.parse().ok().map(Mutation::RemovePlugin),
            Prefix::AppliedPlugins => Some(Mutation::SetAppliedPlugins(AppliedPlugins::default())),
        }
    }

    /// Remove whatever the table holds that the last listing did not return,
    /// dependents first.
    fn remove_unlisted(&self, listed: &HashSet<Ident>, applied_seen: bool) {
        let snapshot = self.table.snapshot();
        for mutation in stale(&snapshot, listed) {
            self.mutate(mutation);
        }
        if !applied_seen && !snapshot.applied_plugins.applied.is_empty() {
            self.mutate(Mutation::SetAppliedPlugins(AppliedPlugins::default()));
        }
    }

    fn mutate(&self, mutation: Mutation) {
        let name = mutation.name();
        if let Err(e) = self.table.apply(mutation) {
            tracing::warn!(mutation = name, error = %e, "Store event rejected by dispatch table");
        }
    }
}

fn stale(snapshot: &Snapshot, listed: &HashSet<Ident>) -> Vec<Mutation> {
    let mut out = Vec::new();

    out.extend(
        snapshot
            .routings
            .iter()
            .filter(|r| !listed.contains(&Ident::Routing(r.id)))
            .map(|r| Mutation::RemoveRouting(r.id)),
    );
    for (cluster_id, servers) in &snapshot.binds {
        out.extend(
            servers
                .iter()
                .filter(|s| !listed.contains(&Ident::Bind(*cluster_id, **s)))
                .map(|s| {
                    Mutation::RemoveBind(Bind {
                        cluster_id: *cluster_id,
                        server_id: *s,
                    })
                }),
        );
    }
    out.extend(
        snapshot
            .servers
            .keys()
            .filter(|id| !listed.contains(&Ident::Server(**id)))
            .map(|id| Mutation::RemoveServer(*id)),
    );
    out.extend(
        snapshot
            .clusters
            .keys()
            .filter(|id| !listed.contains(&Ident::Cluster(**id)))
            .map(|id| Mutation::RemoveCluster(*id)),
    );
    out.extend(
        snapshot
            .apis
            .keys()
            .filter(|id| !listed.contains(&Ident::Api(**id)))
            .map(|id| Mutation::RemoveApi(*id)),
    );
    out.extend(
        snapshot
            .proxies
            .keys()
            .filter(|addr| !listed.contains(&Ident::Proxy((*addr).clone())))
            .map(|addr| Mutation::RemoveProxy(addr.clone())),
    );
    out.extend(
        snapshot
            .plugins
            .keys()
            .filter(|id| !listed.contains(&Ident::Plugin(**id)))
            .map(|id| Mutation::RemovePlugin(*id)),
    );
    out
}

fn decode(prefix: Prefix, key: &str, value: &str, suffix: Option<&str>) -> Result<Record, StoreError> {
    fn json<T: DeserializeOwned>(key: &str, value: &str) -> Result<T, StoreError> {
        serde_json::from_str(value).map_err(|e| StoreError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    Ok(match prefix {
        Prefix::Apis => Record::Api(json(key, value)?),
        Prefix::Clusters => Record::Cluster(json(key, value)?),
        Prefix::Servers => Record::Server(json(key, value)?),
        Prefix::Binds => match json::<Bind>(key, value) {
            Ok(bind) => Record::Bind(bind),
            // the key alone identifies a bind
            Err(e) => {
                let (cluster_id, server_id) = suffix.and_then(parse_bind_suffix).ok_or(e)?;
                Record::Bind(Bind { cluster_id, server_id })
            }
        },
        Prefix::Routings => Record::Routing(json(key, value)?),
        Prefix::Proxies => Record::Proxy(json(key, value)?),
        Prefix::Plugins => Record::Plugin(json(key, value)?),
        Prefix::AppliedPlugins => Record::AppliedPlugins(json(key, value)?),
    })
}

fn ident(record: &Record) -> Option<Ident> {
    Some(match record {
        Record::Api(a) => Ident::Api(a.id),
        Record::Cluster(c) => Ident::Cluster(c.id),
        Record::Server(s) => Ident::Server(s.id),
        Record::Bind(b) => Ident::Bind(b.cluster_id, b.server_id),
        Record::Routing(r) => Ident::Routing(r.id),
        Record::Proxy(p) => Ident::Proxy(p.addr.clone()),
        Record::Plugin(p) => Ident::Plugin(p.id),
        Record::AppliedPlugins(_) => return None,
    })
}

/// Helper for writers: JSON-encode a record under its key.
pub async fn put_record<T: serde::Serialize + Sync>(
    store: &dyn Store,
    key: &str,
    record: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let value = serde_json::to_string(record).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.put(key, value, ttl).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::server::server;
    use crate::observability::Analysis;
    use crate::store::MemoryStore;
    use crate::timer::TimingWheel;

    fn table() -> Arc<DispatchTable> {
        let wheel = TimingWheel::new(Duration::from_secs(1), 60, 1);
        let analysis = Arc::new(Analysis::new(wheel.clone()));
        DispatchTable::new(wheel, analysis, Duration::from_secs(30), 16)
    }

    fn api(id: u64, pattern: &str) -> Api {
        serde_json::from_value(serde_json::json!({
            "id": id, "name": format!("api{id}"), "url_pattern": pattern, "method": "GET", "status": "up",
        }))
        .unwrap()
    }

    fn cluster(id: u64) -> Cluster {
        Cluster {
            id,
            name: format!("c{id}"),
            load_balance: Default::default(),
        }
    }

    async fn seed(store: &MemoryStore, keys: &Keys) {
        put_record(store, &keys.cluster(1), &cluster(1), None).await.unwrap();
        put_record(store, &keys.server(10), &server(10, "127.0.0.1:9000"), None).await.unwrap();
        put_record(store, &keys.bind(1, 10), &Bind { cluster_id: 1, server_id: 10 }, None)
            .await
            .unwrap();
        put_record(store, &keys.api("/users/(number):id", "GET"), &api(1, "/users/(number):id"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_load() {
        let store = MemoryStore::new(64);
        let keys = Keys::new("/gw");
        seed(&store, &keys).await;
        store.put("/gw/servers/bad", "{not json".into(), None).await.unwrap();

        let t = table();
        let watcher = StoreWatcher::new(store.clone(), t.clone(), keys, &StoreConfig::default());
        watcher.sync().await.unwrap();

        let snapshot = t.snapshot();
        assert_eq!(snapshot.apis.len(), 1);
        assert_eq!(snapshot.servers.len(), 1);
        assert_eq!(snapshot.cluster(1).unwrap().active().len(), 1);
        assert_eq!(snapshot.route("/users/3", "GET").unwrap().0.id, 1);
    }

    #[tokio::test]
    async fn test_events_and_resync() {
        let store = MemoryStore::new(64);
        let keys = Keys::new("/gw");
        seed(&store, &keys).await;

        let t = table();
        let watcher = StoreWatcher::new(store.clone(), t.clone(), keys.clone(), &StoreConfig::default());
        watcher.sync().await.unwrap();

        watcher.apply(WatchEvent {
            kind: EventKind::Delete,
            key: keys.api("/users/(number):id", "GET"),
            value: None,
        });
        assert!(t.snapshot().apis.is_empty());

        watcher.apply(WatchEvent {
            kind: EventKind::Delete,
            key: keys.bind(1, 10),
            value: None,
        });
        assert!(t.snapshot().cluster(1).unwrap().active().is_empty());

        watcher.apply(WatchEvent {
            kind: EventKind::New,
            key: "/gw/unknown/1".into(),
            value: Some("{}".into()),
        });

        // store still has the api and bind: a resync restores them
        store.delete(&keys.server(10)).await.unwrap();
        watcher.sync().await.unwrap();
        let snapshot = t.snapshot();
        assert_eq!(snapshot.apis.len(), 1);
        assert!(snapshot.servers.is_empty());
        assert!(snapshot.bound(1).is_empty());
    }

    async fn eventually(t: &DispatchTable, ready: impl Fn(&Snapshot) -> bool) -> bool {
        for _ in 0..100 {
            if ready(t.snapshot().as_ref()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_run_applies_watch_events() {
        let store = MemoryStore::new(64);
        let keys = Keys::new("/gw");
        let t = table();
        let watcher = StoreWatcher::new(store.clone(), t.clone(), keys.clone(), &StoreConfig::default());
        let rx = watcher.open().await.unwrap();
        watcher.sync().await.unwrap();

        let (stop, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(watcher.run(rx, stop_rx));

        put_record(&*store, &keys.cluster(5), &cluster(5), None).await.unwrap();
        assert!(eventually(&t, |s| s.cluster(5).is_some()).await);

        stop.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_writes_before_run_are_not_lost() {
        let store = MemoryStore::new(64);
        let keys = Keys::new("/gw");
        let t = table();
        let watcher = StoreWatcher::new(store.clone(), t.clone(), keys.clone(), &StoreConfig::default());
        let rx = watcher.open().await.unwrap();
        watcher.sync().await.unwrap();

        // Written after the listing but before the watch task was ever polled.
        put_record(&*store, &keys.cluster(7), &cluster(7), None).await.unwrap();
        put_record(&*store, &keys.server(70), &server(70, "127.0.0.1:9000"), None)
            .await
            .unwrap();

        let (stop, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(watcher.run(rx, stop_rx));
        assert!(eventually(&t, |s| s.cluster(7).is_some() && s.server(70).is_some()).await);

        stop.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_lost_stream_is_restored_and_reconciled() {
        let store = MemoryStore::new(64);
        let keys = Keys::new("/gw");
        let t = table();
        let config = StoreConfig {
            resync_backoff_ms: 1,
            resync_backoff_max_ms: 5,
            ..StoreConfig::default()
        };
        let watcher = StoreWatcher::new(store.clone(), t.clone(), keys.clone(), &config);
        watcher.sync().await.unwrap();

        // A stream whose sender is already gone reads as a lost watch.
        let (dead_tx, dead_rx) = mpsc::channel(1);
        drop(dead_tx);
        put_record(&*store, &keys.cluster(9), &cluster(9), None).await.unwrap();

        let (stop, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(watcher.run(dead_rx, stop_rx));
        assert!(eventually(&t, |s| s.cluster(9).is_some()).await);

        stop.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
