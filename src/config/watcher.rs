//! Catalog file watcher.
//!
//! The catalog bootstrap file is diffed against the store and written
//! through it, so file edits reach the dispatch table on the normal watch
//! path.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::config::loader::{load_catalog, ConfigError};
use crate::config::schema::Catalog;
use crate::store::{Keys, Prefix, Store, StoreError};

/// Families the catalog file owns, in dependency order.
const CATALOG_PREFIXES: [Prefix; 5] = [
    Prefix::Clusters,
    Prefix::Servers,
    Prefix::Binds,
    Prefix::Apis,
    Prefix::Routings,
];

type Record = (String, serde_json::Value);

/// Writes done by one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub put: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// A watcher that mirrors the catalog file into the store.
pub struct CatalogWatcher {
    path: PathBuf,
    store: Arc<dyn Store>,
    keys: Keys,
}

impl CatalogWatcher {
    pub fn new(path: &Path, store: Arc<dyn Store>, keys: Keys) -> Self {
        Self {
            path: path.to_path_buf(),
            store,
            keys,
        }
    }

    /// Load the file and make the store's catalog families match it.
    pub async fn publish(&self) -> Result<CatalogDiff, ConfigError> {
        let catalog = load_catalog(&self.path)?;
        let desired = self.records(&catalog)?;
        let wanted: HashSet<&str> = desired.iter().map(|(k, _)| k.as_str()).collect();
        let mut diff = CatalogDiff::default();

        let mut existing = BTreeMap::new();
        for prefix in CATALOG_PREFIXES {
            for kv in self.store.list(&self.keys.dir(prefix)).await? {
                existing.insert(kv.key, kv.value);
            }
        }

        for (key, value) in &desired {
            let same = existing
                .get(key)
                .and_then(|old| serde_json::from_str::<serde_json::Value>(old).ok())
                .is_some_and(|old| old == *value);
            if same {
                diff.unchanged += 1;
                continue;
            }
            self.store.put(key, value.to_string(), None).await?;
            diff.put += 1;
        }

        // Dependents go first so binds never outlive their cluster.
        for prefix in CATALOG_PREFIXES.iter().rev() {
            let dir = self.keys.dir(*prefix);
            for key in existing.keys().filter(|k| k.starts_with(&dir)) {
                if !wanted.contains(key.as_str()) {
                    self.store.delete(key).await?;
                    diff.deleted += 1;
                }
            }
        }

        tracing::info!(
            path = %self.path.display(),
            put = diff.put,
            deleted = diff.deleted,
            unchanged = diff.unchanged,
            "Catalog published"
        );
        Ok(diff)
    }

    /// Keyed records in dependency order.
    fn records(&self, catalog: &Catalog) -> Result<Vec<Record>, StoreError> {
        let mut out = Vec::new();
        for c in &catalog.clusters {
            out.push(encode(self.keys.cluster(c.id), c)?);
        }
        for s in &catalog.servers {
            out.push(encode(self.keys.server(s.id), s)?);
        }
        for b in &catalog.binds {
            out.push(encode(self.keys.bind(b.cluster_id, b.server_id), b)?);
        }
        for a in &catalog.apis {
            out.push(encode(self.keys.api(&a.url_pattern, &a.method), a)?);
        }
        for r in &catalog.routings {
            out.push(encode(self.keys.routing(r.id), r)?);
        }
        Ok(out)
    }

    /// Republish on every change of the file until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<(), ConfigError> {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Catalog watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %self.path.display(), "Catalog watcher started");

        loop {
            tokio::select! {
                changed = rx.recv() => {
                    if changed.is_none() {
                        break;
                    }
                    // Editors write in bursts.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    while rx.try_recv().is_ok() {}
                    if let Err(e) = self.publish().await {
                        tracing::error!(error = %e, "Failed to publish catalog. Keeping current records.");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Catalog watcher stopped");
        Ok(())
    }
}

fn encode<T: Serialize>(key: String, record: &T) -> Result<Record, StoreError> {
    let value = serde_json::to_value(record).map_err(|e| StoreError::Decode {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::Write;

    const CATALOG: &str = r#"
        [[clusters]]
        id = 1
        name = "users"

        [[servers]]
        id = 10
        addr = "127.0.0.1:9001"
        max_qps = 100

        [[binds]]
        cluster_id = 1
        server_id = 10
    "#;

    fn write(file: &mut tempfile::NamedTempFile, content: &str) {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        std::io::Seek::rewind(f).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[tokio::test]
    async fn test_publish_diffs_against_store() {
        let store: Arc<dyn Store> = MemoryStore::new(16);
        let keys = Keys::new("/gw");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, CATALOG);

        let watcher = CatalogWatcher::new(file.path(), store.clone(), keys.clone());
        let diff = watcher.publish().await.unwrap();
        assert_eq!(diff, CatalogDiff { put: 3, deleted: 0, unchanged: 0 });
        assert!(store.get(&keys.bind(1, 10)).await.unwrap().is_some());

        let diff = watcher.publish().await.unwrap();
        assert_eq!(diff, CatalogDiff { put: 0, deleted: 0, unchanged: 3 });

        // Drop the bind, rename the cluster.
        write(
            &mut file,
            r#"
            [[clusters]]
            id = 1
            name = "accounts"

            [[servers]]
            id = 10
            addr = "127.0.0.1:9001"
            max_qps = 100
            "#,
        );
        let diff = watcher.publish().await.unwrap();
        assert_eq!(diff, CatalogDiff { put: 1, deleted: 1, unchanged: 1 });
        assert!(store.get(&keys.bind(1, 10)).await.unwrap().is_none());
        let cluster = store.get(&keys.cluster(1)).await.unwrap().unwrap();
        assert!(cluster.value.contains("accounts"));
    }

    #[tokio::test]
    async fn test_foreign_families_untouched() {
        let store: Arc<dyn Store> = MemoryStore::new(16);
        let keys = Keys::new("/gw");
        store
            .put(&keys.proxy("10.0.0.1:8080"), "{\"addr\":\"10.0.0.1:8080\"}".into(), None)
            .await
            .unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, "");

        let diff = CatalogWatcher::new(file.path(), store.clone(), keys.clone())
            .publish()
            .await
            .unwrap();
        assert_eq!(diff, CatalogDiff::default());
        assert!(store.get(&keys.proxy("10.0.0.1:8080")).await.unwrap().is_some());
    }
}
