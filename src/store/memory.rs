//! In-process store with native watch.
//!
//! # Responsibilities
//! - Ordered map of records with create/modify indexes
//! - TTL leases, expired lazily on read and by the sweeper task
//! - Fan out every change to watchers through one broadcast channel

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

use super::{EventKind, KeyValue, Store, StoreError, WatchEvent};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    create_index: u64,
    modify_index: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<WatchEvent>,
    watch_buffer: usize,
}

impl MemoryStore {
    pub fn new(watch_buffer: usize) -> Arc<Self> {
        let watch_buffer = watch_buffer.max(1);
        let (events, _) = broadcast::channel(watch_buffer);
        Arc::new(Self {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                index: 0,
            }),
            events,
            watch_buffer,
        })
    }

    /// Remove expired leases, emitting a delete for each.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Entry)> = {
            let mut inner = self.inner.write();
            let keys: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let count = expired.len();
        for (key, entry) in expired {
            tracing::debug!(key = %key, "Store lease expired");
            self.publish(EventKind::Delete, key, Some(entry.value));
        }
        count
    }

    /// Purge expired leases every `interval` until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.purge_expired();
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    fn publish(&self, kind: EventKind, key: String, value: Option<String>) {
        // No receivers is fine: nobody watches yet.
        let _ = self.events.send(WatchEvent { kind, key, value });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.read();
        Ok(inner
            .entries
            .get(key)
            .filter(|e| !e.expired(now))
            .map(|e| to_kv(key, e)))
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::Backend("empty key".into()));
        }

        let now = Instant::now();
        let kind = {
            let mut inner = self.inner.write();
            inner.index += 1;
            let index = inner.index;
            let expires_at = ttl.map(|t| now + t);

            match inner.entries.get_mut(key).filter(|e| !e.expired(now)) {
                Some(entry) => {
                    let changed = entry.value != value;
                    entry.value = value.clone();
                    entry.modify_index = index;
                    entry.expires_at = expires_at;
                    // Lease refresh with the same value is not an event.
                    changed.then_some(EventKind::Update)
                }
                None => {
                    inner.entries.insert(
                        key.to_string(),
                        Entry {
                            value: value.clone(),
                            create_index: index,
                            modify_index: index,
                            expires_at,
                        },
                    );
                    Some(EventKind::New)
                }
            }
        };

        if let Some(kind) = kind {
            self.publish(kind, key.to_string(), Some(value));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.inner.write().entries.remove(key);
        match removed {
            Some(entry) => {
                self.publish(EventKind::Delete, key.to_string(), Some(entry.value));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.read();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.expired(now))
            .map(|(k, e)| to_kv(k, e))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(self.watch_buffer);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = tx.closed() => return,
                };

                match event {
                    Ok(event) if event.key.starts_with(&prefix) => {
                        if tx.try_send(event).is_err() {
                            tracing::warn!(prefix = %prefix, "Watch consumer too slow, closing stream");
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(prefix = %prefix, missed, "Watch lagged, closing stream");
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}

fn to_kv(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_index: entry.create_index,
        modify_index: entry.modify_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryStore::new(16);
        store.put("/a/1", "x".into(), None).await.unwrap();
        store.put("/a/2", "y".into(), None).await.unwrap();
        store.put("/b/1", "z".into(), None).await.unwrap();

        let listed = store.list("/a/").await.unwrap();
        assert_eq!(listed.iter().map(|kv| kv.key.as_str()).collect::<Vec<_>>(), vec!["/a/1", "/a/2"]);

        store.put("/a/1", "x2".into(), None).await.unwrap();
        let kv = store.get("/a/1").await.unwrap().unwrap();
        assert_eq!(kv.value, "x2");
        assert!(kv.modify_index > kv.create_index);

        assert!(store.delete("/a/1").await.unwrap());
        assert!(!store.delete("/a/1").await.unwrap());
        assert!(store.get("/a/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_kinds() {
        let store = MemoryStore::new(16);
        let mut rx = store.watch("/ns/").await.unwrap();

        store.put("/ns/k", "1".into(), None).await.unwrap();
        store.put("/other", "1".into(), None).await.unwrap();
        store.put("/ns/k", "2".into(), None).await.unwrap();
        store.put("/ns/k", "2".into(), None).await.unwrap();
        store.delete("/ns/k").await.unwrap();

        let kinds: Vec<EventKind> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|e| e.unwrap().kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::New, EventKind::Update, EventKind::Delete]);
    }

    #[tokio::test]
    async fn test_ttl_expiry_emits_delete() {
        let store = MemoryStore::new(16);
        let mut rx = store.watch("/proxy/").await.unwrap();
        store
            .put("/proxy/a", "{}".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::New);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.list("/proxy/").await.unwrap().is_empty());
        assert_eq!(store.purge_expired(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.key, "/proxy/a");
    }

    #[tokio::test]
    async fn test_slow_consumer_closes_stream() {
        let store = MemoryStore::new(2);
        let mut rx = store.watch("/").await.unwrap();
        for i in 0..8 {
            store.put(&format!("/k{i}"), "v".into(), None).await.unwrap();
        }

        let mut received = 0;
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            received += 1;
        }
        assert!(received < 8);
    }
}
