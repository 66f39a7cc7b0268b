//! Polling driver: watch by listing and diffing.
//!
//! Wraps any [`Store`] and ignores its native watch. Every poll lists the
//! prefix, then emits `New` for unseen keys, `Update` when the modify index
//! moved and `Delete` for keys that vanished.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{EventKind, KeyValue, Store, StoreError, WatchEvent};

#[derive(Debug)]
pub struct PollingStore {
    inner: Arc<dyn Store>,
    interval: Duration,
    buffer: usize,
}

impl PollingStore {
    pub fn new(inner: Arc<dyn Store>, interval: Duration, buffer: usize) -> Self {
        Self {
            inner,
            interval: interval.max(Duration::from_millis(10)),
            buffer: buffer.max(1),
        }
    }
}

/// Known key → (modify index, last value).
type Seen = HashMap<String, (u64, String)>;

fn diff(seen: &mut Seen, listed: Vec<KeyValue>) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    let mut current: Seen = HashMap::with_capacity(listed.len());

    for kv in listed {
        match seen.get(&kv.key) {
            None => events.push(WatchEvent {
                kind: EventKind::New,
                key: kv.key.clone(),
                value: Some(kv.value.clone()),
            }),
            Some((index, _)) if *index != kv.modify_index => events.push(WatchEvent {
                kind: EventKind::Update,
                key: kv.key.clone(),
                value: Some(kv.value.clone()),
            }),
            Some(_) => {}
        }
        current.insert(kv.key, (kv.modify_index, kv.value));
    }

    for (key, (_, value)) in seen.drain() {
        if !current.contains_key(&key) {
            events.push(WatchEvent {
                kind: EventKind::Delete,
                key,
                value: Some(value),
            });
        }
    }

    *seen = current;
    events
}

#[async_trait]
impl Store for PollingStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        // Baseline so the first poll only reports changes after the watch began.
        let mut seen = Seen::new();
        diff(&mut seen, self.inner.list(prefix).await?);

        let (tx, rx) = mpsc::channel(self.buffer);
        let inner = self.inner.clone();
        let interval = self.interval;
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tx.closed() => return,
                }

                let listed = match inner.list(&prefix).await {
                    Ok(listed) => listed,
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "Poll failed, closing watch");
                        return;
                    }
                };

                for event in diff(&mut seen, listed) {
                    if tx.try_send(event).is_err() {
                        tracing::warn!(prefix = %prefix, "Watch consumer too slow, closing stream");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn kv(key: &str, index: u64) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: format!("v{index}"),
            create_index: 1,
            modify_index: index,
        }
    }

    #[test]
    fn test_diff() {
        let mut seen = Seen::new();
        let events = diff(&mut seen, vec![kv("a", 1), kv("b", 1)]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::New));

        assert!(diff(&mut seen, vec![kv("a", 1), kv("b", 1)]).is_empty());

        let events = diff(&mut seen, vec![kv("a", 2)]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Update);
        assert_eq!(events[1].kind, EventKind::Delete);
        assert_eq!(events[1].key, "b");
        assert_eq!(events[1].value.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_polling_watch() {
        let memory = MemoryStore::new(16);
        memory.put("/ns/old", "1".into(), None).await.unwrap();
        let store = PollingStore::new(memory.clone(), Duration::from_millis(20), 16);

        let mut rx = store.watch("/ns/").await.unwrap();
        store.put("/ns/new", "1".into(), None).await.unwrap();
        store.delete("/ns/old").await.unwrap();

        let mut events = Vec::new();
        while events.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            events.push((event.kind, event.key));
        }
        events.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            events,
            vec![(EventKind::New, "/ns/new".to_string()), (EventKind::Delete, "/ns/old".to_string())]
        );
    }
}
