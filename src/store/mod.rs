//! Catalog store subsystem.
//!
//! # Data Flow
//! ```text
//! admin collaborator / catalog file
//!     → Store::put / Store::delete (JSON records under the namespace)
//!
//! watcher.rs
//!     → full load: list every prefix in order → table mutations
//!     → watch(namespace) → WatchEvent stream
//!     → keys.rs classifies the key → decode → table mutation
//!     → stream closed or overflowed → backoff → re-list and reconcile
//!
//! registration.rs
//!     → put /proxy/<addr> with a short TTL every refresh tick
//! ```
//!
//! # Design Decisions
//! - The store is a trait; the gateway only needs get/put/delete/list/watch
//! - memory.rs has native watch, polling.rs turns any store into a watchable one by diffing lists
//! - Malformed records are logged and skipped, never fatal
//! - A lost watch is repaired by a full resync rather than replaying history

pub mod keys;
pub mod memory;
pub mod polling;
pub mod registration;
pub mod watcher;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use keys::{Keys, Prefix};
pub use memory::MemoryStore;
pub use polling::PollingStore;
pub use registration::Registration;
pub use watcher::StoreWatcher;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key <{0}> not found")]
    NotFound(String),

    #[error("decode <{key}>: {reason}")]
    Decode { key: String, reason: String },

    #[error("store backend: {0}")]
    Backend(String),

    #[error("watch closed")]
    WatchClosed,
}

/// One stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub create_index: u64,
    pub modify_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for `New`/`Update`, last known value for `Delete` when the driver has it.
    pub value: Option<String>,
}

/// A watchable key-value registry.
///
/// `watch` returns a bounded stream. The driver closes the stream when it
/// can no longer deliver every event; the consumer must then re-list.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// True when the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Records under `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError>;
}
