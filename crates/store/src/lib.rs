//! Keel store: an ordered key-value store with a single global revision,
//! create-if-absent and compare-and-swap writes, prefix listing and
//! watch-from-revision.

#![forbid(unsafe_code)]

mod hub;
mod mem;

pub use hub::{Subscription, WatchHub};
pub use mem::MemStore;

use keel_core::Watch;

/// Store revision. Starts at 0 (empty store); every write increments it by one.
pub type Revision = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// One committed write. `value` is the new value (`None` for deletes),
/// `prev_value` the value it replaced (`None` for creates).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub prev_value: Option<Vec<u8>>,
    pub revision: Revision,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("key already exists: {0}")]
    KeyExists(String),
    #[error("revision mismatch on {key}: expected {expected}, current {actual}")]
    RevisionMismatch { key: String, expected: Revision, actual: Revision },
    #[error("revision {requested} has been compacted (oldest available {oldest})")]
    Compacted { requested: Revision, oldest: Revision },
    #[error("watcher fell behind by {0} events")]
    Lagged(u64),
    #[error("backend: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Stream of committed writes under a prefix.
pub type StoreWatch = Watch<StoreResult<StoreEvent>>;

/// Ordered key-value store primitives the registry is built on.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Create-if-absent. Fails with `KeyExists` without writing.
    async fn create(&self, key: &str, value: Vec<u8>) -> StoreResult<KeyValue>;

    /// Overwrite an existing key. With `expected`, only when the current
    /// `mod_revision` equals it (`RevisionMismatch` otherwise).
    async fn update(&self, key: &str, value: Vec<u8>, expected: Option<Revision>) -> StoreResult<KeyValue>;

    /// Remove a key, returning its last value. `expected` as in `update`.
    async fn delete(&self, key: &str, expected: Option<Revision>) -> StoreResult<KeyValue>;

    /// Snapshot of every key under `prefix` in key order, with the revision it was taken at.
    async fn list(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, Revision)>;

    /// Writes under `prefix` with revision greater than `from`; `from == 0` starts at
    /// the current revision. Fails with `Compacted` when history no longer reaches `from`.
    async fn watch(&self, prefix: &str, from: Revision) -> StoreResult<StoreWatch>;

    async fn revision(&self) -> StoreResult<Revision>;

    /// Open watch subscriptions. A dropped `StoreWatch` stops counting once its
    /// forwarder has been torn down.
    fn watchers(&self) -> StoreResult<usize>;
}
