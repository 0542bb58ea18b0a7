//! Event storage
//!
//! Three backends satisfy one contract: `put` applies the kind-class
//! semantics atomically, `query` serves historical backfill in
//! (created_at desc, event_id desc) order, and `gc` expires immutable
//! events past the configured TTL. The conflict rule for replaceable
//! classes lives in `aether_core::supersedes` so every backend picks
//! the same winner.

use aether_core::{Event, EventId, Filter};
use std::sync::Arc;
use thiserror::Error;

pub mod kv;
pub mod memory;
pub mod sql;

pub use kv::KvStore;
pub use memory::MemoryStore;
pub use sql::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("kind {0} has no storage class")]
    UnclassifiedKind(u16),
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Result of an atomic `put`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored (or, for ephemeral kinds, acceptable to dispatch)
    Inserted,
    /// Already present, or lost the replaceable conflict; not stored
    Duplicate,
    /// Displaced the previous incumbent for its replaceable key
    Replaced(EventId),
}

/// Storage contract shared by every backend. All operations are atomic
/// with respect to concurrent callers; `put` is linearizable per
/// replaceable key.
pub trait Store: Send + Sync {
    fn put(&self, event: &Event) -> Result<PutOutcome, StoreError>;
    fn get(&self, event_id: &EventId) -> Result<Option<Event>, StoreError>;
    /// Historical backfill: matching events, newest first, honoring the
    /// filter's `limit`.
    fn query(&self, filter: &Filter) -> Result<Vec<Event>, StoreError>;
    /// Drop immutable events older than the TTL. No-op for replaceable
    /// classes and, trivially, for ephemeral events.
    fn gc(&self, now_ns: u64) -> Result<usize, StoreError>;
    fn event_count(&self) -> usize;
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Backend selector parsed from configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sled(std::path::PathBuf),
    Sqlite(std::path::PathBuf),
}

pub fn open_store(backend: &StoreBackend, ttl_ns: u64) -> Result<Arc<dyn Store>, StoreError> {
    Ok(match backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(ttl_ns)),
        StoreBackend::Sled(path) => Arc::new(KvStore::open(path.as_path(), ttl_ns)?),
        StoreBackend::Sqlite(path) => Arc::new(SqliteStore::open(path.as_path(), ttl_ns)?),
    })
}

/// Sort events into backfill order: created_at descending, ties broken
/// by event id descending.
pub(crate) fn sort_backfill(events: &mut [Event]) {
    events.sort_by(|a, b| {
        (b.created_at, &b.event_id.0).cmp(&(a.created_at, &a.event_id.0))
    });
}
