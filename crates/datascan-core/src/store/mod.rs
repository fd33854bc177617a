//! Object pool abstraction used by the metadata backend
//!
//! The recovery engine only relies on object-level atomicity: an exclusive
//! create that reports whether the object was already there, and single-key
//! omap writes. No operation here spans more than one object, and nothing
//! ever deletes.

use std::sync::Arc;

use crate::error::StoreError;

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryCluster, MemoryPool};
pub use sqlite::{SqliteCluster, SqlitePool};

/// Result of an exclusive create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Someone (possibly another worker) created it first
    Exists,
}

impl CreateOutcome {
    pub fn created(self) -> bool {
        self == CreateOutcome::Created
    }
}

/// A flat namespace of objects, each with a data blob, an omap header and
/// an omap of string keys to blobs
pub trait ObjectPool: Send + Sync {
    fn pool_id(&self) -> i64;

    fn exists(&self, oid: &str) -> Result<bool, StoreError>;

    /// Create `oid` with the given data and omap header unless it exists
    fn create(&self, oid: &str, data: &[u8], omap_header: &[u8])
        -> Result<CreateOutcome, StoreError>;

    /// Object data, or `None` if the object does not exist
    fn read(&self, oid: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Omap header, or `None` if the object does not exist
    fn omap_get_header(&self, oid: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Value for `key`, or `None` if the object or the key does not exist
    fn omap_get(&self, oid: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or replace `key`. Fails with [`StoreError::NoSuchObject`] if
    /// the object was never created.
    fn omap_set(&self, oid: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Omap keys of an object in sorted order; empty if it does not exist
    fn omap_keys(&self, oid: &str) -> Result<Vec<String>, StoreError>;

    /// Every object name in the pool, sorted
    fn list_objects(&self) -> Result<Vec<String>, StoreError>;
}

/// A connected session able to hand out pools by id
pub trait Cluster: Send + Sync {
    fn open_pool(&self, pool_id: i64) -> Result<Arc<dyn ObjectPool>, StoreError>;
}
