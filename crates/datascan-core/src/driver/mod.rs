//! Recovery drivers: where recovered inodes get written
//!
//! A driver is chosen once at startup and owned by the scan orchestrator for
//! the whole run. Independent workers each hold their own driver; all
//! coordination between them happens through the target store.

use chrono::{DateTime, Utc};

use crate::config::FsMap;
use crate::error::Result;
use crate::model::InodeBacktrace;
use crate::store::Cluster;

pub mod local;
pub mod metadata;

pub use local::LocalFileDriver;
pub use metadata::MetadataDriver;

/// Backend-neutral contract for injecting recovered inodes
pub trait RecoveryDriver {
    /// Open whatever the backend needs from the cluster session
    fn init(&mut self, cluster: &dyn Cluster, fsmap: &FsMap) -> Result<()>;

    /// Create any missing roots (root, system directory, lost+found).
    ///
    /// Safe to call repeatedly and from several workers at once.
    fn init_metadata(&self, data_pool_id: i64) -> Result<()>;

    /// Pre-injection check that all the roots are present.
    ///
    /// Missing roots are not an error: they yield `Ok(false)`. An `Err`
    /// means the check itself could not be carried out.
    fn check_roots(&self) -> Result<bool>;

    /// Link an inode and any missing ancestors, following its backtrace
    fn inject_with_backtrace(
        &self,
        backtrace: &InodeBacktrace,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: i64,
    ) -> Result<()>;

    /// Link an inode into lost+found when all we know about it is its number
    fn inject_lost_and_found(
        &self,
        ino: u64,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: i64,
    ) -> Result<()>;
}
