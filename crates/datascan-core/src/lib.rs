//! Metadata tree recovery from a filesystem's data pool
//!
//! Data objects keep a backtrace of the path they were written under. This
//! crate turns those backtraces back into a reachable directory tree: it
//! re-creates missing ancestor directories, links each recovered inode into
//! its parent, and parks anything without usable ancestry in lost+found.

pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod scan;
pub mod store;

pub use config::{shard_for, FsMap, ScanConfig, WorkerShard};
pub use driver::{LocalFileDriver, MetadataDriver, RecoveryDriver};
pub use error::{DecodeError, Result, ScanError, StoreError};
pub use model::{BacktraceAncestor, InodeBacktrace, InodeRecord, LinkagePlan};
pub use scan::{
    run_workers, DataScan, ManifestSource, ObjectOutcome, ScanProgress, ScanReport, ScannedObject,
};
pub use store::{Cluster, CreateOutcome, MemoryCluster, ObjectPool, SqliteCluster};
