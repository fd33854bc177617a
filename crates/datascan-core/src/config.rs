//! Filesystem map and scan configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ScanError};
use crate::model::DEFAULT_CHUNK_SIZE;

/// The pools a filesystem is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsMap {
    pub fs_name: String,
    pub metadata_pool: i64,
    pub data_pools: Vec<i64>,
}

impl Default for FsMap {
    fn default() -> Self {
        Self {
            fs_name: "cephfs".to_string(),
            metadata_pool: 1,
            data_pools: vec![2],
        }
    }
}

impl FsMap {
    /// Load a filesystem map from a JSON file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .context(format!("Failed to read fsmap {}", path.display()))?;
        let fsmap: FsMap = serde_json::from_str(&raw)
            .context(format!("Failed to parse fsmap {}", path.display()))?;
        fsmap.validate()?;
        Ok(fsmap)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_pools.is_empty() {
            return Err(ScanError::Config(format!(
                "filesystem '{}' has no data pools",
                self.fs_name
            )));
        }
        if self.data_pools.contains(&self.metadata_pool) {
            return Err(ScanError::Config(format!(
                "pool {} is both the metadata pool and a data pool",
                self.metadata_pool
            )));
        }
        Ok(())
    }

    /// The pool recovered layouts point at unless overridden
    pub fn default_data_pool(&self) -> Option<i64> {
        self.data_pools.first().copied()
    }

    pub fn resolve_data_pool(&self, requested: Option<i64>) -> Result<i64> {
        match requested {
            Some(pool) if self.data_pools.contains(&pool) => Ok(pool),
            Some(pool) => Err(ScanError::Config(format!(
                "pool {} is not a data pool of '{}'",
                pool, self.fs_name
            ))),
            None => self
                .default_data_pool()
                .ok_or_else(|| ScanError::Config("no data pool configured".to_string())),
        }
    }
}

/// Which slice of the data pool one worker owns: worker `n` of `m`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerShard {
    pub n: u32,
    pub m: u32,
}

impl Default for WorkerShard {
    fn default() -> Self {
        Self { n: 0, m: 1 }
    }
}

impl WorkerShard {
    pub fn new(n: u32, m: u32) -> Result<Self> {
        if m == 0 {
            return Err(ScanError::Config("worker count must be at least 1".to_string()));
        }
        if n >= m {
            return Err(ScanError::Config(format!(
                "worker index {} out of range for {} workers",
                n, m
            )));
        }
        Ok(Self { n, m })
    }

    /// Whether this worker is responsible for `ino`
    pub fn owns(&self, ino: u64) -> bool {
        shard_for(ino, self.m) == self.n
    }
}

/// Map an inode number to the index of the worker that handles it
pub fn shard_for(ino: u64, m: u32) -> u32 {
    (ino % m.max(1) as u64) as u32
}

/// Knobs for one scan run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub worker: WorkerShard,
    /// Used when a scanned object carries no chunk size of its own
    pub default_chunk_size: u32,
    /// Layout pool override; defaults to the fsmap's first data pool
    pub data_pool_id: Option<i64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            worker: WorkerShard::default(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            data_pool_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_shards_partition_inodes() {
        let shards: Vec<_> = (0..4).map(|n| WorkerShard::new(n, 4).unwrap()).collect();
        for ino in 0x10000000000u64..0x10000000040 {
            let owners = shards.iter().filter(|s| s.owns(ino)).count();
            assert_eq!(owners, 1, "inode {:x} owned by {} workers", ino, owners);
        }
    }

    #[test]
    fn test_invalid_shards() {
        assert!(WorkerShard::new(0, 0).is_err());
        assert!(WorkerShard::new(3, 3).is_err());
        assert!(WorkerShard::new(2, 3).is_ok());
    }

    #[test]
    fn test_load_fsmap() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"fs_name": "recovery", "metadata_pool": 5, "data_pools": [6, 7]}}"#
        )
        .unwrap();

        let fsmap = FsMap::load(file.path()).unwrap();
        assert_eq!(fsmap.metadata_pool, 5);
        assert_eq!(fsmap.resolve_data_pool(None).unwrap(), 6);
        assert_eq!(fsmap.resolve_data_pool(Some(7)).unwrap(), 7);
        assert!(fsmap.resolve_data_pool(Some(5)).is_err());
    }

    #[test]
    fn test_fsmap_rejects_shared_pool() {
        let fsmap = FsMap {
            fs_name: "bad".to_string(),
            metadata_pool: 2,
            data_pools: vec![2],
        };
        assert!(matches!(fsmap.validate(), Err(ScanError::Config(_))));
    }
}
