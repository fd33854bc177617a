//! Recovery into an ordinary directory tree
//!
//! Mirrors the recovered hierarchy under a target directory. File content is
//! not copied: each recovered file becomes a small JSON placeholder saying
//! which inode and data objects hold it, stamped with the recovered mtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::RecoveryDriver;
use crate::config::FsMap;
use crate::error::{Result, ScanError};
use crate::model::{lost_and_found_name, Anchor, InodeBacktrace, LinkagePlan, LOST_AND_FOUND_NAME};
use crate::store::Cluster;

/// Contents of a recovered file's placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    pub ino: u64,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub chunk_size: u32,
    pub data_pool_id: i64,
    /// Data object holding the first chunk
    pub head_object: String,
}

impl Placeholder {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Writes recovered files under a local directory
#[derive(Debug)]
pub struct LocalFileDriver {
    path: PathBuf,
    initialized: bool,
}

impl LocalFileDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            initialized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lost_and_found_dir(&self) -> PathBuf {
        self.path.join(LOST_AND_FOUND_NAME)
    }

    fn check_init(&self) -> Result<()> {
        if !self.initialized {
            return Err(ScanError::NotInitialized("local target not checked"));
        }
        Ok(())
    }

    fn ensure_roots(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        ensure_dir(&self.lost_and_found_dir())
    }

    fn write_placeholder(&self, path: &Path, placeholder: &Placeholder) -> Result<()> {
        if path.is_dir() {
            tracing::warn!(
                "{} is a directory, not replacing it with inode {:x}",
                path.display(),
                placeholder.ino
            );
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", path.display()),
            )
            .into());
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, placeholder)?;
        writer.write_all(b"\n")?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.set_modified(SystemTime::from(placeholder.mtime))?;
        tracing::debug!("Wrote placeholder {}", path.display());
        Ok(())
    }

    /// Every path below the target, e.g. `/home/user/file.txt`
    pub fn list_paths(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut pending = vec![(self.path.clone(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = format!("{}/{}", prefix, name);
                if entry.file_type()?.is_dir() {
                    pending.push((entry.path(), path.clone()));
                }
                paths.push(path);
            }
        }

        paths.sort();
        Ok(paths)
    }
}

/// Create one directory level; losing a creation race is fine
fn ensure_dir(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => {
            tracing::debug!("Created directory {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if path.is_dir() {
                return Ok(());
            }
            // A placeholder sits where a directory belongs; the backtrace wins
            tracing::warn!("Replacing file {} with a directory", path.display());
            fs::remove_file(path)?;
            match fs::create_dir(path) {
                Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(e.into()),
                _ => Ok(()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

impl RecoveryDriver for LocalFileDriver {
    fn init(&mut self, _cluster: &dyn Cluster, fsmap: &FsMap) -> Result<()> {
        fsmap.validate()?;
        if self.path.exists() {
            if !self.path.is_dir() {
                return Err(ScanError::Config(format!(
                    "{} exists and is not a directory",
                    self.path.display()
                )));
            }
        } else {
            let parent_ok = match self.path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
                _ => true,
            };
            if !parent_ok {
                return Err(ScanError::Config(format!(
                    "parent of {} does not exist",
                    self.path.display()
                )));
            }
        }
        tracing::info!("Recovering '{}' into {}", fsmap.fs_name, self.path.display());
        self.initialized = true;
        Ok(())
    }

    fn init_metadata(&self, _data_pool_id: i64) -> Result<()> {
        self.check_init()?;
        self.ensure_roots()?;
        tracing::info!("Local roots present under {}", self.path.display());
        Ok(())
    }

    fn check_roots(&self) -> Result<bool> {
        self.check_init()?;
        Ok(self.path.is_dir() && self.lost_and_found_dir().is_dir())
    }

    fn inject_with_backtrace(
        &self,
        backtrace: &InodeBacktrace,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: i64,
    ) -> Result<()> {
        self.check_init()?;
        let (anchor, steps) = match backtrace.linkage_plan() {
            LinkagePlan::Chain { anchor, steps } => (anchor, steps),
            LinkagePlan::Orphan(_) => {
                return self.inject_lost_and_found(
                    backtrace.ino,
                    size,
                    mtime,
                    chunk_size,
                    data_pool_id,
                )
            }
        };
        let Some((leaf, ancestors)) = steps.split_last() else {
            return self.inject_lost_and_found(backtrace.ino, size, mtime, chunk_size, data_pool_id);
        };

        self.ensure_roots()?;
        let mut current = match anchor {
            Anchor::Root => self.path.clone(),
            Anchor::LostAndFound => self.lost_and_found_dir(),
        };
        for step in ancestors {
            current.push(&step.name);
            ensure_dir(&current)?;
        }

        let placeholder = Placeholder {
            ino: backtrace.ino,
            size,
            mtime,
            chunk_size,
            data_pool_id,
            head_object: format!("{:x}.00000000", backtrace.ino),
        };
        self.write_placeholder(&current.join(&leaf.name), &placeholder)
    }

    fn inject_lost_and_found(
        &self,
        ino: u64,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: i64,
    ) -> Result<()> {
        self.check_init()?;
        self.ensure_roots()?;
        let placeholder = Placeholder {
            ino,
            size,
            mtime,
            chunk_size,
            data_pool_id,
            head_object: format!("{:x}.00000000", ino),
        };
        let path = self.lost_and_found_dir().join(lost_and_found_name(ino));
        self.write_placeholder(&path, &placeholder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCluster;
    use tempfile::TempDir;

    fn driver(temp_dir: &TempDir) -> LocalFileDriver {
        let mut driver = LocalFileDriver::new(temp_dir.path().join("recovered"));
        driver
            .init(&MemoryCluster::new(), &FsMap::default())
            .unwrap();
        driver
    }

    #[test]
    fn test_requires_init() {
        let temp_dir = TempDir::new().unwrap();
        let driver = LocalFileDriver::new(temp_dir.path());
        assert!(matches!(
            driver.check_roots(),
            Err(ScanError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_init_rejects_unreachable_target() {
        let temp_dir = TempDir::new().unwrap();
        let mut driver = LocalFileDriver::new(temp_dir.path().join("no/such/dir"));
        let err = driver
            .init(&MemoryCluster::new(), &FsMap::default())
            .unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
    }

    #[test]
    fn test_roots() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(&temp_dir);
        assert!(!driver.check_roots().unwrap());
        driver.init_metadata(2).unwrap();
        driver.init_metadata(2).unwrap();
        assert!(driver.check_roots().unwrap());
    }

    #[test]
    fn test_placeholder_records_inode() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(&temp_dir);
        let mtime = DateTime::from_timestamp(1_650_000_000, 0).unwrap();

        driver.inject_lost_and_found(42, 100, mtime, 4096, 2).unwrap();

        let path = driver.path().join("lost+found").join("42");
        let placeholder = Placeholder::read(&path).unwrap();
        assert_eq!(placeholder.size, 100);
        assert_eq!(placeholder.head_object, "2a.00000000");
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(DateTime::<Utc>::from(modified), mtime);
    }

    #[test]
    fn test_directory_replaces_stale_placeholder() {
        let temp_dir = TempDir::new().unwrap();
        let driver = driver(&temp_dir);
        let mtime = DateTime::from_timestamp(1_650_000_000, 0).unwrap();
        driver.init_metadata(2).unwrap();

        let file = InodeBacktrace::new(0x10000000001, 2).with_ancestor(1, "data", 1);
        driver.inject_with_backtrace(&file, 1, mtime, 4096, 2).unwrap();

        let nested = InodeBacktrace::new(0x10000000002, 2)
            .with_ancestor(0x10000000001, "inner.txt", 2)
            .with_ancestor(1, "data", 2);
        driver.inject_with_backtrace(&nested, 1, mtime, 4096, 2).unwrap();

        assert!(driver.path().join("data").is_dir());
        assert!(driver.path().join("data/inner.txt").is_file());
    }
}
