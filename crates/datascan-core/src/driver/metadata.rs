//! Tree repair against a metadata pool
//!
//! Layout written here:
//! - root-set inodes (`/` and the rank-0 system directory) as standalone
//!   `"{ino:x}.00000000.inode"` objects
//! - one object per directory fragment, `"{ino:x}.{frag:08x}"`, whose omap
//!   header is the [`Fnode`] and whose omap keys `"{name}_head"` are primary
//!   dentries embedding the child inode. Recovered directories are never
//!   split, so every name lives in [`Frag::ROOT`].
//!
//! Every write is either an exclusive create (losing a race to another
//! worker counts as success) or a single-key omap set, so any number of
//! workers can inject overlapping paths without a lock.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use super::RecoveryDriver;
use crate::config::FsMap;
use crate::error::{Result, ScanError, StoreError};
use crate::model::{
    dentry_key, dentry_name, dirfrag_object_name, inode_object_name, lost_and_found_name,
    mdsdir_ino, Anchor, Decode, Dentry, Encode, Fnode, Frag, InodeBacktrace, InodeRecord,
    LinkStep, LinkagePlan, LOST_AND_FOUND_INO, LOST_AND_FOUND_NAME, ROOT_INO,
};
use crate::store::{Cluster, CreateOutcome, ObjectPool};

const ROOT_MODE: u32 = 0o755;
const MDSDIR_MODE: u32 = 0o700;
const RECOVERED_DIR_MODE: u32 = 0o755;
/// Version stamped on directories this engine invents
const BOOTSTRAP_VERSION: u64 = 1;

/// Knows how to manipulate a filesystem's metadata pool
#[derive(Default)]
pub struct MetadataDriver {
    metadata_pool: Option<Arc<dyn ObjectPool>>,
}

impl MetadataDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver bound to an already-open pool, skipping [`RecoveryDriver::init`]
    pub fn with_pool(pool: Arc<dyn ObjectPool>) -> Self {
        Self {
            metadata_pool: Some(pool),
        }
    }

    fn pool(&self) -> Result<&dyn ObjectPool> {
        self.metadata_pool
            .as_deref()
            .ok_or(ScanError::NotInitialized("metadata pool not open"))
    }

    /// Create a standalone inode object (root or system directory).
    ///
    /// Returns whether this call created it; an existing object is left
    /// untouched.
    pub fn inject_unlinked_inode(
        &self,
        ino: u64,
        mode: u32,
        data_pool_id: i64,
    ) -> Result<CreateOutcome> {
        let inode = InodeRecord::directory(ino, mode, data_pool_id, BOOTSTRAP_VERSION);
        let oid = inode_object_name(ino);
        let outcome = self.pool()?.create(&oid, &inode.to_bytes(), &[])?;
        if outcome.created() {
            tracing::debug!("Created inode object {}", oid);
        }
        Ok(outcome)
    }

    /// Whether the standalone inode object for `ino` exists
    pub fn root_exists(&self, ino: u64) -> Result<bool> {
        Ok(self.pool()?.exists(&inode_object_name(ino))?)
    }

    /// Read a standalone inode object
    pub fn read_root_inode(&self, ino: u64) -> Result<Option<InodeRecord>> {
        match self.pool()?.read(&inode_object_name(ino))? {
            Some(raw) => Ok(Some(InodeRecord::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    /// Fnode of a fragment, or `None` if the fragment does not exist
    pub fn read_fnode(&self, ino: u64, frag: Frag) -> Result<Option<Fnode>> {
        let oid = dirfrag_object_name(ino, frag);
        match self.pool()?.omap_get_header(&oid)? {
            Some(raw) => Ok(Some(Fnode::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    /// Dentry `name` in a fragment, or `None` if either is absent
    pub fn read_dentry(&self, parent_ino: u64, frag: Frag, name: &str) -> Result<Option<Dentry>> {
        let oid = dirfrag_object_name(parent_ino, frag);
        match self.pool()?.omap_get(&oid, &dentry_key(name))? {
            Some(raw) => Ok(Some(Dentry::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    /// Return the directory's fragment, creating an empty one if needed.
    ///
    /// The flag is true only when this call did the creating.
    pub fn find_or_create_dirfrag(&self, ino: u64) -> Result<(Fnode, bool)> {
        let frag = Frag::ROOT;
        let oid = dirfrag_object_name(ino, frag);
        let fnode = Fnode::default();

        match self.pool()?.create(&oid, &[], &fnode.to_bytes())? {
            CreateOutcome::Created => {
                tracing::debug!("Created dirfrag {}", oid);
                Ok((fnode, true))
            }
            CreateOutcome::Exists => match self.read_fnode(ino, frag)? {
                Some(existing) => Ok((existing, false)),
                // Objects are never removed, so this means the store lied
                None => Err(StoreError::NoSuchObject(oid).into()),
            },
        }
    }

    /// Write (or overwrite) the primary dentry `name` in `dir_ino`
    pub fn inject_linkage(&self, dir_ino: u64, name: &str, inode: &InodeRecord) -> Result<()> {
        let oid = dirfrag_object_name(dir_ino, Frag::ROOT);
        let dentry = Dentry::Primary(inode.clone());
        self.pool()?
            .omap_set(&oid, &dentry_key(name), &dentry.to_bytes())?;
        tracing::debug!("Linked {:x}/{} -> {:x}", dir_ino, name, inode.ino);
        Ok(())
    }

    fn ensure_root(&self, data_pool_id: i64) -> Result<()> {
        if !self.root_exists(ROOT_INO)? {
            self.inject_unlinked_inode(ROOT_INO, ROOT_MODE, data_pool_id)?;
        }
        self.find_or_create_dirfrag(ROOT_INO)?;
        Ok(())
    }

    fn lost_and_found_exists(&self) -> Result<bool> {
        let linked = match self.read_dentry(ROOT_INO, Frag::ROOT, LOST_AND_FOUND_NAME)? {
            Some(dentry) => dentry.ino() == LOST_AND_FOUND_INO,
            None => false,
        };
        Ok(linked && self.read_fnode(LOST_AND_FOUND_INO, Frag::ROOT)?.is_some())
    }

    fn ensure_lost_and_found(&self, data_pool_id: i64) -> Result<()> {
        self.ensure_root(data_pool_id)?;
        let step = LinkStep {
            parent: ROOT_INO,
            name: LOST_AND_FOUND_NAME.to_string(),
            child: LOST_AND_FOUND_INO,
            version: BOOTSTRAP_VERSION,
        };
        self.link_directory(&step, data_pool_id)?;
        self.find_or_create_dirfrag(LOST_AND_FOUND_INO)?;
        Ok(())
    }

    /// Make `step.parent/step.name` a directory pointing at `step.child`
    fn link_directory(&self, step: &LinkStep, data_pool_id: i64) -> Result<()> {
        let (_, created) = self.find_or_create_dirfrag(step.parent)?;
        if !created {
            match self.read_dentry(step.parent, Frag::ROOT, &step.name)? {
                Some(Dentry::Primary(existing))
                    if existing.ino == step.child && existing.is_dir() =>
                {
                    return Ok(());
                }
                Some(existing) => {
                    tracing::warn!(
                        "Dentry {:x}/{} points to {:x}, relinking to directory {:x}",
                        step.parent,
                        step.name,
                        existing.ino(),
                        step.child
                    );
                }
                None => {}
            }
        }
        let dir =
            InodeRecord::directory(step.child, RECOVERED_DIR_MODE, data_pool_id, step.version);
        self.inject_linkage(step.parent, &step.name, &dir)
    }

    /// Make `parent/name` point at the file `inode`, refreshing stale copies
    fn link_file(&self, parent: u64, name: &str, inode: &InodeRecord) -> Result<()> {
        let (_, created) = self.find_or_create_dirfrag(parent)?;
        if !created {
            match self.read_dentry(parent, Frag::ROOT, name)? {
                Some(Dentry::Primary(existing)) if existing == *inode => return Ok(()),
                Some(existing) if existing.ino() != inode.ino => {
                    tracing::warn!(
                        "Dentry {:x}/{} points to {:x}, overwriting with {:x}",
                        parent,
                        name,
                        existing.ino(),
                        inode.ino
                    );
                }
                _ => {}
            }
        }
        self.inject_linkage(parent, name, inode)
    }

    /// Entries of a directory as `(name, dentry)`, sorted by name
    pub fn list_dir(&self, ino: u64) -> Result<Vec<(String, Dentry)>> {
        let pool = self.pool()?;
        let oid = dirfrag_object_name(ino, Frag::ROOT);
        let mut entries = Vec::new();
        for key in pool.omap_keys(&oid)? {
            let Some(name) = dentry_name(&key) else {
                continue;
            };
            if let Some(raw) = pool.omap_get(&oid, &key)? {
                entries.push((name.to_string(), Dentry::from_bytes(&raw)?));
            }
        }
        Ok(entries)
    }

    /// Every path reachable from the root, e.g. `/home/user/file.txt`
    pub fn list_paths(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut visited = HashSet::from([ROOT_INO]);
        let mut pending = vec![(ROOT_INO, String::new())];

        while let Some((dir_ino, prefix)) = pending.pop() {
            for (name, dentry) in self.list_dir(dir_ino)? {
                let path = format!("{}/{}", prefix, name);
                let is_dir = dentry.inode().map(|i| i.is_dir()).unwrap_or(false);
                if is_dir && visited.insert(dentry.ino()) {
                    pending.push((dentry.ino(), path.clone()));
                }
                paths.push(path);
            }
        }

        paths.sort();
        Ok(paths)
    }
}

impl RecoveryDriver for MetadataDriver {
    fn init(&mut self, cluster: &dyn Cluster, fsmap: &FsMap) -> Result<()> {
        fsmap.validate()?;
        let pool = cluster.open_pool(fsmap.metadata_pool)?;
        tracing::info!(
            "Opened metadata pool {} for filesystem '{}'",
            pool.pool_id(),
            fsmap.fs_name
        );
        self.metadata_pool = Some(pool);
        Ok(())
    }

    fn init_metadata(&self, data_pool_id: i64) -> Result<()> {
        self.ensure_root(data_pool_id)?;

        let mydir = mdsdir_ino(0);
        self.inject_unlinked_inode(mydir, MDSDIR_MODE, data_pool_id)?;
        self.find_or_create_dirfrag(mydir)?;

        self.ensure_lost_and_found(data_pool_id)?;
        tracing::info!("Metadata roots present (data pool {})", data_pool_id);
        Ok(())
    }

    fn check_roots(&self) -> Result<bool> {
        for ino in [ROOT_INO, mdsdir_ino(0)] {
            if !self.root_exists(ino)? {
                tracing::info!("Root inode {:x} is missing", ino);
                return Ok(false);
            }
        }
        if !self.lost_and_found_exists()? {
            tracing::info!("{} is missing", LOST_AND_FOUND_NAME);
            return Ok(false);
        }
        Ok(true)
    }

    fn inject_with_backtrace(
        &self,
        backtrace: &InodeBacktrace,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: i64,
    ) -> Result<()> {
        let (anchor, steps) = match backtrace.linkage_plan() {
            LinkagePlan::Chain { anchor, steps } => (anchor, steps),
            LinkagePlan::Orphan(reason) => {
                tracing::debug!(
                    "Backtrace of {:x} unusable ({:?}), using {}",
                    backtrace.ino,
                    reason,
                    LOST_AND_FOUND_NAME
                );
                return self.inject_lost_and_found(
                    backtrace.ino,
                    size,
                    mtime,
                    chunk_size,
                    data_pool_id,
                );
            }
        };
        let Some((leaf, ancestors)) = steps.split_last() else {
            return self.inject_lost_and_found(backtrace.ino, size, mtime, chunk_size, data_pool_id);
        };

        match anchor {
            Anchor::Root => self.ensure_root(data_pool_id)?,
            Anchor::LostAndFound => self.ensure_lost_and_found(data_pool_id)?,
        }

        for step in ancestors {
            self.link_directory(step, data_pool_id)?;
        }

        let inode = InodeRecord::file(
            backtrace.ino,
            size,
            mtime,
            chunk_size,
            data_pool_id,
            leaf.version,
        );
        self.link_file(leaf.parent, &leaf.name, &inode)?;

        tracing::debug!(
            "Injected {:x} at {}",
            backtrace.ino,
            backtrace.display_path()
        );
        Ok(())
    }

    fn inject_lost_and_found(
        &self,
        ino: u64,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: i64,
    ) -> Result<()> {
        if !self.lost_and_found_exists()? {
            self.ensure_lost_and_found(data_pool_id)?;
        }

        let inode =
            InodeRecord::file(ino, size, mtime, chunk_size, data_pool_id, BOOTSTRAP_VERSION);
        self.link_file(LOST_AND_FOUND_INO, &lost_and_found_name(ino), &inode)?;

        tracing::debug!("Injected {:x} into {}", ino, LOST_AND_FOUND_NAME);
        Ok(())
    }
}
