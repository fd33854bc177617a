//! Backtraces recovered from data objects
//!
//! A backtrace lists the ancestors of a file from its immediate parent
//! outward. Each ancestor names a directory inode (`dirino`) and the name
//! (`dname`) of the next-inner entry inside that directory, so
//! `ancestors[0].dname` is the file's own name.
//!
//! Drivers never walk the raw ancestor list themselves: they ask for a
//! [`LinkagePlan`], which orders the links root-to-leaf and decides where a
//! chain without a known root is anchored.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::codec::{Decode, Decoder, Encode, Encoder};
use super::inode::{
    is_system_ino, lost_and_found_name, LOST_AND_FOUND_INO, LOST_AND_FOUND_NAME, ROOT_INO,
};
use crate::error::DecodeError;

/// One `(directory, name-within-it)` hop of a backtrace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktraceAncestor {
    pub dirino: u64,
    pub dname: String,
    pub version: u64,
}

impl BacktraceAncestor {
    pub fn new(dirino: u64, dname: impl Into<String>, version: u64) -> Self {
        Self {
            dirino,
            dname: dname.into(),
            version,
        }
    }
}

impl Encode for BacktraceAncestor {
    fn encode(&self, enc: &mut Encoder) {
        enc.envelope(1, 1, |e| {
            e.put_u64(self.dirino);
            e.put_str(&self.dname);
            e.put_u64(self.version);
        });
    }
}

impl Decode for BacktraceAncestor {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.envelope(1, |d, _| {
            Ok(BacktraceAncestor {
                dirino: d.get_u64()?,
                dname: d.get_str()?,
                version: d.get_u64()?,
            })
        })
    }
}

/// Recorded ancestry of one file inode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeBacktrace {
    pub ino: u64,
    pub ancestors: Vec<BacktraceAncestor>,
    /// Pool the file's data was last written to
    pub pool: i64,
    #[serde(default)]
    pub old_pools: Vec<i64>,
}

impl InodeBacktrace {
    pub fn new(ino: u64, pool: i64) -> Self {
        Self {
            ino,
            ancestors: Vec::new(),
            pool,
            old_pools: Vec::new(),
        }
    }

    /// Append the next ancestor outward
    pub fn with_ancestor(mut self, dirino: u64, dname: impl Into<String>, version: u64) -> Self {
        self.ancestors.push(BacktraceAncestor::new(dirino, dname, version));
        self
    }

    /// Human-readable path for log messages, e.g. `/home/user/file.txt`
    pub fn display_path(&self) -> String {
        let mut path = String::new();
        for ancestor in self.ancestors.iter().rev() {
            path.push('/');
            path.push_str(&ancestor.dname);
        }
        if self.ancestors.last().map(|a| a.dirino) != Some(ROOT_INO) {
            path.insert_str(0, "...");
        }
        path
    }

    /// Names are valid, no directory repeats, and the root-set inodes only
    /// appear where they can live: root as the outermost ancestor, system
    /// directories only inside a chain ending in one, lost+found nowhere.
    fn is_well_formed(&self) -> bool {
        if is_reserved_ino(self.ino) {
            return false;
        }
        let mut seen = HashSet::from([self.ino]);
        let outermost = self.ancestors.len().saturating_sub(1);
        let in_system_dir = self
            .ancestors
            .last()
            .map_or(false, |a| is_system_ino(a.dirino));
        self.ancestors.iter().enumerate().all(|(i, a)| {
            let inner = i < outermost;
            let misplaced = a.dirino == LOST_AND_FOUND_INO
                || (inner && a.dirino == ROOT_INO)
                || (inner && is_system_ino(a.dirino) && !in_system_dir);
            valid_dentry_name(&a.dname) && !misplaced && seen.insert(a.dirino)
        })
    }

    /// Order the links needed to make this inode reachable.
    pub fn linkage_plan(&self) -> LinkagePlan {
        let outermost = match self.ancestors.last() {
            Some(a) => a,
            None => return LinkagePlan::Orphan(OrphanReason::NoAncestors),
        };
        if !self.is_well_formed() {
            return LinkagePlan::Orphan(OrphanReason::Malformed);
        }
        if is_system_ino(outermost.dirino) {
            // Unlinked files parked in a stray directory
            return LinkagePlan::Orphan(OrphanReason::Stray);
        }

        let mut steps = Vec::with_capacity(self.ancestors.len() + 1);
        for (i, ancestor) in self.ancestors.iter().enumerate().rev() {
            let child = if i == 0 {
                self.ino
            } else {
                self.ancestors[i - 1].dirino
            };
            steps.push(LinkStep {
                parent: ancestor.dirino,
                name: ancestor.dname.clone(),
                child,
                version: ancestor.version,
            });
        }

        let top = &steps[0];
        let anchor = if top.parent != ROOT_INO {
            let child = top.parent;
            steps.insert(
                0,
                LinkStep {
                    parent: LOST_AND_FOUND_INO,
                    name: lost_and_found_name(child),
                    child,
                    version: outermost.version,
                },
            );
            Anchor::LostAndFound
        } else if top.name == LOST_AND_FOUND_NAME {
            // `/lost+found` belongs to the root set; whatever else claimed
            // that name is parked inside it under its inode number
            let (child, version) = (top.child, top.version);
            steps[0] = LinkStep {
                parent: LOST_AND_FOUND_INO,
                name: lost_and_found_name(child),
                child,
                version,
            };
            Anchor::LostAndFound
        } else {
            Anchor::Root
        };

        LinkagePlan::Chain { anchor, steps }
    }
}

/// Inodes a recovered file can never be
fn is_reserved_ino(ino: u64) -> bool {
    ino == ROOT_INO || ino == LOST_AND_FOUND_INO || is_system_ino(ino)
}

fn valid_dentry_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

impl Encode for InodeBacktrace {
    fn encode(&self, enc: &mut Encoder) {
        enc.envelope(1, 1, |e| {
            e.put_u64(self.ino);
            e.put_u32(self.ancestors.len() as u32);
            for ancestor in &self.ancestors {
                ancestor.encode(e);
            }
            e.put_i64(self.pool);
            e.put_u32(self.old_pools.len() as u32);
            for pool in &self.old_pools {
                e.put_i64(*pool);
            }
        });
    }
}

impl Decode for InodeBacktrace {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.envelope(1, |d, _| {
            let ino = d.get_u64()?;
            let count = d.get_u32()? as usize;
            // Each ancestor needs at least its envelope header
            if count > d.remaining() / 6 {
                return Err(DecodeError::Malformed(format!(
                    "ancestor count {} exceeds record size",
                    count
                )));
            }
            let mut ancestors = Vec::with_capacity(count);
            for _ in 0..count {
                ancestors.push(BacktraceAncestor::decode(d)?);
            }
            let pool = d.get_i64()?;
            let old_count = d.get_u32()? as usize;
            if old_count > d.remaining() / 8 {
                return Err(DecodeError::Malformed(format!(
                    "old pool count {} exceeds record size",
                    old_count
                )));
            }
            let mut old_pools = Vec::with_capacity(old_count);
            for _ in 0..old_count {
                old_pools.push(d.get_i64()?);
            }
            Ok(InodeBacktrace {
                ino,
                ancestors,
                pool,
                old_pools,
            })
        })
    }
}

/// Where the first link of a chain hangs from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Root,
    /// The outermost directory is unknown to us, so it is parked in
    /// lost+found under its inode number
    LostAndFound,
}

/// One dentry to create: `parent/name -> child`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStep {
    pub parent: u64,
    pub name: String,
    pub child: u64,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanReason {
    NoAncestors,
    Malformed,
    Stray,
}

/// Root-to-leaf links derived from a backtrace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkagePlan {
    /// Every step but the last links a directory; the last links the file
    Chain { anchor: Anchor, steps: Vec<LinkStep> },
    /// Ancestry is unusable; the file belongs in lost+found
    Orphan(OrphanReason),
}
