//! Inode records as stored in the metadata pool

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::codec::{Decode, Decoder, Encode, Encoder};
use crate::error::DecodeError;

/// Filesystem root directory
pub const ROOT_INO: u64 = 0x1;
/// Recovery-only directory for data without known ancestry
pub const LOST_AND_FOUND_INO: u64 = 0x4;
/// First per-rank system directory ("mydir"); rank N lives at offset + N
pub const MDSDIR_OFFSET: u64 = 0x100;
/// Upper bound (exclusive) of the system directory range, strays included
pub const MDSDIR_END: u64 = 0x200;
pub const LOST_AND_FOUND_NAME: &str = "lost+found";

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// Default object size used when the scanner could not tell us one (4 MiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 1 << 22;

/// System directory inode for an MDS rank
pub fn mdsdir_ino(rank: u32) -> u64 {
    MDSDIR_OFFSET + rank as u64
}

/// True for the system directories and the stray directories below them
pub fn is_system_ino(ino: u64) -> bool {
    (MDSDIR_OFFSET..MDSDIR_END).contains(&ino) || (0x600..0x700).contains(&ino)
}

/// Dentry name used for an inode parked in lost+found
pub fn lost_and_found_name(ino: u64) -> String {
    ino.to_string()
}

/// Name of the standalone object holding a root-set inode
pub fn inode_object_name(ino: u64) -> String {
    format!("{:x}.00000000.inode", ino)
}

/// How a file's content is striped across data objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    pub stripe_unit: u32,
    pub stripe_count: u32,
    pub object_size: u32,
    pub pool_id: i64,
}

impl FileLayout {
    /// Unstriped layout with one chunk per object, as the data scanner assumes
    pub fn chunked(chunk_size: u32, pool_id: i64) -> Self {
        Self {
            stripe_unit: chunk_size,
            stripe_count: 1,
            object_size: chunk_size,
            pool_id,
        }
    }
}

impl Encode for FileLayout {
    fn encode(&self, enc: &mut Encoder) {
        enc.envelope(1, 1, |e| {
            e.put_u32(self.stripe_unit);
            e.put_u32(self.stripe_count);
            e.put_u32(self.object_size);
            e.put_i64(self.pool_id);
        });
    }
}

impl Decode for FileLayout {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.envelope(1, |d, _| {
            Ok(FileLayout {
                stripe_unit: d.get_u32()?,
                stripe_count: d.get_u32()?,
                object_size: d.get_u32()?,
                pool_id: d.get_i64()?,
            })
        })
    }
}

/// Durable representation of one inode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub layout: FileLayout,
    pub version: u64,
}

impl InodeRecord {
    /// A recovered regular file
    pub fn file(
        ino: u64,
        size: u64,
        mtime: DateTime<Utc>,
        chunk_size: u32,
        data_pool_id: i64,
        version: u64,
    ) -> Self {
        Self {
            ino,
            mode: S_IFREG | 0o644,
            nlink: 1,
            size,
            mtime,
            ctime: mtime,
            layout: FileLayout::chunked(chunk_size, data_pool_id),
            version,
        }
    }

    /// A minimal directory, used for roots and for re-created ancestors.
    ///
    /// Times are left at the epoch: nothing in the data pool tells us when a
    /// directory was last modified.
    pub fn directory(ino: u64, mode: u32, data_pool_id: i64, version: u64) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            ino,
            mode: S_IFDIR | (mode & !S_IFMT),
            nlink: 1,
            size: 0,
            mtime: epoch,
            ctime: epoch,
            layout: FileLayout::chunked(DEFAULT_CHUNK_SIZE, data_pool_id),
            version,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

impl Encode for InodeRecord {
    fn encode(&self, enc: &mut Encoder) {
        enc.envelope(1, 1, |e| {
            e.put_u64(self.ino);
            e.put_u32(self.mode);
            e.put_u32(self.nlink);
            e.put_u64(self.size);
            e.put_time(&self.mtime);
            e.put_time(&self.ctime);
            self.layout.encode(e);
            e.put_u64(self.version);
        });
    }
}

impl Decode for InodeRecord {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.envelope(1, |d, _| {
            Ok(InodeRecord {
                ino: d.get_u64()?,
                mode: d.get_u32()?,
                nlink: d.get_u32()?,
                size: d.get_u64()?,
                mtime: d.get_time()?,
                ctime: d.get_time()?,
                layout: FileLayout::decode(d)?,
                version: d.get_u64()?,
            })
        })
    }
}
