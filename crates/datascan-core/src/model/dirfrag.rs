//! Directory fragments, fnodes and dentries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::codec::{Decode, Decoder, Encode, Encoder};
use super::inode::InodeRecord;
use crate::error::DecodeError;

/// Selects a slice of a directory's dentry hash space.
///
/// Directories rebuilt by recovery are never split, so everything this crate
/// writes lives in [`Frag::ROOT`]; the packed form still follows the general
/// `(value, bits)` encoding so object names match a live filesystem's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frag {
    value: u32,
    bits: u8,
}

impl Frag {
    pub const ROOT: Frag = Frag { value: 0, bits: 0 };

    /// Packed form used in object names: bits in the top byte, value below
    pub fn raw(&self) -> u32 {
        ((self.bits as u32) << 24) | (self.value >> 8)
    }
}

impl fmt::Display for Frag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bits == 0 {
            write!(f, "*")
        } else {
            write!(f, "{:x}/{}", self.value >> (32 - self.bits as u32), self.bits)
        }
    }
}

/// Object holding the fragment `frag` of directory `ino`
pub fn dirfrag_object_name(ino: u64, frag: Frag) -> String {
    format!("{:x}.{:08x}", ino, frag.raw())
}

/// Omap key of a head dentry
pub fn dentry_key(name: &str) -> String {
    format!("{}_head", name)
}

/// Inverse of [`dentry_key`]; snapshot dentries and foreign keys yield `None`
pub fn dentry_name(key: &str) -> Option<&str> {
    key.strip_suffix("_head")
}

/// Per-fragment metadata, stored in the fragment object's omap header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fnode {
    pub version: u64,
    pub nfiles: u64,
    pub nsubdirs: u64,
    pub mtime: DateTime<Utc>,
}

impl Default for Fnode {
    fn default() -> Self {
        Self {
            version: 1,
            nfiles: 0,
            nsubdirs: 0,
            mtime: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Encode for Fnode {
    fn encode(&self, enc: &mut Encoder) {
        enc.envelope(1, 1, |e| {
            e.put_u64(self.version);
            e.put_u64(self.nfiles);
            e.put_u64(self.nsubdirs);
            e.put_time(&self.mtime);
        });
    }
}

impl Decode for Fnode {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.envelope(1, |d, _| {
            Ok(Fnode {
                version: d.get_u64()?,
                nfiles: d.get_u64()?,
                nsubdirs: d.get_u64()?,
                mtime: d.get_time()?,
            })
        })
    }
}

const DENTRY_PRIMARY: u8 = b'I';
const DENTRY_REMOTE: u8 = b'L';

/// A named link from a fragment to a child inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dentry {
    /// Owns the child inode, embedding it in full
    Primary(InodeRecord),
    /// Hard link to an inode that lives elsewhere; never written by recovery
    Remote { ino: u64, d_type: u8 },
}

impl Dentry {
    pub fn ino(&self) -> u64 {
        match self {
            Dentry::Primary(inode) => inode.ino,
            Dentry::Remote { ino, .. } => *ino,
        }
    }

    pub fn inode(&self) -> Option<&InodeRecord> {
        match self {
            Dentry::Primary(inode) => Some(inode),
            Dentry::Remote { .. } => None,
        }
    }
}

impl Encode for Dentry {
    fn encode(&self, enc: &mut Encoder) {
        match self {
            Dentry::Primary(inode) => {
                enc.put_u8(DENTRY_PRIMARY);
                inode.encode(enc);
            }
            Dentry::Remote { ino, d_type } => {
                enc.put_u8(DENTRY_REMOTE);
                enc.put_u64(*ino);
                enc.put_u8(*d_type);
            }
        }
    }
}

impl Decode for Dentry {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        match dec.get_u8()? {
            DENTRY_PRIMARY => Ok(Dentry::Primary(InodeRecord::decode(dec)?)),
            DENTRY_REMOTE => Ok(Dentry::Remote {
                ino: dec.get_u64()?,
                d_type: dec.get_u8()?,
            }),
            other => Err(DecodeError::Malformed(format!(
                "unknown dentry type 0x{:02x}",
                other
            ))),
        }
    }
}
