//! Metadata model: backtraces, inodes, directory fragments and their codec

pub mod backtrace;
pub mod codec;
pub mod dirfrag;
pub mod inode;

pub use backtrace::{Anchor, BacktraceAncestor, InodeBacktrace, LinkStep, LinkagePlan, OrphanReason};
pub use codec::{Decode, Decoder, Encode, Encoder};
pub use dirfrag::{dentry_key, dentry_name, dirfrag_object_name, Dentry, Fnode, Frag};
pub use inode::{
    inode_object_name, is_system_ino, lost_and_found_name, mdsdir_ino, FileLayout, InodeRecord,
    DEFAULT_CHUNK_SIZE, LOST_AND_FOUND_INO, LOST_AND_FOUND_NAME, MDSDIR_OFFSET, ROOT_INO, S_IFDIR,
    S_IFMT, S_IFREG,
};
