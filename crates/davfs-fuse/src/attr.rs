use std::time::SystemTime;

use crate::config::FsConfig;
use crate::node::{NodeKind, NodeSnapshot};

pub const FILE_PERM: u16 = 0o644;
pub const DIR_PERM: u16 = 0o755;

/// Attribute record handed to the kernel, with the duration it may be
/// cached for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attr {
    pub kind: NodeKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
    pub valid: std::time::Duration,
}

impl Attr {
    pub fn from_snapshot(snap: &NodeSnapshot, config: &FsConfig) -> Self {
        let perm = match snap.kind {
            NodeKind::File => FILE_PERM,
            NodeKind::Directory => DIR_PERM,
        };
        Attr {
            kind: snap.kind,
            size: snap.size,
            blocks: blocks_for_size(snap.size),
            atime: snap.atime,
            mtime: snap.mtime,
            ctime: snap.ctime,
            crtime: snap.ctime,
            perm,
            nlink: 1,
            uid: config.uid,
            gid: config.gid,
            blksize: config.block_size,
            valid: config.attr_timeout,
        }
    }

    pub fn to_fuser(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: kind_to_fuser_type(self.kind),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

pub fn blocks_for_size(size: u64) -> u64 {
    size.div_ceil(512)
}

pub fn kind_to_fuser_type(kind: NodeKind) -> fuser::FileType {
    match kind {
        NodeKind::File => fuser::FileType::RegularFile,
        NodeKind::Directory => fuser::FileType::Directory,
    }
}
