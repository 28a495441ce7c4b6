// SPDX-License-Identifier: MPL-2.0

//! Value types shared between the wire codec, the metadata store, and the
//! binlog.

use int_to_c_enum::TryFromInt;

pub const NAME_MAX: usize = 255;
pub const PATH_MAX: usize = 4096;
/// Upper bound on tree depth; `get_full_path` refuses deeper walks.
pub const MAX_PATH_DEPTH: usize = 128;
pub const REPLICA_KEY_SIZE: usize = 8;

/// File-type bits carried in `mode`.
pub const MODE_TYPE_MASK: u32 = 0o170000;
pub const MODE_DIR: u32 = 0o040000;
pub const MODE_FILE: u32 = 0o100000;

pub const fn mode_is_dir(mode: u32) -> bool {
    mode & MODE_TYPE_MASK == MODE_DIR
}

/// Per-dentry metadata, exactly the fields the wire and the binlog carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DentryStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub size: i64,
}

/// A namespace name plus an absolute path inside it.
#[derive(Debug, Clone, Default)]
pub struct FullName {
    pub ns: Vec<u8>,
    pub path: Vec<u8>,
}

impl FullName {
    pub fn new(ns: &[u8], path: &[u8]) -> Self {
        Self {
            ns: ns.to_vec(),
            path: path.to_vec(),
        }
    }
}

/// The identity an advisory lock is held under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlockOwner {
    pub tid: u64,
    pub pid: u32,
}

bitflags::bitflags! {
    /// Lock operation word of the flock request (the classic flock(2) bits).
    pub struct LockOp: u32 {
        const SH = 1;
        const EX = 2;
        const NB = 4;
        const UN = 8;
    }
}

/// `sys_unlock` flag: apply the carried new size on release.
pub const SYS_UNLOCK_FLAG_SET_SIZE: u32 = 1;

/// Externally visible replica state, persisted in `cluster.info` and
/// reported by the stat commands.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromInt)]
pub enum ServerStatus {
    Init = 0,
    Building = 10,
    Offline = 21,
    Syncing = 22,
    Active = 23,
}

/// A byte position inside the rotated binlog: `index` names the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinlogPosition {
    pub index: u32,
    pub offset: u64,
}
