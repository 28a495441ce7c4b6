// SPDX-License-Identifier: MPL-2.0

//! The binlog record value type.

use crate::types::{DentryStat, FullName};

bitflags::bitflags! {
    /// Which optional fields a record carries.
    ///
    /// The same mask doubles as the `mflags` vocabulary of the
    /// modify-dentry-stat command and as the modified-field report of
    /// `check_set_dentry_size`.
    pub struct RecordOptions: u64 {
        const NS         = 1 << 0;
        const PATH       = 1 << 1;
        const HASH_CODE  = 1 << 4;
        const USER_DATA  = 1 << 5;
        const EXTRA_DATA = 1 << 6;
        const MODE       = 1 << 7;
        const ATIME      = 1 << 8;
        const CTIME      = 1 << 9;
        const MTIME      = 1 << 10;
        const GID        = 1 << 11;
        const UID        = 1 << 12;
        const SIZE       = 1 << 13;

        const PATH_ENABLED = Self::NS.bits | Self::PATH.bits;
        /// The stat fields a client may set via modify-dentry-stat.
        const STAT_MASK = Self::MODE.bits | Self::ATIME.bits | Self::CTIME.bits
            | Self::MTIME.bits | Self::UID.bits | Self::GID.bits | Self::SIZE.bits;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOp {
    None = 0,
    Create = 1,
    Remove = 2,
    /// Reserved in the vocabulary; no operation emits it yet.
    Rename = 3,
    Update = 4,
}

impl RecordOp {
    pub fn label(self) -> &'static str {
        match self {
            RecordOp::Create => "cre",
            RecordOp::Remove => "rmv",
            RecordOp::Rename => "rnm",
            RecordOp::Update => "upd",
            RecordOp::None => "none",
        }
    }

    pub fn from_label(label: &[u8]) -> RecordOp {
        match label {
            b"cre" => RecordOp::Create,
            b"rmv" => RecordOp::Remove,
            b"rnm" => RecordOp::Rename,
            b"upd" => RecordOp::Update,
            _ => RecordOp::None,
        }
    }
}

/// One mutation, as it travels from the request handler through the data
/// threads into the binlog and out to the slaves.
#[derive(Debug, Clone)]
pub struct BinlogRecord {
    pub inode: u64,
    pub data_version: u64,
    pub operation: RecordOp,
    /// Seconds since the epoch, stamped when the record is packed.
    pub timestamp: i64,
    /// Namespace hash routing the record to its data thread.
    pub hash_code: u32,
    pub fullname: FullName,
    pub extra_data: Vec<u8>,
    pub user_data: Vec<u8>,
    pub stat: DentryStat,
    pub options: RecordOptions,
}

impl Default for BinlogRecord {
    fn default() -> Self {
        Self {
            inode: 0,
            data_version: 0,
            operation: RecordOp::None,
            timestamp: 0,
            hash_code: 0,
            fullname: FullName::default(),
            extra_data: Vec::new(),
            user_data: Vec::new(),
            stat: DentryStat::default(),
            options: RecordOptions::empty(),
        }
    }
}

impl BinlogRecord {
    /// A mutation addressed by `(ns, path)`, the shape the service
    /// handlers allocate.
    pub fn with_fullname(operation: RecordOp, fullname: FullName, hash_code: u32) -> Self {
        Self {
            operation,
            fullname,
            hash_code,
            options: RecordOptions::PATH_ENABLED,
            ..Default::default()
        }
    }
}
