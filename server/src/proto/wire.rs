// SPDX-License-Identifier: MPL-2.0

//! Typed request/reply bodies.
//!
//! Each struct mirrors one wire layout; `unpack` consumes a [`BodyReader`]
//! and `pack` appends to a [`BodyWriter`]. Validation that needs request
//! context (length echoes, admission) stays in the handlers.

use super::{BodyReader, BodyWriter};
use crate::prelude::*;
use crate::types::{DentryStat, FlockOwner, FullName, NAME_MAX, PATH_MAX, REPLICA_KEY_SIZE};

/// Times on the wire are 32-bit epoch seconds.
pub fn pack_dentry_stat(writer: &mut BodyWriter, stat: &DentryStat) {
    writer
        .put_u32(stat.mode)
        .put_u32(stat.uid)
        .put_u32(stat.gid)
        .put_u32(stat.atime as u32)
        .put_u32(stat.ctime as u32)
        .put_u32(stat.mtime as u32)
        .put_i64(stat.size);
}

pub fn unpack_dentry_stat(reader: &mut BodyReader) -> Result<DentryStat> {
    Ok(DentryStat {
        mode: reader.u32()?,
        uid: reader.u32()?,
        gid: reader.u32()?,
        atime: reader.u32()? as i64,
        ctime: reader.u32()? as i64,
        mtime: reader.u32()? as i64,
        size: reader.i64()?,
    })
}

/// `{ns_len:u8, path_len:u16, ns, path}` with the input checks every
/// path-addressed command shares.
pub fn unpack_dentry_info(reader: &mut BodyReader) -> Result<FullName> {
    let ns_len = reader.u8()? as usize;
    let path_len = reader.u16()? as usize;
    if ns_len == 0 {
        return_errno_with_message!(Errno::EINVAL, "invalid namespace length: 0");
    }
    if ns_len > NAME_MAX {
        return_errno_with_message!(Errno::EINVAL, "namespace length exceeds NAME_MAX");
    }
    if path_len == 0 {
        return_errno_with_message!(Errno::EINVAL, "invalid path length: 0");
    }
    if path_len > PATH_MAX {
        return_errno_with_message!(Errno::EINVAL, "path length exceeds PATH_MAX");
    }
    let ns = reader.bytes(ns_len)?.to_vec();
    let path = reader.bytes(path_len)?.to_vec();
    if path[0] != b'/' {
        return_errno_with_message!(Errno::EINVAL, "path must start with /");
    }
    Ok(FullName { ns, path })
}

pub fn pack_dentry_info(writer: &mut BodyWriter, fullname: &FullName) {
    writer.put_u8(fullname.ns.len() as u8);
    writer.put_u16(fullname.path.len() as u16);
    writer.put_bytes(&fullname.ns);
    writer.put_bytes(&fullname.path);
}

/// Reply body of every stat-shaped command: `{inode:u64, stat}`.
pub fn pack_stat_reply(inode: u64, stat: &DentryStat) -> Vec<u8> {
    let mut writer = BodyWriter::with_capacity(8 + 32);
    writer.put_u64(inode);
    pack_dentry_stat(&mut writer, stat);
    writer.into_bytes()
}

pub struct CreateByPNameReq {
    pub parent_inode: u64,
    pub mode: u32,
    pub ns: Vec<u8>,
    pub name: Vec<u8>,
}

impl CreateByPNameReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let parent_inode = reader.u64()?;
        let mode = reader.u32()?;
        let ns_len = reader.u8()? as usize;
        let name_len = reader.u8()? as usize;
        if ns_len == 0 || name_len == 0 {
            return_errno_with_message!(Errno::EINVAL, "invalid namespace or name length: 0");
        }
        Ok(Self {
            parent_inode,
            mode,
            ns: reader.bytes(ns_len)?.to_vec(),
            name: reader.bytes(name_len)?.to_vec(),
        })
    }
}

pub struct StatByPNameReq {
    pub parent_inode: u64,
    pub name: Vec<u8>,
}

impl StatByPNameReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let parent_inode = reader.u64()?;
        let name_len = reader.u8()? as usize;
        if name_len == 0 || name_len > NAME_MAX {
            return_errno_with_message!(Errno::EINVAL, "invalid name length");
        }
        Ok(Self {
            parent_inode,
            name: reader.bytes(name_len)?.to_vec(),
        })
    }
}

pub struct SetDentrySizeReq {
    pub inode: u64,
    pub size: i64,
    pub force: bool,
    pub ns: Vec<u8>,
}

impl SetDentrySizeReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let inode = reader.u64()?;
        let size = reader.i64()?;
        let force = reader.u8()? != 0;
        let ns_len = reader.u8()? as usize;
        if ns_len == 0 {
            return_errno_with_message!(Errno::EINVAL, "invalid namespace length: 0");
        }
        Ok(Self {
            inode,
            size,
            force,
            ns: reader.bytes(ns_len)?.to_vec(),
        })
    }
}

pub struct ModifyDentryStatReq {
    pub inode: u64,
    pub mflags: u64,
    pub stat: DentryStat,
    pub ns: Vec<u8>,
}

impl ModifyDentryStatReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let inode = reader.u64()?;
        let mflags = reader.u64()?;
        let stat = unpack_dentry_stat(reader)?;
        let ns_len = reader.u8()? as usize;
        if ns_len == 0 {
            return_errno_with_message!(Errno::EINVAL, "invalid namespace length: 0");
        }
        Ok(Self {
            inode,
            mflags,
            stat,
            ns: reader.bytes(ns_len)?.to_vec(),
        })
    }
}

pub struct FlockDentryReq {
    pub inode: u64,
    pub offset: i64,
    pub length: i64,
    pub owner: FlockOwner,
    pub operation: u32,
}

impl FlockDentryReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        Ok(Self {
            inode: reader.u64()?,
            offset: reader.i64()?,
            length: reader.i64()?,
            owner: FlockOwner {
                tid: reader.u64()?,
                pid: reader.u32()?,
            },
            operation: reader.u32()?,
        })
    }
}

pub struct GetlkDentryReq {
    pub inode: u64,
    pub offset: i64,
    pub length: i64,
    pub operation: u32,
}

impl GetlkDentryReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        Ok(Self {
            inode: reader.u64()?,
            offset: reader.i64()?,
            length: reader.i64()?,
            operation: reader.u32()?,
        })
    }
}

pub fn pack_getlk_reply(
    offset: i64,
    length: i64,
    owner: &FlockOwner,
    lock_type: u32,
) -> Vec<u8> {
    let mut writer = BodyWriter::with_capacity(32);
    writer
        .put_i64(offset)
        .put_i64(length)
        .put_u64(owner.tid)
        .put_u32(owner.pid)
        .put_u32(lock_type);
    writer.into_bytes()
}

pub struct SysLockDentryReq {
    pub inode: u64,
    pub flags: u32,
}

impl SysLockDentryReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let inode = reader.u64()?;
        let flags = reader.u32()?;
        let _padding = reader.u32()?;
        Ok(Self { inode, flags })
    }
}

pub struct SysUnlockDentryReq {
    pub inode: u64,
    pub old_size: i64,
    pub new_size: i64,
    pub flags: u32,
    pub force: bool,
    pub ns: Vec<u8>,
}

impl SysUnlockDentryReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let inode = reader.u64()?;
        let old_size = reader.i64()?;
        let new_size = reader.i64()?;
        let flags = reader.u32()?;
        let force = reader.u8()? != 0;
        let ns_len = reader.u8()? as usize;
        let ns = reader.bytes(ns_len)?.to_vec();
        Ok(Self {
            inode,
            old_size,
            new_size,
            flags,
            force,
            ns,
        })
    }
}

pub struct ListDentryNextReq {
    pub token: u64,
    pub offset: u32,
}

impl ListDentryNextReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let token = reader.u64()?;
        let offset = reader.u32()?;
        let _padding = reader.u32()?;
        Ok(Self { token, offset })
    }
}

/// `{cluster_id, server_id, config_sign, key}` sent by a slave to the node
/// it believes is master.
pub struct JoinMasterReq {
    pub cluster_id: u32,
    pub server_id: u32,
    pub config_sign: [u8; 16],
    pub key: [u8; REPLICA_KEY_SIZE],
}

impl JoinMasterReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let cluster_id = reader.u32()?;
        let server_id = reader.u32()?;
        let config_sign = reader.bytes(16)?.try_into().unwrap();
        let key = reader.bytes(REPLICA_KEY_SIZE)?.try_into().unwrap();
        Ok(Self {
            cluster_id,
            server_id,
            config_sign,
            key,
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut writer = BodyWriter::with_capacity(32);
        writer.put_u32(self.cluster_id).put_u32(self.server_id);
        writer.put_bytes(&self.config_sign);
        writer.put_bytes(&self.key);
        writer.into_bytes()
    }
}

pub struct GetServerStatusReq {
    pub server_id: u32,
    pub config_sign: [u8; 16],
}

impl GetServerStatusReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let server_id = reader.u32()?;
        let config_sign = reader.bytes(16)?.try_into().unwrap();
        Ok(Self {
            server_id,
            config_sign,
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut writer = BodyWriter::with_capacity(20);
        writer.put_u32(self.server_id);
        writer.put_bytes(&self.config_sign);
        writer.into_bytes()
    }
}

pub struct GetServerStatusResp {
    pub is_master: bool,
    pub status: u8,
    pub server_id: u32,
    pub data_version: u64,
}

impl GetServerStatusResp {
    pub fn pack(&self) -> Vec<u8> {
        let mut writer = BodyWriter::with_capacity(16);
        writer.put_u8(self.is_master as u8).put_u8(self.status);
        writer.put_u32(self.server_id).put_u64(self.data_version);
        writer.into_bytes()
    }

    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        Ok(Self {
            is_master: reader.u8()? != 0,
            status: reader.u8()?,
            server_id: reader.u32()?,
            data_version: reader.u64()?,
        })
    }
}

/// `{cluster_id, server_id, buffer_size, key}` from the master when it
/// opens a replication link.
pub struct JoinSlaveReq {
    pub cluster_id: u32,
    pub server_id: u32,
    pub buffer_size: u32,
    pub key: [u8; REPLICA_KEY_SIZE],
}

impl JoinSlaveReq {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        let cluster_id = reader.u32()?;
        let server_id = reader.u32()?;
        let buffer_size = reader.u32()?;
        let key = reader.bytes(REPLICA_KEY_SIZE)?.try_into().unwrap();
        Ok(Self {
            cluster_id,
            server_id,
            buffer_size,
            key,
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut writer = BodyWriter::with_capacity(20);
        writer
            .put_u32(self.cluster_id)
            .put_u32(self.server_id)
            .put_u32(self.buffer_size);
        writer.put_bytes(&self.key);
        writer.into_bytes()
    }
}

/// The slave's resume hint: where the master should start streaming.
pub struct JoinSlaveResp {
    pub binlog_index: u32,
    pub binlog_offset: u64,
    pub last_data_version: u64,
}

impl JoinSlaveResp {
    pub fn pack(&self) -> Vec<u8> {
        let mut writer = BodyWriter::with_capacity(20);
        writer
            .put_u32(self.binlog_index)
            .put_u64(self.binlog_offset)
            .put_u64(self.last_data_version);
        writer.into_bytes()
    }

    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        Ok(Self {
            binlog_index: reader.u32()?,
            binlog_offset: reader.u64()?,
            last_data_version: reader.u64()?,
        })
    }
}

pub struct PushBinlogReqHeader {
    pub binlog_length: u32,
    pub last_data_version: u64,
}

pub const PUSH_BINLOG_REQ_HEADER_SIZE: usize = 12;

impl PushBinlogReqHeader {
    pub fn unpack(reader: &mut BodyReader) -> Result<Self> {
        Ok(Self {
            binlog_length: reader.u32()?,
            last_data_version: reader.u64()?,
        })
    }

    pub fn pack(&self) -> [u8; PUSH_BINLOG_REQ_HEADER_SIZE] {
        let mut buf = [0u8; PUSH_BINLOG_REQ_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.binlog_length.to_be_bytes());
        buf[4..12].copy_from_slice(&self.last_data_version.to_be_bytes());
        buf
    }
}

/// One `(data_version, err_no)` acknowledgement entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushResultEntry {
    pub data_version: u64,
    pub err_no: u16,
}

pub fn pack_push_binlog_resp(entries: &[PushResultEntry]) -> Vec<u8> {
    let mut writer = BodyWriter::with_capacity(4 + entries.len() * 10);
    writer.put_u32(entries.len() as u32);
    for entry in entries {
        writer.put_u64(entry.data_version).put_u16(entry.err_no);
    }
    writer.into_bytes()
}

pub fn unpack_push_binlog_resp(reader: &mut BodyReader) -> Result<Vec<PushResultEntry>> {
    let count = reader.u32()? as usize;
    if reader.remain() != count * 10 {
        return_errno_with_message!(Errno::EINVAL, "push result body length mismatch");
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(PushResultEntry {
            data_version: reader.u64()?,
            err_no: reader.u16()?,
        });
    }
    Ok(entries)
}

/// `{server_id, addr}` used by get-master and get-readable-server replies.
pub fn pack_server_reply(server_id: u32, addr: &str) -> Vec<u8> {
    let mut writer = BodyWriter::with_capacity(8 + addr.len());
    writer.put_u32(server_id);
    writer.put_u8(addr.len() as u8);
    writer.put_bytes(addr.as_bytes());
    writer.into_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dentry_stat_round_trip() {
        let stat = DentryStat {
            mode: 0o100644,
            uid: 500,
            gid: 501,
            atime: 1000,
            ctime: 1001,
            mtime: 1002,
            size: 4096,
        };
        let mut writer = BodyWriter::new();
        pack_dentry_stat(&mut writer, &stat);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 32);
        let unpacked = unpack_dentry_stat(&mut BodyReader::new(&bytes)).unwrap();
        assert_eq!(unpacked, stat);
    }

    #[test]
    fn dentry_info_validation() {
        // ns_len 0
        let mut writer = BodyWriter::new();
        writer.put_u8(0).put_u16(1).put_bytes(b"/");
        let bytes = writer.into_bytes();
        assert!(unpack_dentry_info(&mut BodyReader::new(&bytes)).is_err());

        // path not absolute
        let mut writer = BodyWriter::new();
        writer.put_u8(2).put_u16(1).put_bytes(b"nsx");
        let bytes = writer.into_bytes();
        assert!(unpack_dentry_info(&mut BodyReader::new(&bytes)).is_err());

        // well-formed
        let mut writer = BodyWriter::new();
        pack_dentry_info(
            &mut writer,
            &FullName::new(b"ns", b"/a/b"),
        );
        let bytes = writer.into_bytes();
        let fullname = unpack_dentry_info(&mut BodyReader::new(&bytes)).unwrap();
        assert_eq!(fullname.ns, b"ns");
        assert_eq!(fullname.path, b"/a/b");
    }

    #[test]
    fn push_binlog_resp_round_trip() {
        let entries = vec![
            PushResultEntry {
                data_version: 10,
                err_no: 0,
            },
            PushResultEntry {
                data_version: 11,
                err_no: 5,
            },
        ];
        let bytes = pack_push_binlog_resp(&entries);
        let unpacked = unpack_push_binlog_resp(&mut BodyReader::new(&bytes)).unwrap();
        assert_eq!(unpacked, entries);
    }

    #[test]
    fn join_slave_round_trip() {
        let req = JoinSlaveReq {
            cluster_id: 1,
            server_id: 3,
            buffer_size: 65536,
            key: *b"abcdefgh",
        };
        let bytes = req.pack();
        let unpacked = JoinSlaveReq::unpack(&mut BodyReader::new(&bytes)).unwrap();
        assert_eq!(unpacked.cluster_id, 1);
        assert_eq!(unpacked.server_id, 3);
        assert_eq!(unpacked.buffer_size, 65536);
        assert_eq!(unpacked.key, *b"abcdefgh");
    }
}
