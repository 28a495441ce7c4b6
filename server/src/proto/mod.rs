// SPDX-License-Identifier: MPL-2.0

//! The wire protocol.
//!
//! Every message starts with a fixed 16-byte header; the body layout is
//! selected by the command code. All multi-byte integers are big-endian
//! and strings are length-prefixed, never NUL-terminated.

pub mod wire;

use std::io::{Read, Write};

use int_to_c_enum::TryFromInt;

use crate::prelude::*;

pub const PROTO_MAGIC: [u8; 4] = [0x23, 0x23, 0x23, 0x23];
pub const HEADER_SIZE: usize = 16;

/// Status value outside the errno range: the answering node believes a
/// different server holds mastership. Receivers must trigger a master
/// re-election instead of treating this as an ordinary failure.
pub const STATUS_MASTER_INCONSISTENT: u16 = 9999;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromInt)]
pub enum Cmd {
    Ack = 6,

    ActiveTestReq = 21,
    ActiveTestResp = 22,

    // service commands
    CreateDentryReq = 23,
    CreateDentryResp = 24,
    CreateByPNameReq = 25,
    CreateByPNameResp = 26,
    RemoveDentryReq = 27,
    RemoveDentryResp = 28,
    ListDentryFirstReq = 29,
    ListDentryNextReq = 31,
    ListDentryResp = 32,
    LookupInodeReq = 33,
    LookupInodeResp = 34,
    StatByPathReq = 35,
    StatByPathResp = 36,
    StatByInodeReq = 37,
    StatByInodeResp = 38,
    StatByPNameReq = 39,
    StatByPNameResp = 40,
    SetDentrySizeReq = 41,
    SetDentrySizeResp = 42,
    ModifyDentryStatReq = 43,
    ModifyDentryStatResp = 44,
    FlockDentryReq = 45,
    FlockDentryResp = 46,
    GetlkDentryReq = 47,
    GetlkDentryResp = 48,
    SysLockDentryReq = 49,
    SysLockDentryResp = 50,
    SysUnlockDentryReq = 51,
    SysUnlockDentryResp = 52,
    ServiceStatReq = 55,
    ServiceStatResp = 56,
    ClusterStatReq = 57,
    ClusterStatResp = 58,
    GetMasterReq = 61,
    GetMasterResp = 62,
    GetSlavesReq = 63,
    GetSlavesResp = 64,
    GetReadableServerReq = 65,
    GetReadableServerResp = 66,

    // cluster commands
    GetServerStatusReq = 71,
    GetServerStatusResp = 72,
    JoinMaster = 73,
    PingMasterReq = 75,
    PingMasterResp = 76,
    PreSetNextMaster = 77,
    CommitNextMaster = 78,

    // replication commands, master -> slave
    JoinSlaveReq = 81,
    JoinSlaveResp = 82,
    PushBinlogReq = 83,
    PushBinlogResp = 84,
}

/// The decoded fixed header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub body_len: u32,
    pub status: u16,
    pub flags: u16,
    pub cmd: u8,
}

impl Header {
    pub fn new(cmd: Cmd, body_len: usize) -> Self {
        Self {
            body_len: body_len as u32,
            status: 0,
            flags: 0,
            cmd: cmd as u8,
        }
    }

    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&PROTO_MAGIC);
        buf[4..8].copy_from_slice(&self.body_len.to_be_bytes());
        buf[8..10].copy_from_slice(&self.status.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12] = self.cmd;
        // buf[13..16] is padding
        buf
    }

    pub fn unpack(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != PROTO_MAGIC {
            return_errno_with_message!(Errno::EINVAL, "invalid header magic");
        }
        Ok(Self {
            body_len: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            status: u16::from_be_bytes(buf[8..10].try_into().unwrap()),
            flags: u16::from_be_bytes(buf[10..12].try_into().unwrap()),
            cmd: buf[12],
        })
    }
}

/// Reads exactly one header, validating magic and the body-length cap.
pub fn recv_header(stream: &mut impl Read, max_body_len: usize) -> Result<Header> {
    let mut buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buf)?;
    let header = Header::unpack(&buf)?;
    if header.body_len as usize > max_body_len {
        return_errno_with_message!(Errno::EMSGSIZE, "body length exceeds buffer size");
    }
    Ok(header)
}

/// Reads one full frame: header plus exactly `body_len` body bytes.
pub fn recv_frame(stream: &mut impl Read, max_body_len: usize) -> Result<(Header, Vec<u8>)> {
    let header = recv_header(stream, max_body_len)?;
    let mut body = vec![0u8; header.body_len as usize];
    stream.read_exact(&mut body)?;
    Ok((header, body))
}

/// Like [`recv_frame`], but built for connection threads whose stream has
/// a read timeout: between frames a timeout just polls `stop`; a clean
/// close before any header byte yields `Ok(None)`.
pub fn recv_frame_interruptible(
    stream: &mut impl Read,
    max_body_len: usize,
    stop: &crate::prelude::AtomicBool,
) -> Result<Option<(Header, Vec<u8>)>> {
    use std::io::ErrorKind;
    use std::sync::atomic::Ordering;

    let mut first = [0u8; 1];
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match stream.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(err)
                if err.kind() == ErrorKind::WouldBlock
                    || err.kind() == ErrorKind::TimedOut =>
            {
                continue
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let mut rest = [0u8; HEADER_SIZE - 1];
    read_exact_retrying(stream, &mut rest, stop)?;
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = first[0];
    buf[1..].copy_from_slice(&rest);
    let header = Header::unpack(&buf)?;
    if header.body_len as usize > max_body_len {
        return_errno_with_message!(Errno::EMSGSIZE, "body length exceeds buffer size");
    }
    let mut body = vec![0u8; header.body_len as usize];
    read_exact_retrying(stream, &mut body, stop)?;
    Ok(Some((header, body)))
}

fn read_exact_retrying(
    stream: &mut impl Read,
    mut buf: &mut [u8],
    stop: &crate::prelude::AtomicBool,
) -> Result<()> {
    use std::io::ErrorKind;
    use std::sync::atomic::Ordering;

    while !buf.is_empty() {
        match stream.read(buf) {
            Ok(0) => return_errno_with_message!(Errno::ECONNRESET, "connection closed mid-frame"),
            Ok(read) => buf = &mut buf[read..],
            Err(err)
                if err.kind() == ErrorKind::WouldBlock
                    || err.kind() == ErrorKind::TimedOut =>
            {
                if stop.load(Ordering::SeqCst) {
                    return_errno_with_message!(Errno::ECONNRESET, "server shutting down");
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub fn send_frame(
    stream: &mut impl Write,
    cmd: Cmd,
    status: u16,
    body: &[u8],
) -> Result<()> {
    let mut header = Header::new(cmd, body.len());
    header.status = status;
    stream.write_all(&header.pack())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

/// A cursor over a request body, mirroring the `buff2*` accessor family.
pub struct BodyReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn remain(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remain() < count {
            return_errno_with_message!(Errno::EINVAL, "request body too short");
        }
        let slice = &self.buf[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

/// An append-only reply body, mirroring the `int2buff` family.
#[derive(Default)]
pub struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.put_bytes(&v.to_be_bytes())
    }

    /// Overwrites previously written bytes, for headers whose counts are
    /// only known after the parts are appended.
    pub fn overwrite_u16(&mut self, offset: usize, v: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
    }

    pub fn overwrite_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut header = Header::new(Cmd::CreateDentryReq, 42);
        header.status = 17;
        header.flags = 3;
        let packed = header.pack();
        assert_eq!(&packed[0..4], &PROTO_MAGIC);
        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(unpacked.body_len, 42);
        assert_eq!(unpacked.status, 17);
        assert_eq!(unpacked.flags, 3);
        assert_eq!(unpacked.cmd, Cmd::CreateDentryReq as u8);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = Header::new(Cmd::Ack, 0).pack();
        buf[0] = b'!';
        assert_eq!(Header::unpack(&buf).unwrap_err().error(), Errno::EINVAL);
    }

    #[test]
    fn frame_round_trip_and_length_cap() {
        let mut wire = Vec::new();
        send_frame(&mut wire, Cmd::StatByInodeReq, 0, &7u64.to_be_bytes()).unwrap();

        let mut cursor = std::io::Cursor::new(wire.clone());
        let (header, body) = recv_frame(&mut cursor, 64).unwrap();
        assert_eq!(header.cmd, Cmd::StatByInodeReq as u8);
        assert_eq!(body, 7u64.to_be_bytes());

        let mut cursor = std::io::Cursor::new(wire);
        assert_eq!(
            recv_frame(&mut cursor, 4).unwrap_err().error(),
            Errno::EMSGSIZE
        );
    }

    #[test]
    fn cmd_try_from_int() {
        assert_eq!(Cmd::try_from(83u8).unwrap(), Cmd::PushBinlogReq);
        assert!(Cmd::try_from(200u8).is_err());
    }

    #[test]
    fn body_reader_bounds() {
        let mut reader = BodyReader::new(&[0u8; 3]);
        assert_eq!(reader.u16().unwrap(), 0);
        assert_eq!(reader.u32().unwrap_err().error(), Errno::EINVAL);
    }
}
