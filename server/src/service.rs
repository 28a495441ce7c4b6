// SPDX-License-Identifier: MPL-2.0

//! Service request handling, one thread per client connection.
//!
//! Each request is parsed and validated, then either completed inline
//! (reads, stats) or expressed as a binlog record, pushed to the owning
//! data thread, and answered once the record has been accepted by the
//! binlog producer. Blocking lock requests park the connection thread
//! until granted.

use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

use rand::Rng as _;

use crate::binlog::record::{BinlogRecord, RecordOp, RecordOptions};
use crate::clock;
use crate::context::{ConnState, ServerContext};
use crate::data_thread::{AppliedResult, QueuedRecord, RecordNotify, RecordOrigin};
use crate::dentry::{Dentry, DentryStore};
use crate::flock::LockType;
use crate::inode_index::{FlockHandle, SysLockHandle};
use crate::prelude::*;
use crate::proto::{self, wire, BodyReader, BodyWriter, Cmd};
use crate::types::{
    DentryStat, FullName, LockOp, ServerStatus, SYS_UNLOCK_FLAG_SET_SIZE,
};

/// A list cursor expires after this much idle time.
const LIST_CACHE_TTL_SECS: i64 = 60;

struct ListCache {
    token: u64,
    offset: u32,
    expires: i64,
    entries: Vec<Arc<Dentry>>,
}

struct ServiceConn {
    ctx: Arc<ServerContext>,
    conn: Arc<ConnState>,
    held_flocks: Vec<FlockHandle>,
    sys_lock: Option<SysLockHandle>,
    list_cache: Option<ListCache>,
}

pub fn serve_connection(ctx: Arc<ServerContext>, mut stream: TcpStream, stop: Arc<AtomicBool>) {
    let peer_addr = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "?".into());
    let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
    let _ = stream.set_nodelay(true);

    let conn = ctx.conns.register();
    let mut service = ServiceConn {
        ctx: ctx.clone(),
        conn,
        held_flocks: Vec::new(),
        sys_lock: None,
        list_cache: None,
    };

    loop {
        let frame = match proto::recv_frame_interruptible(
            &mut stream,
            ctx.config.task_buffer_size,
            &stop,
        ) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                debug!("client {}: {}", peer_addr, err);
                break;
            }
        };
        let (header, body) = frame;

        let (resp_cmd, result) = match Cmd::try_from(header.cmd) {
            Ok(cmd) => {
                let resp_cmd = resp_cmd_of(cmd);
                (resp_cmd, service.deal_request(cmd, &body))
            }
            Err(_) => (
                Cmd::Ack,
                Err(Error::with_message(Errno::EINVAL, "unknown cmd")),
            ),
        };

        let sent = match result {
            Ok(reply_body) => proto::send_frame(&mut stream, resp_cmd, 0, &reply_body),
            Err(err) => {
                if err.message().is_some() {
                    warn!(
                        "client {}, cmd: {}, {}",
                        peer_addr,
                        header.cmd,
                        err.message().unwrap_or("")
                    );
                }
                let message = err.message().unwrap_or("").as_bytes();
                proto::send_frame(&mut stream, resp_cmd, err.wire_status(), message)
            }
        };
        if sent.is_err() {
            break;
        }
    }

    service.cleanup();
    debug!("client {} disconnects", peer_addr);
}

fn resp_cmd_of(cmd: Cmd) -> Cmd {
    match cmd {
        Cmd::ActiveTestReq => Cmd::ActiveTestResp,
        Cmd::CreateDentryReq => Cmd::CreateDentryResp,
        Cmd::CreateByPNameReq => Cmd::CreateByPNameResp,
        Cmd::RemoveDentryReq => Cmd::RemoveDentryResp,
        Cmd::ListDentryFirstReq | Cmd::ListDentryNextReq => Cmd::ListDentryResp,
        Cmd::LookupInodeReq => Cmd::LookupInodeResp,
        Cmd::StatByPathReq => Cmd::StatByPathResp,
        Cmd::StatByInodeReq => Cmd::StatByInodeResp,
        Cmd::StatByPNameReq => Cmd::StatByPNameResp,
        Cmd::SetDentrySizeReq => Cmd::SetDentrySizeResp,
        Cmd::ModifyDentryStatReq => Cmd::ModifyDentryStatResp,
        Cmd::FlockDentryReq => Cmd::FlockDentryResp,
        Cmd::GetlkDentryReq => Cmd::GetlkDentryResp,
        Cmd::SysLockDentryReq => Cmd::SysLockDentryResp,
        Cmd::SysUnlockDentryReq => Cmd::SysUnlockDentryResp,
        Cmd::ServiceStatReq => Cmd::ServiceStatResp,
        Cmd::ClusterStatReq => Cmd::ClusterStatResp,
        Cmd::GetMasterReq => Cmd::GetMasterResp,
        Cmd::GetSlavesReq => Cmd::GetSlavesResp,
        Cmd::GetReadableServerReq => Cmd::GetReadableServerResp,
        _ => Cmd::Ack,
    }
}

impl ServiceConn {
    fn deal_request(&mut self, cmd: Cmd, body: &[u8]) -> Result<Vec<u8>> {
        match cmd {
            Cmd::ActiveTestReq => {
                expect_empty(body)?;
                Ok(Vec::new())
            }
            Cmd::CreateDentryReq => {
                self.check_master()?;
                self.deal_create_dentry(body)
            }
            Cmd::CreateByPNameReq => {
                self.check_master()?;
                self.deal_create_by_pname(body)
            }
            Cmd::RemoveDentryReq => {
                self.check_master()?;
                self.deal_remove_dentry(body)
            }
            Cmd::SetDentrySizeReq => {
                self.check_master()?;
                self.deal_set_dentry_size(body)
            }
            Cmd::ModifyDentryStatReq => {
                self.check_master()?;
                self.deal_modify_dentry_stat(body)
            }
            Cmd::LookupInodeReq => {
                self.check_readable()?;
                self.deal_lookup_inode(body)
            }
            Cmd::StatByPathReq => {
                self.check_readable()?;
                self.deal_stat_by_path(body)
            }
            Cmd::StatByInodeReq => {
                self.check_readable()?;
                self.deal_stat_by_inode(body)
            }
            Cmd::StatByPNameReq => {
                self.check_readable()?;
                self.deal_stat_by_pname(body)
            }
            Cmd::ListDentryFirstReq => {
                self.check_readable()?;
                self.deal_list_dentry_first(body)
            }
            Cmd::ListDentryNextReq => {
                self.check_readable()?;
                self.deal_list_dentry_next(body)
            }
            Cmd::FlockDentryReq => {
                self.check_master()?;
                self.deal_flock_dentry(body)
            }
            Cmd::GetlkDentryReq => {
                self.check_master()?;
                self.deal_getlk_dentry(body)
            }
            Cmd::SysLockDentryReq => {
                self.check_master()?;
                self.deal_sys_lock_dentry(body)
            }
            Cmd::SysUnlockDentryReq => {
                self.check_master()?;
                self.deal_sys_unlock_dentry(body)
            }
            Cmd::ServiceStatReq => self.deal_service_stat(body),
            Cmd::ClusterStatReq => self.deal_cluster_stat(body),
            Cmd::GetMasterReq => self.deal_get_master(body),
            Cmd::GetSlavesReq => self.deal_get_slaves(body),
            Cmd::GetReadableServerReq => self.deal_get_readable_server(body),
            _ => return_errno_with_message!(Errno::EINVAL, "unexpected cmd on service port"),
        }
    }

    fn cleanup(&mut self) {
        for handle in self.held_flocks.drain(..) {
            self.ctx.store.index().flock_release(&handle);
        }
        if let Some(handle) = self.sys_lock.take() {
            let _ = self
                .ctx
                .store
                .index()
                .sys_lock_release(&handle, None, clock::current_time_secs());
        }
        self.ctx.conns.unregister(self.conn.id);
    }

    fn check_master(&self) -> Result<()> {
        if !self.ctx.cluster.is_myself_master() {
            return_errno_with_message!(Errno::EINVAL, "i am not master");
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        if self.ctx.cluster.is_myself_master()
            || self.ctx.cluster.myself().status() == ServerStatus::Active
        {
            return Ok(());
        }
        return_errno_with_message!(Errno::EINVAL, "i am not active");
    }

    fn origin(&self) -> Option<RecordOrigin> {
        Some(RecordOrigin {
            conn_id: self.conn.id,
            task_version: self.conn.task_version.load(Ordering::SeqCst),
        })
    }

    /// Hands the record to its data thread and parks until it has been
    /// applied and accepted by the binlog producer.
    fn apply_mutation(&self, record: BinlogRecord) -> Result<AppliedResult> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.ctx.push_to_data_thread(QueuedRecord {
            record,
            notify: RecordNotify::Service(tx),
            origin: self.origin(),
        })?;
        match rx.recv() {
            Ok(result) => result,
            Err(_) => {
                return_errno_with_message!(Errno::EBUSY, "data thread dropped the record")
            }
        }
    }

    fn new_path_record(&self, operation: RecordOp, fullname: FullName) -> BinlogRecord {
        let hash_code = times33::times33_hash(&fullname.ns);
        BinlogRecord::with_fullname(operation, fullname, hash_code)
    }

    fn record_for_create(&self, fullname: FullName, mode: u32) -> BinlogRecord {
        let mut record = self.new_path_record(RecordOp::Create, fullname);
        let now = clock::current_time_secs();
        record.stat.mode = mode;
        record.stat.ctime = now;
        record.stat.mtime = now;
        record.options |= RecordOptions::MODE | RecordOptions::CTIME | RecordOptions::MTIME;
        record
    }

    fn deal_create_dentry(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let mode = reader.u32()?;
        let fullname = wire::unpack_dentry_info(&mut reader)?;
        expect_consumed(&reader)?;

        let applied = self.apply_mutation(self.record_for_create(fullname, mode))?;
        Ok(wire::pack_stat_reply(applied.inode, &applied.stat))
    }

    fn deal_create_by_pname(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::CreateByPNameReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;
        check_name_len(req.ns.len(), "namespace")?;
        check_name_len(req.name.len(), "path name")?;

        let Some(parent) = self.ctx.store.index().get(req.parent_inode) else {
            return_errno_with_message!(Errno::ENOENT, "parent inode not exist");
        };
        let mut path = DentryStore::get_full_path(&parent)?;
        path.push(b'/');
        path.extend_from_slice(&req.name);

        let fullname = FullName {
            ns: req.ns,
            path,
        };
        let applied = self.apply_mutation(self.record_for_create(fullname, req.mode))?;
        Ok(wire::pack_stat_reply(applied.inode, &applied.stat))
    }

    fn deal_remove_dentry(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let fullname = wire::unpack_dentry_info(&mut reader)?;
        expect_consumed(&reader)?;

        let record = self.new_path_record(RecordOp::Remove, fullname);
        let applied = self.apply_mutation(record)?;
        Ok(wire::pack_stat_reply(applied.inode, &applied.stat))
    }

    fn deal_stat_by_path(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let fullname = wire::unpack_dentry_info(&mut reader)?;
        expect_consumed(&reader)?;
        let dentry = self.ctx.store.find(&fullname)?;
        Ok(wire::pack_stat_reply(dentry.inode(), &dentry.stat()))
    }

    fn deal_lookup_inode(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let fullname = wire::unpack_dentry_info(&mut reader)?;
        expect_consumed(&reader)?;
        let dentry = self.ctx.store.find(&fullname)?;
        let mut writer = BodyWriter::with_capacity(8);
        writer.put_u64(dentry.inode());
        Ok(writer.into_bytes())
    }

    fn deal_stat_by_inode(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let inode = reader.u64()?;
        expect_consumed(&reader)?;
        let Some(dentry) = self.ctx.store.index().get(inode) else {
            return_errno!(Errno::ENOENT);
        };
        Ok(wire::pack_stat_reply(dentry.inode(), &dentry.stat()))
    }

    fn deal_stat_by_pname(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::StatByPNameReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;
        let dentry = self.ctx.store.index().get_by_pname(req.parent_inode, &req.name)?;
        Ok(wire::pack_stat_reply(dentry.inode(), &dentry.stat()))
    }

    /// Emits the minimal `update` record after a size/mtime change.
    fn produce_update(
        &self,
        ns: &[u8],
        inode: u64,
        stat: &DentryStat,
        modified: RecordOptions,
    ) -> Result<()> {
        if modified.is_empty() {
            return Ok(());
        }
        let mut record = BinlogRecord {
            inode,
            operation: RecordOp::Update,
            hash_code: times33::times33_hash(ns),
            options: modified,
            ..Default::default()
        };
        record.stat = *stat;
        self.ctx
            .producer
            .produce(&self.ctx.data_version, &mut record, self.origin())?;
        Ok(())
    }

    fn deal_set_dentry_size(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::SetDentrySizeReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;

        let (dentry, modified) = self.ctx.store.index().check_set_dentry_size(
            req.inode,
            req.size,
            req.force,
            clock::current_time_secs(),
        )?;
        let stat = dentry.stat();
        self.produce_update(&req.ns, req.inode, &stat, modified)?;
        Ok(wire::pack_stat_reply(dentry.inode(), &stat))
    }

    fn deal_modify_dentry_stat(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::ModifyDentryStatReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;

        let masked = RecordOptions::from_bits_truncate(req.mflags) & RecordOptions::STAT_MASK;
        if masked.is_empty() {
            return_errno_with_message!(Errno::EINVAL, "invalid stat modify flags");
        }

        let mut record = BinlogRecord {
            inode: req.inode,
            operation: RecordOp::Update,
            hash_code: times33::times33_hash(&req.ns),
            options: masked,
            stat: req.stat,
            ..Default::default()
        };
        let dentry = self.ctx.store.index().update_dentry(&record)?;
        self.ctx
            .producer
            .produce(&self.ctx.data_version, &mut record, self.origin())?;
        Ok(wire::pack_stat_reply(dentry.inode(), &dentry.stat()))
    }

    fn deal_flock_dentry(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::FlockDentryReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;
        let operation = LockOp::from_bits_truncate(req.operation);

        if operation.contains(LockOp::UN) {
            return self.flock_unlock(&req);
        }

        let lock_type = if operation.contains(LockOp::EX) {
            LockType::Exclusive
        } else if operation.contains(LockOp::SH) {
            LockType::Shared
        } else {
            return_errno_with_message!(Errno::EINVAL, "invalid lock operation");
        };
        let block = !operation.contains(LockOp::NB);

        match self.ctx.store.index().flock_apply(
            req.inode,
            lock_type,
            req.offset,
            req.length,
            block,
            req.owner,
        ) {
            Ok(handle) => {
                self.held_flocks.push(handle);
                Ok(Vec::new())
            }
            Err(err) if err.error() == Errno::ENOLCK => {
                return_errno_with_message!(Errno::EAGAIN, "the file is locked")
            }
            Err(err) => Err(err),
        }
    }

    fn flock_unlock(&mut self, req: &wire::FlockDentryReq) -> Result<Vec<u8>> {
        let position = self.held_flocks.iter().position(|handle| {
            handle.inode == req.inode
                && handle.owner == req.owner
                && handle.offset == req.offset
                && handle.length == req.length
        });
        let Some(position) = position else {
            return_errno_with_message!(Errno::ENOENT, "no matching lock to release");
        };
        let handle = self.held_flocks.swap_remove(position);
        self.ctx.store.index().flock_release(&handle);
        Ok(Vec::new())
    }

    fn deal_getlk_dentry(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::GetlkDentryReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;
        let operation = LockOp::from_bits_truncate(req.operation);
        let lock_type = if operation.contains(LockOp::EX) {
            LockType::Exclusive
        } else if operation.contains(LockOp::SH) {
            LockType::Shared
        } else {
            return_errno_with_message!(Errno::EINVAL, "invalid lock operation");
        };

        let blocker =
            self.ctx
                .store
                .index()
                .flock_getlk(req.inode, lock_type, req.offset, req.length)?;
        let wire_type = match blocker.lock_type {
            LockType::Shared => LockOp::SH.bits(),
            LockType::Exclusive => LockOp::EX.bits(),
        };
        Ok(wire::pack_getlk_reply(
            blocker.offset,
            blocker.length,
            &blocker.owner,
            wire_type,
        ))
    }

    fn deal_sys_lock_dentry(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::SysLockDentryReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;

        if self.sys_lock.is_some() {
            return_errno_with_message!(Errno::EEXIST, "sys lock already exist");
        }
        let block = (req.flags & LockOp::NB.bits()) == 0;
        match self.ctx.store.index().sys_lock_apply(req.inode, block) {
            Ok((handle, size)) => {
                self.sys_lock = Some(handle);
                let mut writer = BodyWriter::with_capacity(8);
                writer.put_i64(size);
                Ok(writer.into_bytes())
            }
            Err(err) if err.error() == Errno::ENOLCK => {
                return_errno_with_message!(Errno::EAGAIN, "sys lock is held")
            }
            Err(err) => Err(err),
        }
    }

    fn deal_sys_unlock_dentry(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::SysUnlockDentryReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;

        let Some(handle) = self.sys_lock else {
            return_errno_with_message!(Errno::ENOENT, "sys lock not exist");
        };
        if req.inode != handle.inode {
            return_errno_with_message!(Errno::EINVAL, "sys lock inode mismatch");
        }

        let set_size = if (req.flags & SYS_UNLOCK_FLAG_SET_SIZE) != 0 {
            if req.ns.is_empty() {
                return_errno_with_message!(Errno::ENOENT, "namespace required to set size");
            }
            if req.new_size < 0 {
                return_errno_with_message!(Errno::EINVAL, "invalid new file size");
            }
            if let Some(dentry) = self.ctx.store.index().get(req.inode) {
                let current = dentry.stat().size;
                if req.old_size != current {
                    warn!(
                        "inode {} old size {} != current size {}, maybe changed by others",
                        req.inode, req.old_size, current
                    );
                }
            }
            Some((req.new_size, req.force))
        } else {
            None
        };

        let released = self.ctx.store.index().sys_lock_release(
            &handle,
            set_size,
            clock::current_time_secs(),
        )?;
        self.sys_lock = None;

        let mut writer = BodyWriter::with_capacity(8);
        match released {
            Some((dentry, modified)) => {
                let stat = dentry.stat();
                self.produce_update(&req.ns, req.inode, &stat, modified)?;
                writer.put_i64(stat.size);
            }
            None => {
                let size = self
                    .ctx
                    .store
                    .index()
                    .get(req.inode)
                    .map(|dentry| dentry.stat().size)
                    .unwrap_or(0);
                writer.put_i64(size);
            }
        }
        Ok(writer.into_bytes())
    }

    fn deal_list_dentry_first(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let fullname = wire::unpack_dentry_info(&mut reader)?;
        expect_consumed(&reader)?;

        let entries = self.ctx.store.list(&fullname)?;
        self.list_cache = Some(ListCache {
            token: 0,
            offset: 0,
            expires: 0,
            entries,
        });
        self.list_output()
    }

    fn deal_list_dentry_next(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BodyReader::new(body);
        let req = wire::ListDentryNextReq::unpack(&mut reader)?;
        expect_consumed(&reader)?;

        let now = clock::current_time_secs();
        let Some(cache) = &self.list_cache else {
            return_errno_with_message!(Errno::ETIMEDOUT, "dentry list cache expires");
        };
        if cache.expires < now {
            return_errno_with_message!(Errno::ETIMEDOUT, "dentry list cache expires");
        }
        if req.token != cache.token {
            return_errno_with_message!(Errno::EINVAL, "invalid token for next list");
        }
        if req.offset != cache.offset {
            return_errno_with_message!(Errno::EINVAL, "next list offset mismatch");
        }
        self.list_output()
    }

    fn list_output(&mut self) -> Result<Vec<u8>> {
        let cache = self.list_cache.as_mut().unwrap();
        let buffer_limit = self.ctx.config.task_buffer_size;

        let mut writer = BodyWriter::with_capacity(4096);
        writer.put_u64(0); // token, fixed up below
        writer.put_u32(0); // count
        writer.put_u8(0); // is_last
        writer.put_bytes(&[0u8; 3]);

        let start = cache.offset as usize;
        let mut count = 0usize;
        for dentry in cache.entries[start..].iter() {
            if writer.len() + 1 + dentry.name().len() > buffer_limit {
                break;
            }
            writer.put_u8(dentry.name().len() as u8);
            writer.put_bytes(dentry.name());
            count += 1;
        }

        let remain = cache.entries.len() - start;
        if count < remain {
            cache.offset += count as u32;
            cache.expires = clock::current_time_secs() + LIST_CACHE_TTL_SECS;
            cache.token = self
                .ctx
                .next_list_token
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            writer.overwrite_u32(8, count as u32);
            let token = cache.token;
            let mut bytes = writer.into_bytes();
            bytes[0..8].copy_from_slice(&token.to_be_bytes());
            // is_last stays 0
            Ok(bytes)
        } else {
            writer.overwrite_u32(8, count as u32);
            let mut bytes = writer.into_bytes();
            bytes[12] = 1; // is_last
            Ok(bytes)
        }
    }

    fn deal_service_stat(&self, body: &[u8]) -> Result<Vec<u8>> {
        expect_empty(body)?;
        let ctx = &self.ctx;
        let counters = ctx.store.counters();

        let mut writer = BodyWriter::with_capacity(64);
        writer.put_u32(ctx.cluster.my_id());
        writer.put_u8(ctx.cluster.is_myself_master() as u8);
        writer.put_u8(ctx.cluster.myself().status() as u8);
        writer.put_u32(ctx.conns.current_count() as u32);
        writer.put_u32(ctx.conns.max_count() as u32);
        writer.put_u64(ctx.current_data_version());
        writer.put_u64(ctx.store.generator().current_serial());
        writer.put_i64(counters.ns.load(Ordering::Relaxed));
        writer.put_i64(counters.dir.load(Ordering::Relaxed));
        writer.put_i64(counters.file.load(Ordering::Relaxed));
        Ok(writer.into_bytes())
    }

    fn deal_cluster_stat(&self, body: &[u8]) -> Result<Vec<u8>> {
        expect_empty(body)?;
        let peers = self.ctx.cluster.peers();
        let master_id = self.ctx.cluster.master_id();

        let mut writer = BodyWriter::with_capacity(16 + peers.len() * 32);
        writer.put_u32(peers.len() as u32);
        for peer in peers {
            writer.put_u32(peer.id());
            writer.put_u8((peer.id() == master_id) as u8);
            writer.put_u8(peer.status() as u8);
            let addr = peer.config.service_addr.as_bytes();
            writer.put_u8(addr.len() as u8);
            writer.put_bytes(addr);
        }
        Ok(writer.into_bytes())
    }

    fn deal_get_master(&self, body: &[u8]) -> Result<Vec<u8>> {
        expect_empty(body)?;
        let Some(master) = self.ctx.cluster.master() else {
            return_errno_with_message!(Errno::ENOENT, "the master NOT exist");
        };
        Ok(wire::pack_server_reply(
            master.id(),
            &master.config.service_addr,
        ))
    }

    fn deal_get_slaves(&self, body: &[u8]) -> Result<Vec<u8>> {
        expect_empty(body)?;
        let master_id = self.ctx.cluster.master_id();
        let slaves: Vec<_> = self
            .ctx
            .cluster
            .peers()
            .iter()
            .filter(|peer| peer.id() != master_id)
            .collect();

        let mut writer = BodyWriter::with_capacity(8 + slaves.len() * 32);
        writer.put_u16(slaves.len() as u16);
        for peer in slaves {
            writer.put_u32(peer.id());
            let addr = peer.config.service_addr.as_bytes();
            writer.put_u8(addr.len() as u8);
            writer.put_bytes(addr);
            writer.put_u8(peer.status() as u8);
        }
        Ok(writer.into_bytes())
    }

    fn deal_get_readable_server(&self, body: &[u8]) -> Result<Vec<u8>> {
        expect_empty(body)?;
        let master_id = self.ctx.cluster.master_id();
        let readable: Vec<_> = self
            .ctx
            .cluster
            .peers()
            .iter()
            .filter(|peer| peer.id() == master_id || peer.status() == ServerStatus::Active)
            .collect();
        if readable.is_empty() {
            return_errno_with_message!(Errno::ENOENT, "no active server");
        }
        let pick = readable[rand::rng().random_range(0..readable.len())];
        Ok(wire::pack_server_reply(
            pick.id(),
            &pick.config.service_addr,
        ))
    }
}

fn expect_empty(body: &[u8]) -> Result<()> {
    if !body.is_empty() {
        return_errno_with_message!(Errno::EINVAL, "request body should be empty");
    }
    Ok(())
}

fn expect_consumed(reader: &BodyReader) -> Result<()> {
    if reader.remain() != 0 {
        return_errno_with_message!(Errno::EINVAL, "request body length mismatch");
    }
    Ok(())
}

fn check_name_len(len: usize, caption: &str) -> Result<()> {
    if len == 0 || len > crate::types::NAME_MAX {
        debug!("invalid {} length: {}", caption, len);
        return_errno_with_message!(Errno::EINVAL, "invalid name length");
    }
    Ok(())
}
