// SPDX-License-Identifier: MPL-2.0

//! Inbound cluster-port request handling.
//!
//! Serves three kinds of peers on one port: relationship connections from
//! slaves (join-master, ping), replication connections from the master
//! (join-slave, push-binlog), and the next-master administration pair.

use std::net::TcpStream;

use crate::binlog::replay::ReplayContext;
use crate::binlog::replication::replication_body_cap;
use crate::context::ServerContext;
use crate::prelude::*;
use crate::proto::{self, wire, BodyReader, BodyWriter, Cmd, STATUS_MASTER_INCONSISTENT};
use crate::types::ServerStatus;

/// What this connection has authenticated as.
enum ConnKind {
    None,
    /// A slave's relationship connection; `peer_id` joined us as master.
    Relationship { peer_id: u32, last_change_version: u64 },
    /// The master's replication connection into this slave.
    ReplicaSlave { replay: ReplayContext },
}

struct Reply {
    cmd: Cmd,
    status: u16,
    body: Vec<u8>,
}

impl Reply {
    fn ok(cmd: Cmd, body: Vec<u8>) -> Self {
        Self {
            cmd,
            status: 0,
            body,
        }
    }

    fn empty(cmd: Cmd) -> Self {
        Self::ok(cmd, Vec::new())
    }

    fn master_inconsistent(cmd: Cmd, message: &str) -> Self {
        Self {
            cmd,
            status: STATUS_MASTER_INCONSISTENT,
            body: message.as_bytes().to_vec(),
        }
    }

    fn from_error(cmd: Cmd, err: &Error) -> Self {
        Self {
            cmd,
            status: err.wire_status(),
            body: err.message().unwrap_or("").as_bytes().to_vec(),
        }
    }
}

pub fn serve_connection(ctx: Arc<ServerContext>, mut stream: TcpStream, stop: Arc<AtomicBool>) {
    let peer_addr = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "?".into());
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_millis(500)));
    let _ = stream.set_nodelay(true);
    let cap = replication_body_cap(&ctx.config);
    let mut kind = ConnKind::None;

    loop {
        let frame = match proto::recv_frame_interruptible(&mut stream, cap, &stop) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                debug!("cluster peer {}: {}", peer_addr, err);
                break;
            }
        };
        let (header, body) = frame;
        let Ok(cmd) = Cmd::try_from(header.cmd) else {
            let err = Error::with_message(Errno::EINVAL, "unknown cmd");
            let reply = Reply::from_error(Cmd::Ack, &err);
            if proto::send_frame(&mut stream, reply.cmd, reply.status, &reply.body).is_err() {
                break;
            }
            continue;
        };

        let reply = deal_request(&ctx, &mut kind, cmd, &body);
        if reply.status != 0 {
            warn!(
                "cluster peer {}, cmd: {:?}, status: {}, {}",
                peer_addr,
                cmd,
                reply.status,
                String::from_utf8_lossy(&reply.body)
            );
        }
        if proto::send_frame(&mut stream, reply.cmd, reply.status, &reply.body).is_err() {
            break;
        }
    }

    if let ConnKind::Relationship { peer_id, .. } = kind {
        if let Some(peer) = ctx.cluster.peer(peer_id) {
            peer.joined.store(false, Ordering::SeqCst);
        }
    }
    debug!("cluster peer {} disconnects", peer_addr);
}

fn deal_request(
    ctx: &Arc<ServerContext>,
    kind: &mut ConnKind,
    cmd: Cmd,
    body: &[u8],
) -> Reply {
    match cmd {
        Cmd::ActiveTestReq => Reply::empty(Cmd::ActiveTestResp),
        Cmd::GetServerStatusReq => wrap(Cmd::GetServerStatusResp, || {
            deal_get_server_status(ctx, body)
        }),
        Cmd::JoinMaster => match deal_join_master(ctx, kind, body) {
            Ok(reply) => reply,
            Err(err) => Reply::from_error(Cmd::Ack, &err),
        },
        Cmd::PingMasterReq => wrap(Cmd::PingMasterResp, || deal_ping_master(ctx, kind)),
        Cmd::PreSetNextMaster | Cmd::CommitNextMaster => {
            wrap(Cmd::Ack, || deal_next_master(ctx, cmd, body))
        }
        Cmd::JoinSlaveReq => match deal_join_slave(ctx, kind, body) {
            Ok(reply) => reply,
            Err(err) => Reply::from_error(Cmd::JoinSlaveResp, &err),
        },
        Cmd::PushBinlogReq => wrap(Cmd::PushBinlogResp, || {
            deal_push_binlog(ctx, kind, body)
        }),
        _ => Reply::from_error(
            Cmd::Ack,
            &Error::with_message(Errno::EINVAL, "unexpected cmd on cluster port"),
        ),
    }
}

fn wrap(cmd: Cmd, deal: impl FnOnce() -> Result<Vec<u8>>) -> Reply {
    match deal() {
        Ok(body) => Reply::ok(cmd, body),
        Err(err) => Reply::from_error(cmd, &err),
    }
}

fn check_config_sign(ctx: &ServerContext, config_sign: &[u8; 16]) -> Result<()> {
    if config_sign != ctx.cluster.config_sign() {
        return_errno_with_message!(Errno::EFAULT, "cluster config sign mismatch");
    }
    Ok(())
}

fn deal_get_server_status(ctx: &Arc<ServerContext>, body: &[u8]) -> Result<Vec<u8>> {
    let req = wire::GetServerStatusReq::unpack(&mut BodyReader::new(body))?;
    check_config_sign(ctx, &req.config_sign)?;

    let myself = ctx.cluster.myself();
    Ok(wire::GetServerStatusResp {
        is_master: ctx.cluster.is_myself_master(),
        status: myself.status() as u8,
        server_id: ctx.cluster.my_id(),
        data_version: ctx.current_data_version(),
    }
    .pack())
}

fn deal_join_master(
    ctx: &Arc<ServerContext>,
    kind: &mut ConnKind,
    body: &[u8],
) -> Result<Reply> {
    let req = wire::JoinMasterReq::unpack(&mut BodyReader::new(body))?;
    if req.cluster_id != ctx.cluster.cluster_id() as u32 {
        return_errno_with_message!(Errno::EINVAL, "peer cluster id mismatch");
    }
    let Some(peer) = ctx.cluster.peer(req.server_id) else {
        return_errno_with_message!(Errno::ENOENT, "peer server id not exist");
    };
    check_config_sign(ctx, &req.config_sign)?;
    if !ctx.cluster.is_myself_master() {
        return_errno_with_message!(Errno::EINVAL, "i am not master");
    }
    if matches!(kind, ConnKind::Relationship { .. }) {
        return_errno_with_message!(Errno::EEXIST, "peer server already joined");
    }

    peer.set_key(req.key);
    peer.joined.store(true, Ordering::SeqCst);
    *kind = ConnKind::Relationship {
        peer_id: req.server_id,
        last_change_version: 0,
    };
    info!("server {} joins as slave", req.server_id);
    Ok(Reply::empty(Cmd::Ack))
}

fn deal_ping_master(ctx: &Arc<ServerContext>, kind: &mut ConnKind) -> Result<Vec<u8>> {
    let ConnKind::Relationship {
        last_change_version,
        ..
    } = kind
    else {
        return_errno_with_message!(Errno::EINVAL, "please join first");
    };
    if !ctx.cluster.is_myself_master() {
        return_errno_with_message!(Errno::EINVAL, "i am not master");
    }

    let mut writer = BodyWriter::with_capacity(64);
    writer.put_u64(ctx.store.generator().current_serial());

    let change_version = ctx.cluster.change_version.load(Ordering::SeqCst);
    if *last_change_version < change_version {
        *last_change_version = change_version;
        let peers = ctx.cluster.peers();
        writer.put_u32(peers.len() as u32);
        for peer in peers {
            writer.put_u32(peer.id());
            writer.put_u8(peer.status() as u8);
        }
    } else {
        writer.put_u32(0);
    }
    Ok(writer.into_bytes())
}

fn deal_next_master(ctx: &Arc<ServerContext>, cmd: Cmd, body: &[u8]) -> Result<Vec<u8>> {
    let master_id = BodyReader::new(body).u32()?;
    if ctx.cluster.peer(master_id).is_none() {
        return_errno_with_message!(Errno::ENOENT, "master server id not exist");
    }
    if cmd == Cmd::PreSetNextMaster {
        ctx.cluster.pre_set_next_master(master_id)?;
    } else {
        ctx.cluster.commit_next_master(master_id)?;
    }
    Ok(Vec::new())
}

fn deal_join_slave(
    ctx: &Arc<ServerContext>,
    kind: &mut ConnKind,
    body: &[u8],
) -> Result<Reply> {
    let req = wire::JoinSlaveReq::unpack(&mut BodyReader::new(body))?;
    if req.cluster_id != ctx.cluster.cluster_id() as u32 {
        return_errno_with_message!(Errno::EINVAL, "peer cluster id mismatch");
    }
    if req.buffer_size as usize != ctx.config.task_buffer_size {
        return_errno_with_message!(Errno::EINVAL, "peer task buffer size mismatch");
    }
    if ctx.cluster.peer(req.server_id).is_none() {
        return_errno_with_message!(Errno::ENOENT, "peer server id not exist");
    }

    // The brain-split guard: only the server this node currently holds as
    // master (or the announced candidate) may push binlog into it.
    let next_master = ctx.cluster.next_master_id();
    if next_master != 0 {
        if next_master != req.server_id {
            return Ok(Reply::master_inconsistent(
                Cmd::JoinSlaveResp,
                "master selection in progress with another candidate",
            ));
        }
        return_errno_with_message!(Errno::EBUSY, "master selection in progress");
    }
    if req.server_id != ctx.cluster.master_id() {
        return Ok(Reply::master_inconsistent(
            Cmd::JoinSlaveResp,
            "master NOT consistent with local oracle",
        ));
    }
    if req.key != ctx.replica_key {
        return_errno_with_message!(Errno::EPERM, "check replica key fail");
    }
    if matches!(kind, ConnKind::ReplicaSlave { .. }) {
        return_errno_with_message!(Errno::EEXIST, "master already joined");
    }

    *kind = ConnKind::ReplicaSlave {
        replay: ReplayContext::new(),
    };
    let position = ctx.producer.writer().position();
    info!(
        "master {} joins, our data_version: {}",
        req.server_id,
        ctx.current_data_version()
    );
    Ok(Reply::ok(
        Cmd::JoinSlaveResp,
        wire::JoinSlaveResp {
            binlog_index: position.index,
            binlog_offset: position.offset,
            last_data_version: ctx.current_data_version(),
        }
        .pack(),
    ))
}

fn deal_push_binlog(
    ctx: &Arc<ServerContext>,
    kind: &mut ConnKind,
    body: &[u8],
) -> Result<Vec<u8>> {
    let ConnKind::ReplicaSlave { replay } = kind else {
        return_errno_with_message!(Errno::EINVAL, "please join first");
    };

    let mut reader = BodyReader::new(body);
    let req_header = wire::PushBinlogReqHeader::unpack(&mut reader)?;
    if req_header.binlog_length as usize != reader.remain() {
        return_errno_with_message!(Errno::EINVAL, "push body length mismatch");
    }
    let records = reader.bytes(req_header.binlog_length as usize)?;

    // Persist first so this node's own binlog position hint stays honest,
    // then replay into the in-memory store.
    ctx.producer.writer().append(records)?;
    let entries = replay.deal_buffer(ctx, records)?;

    // Track our own replication progress for stat reporting.
    ctx.cluster
        .myself()
        .last_data_version
        .store(ctx.current_data_version(), Ordering::SeqCst);

    Ok(wire::pack_push_binlog_resp(&entries))
}

/// Marks the myself entry of a freshly started node.
pub fn init_self_status(ctx: &Arc<ServerContext>) {
    let status = if ctx.cluster.is_myself_master() {
        ServerStatus::Active
    } else if ctx.current_data_version() > 0 {
        ServerStatus::Offline
    } else {
        ServerStatus::Init
    };
    ctx.cluster.set_status(ctx.cluster.my_id(), status);
}
