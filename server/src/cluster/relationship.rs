// SPDX-License-Identifier: MPL-2.0

//! The slave side of the cluster relationship.
//!
//! A non-master node keeps one background thread that joins the
//! configured master (handing over its replica key) and then pings it
//! periodically. Ping responses carry the master's inode serial and,
//! when membership changed, the full status table.

use std::net::TcpStream;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{CONNECT_TIMEOUT_SECS, NETWORK_TIMEOUT_SECS};
use crate::context::ServerContext;
use crate::prelude::*;
use crate::proto::{self, wire, Cmd, STATUS_MASTER_INCONSISTENT};
use crate::types::ServerStatus;

const PING_INTERVAL: Duration = Duration::from_millis(500);

pub struct RelationshipThread {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RelationshipThread {
    pub fn start(ctx: Arc<ServerContext>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("relationship".into())
            .spawn(move || relationship_loop(ctx, stop_flag))
            .expect("spawn relationship thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn relationship_loop(ctx: Arc<ServerContext>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        if ctx.cluster.is_myself_master() {
            break;
        }
        if let Err(err) = join_and_ping(&ctx, &stop) {
            debug!("master relationship lost: {}", err);
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}

fn join_and_ping(ctx: &Arc<ServerContext>, stop: &AtomicBool) -> Result<()> {
    let Some(master) = ctx.cluster.master() else {
        return_errno_with_message!(Errno::ENOENT, "the master NOT exist");
    };
    let addr: std::net::SocketAddr = master
        .config
        .cluster_addr
        .parse()
        .map_err(|_| Error::with_message(Errno::EINVAL, "bad cluster address"))?;
    let mut stream =
        TcpStream::connect_timeout(&addr, Duration::from_secs(CONNECT_TIMEOUT_SECS))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_secs(NETWORK_TIMEOUT_SECS)))?;

    let req = wire::JoinMasterReq {
        cluster_id: ctx.cluster.cluster_id() as u32,
        server_id: ctx.cluster.my_id(),
        config_sign: *ctx.cluster.config_sign(),
        key: ctx.replica_key,
    };
    proto::send_frame(&mut stream, Cmd::JoinMaster, 0, &req.pack())?;
    let (header, body) = proto::recv_frame(&mut stream, 4096)?;
    if header.status != 0 {
        warn!(
            "join master {} fail, status: {}, {}",
            master.id(),
            header.status,
            String::from_utf8_lossy(&body)
        );
        if header.status == STATUS_MASTER_INCONSISTENT {
            ctx.cluster.trigger_reselect_master();
        }
        return Err(Error::new(Errno::from_wire(header.status)));
    }
    info!("joined master {}", master.id());

    while !stop.load(Ordering::SeqCst) && !ctx.cluster.is_myself_master() {
        ping_master(ctx, &mut stream)?;
        std::thread::sleep(PING_INTERVAL);
    }
    Ok(())
}

fn ping_master(ctx: &Arc<ServerContext>, stream: &mut TcpStream) -> Result<()> {
    proto::send_frame(stream, Cmd::PingMasterReq, 0, &[])?;
    let (header, body) = proto::recv_frame(stream, 64 * 1024)?;
    if header.status != 0 {
        return Err(Error::new(Errno::from_wire(header.status)));
    }

    let mut reader = proto::BodyReader::new(&body);
    let inode_sn = reader.u64()?;
    ctx.store.generator().advance_to(inode_sn);

    let server_count = reader.u32()? as usize;
    for _ in 0..server_count {
        let server_id = reader.u32()?;
        let status_value = reader.u8()?;
        if let Ok(status) = ServerStatus::try_from(status_value) {
            ctx.cluster.set_status(server_id, status);
        }
    }
    Ok(())
}
