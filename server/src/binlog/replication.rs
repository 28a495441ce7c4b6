// SPDX-License-Identifier: MPL-2.0

//! The master-side replication engine.
//!
//! One state machine per slave:
//!
//! ```text
//! NONE --connect--> CONNECTING --socket-ready--> WAITING_JOIN_RESP
//!      --join-ok--> SYNC_FROM_DISK --caught-up--> SYNC_FROM_QUEUE
//!      --error/disconnect--> NONE
//! ```
//!
//! During disk sync the master keeps at most one chunk in flight beyond
//! the slave's acknowledgement; during queue sync it drains the per-slave
//! buffer queue into one push per cycle and records every shipped
//! `data_version` in the push-result ring. Any error a slave reports
//! tears the link down; the rejoin resumes from the slave's own hint,
//! which is exactly the failing version.

use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpStream;
use std::thread::JoinHandle;
use std::time::Duration;

use super::pack;
use super::producer::RecordBuffer;
use super::push_result::PushResultRing;
use super::reader::BinlogReader;
use crate::clock;
use crate::cluster::PeerState;
use crate::config::{ServerConfig, CONNECT_TIMEOUT_SECS, NETWORK_TIMEOUT_SECS};
use crate::context::ServerContext;
use crate::data_thread::RecordOrigin;
use crate::prelude::*;
use crate::proto::{self, wire, Cmd, STATUS_MASTER_INCONSISTENT};
use crate::types::{BinlogPosition, ServerStatus};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStage {
    None = 0,
    Connecting = 1,
    WaitingJoinResp = 2,
    SyncFromDisk = 3,
    SyncFromQueue = 4,
}

impl ReplicationStage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::WaitingJoinResp,
            3 => Self::SyncFromDisk,
            4 => Self::SyncFromQueue,
            _ => Self::None,
        }
    }
}

/// The largest frame body replication connections may carry: one push
/// header plus a full buffer of records (a single record may reach
/// `RECORD_MAX_SIZE` on its own).
pub fn replication_body_cap(config: &ServerConfig) -> usize {
    config.task_buffer_size.max(pack::RECORD_MAX_SIZE + 1024)
        + wire::PUSH_BINLOG_REQ_HEADER_SIZE
}

/// One record batch drained from a slave queue.
struct QueueBatch {
    bytes: Vec<u8>,
    last_data_version: u64,
    records: Vec<(u64, Option<RecordOrigin>)>,
}

/// Master-side state for one slave, shared between the producer (which
/// enqueues buffers), the replication thread, and the ack receiver.
pub struct SlaveLink {
    pub peer: Arc<PeerState>,
    queue: Mutex<VecDeque<Arc<RecordBuffer>>>,
    queue_cond: Condvar,
    pub ring: Mutex<PushResultRing>,
    /// Highest `data_version` the slave has acknowledged.
    pub by_resp: AtomicU64,
    /// First errno an acknowledgement carried; nonzero tears the link.
    ack_error: AtomicU32,
    stage: std::sync::atomic::AtomicU8,
}

impl SlaveLink {
    pub fn new(peer: Arc<PeerState>, ring_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            peer,
            queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            ring: Mutex::new(PushResultRing::new(ring_capacity)),
            by_resp: AtomicU64::new(0),
            ack_error: AtomicU32::new(0),
            stage: std::sync::atomic::AtomicU8::new(ReplicationStage::None as u8),
        })
    }

    pub fn stage(&self) -> ReplicationStage {
        ReplicationStage::from_u8(self.stage.load(Ordering::SeqCst))
    }

    pub fn enqueue(&self, buffer: Arc<RecordBuffer>) {
        self.queue.lock().unwrap().push_back(buffer);
        self.queue_cond.notify_all();
    }

    /// Drops everything queued, reporting the highest version seen.
    fn discard_all(&self) -> Option<u64> {
        let mut queue = self.queue.lock().unwrap();
        let last = queue.back().map(|buffer| buffer.data_version);
        queue.clear();
        last
    }

    /// Drops queue entries already covered by the disk catch-up.
    fn discard_synced(&self, up_to: u64) {
        let mut queue = self.queue.lock().unwrap();
        while matches!(queue.front(), Some(buffer) if buffer.data_version <= up_to) {
            queue.pop_front();
        }
    }

    fn collect_batch(&self, max_bytes: usize) -> Option<QueueBatch> {
        let mut queue = self.queue.lock().unwrap();
        queue.front()?;
        let mut batch = QueueBatch {
            bytes: Vec::new(),
            last_data_version: 0,
            records: Vec::new(),
        };
        while let Some(front) = queue.front() {
            if !batch.bytes.is_empty() && batch.bytes.len() + front.bytes.len() > max_bytes {
                break;
            }
            let buffer = queue.pop_front().unwrap();
            batch.bytes.extend_from_slice(&buffer.bytes);
            batch.last_data_version = buffer.data_version;
            batch.records.push((buffer.data_version, buffer.origin));
        }
        Some(batch)
    }

    fn wait_for_queue(&self, timeout: Duration) {
        let queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            let _ = self.queue_cond.wait_timeout(queue, timeout).unwrap();
        }
    }

    fn take_ack_error(&self) -> Option<u32> {
        match self.ack_error.load(Ordering::SeqCst) {
            0 => None,
            errno => Some(errno),
        }
    }
}

/// Externally visible slave status follows the stage transitions.
fn set_stage(ctx: &ServerContext, link: &SlaveLink, stage: ReplicationStage) {
    let peer_id = link.peer.id();
    match stage {
        ReplicationStage::None => {
            let status = link.peer.status();
            if status == ServerStatus::Syncing || status == ServerStatus::Active {
                ctx.cluster.set_status(peer_id, ServerStatus::Offline);
            }
        }
        ReplicationStage::SyncFromDisk => {
            let status = link.peer.status();
            if status == ServerStatus::Init {
                ctx.cluster.set_status(peer_id, ServerStatus::Building);
            } else if status != ServerStatus::Building {
                ctx.cluster.set_status(peer_id, ServerStatus::Syncing);
            }
        }
        ReplicationStage::SyncFromQueue => {
            ctx.cluster.set_status(peer_id, ServerStatus::Active);
        }
        _ => {}
    }
    link.stage.store(stage as u8, Ordering::SeqCst);
}

pub struct ReplicationManager {
    links: Vec<Arc<SlaveLink>>,
    threads: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ReplicationManager {
    /// Spawns one replication thread per slave and exposes their queues
    /// to the producer.
    pub fn start(ctx: &Arc<ServerContext>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let ring_capacity = 4 * ctx.config.task_buffer_size / pack::RECORD_MIN_SIZE;
        let mut links = Vec::new();
        let mut threads = Vec::new();
        for peer in ctx.cluster.peers() {
            if peer.id() == ctx.cluster.my_id() {
                continue;
            }
            let link = SlaveLink::new(peer.clone(), ring_capacity);
            links.push(link.clone());
            let ctx = ctx.clone();
            let stop = stop.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("repl-{}", peer.id()))
                    .spawn(move || replication_loop(ctx, link, stop))
                    .expect("spawn replication thread"),
            );
        }
        ctx.producer.set_links(links.clone());
        Self {
            links,
            threads,
            stop,
        }
    }

    pub fn links(&self) -> &[Arc<SlaveLink>] {
        &self.links
    }

    pub fn shutdown(self, ctx: &ServerContext) {
        self.stop.store(true, Ordering::SeqCst);
        for link in &self.links {
            link.queue_cond.notify_all();
        }
        for thread in self.threads {
            let _ = thread.join();
        }
        ctx.producer.clear_links();
    }
}

fn backoff_secs(fail_count: u32) -> u64 {
    match fail_count {
        0 => 1,
        1 => 2,
        2 => 4,
        3 => 8,
        4 => 16,
        _ => 32,
    }
}

fn sleep_with_stop(stop: &AtomicBool, duration: Duration) {
    let deadline = std::time::Instant::now() + duration;
    while std::time::Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn connect_to_slave(link: &SlaveLink) -> Result<TcpStream> {
    let addr: std::net::SocketAddr = link
        .peer
        .config
        .cluster_addr
        .parse()
        .map_err(|_| Error::with_message(Errno::EINVAL, "bad cluster address"))?;
    let stream =
        TcpStream::connect_timeout(&addr, Duration::from_secs(CONNECT_TIMEOUT_SECS))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_secs(NETWORK_TIMEOUT_SECS)))?;
    Ok(stream)
}

/// Sends `JOIN_SLAVE_REQ` and interprets the response, including the
/// brain-split guard.
fn join_slave(
    ctx: &ServerContext,
    link: &SlaveLink,
    stream: &mut TcpStream,
) -> Result<wire::JoinSlaveResp> {
    let req = wire::JoinSlaveReq {
        cluster_id: ctx.cluster.cluster_id() as u32,
        server_id: ctx.cluster.my_id(),
        buffer_size: ctx.config.task_buffer_size as u32,
        key: link.peer.key().unwrap_or([0u8; 8]),
    };
    proto::send_frame(stream, Cmd::JoinSlaveReq, 0, &req.pack())?;

    let (header, body) = proto::recv_frame(stream, replication_body_cap(&ctx.config))?;
    if header.status == STATUS_MASTER_INCONSISTENT {
        error!(
            "slave {} answered master-inconsistent: {}",
            link.peer.id(),
            String::from_utf8_lossy(&body)
        );
        ctx.cluster.trigger_reselect_master();
        return_errno_with_message!(Errno::EEXIST, "master inconsistent");
    }
    if header.status != 0 {
        warn!(
            "join slave {} fail, status: {}, {}",
            link.peer.id(),
            header.status,
            String::from_utf8_lossy(&body)
        );
        return Err(Error::new(Errno::from_wire(header.status)));
    }
    wire::JoinSlaveResp::unpack(&mut proto::BodyReader::new(&body))
}

fn send_push(
    stream: &mut TcpStream,
    last_data_version: u64,
    records: &[u8],
) -> Result<()> {
    let body_header = wire::PushBinlogReqHeader {
        binlog_length: records.len() as u32,
        last_data_version,
    };
    let mut header = proto::Header::new(
        Cmd::PushBinlogReq,
        wire::PUSH_BINLOG_REQ_HEADER_SIZE + records.len(),
    );
    header.status = 0;
    stream.write_all(&header.pack())?;
    stream.write_all(&body_header.pack())?;
    stream.write_all(records)?;
    stream.flush()?;
    Ok(())
}

/// Receives `PUSH_BINLOG_RESP` frames for one link until the socket
/// closes. Successful entries advance `by_resp` and clear ring entries;
/// the first failing entry aborts the batch and flags the link for a
/// disk resync.
fn ack_loop(
    ctx: Arc<ServerContext>,
    link: Arc<SlaveLink>,
    mut stream: TcpStream,
    stop: Arc<AtomicBool>,
) {
    let cap = replication_body_cap(&ctx.config);
    loop {
        let (header, body) =
            match proto::recv_frame_interruptible(&mut stream, cap, &stop) {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(_) => return,
            };
        if header.cmd != Cmd::PushBinlogResp as u8 {
            debug!("unexpected cmd {} on replication link", header.cmd);
            continue;
        }
        let entries =
            match wire::unpack_push_binlog_resp(&mut proto::BodyReader::new(&body)) {
                Ok(entries) => entries,
                Err(err) => {
                    error!("bad push binlog response: {}", err);
                    link.ack_error
                        .store(Errno::EINVAL.as_i32() as u32, Ordering::SeqCst);
                    return;
                }
            };

        for entry in entries {
            if entry.err_no != 0 {
                error!(
                    "replica fail on slave {}, data_version: {}, errno: {}",
                    link.peer.id(),
                    entry.data_version,
                    entry.err_no
                );
                link.ack_error.store(entry.err_no as u32, Ordering::SeqCst);
                return;
            }
            link.by_resp.fetch_max(entry.data_version, Ordering::SeqCst);
            link.peer
                .last_data_version
                .fetch_max(entry.data_version, Ordering::SeqCst);

            if link.stage() == ReplicationStage::SyncFromQueue {
                let removed = link.ring.lock().unwrap().remove(entry.data_version);
                match removed {
                    Ok(pending) => notify_replicated(&ctx, &pending.origin),
                    Err(_) => {
                        error!(
                            "push result ring lacks data_version {}",
                            entry.data_version
                        );
                        link.ack_error
                            .store(Errno::EINVAL.as_i32() as u32, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }
    }
}

/// The client was answered when the record entered the producer queue;
/// the acknowledgement only confirms replication for bookkeeping, with
/// the `task_version` comparison dropping notifications whose task is
/// long gone.
fn notify_replicated(ctx: &ServerContext, origin: &Option<RecordOrigin>) {
    let Some(origin) = origin else { return };
    match ctx.conns.get(origin.conn_id) {
        Some(conn)
            if conn.task_version.load(Ordering::SeqCst) == origin.task_version =>
        {
            debug!("replication confirmed for conn {}", origin.conn_id);
        }
        _ => debug!("task of conn {} already cleaned up", origin.conn_id),
    }
}

struct LinkTearDown;

fn replication_loop(ctx: Arc<ServerContext>, link: Arc<SlaveLink>, stop: Arc<AtomicBool>) {
    let mut fail_count: u32 = 0;
    while !stop.load(Ordering::SeqCst) {
        if !ctx.cluster.is_myself_master() {
            break;
        }
        match run_once(&ctx, &link, &stop, &mut fail_count) {
            Ok(()) => {}
            Err(LinkTearDown) => {}
        }
        set_stage(&ctx, &link, ReplicationStage::None);
        link.discard_all();
        link.ring.lock().unwrap().clear_all();
        link.ack_error.store(0, Ordering::SeqCst);
        if !stop.load(Ordering::SeqCst) {
            let delay = if fail_count == 0 {
                // A clean teardown (slave error, lost link) retries fast.
                Duration::from_millis(200)
            } else {
                Duration::from_secs(backoff_secs(fail_count - 1))
            };
            sleep_with_stop(&stop, delay);
        }
    }
    set_stage(&ctx, &link, ReplicationStage::None);
    link.discard_all();
    link.ring.lock().unwrap().clear_all();
}

fn run_once(
    ctx: &Arc<ServerContext>,
    link: &Arc<SlaveLink>,
    stop: &Arc<AtomicBool>,
    fail_count: &mut u32,
) -> core::result::Result<(), LinkTearDown> {
    set_stage(ctx, link, ReplicationStage::Connecting);
    let mut stream = match connect_to_slave(link) {
        Ok(stream) => stream,
        Err(err) => {
            if *fail_count % 100 == 0 {
                error!(
                    "connect to slave {} ({}) fail: {}",
                    link.peer.id(),
                    link.peer.config.cluster_addr,
                    err
                );
            }
            *fail_count += 1;
            return Err(LinkTearDown);
        }
    };

    set_stage(ctx, link, ReplicationStage::WaitingJoinResp);
    let join = match join_slave(ctx, link, &mut stream) {
        Ok(join) => join,
        Err(_) => {
            *fail_count += 1;
            return Err(LinkTearDown);
        }
    };
    if *fail_count > 0 {
        info!(
            "connected to slave {} after {} retries",
            link.peer.id(),
            fail_count
        );
    }
    *fail_count = 0;
    link.by_resp.store(join.last_data_version, Ordering::SeqCst);
    link.peer
        .last_data_version
        .store(join.last_data_version, Ordering::SeqCst);
    info!(
        "slave {} joins from data_version {}, binlog position ({}, {})",
        link.peer.id(),
        join.last_data_version,
        join.binlog_index,
        join.binlog_offset
    );

    let ack_thread = {
        let ack_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(_) => return Err(LinkTearDown),
        };
        let ctx = ctx.clone();
        let link = link.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name(format!("repl-ack-{}", link.peer.id()))
            .spawn(move || ack_loop(ctx, link, ack_stream, stop))
            .expect("spawn ack thread")
    };

    let result = sync_with_slave(ctx, link, stop, &mut stream, join);

    // Closing the socket ends the ack receiver too.
    let _ = stream.shutdown(std::net::Shutdown::Both);
    drop(stream);
    let _ = ack_thread.join();
    result
}

fn sync_with_slave(
    ctx: &Arc<ServerContext>,
    link: &Arc<SlaveLink>,
    stop: &Arc<AtomicBool>,
    stream: &mut TcpStream,
    join: wire::JoinSlaveResp,
) -> core::result::Result<(), LinkTearDown> {
    // --- SYNC_FROM_DISK ---
    set_stage(ctx, link, ReplicationStage::SyncFromDisk);
    let start_position = BinlogPosition {
        index: join.binlog_index,
        offset: join.binlog_offset,
    };
    let mut reader = BinlogReader::start(
        ctx.producer.writer().clone(),
        start_position,
        ctx.config.task_buffer_size,
    );
    let sync_start_ms = clock::current_time_millis();
    let mut sync_bytes: u64 = 0;
    let mut by_disk_previous: u64 = 0;
    let mut by_disk_current: u64 = join.last_data_version;
    let mut by_queue: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) || !ctx.cluster.is_myself_master() {
            return Err(LinkTearDown);
        }
        if link.take_ack_error().is_some() {
            return Err(LinkTearDown);
        }
        // Records arriving while disk sync runs will be read from disk;
        // only their versions matter for the hand-over condition.
        if let Some(last) = link.discard_all() {
            by_queue = by_queue.max(last);
        }
        // Flow control: at most one chunk beyond the slave's ack.
        if link.by_resp.load(Ordering::SeqCst) < by_disk_previous {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        let Some(result) = reader.fetch(Duration::from_millis(100)) else {
            continue;
        };
        match result.err {
            None => {
                if result.last_data_version > by_disk_current {
                    by_disk_previous = by_disk_current;
                    by_disk_current = result.last_data_version;
                }
                sync_bytes += result.bytes.len() as u64;
                if send_push(stream, result.last_data_version, &result.bytes).is_err() {
                    return Err(LinkTearDown);
                }
            }
            Some(Errno::ENOENT) => {
                let acked = link.by_resp.load(Ordering::SeqCst);
                if by_queue <= by_disk_current && acked >= by_disk_current {
                    reader.terminate();
                    link.discard_synced(by_disk_current);
                    info!(
                        "sync to slave {} by disk done, binlog bytes: {}, \
                         time used: {} ms",
                        link.peer.id(),
                        sync_bytes,
                        clock::current_time_millis() - sync_start_ms
                    );
                    break;
                }
            }
            Some(_) => return Err(LinkTearDown),
        }
    }

    // --- SYNC_FROM_QUEUE ---
    set_stage(ctx, link, ReplicationStage::SyncFromQueue);
    let max_batch = ctx.config.task_buffer_size;
    loop {
        if stop.load(Ordering::SeqCst) || !ctx.cluster.is_myself_master() {
            return Err(LinkTearDown);
        }
        if link.take_ack_error().is_some() {
            return Err(LinkTearDown);
        }

        let now = clock::current_time_secs();
        for expired in link.ring.lock().unwrap().clear_timeouts(now) {
            warn!(
                "push result for data_version {} timed out on slave {}",
                expired.data_version,
                link.peer.id()
            );
        }

        let Some(batch) = link.collect_batch(max_batch) else {
            link.wait_for_queue(Duration::from_millis(100));
            continue;
        };
        {
            let mut ring = link.ring.lock().unwrap();
            for (data_version, origin) in &batch.records {
                if ring.add(*data_version, *origin, now).is_err() {
                    warn!("push result ring overflow on slave {}", link.peer.id());
                }
            }
        }
        if send_push(stream, batch.last_data_version, &batch.bytes).is_err() {
            return Err(LinkTearDown);
        }
    }
}
