// SPDX-License-Identifier: MPL-2.0

//! End-to-end tests over real sockets: one- and two-node clusters
//! exercising the full request pipeline, replication catch-up, and the
//! brain-split guard.

use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use metadir_server::binlog::replay::ReplayContext;
use metadir_server::binlog::writer::binlog_file_path;
use metadir_server::config::{PeerConfig, ServerConfig};
use metadir_server::error::Errno;
use metadir_server::proto::{self, wire, BodyWriter, Cmd, Header};
use metadir_server::server::{Server, ServerHandle};
use metadir_server::types::{FullName, LockOp, ServerStatus, MODE_DIR, MODE_FILE};

fn init_logger() {
    metadir_server::logger::init(log::LevelFilter::Warn);
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_data_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir()
        .join("metadir-e2e")
        .join(format!("{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn single_node_config(name: &str) -> ServerConfig {
    let service_port = free_port();
    let cluster_port = free_port();
    ServerConfig {
        servers: vec![PeerConfig {
            id: 1,
            cluster_addr: format!("127.0.0.1:{}", cluster_port),
            service_addr: format!("127.0.0.1:{}", service_port),
        }],
        data_path: test_data_path(name),
        ..Default::default()
    }
}

/// Two members; `my_id` selects the node, `master_id` its oracle.
fn two_node_config(
    name: &str,
    ports: &[u16; 4],
    my_id: u32,
    master_id: u32,
) -> ServerConfig {
    ServerConfig {
        my_server_id: my_id,
        master_server_id: master_id,
        servers: vec![
            PeerConfig {
                id: 1,
                cluster_addr: format!("127.0.0.1:{}", ports[0]),
                service_addr: format!("127.0.0.1:{}", ports[1]),
            },
            PeerConfig {
                id: 2,
                cluster_addr: format!("127.0.0.1:{}", ports[2]),
                service_addr: format!("127.0.0.1:{}", ports[3]),
            },
        ],
        data_path: test_data_path(&format!("{}-{}", name, my_id)),
        ..Default::default()
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(handle: &ServerHandle) -> Self {
        Self::connect_addr(&handle.service_addr().to_string())
    }

    fn connect_addr(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_nodelay(true).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self { stream }
    }

    fn request(&mut self, cmd: Cmd, body: &[u8]) -> (Header, Vec<u8>) {
        proto::send_frame(&mut self.stream, cmd, 0, body).unwrap();
        proto::recv_frame(&mut self.stream, 1 << 20).unwrap()
    }

    fn create(&mut self, ns: &[u8], path: &[u8], mode: u32) -> (u16, u64) {
        let mut writer = BodyWriter::new();
        writer.put_u32(mode);
        wire::pack_dentry_info(&mut writer, &FullName::new(ns, path));
        let (header, body) = self.request(Cmd::CreateDentryReq, &writer.into_bytes());
        (header.status, stat_reply_inode(&body))
    }

    fn remove(&mut self, ns: &[u8], path: &[u8]) -> u16 {
        let mut writer = BodyWriter::new();
        wire::pack_dentry_info(&mut writer, &FullName::new(ns, path));
        self.request(Cmd::RemoveDentryReq, &writer.into_bytes())
            .0
            .status
    }

    fn stat_by_path(&mut self, ns: &[u8], path: &[u8]) -> (u16, u64, u32, i64) {
        let mut writer = BodyWriter::new();
        wire::pack_dentry_info(&mut writer, &FullName::new(ns, path));
        let (header, body) = self.request(Cmd::StatByPathReq, &writer.into_bytes());
        if header.status != 0 {
            return (header.status, 0, 0, 0);
        }
        let inode = u64::from_be_bytes(body[0..8].try_into().unwrap());
        let mode = u32::from_be_bytes(body[8..12].try_into().unwrap());
        let size = i64::from_be_bytes(body[32..40].try_into().unwrap());
        (0, inode, mode, size)
    }

    fn stat_by_inode(&mut self, inode: u64) -> u16 {
        let (header, _) = self.request(Cmd::StatByInodeReq, &inode.to_be_bytes());
        header.status
    }

    fn set_size(&mut self, ns: &[u8], inode: u64, size: i64, force: bool) -> u16 {
        let mut writer = BodyWriter::new();
        writer.put_u64(inode);
        writer.put_i64(size);
        writer.put_u8(force as u8);
        writer.put_u8(ns.len() as u8);
        writer.put_bytes(ns);
        self.request(Cmd::SetDentrySizeReq, &writer.into_bytes())
            .0
            .status
    }

    fn list_first(&mut self, ns: &[u8], path: &[u8]) -> (u16, Vec<Vec<u8>>) {
        let mut writer = BodyWriter::new();
        wire::pack_dentry_info(&mut writer, &FullName::new(ns, path));
        let (header, body) = self.request(Cmd::ListDentryFirstReq, &writer.into_bytes());
        if header.status != 0 {
            return (header.status, Vec::new());
        }
        let count = u32::from_be_bytes(body[8..12].try_into().unwrap()) as usize;
        let mut names = Vec::with_capacity(count);
        let mut offset = 16;
        for _ in 0..count {
            let len = body[offset] as usize;
            names.push(body[offset + 1..offset + 1 + len].to_vec());
            offset += 1 + len;
        }
        (0, names)
    }

    fn flock(
        &mut self,
        inode: u64,
        offset: i64,
        length: i64,
        tid: u64,
        pid: u32,
        operation: u32,
    ) -> u16 {
        let mut writer = BodyWriter::new();
        writer.put_u64(inode);
        writer.put_i64(offset);
        writer.put_i64(length);
        writer.put_u64(tid);
        writer.put_u32(pid);
        writer.put_u32(operation);
        self.request(Cmd::FlockDentryReq, &writer.into_bytes())
            .0
            .status
    }

    fn sys_lock(&mut self, inode: u64, flags: u32) -> (u16, i64) {
        let mut writer = BodyWriter::new();
        writer.put_u64(inode);
        writer.put_u32(flags);
        writer.put_u32(0);
        let (header, body) = self.request(Cmd::SysLockDentryReq, &writer.into_bytes());
        let size = if header.status == 0 {
            i64::from_be_bytes(body[0..8].try_into().unwrap())
        } else {
            0
        };
        (header.status, size)
    }

    fn sys_unlock(
        &mut self,
        ns: &[u8],
        inode: u64,
        old_size: i64,
        new_size: i64,
        flags: u32,
    ) -> (u16, i64) {
        let mut writer = BodyWriter::new();
        writer.put_u64(inode);
        writer.put_i64(old_size);
        writer.put_i64(new_size);
        writer.put_u32(flags);
        writer.put_u8(0);
        writer.put_u8(ns.len() as u8);
        writer.put_bytes(ns);
        let (header, body) = self.request(Cmd::SysUnlockDentryReq, &writer.into_bytes());
        let size = if header.status == 0 {
            i64::from_be_bytes(body[0..8].try_into().unwrap())
        } else {
            0
        };
        (header.status, size)
    }

    fn service_stat(&mut self) -> (u64, u64) {
        let (header, body) = self.request(Cmd::ServiceStatReq, &[]);
        assert_eq!(header.status, 0);
        let data_version = u64::from_be_bytes(body[14..22].try_into().unwrap());
        let inode_sn = u64::from_be_bytes(body[22..30].try_into().unwrap());
        (data_version, inode_sn)
    }
}

fn stat_reply_inode(body: &[u8]) -> u64 {
    if body.len() >= 8 {
        u64::from_be_bytes(body[0..8].try_into().unwrap())
    } else {
        0
    }
}

fn errno(value: Errno) -> u16 {
    value.as_i32() as u16
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn single_node_dentry_lifecycle() {
    init_logger();
    let handle = Server::start(single_node_config("lifecycle")).unwrap();
    let mut client = Client::connect(&handle);

    // Active test answers an empty frame.
    let (header, body) = client.request(Cmd::ActiveTestReq, &[]);
    assert_eq!(header.status, 0);
    assert!(body.is_empty());

    let (status, root_inode) = client.create(b"nsA", b"/", MODE_DIR | 0o755);
    assert_eq!(status, 0);
    assert!(root_inode > 0);

    let (status, a_inode) = client.create(b"nsA", b"/a", MODE_DIR | 0o755);
    assert_eq!(status, 0);
    let (status, b_inode) = client.create(b"nsA", b"/a/b", MODE_FILE | 0o644);
    assert_eq!(status, 0);
    assert!(b_inode > a_inode);

    // Duplicate create and create in a missing directory.
    assert_eq!(
        client.create(b"nsA", b"/a/b", MODE_FILE | 0o644).0,
        errno(Errno::EEXIST)
    );
    assert_eq!(
        client.create(b"nsA", b"/no/dir/file", MODE_FILE | 0o644).0,
        errno(Errno::ENOENT)
    );

    // Reads resolve the same inodes by path and by inode.
    let (status, inode, mode, _) = client.stat_by_path(b"nsA", b"/a/b");
    assert_eq!(status, 0);
    assert_eq!(inode, b_inode);
    assert_eq!(mode, MODE_FILE | 0o644);
    assert_eq!(client.stat_by_inode(b_inode), 0);

    let (status, names) = client.list_first(b"nsA", b"/a");
    assert_eq!(status, 0);
    assert_eq!(names, vec![b"b".to_vec()]);

    // Non-empty directory refuses removal; then bottom-up removal works.
    assert_eq!(client.remove(b"nsA", b"/a"), errno(Errno::ENOTEMPTY));
    assert_eq!(client.remove(b"nsA", b"/a/b"), 0);
    assert_eq!(client.remove(b"nsA", b"/a"), 0);
    assert_eq!(
        client.stat_by_path(b"nsA", b"/a/b").0,
        errno(Errno::ENOENT)
    );
    assert_eq!(client.stat_by_inode(b_inode), errno(Errno::ENOENT));

    // Every accepted mutation advanced the version: 3 creates + 2 removes.
    let (data_version, _) = client.service_stat();
    assert_eq!(data_version, 5);

    handle.shutdown();
}

#[test]
fn grow_only_set_size() {
    init_logger();
    let handle = Server::start(single_node_config("setsize")).unwrap();
    let mut client = Client::connect(&handle);

    client.create(b"ns", b"/", MODE_DIR | 0o755);
    let (_, inode) = client.create(b"ns", b"/f", MODE_FILE | 0o644);

    assert_eq!(client.set_size(b"ns", inode, 100, false), 0);
    assert_eq!(client.stat_by_path(b"ns", b"/f").3, 100);
    // Shrinking without force is ignored.
    assert_eq!(client.set_size(b"ns", inode, 40, false), 0);
    assert_eq!(client.stat_by_path(b"ns", b"/f").3, 100);
    // Force wins.
    assert_eq!(client.set_size(b"ns", inode, 40, true), 0);
    assert_eq!(client.stat_by_path(b"ns", b"/f").3, 40);

    handle.shutdown();
}

#[test]
fn flock_conflicts_across_connections() {
    init_logger();
    let handle = Server::start(single_node_config("flock")).unwrap();
    let mut owner1 = Client::connect(&handle);

    owner1.create(b"ns", b"/", MODE_DIR | 0o755);
    let (_, inode) = owner1.create(b"ns", b"/locked", MODE_FILE | 0o644);

    // T1 takes the whole-file exclusive lock.
    assert_eq!(owner1.flock(inode, 0, 0, 1, 10, LockOp::EX.bits()), 0);

    // T2 non-blocking shared attempt fails with EAGAIN.
    let mut owner2 = Client::connect(&handle);
    assert_eq!(
        owner2.flock(inode, 0, 0, 2, 20, (LockOp::SH | LockOp::NB).bits()),
        errno(Errno::EAGAIN)
    );

    // getlk reports the blocker.
    let mut writer = BodyWriter::new();
    writer.put_u64(inode);
    writer.put_i64(0);
    writer.put_i64(0);
    writer.put_u32(LockOp::SH.bits());
    let (header, body) = owner2.request(Cmd::GetlkDentryReq, &writer.into_bytes());
    assert_eq!(header.status, 0);
    let tid = u64::from_be_bytes(body[16..24].try_into().unwrap());
    let pid = u32::from_be_bytes(body[24..28].try_into().unwrap());
    let lock_type = u32::from_be_bytes(body[28..32].try_into().unwrap());
    assert_eq!((tid, pid), (1, 10));
    assert_eq!(lock_type, LockOp::EX.bits());

    // A blocking attempt parks until T1 unlocks.
    let addr = handle.service_addr().to_string();
    let waiter = std::thread::spawn(move || {
        let mut owner3 = Client::connect_addr(&addr);
        owner3.flock(inode, 0, 0, 3, 30, LockOp::SH.bits())
    });
    std::thread::sleep(Duration::from_millis(200));
    assert!(!waiter.is_finished());
    assert_eq!(owner1.flock(inode, 0, 0, 1, 10, LockOp::UN.bits()), 0);
    assert_eq!(waiter.join().unwrap(), 0);

    // Unlocking a never-held region reports ENOENT.
    assert_eq!(
        owner1.flock(inode, 7, 5, 1, 10, LockOp::UN.bits()),
        errno(Errno::ENOENT)
    );

    handle.shutdown();
}

#[test]
fn sys_lock_sequence_sets_size() {
    init_logger();
    let handle = Server::start(single_node_config("syslock")).unwrap();
    let mut client = Client::connect(&handle);

    client.create(b"ns", b"/", MODE_DIR | 0o755);
    let (_, inode) = client.create(b"ns", b"/append", MODE_FILE | 0o644);
    client.set_size(b"ns", inode, 100, false);
    let version_before = client.service_stat().0;

    let (status, size) = client.sys_lock(inode, 0);
    assert_eq!(status, 0);
    assert_eq!(size, 100);

    // A second holder refuses in non-blocking mode on its own connection.
    let mut other = Client::connect(&handle);
    assert_eq!(
        other.sys_lock(inode, LockOp::NB.bits()).0,
        errno(Errno::EAGAIN)
    );

    // Unlock applies the append atomically and reports the new size.
    let (status, size) = client.sys_unlock(b"ns", inode, 100, 200, 1);
    assert_eq!(status, 0);
    assert_eq!(size, 200);
    assert_eq!(client.stat_by_path(b"ns", b"/append").3, 200);

    // Exactly one update record was emitted for the unlock.
    assert_eq!(client.service_stat().0, version_before + 1);

    handle.shutdown();
}

#[test]
fn restart_replays_binlog() {
    init_logger();
    let config = single_node_config("restart");
    let data_path = config.data_path.clone();

    let version = {
        let handle = Server::start(config.clone()).unwrap();
        let mut client = Client::connect(&handle);
        client.create(b"ns", b"/", MODE_DIR | 0o755);
        client.create(b"ns", b"/keep", MODE_DIR | 0o755);
        let (_, inode) = client.create(b"ns", b"/keep/f", MODE_FILE | 0o600);
        client.set_size(b"ns", inode, 4096, false);
        client.create(b"ns", b"/gone", MODE_FILE | 0o644);
        client.remove(b"ns", b"/gone");
        let version = client.service_stat().0;
        handle.shutdown();
        version
    };

    // A restart on the same data path rebuilds the identical tree.
    let handle = Server::start(config).unwrap();
    let mut client = Client::connect(&handle);
    assert_eq!(client.service_stat().0, version);
    let (status, _, mode, size) = client.stat_by_path(b"ns", b"/keep/f");
    assert_eq!(status, 0);
    assert_eq!(mode, MODE_FILE | 0o600);
    assert_eq!(size, 4096);
    assert_eq!(
        client.stat_by_path(b"ns", b"/gone").0,
        errno(Errno::ENOENT)
    );

    // Feeding the same binlog once more skips every record.
    let binlog = std::fs::read(binlog_file_path(
        &data_path.join("binlog"),
        0,
    ))
    .unwrap();
    let replay = ReplayContext::new();
    let entries = replay.deal_buffer(handle.ctx(), &binlog).unwrap();
    assert!(entries.iter().all(|entry| entry.err_no == 0));
    let counters = replay.counters();
    assert_eq!(counters.record_count, version);
    assert_eq!(counters.skip_count, version);

    handle.shutdown();
}

#[test]
fn replication_catch_up_and_live_stream() {
    init_logger();
    let ports = [free_port(), free_port(), free_port(), free_port()];
    let master = Server::start(two_node_config("repl", &ports, 1, 1)).unwrap();
    let mut client = Client::connect(&master);

    // History the slave must fetch from disk.
    client.create(b"ns", b"/", MODE_DIR | 0o755);
    client.create(b"ns", b"/old", MODE_DIR | 0o755);
    client.create(b"ns", b"/old/f", MODE_FILE | 0o644);
    let master_version = client.service_stat().0;

    let slave = Server::start(two_node_config("repl", &ports, 2, 1)).unwrap();

    // Mutations are refused on the slave.
    let mut slave_client = Client::connect(&slave);
    assert_eq!(
        slave_client.create(b"ns", b"/nope", MODE_FILE | 0o644).0,
        errno(Errno::EINVAL)
    );

    // The slave catches up from disk and turns ACTIVE.
    assert!(wait_until(Duration::from_secs(20), || {
        slave.ctx().current_data_version() >= master_version
            && slave.ctx().cluster.myself().status() == ServerStatus::Active
    }));
    let (status, _, mode, _) = slave_client.stat_by_path(b"ns", b"/old/f");
    assert_eq!(status, 0);
    assert_eq!(mode, MODE_FILE | 0o644);

    // Live mutations now stream through the queue in order.
    client.create(b"ns", b"/new", MODE_DIR | 0o755);
    client.create(b"ns", b"/new/g", MODE_FILE | 0o600);
    let master_version = client.service_stat().0;
    assert!(wait_until(Duration::from_secs(20), || {
        slave.ctx().current_data_version() >= master_version
    }));
    let (status, _, mode, _) = slave_client.stat_by_path(b"ns", b"/new/g");
    assert_eq!(status, 0);
    assert_eq!(mode, MODE_FILE | 0o600);

    slave.shutdown();
    master.shutdown();
}

#[test]
fn brain_split_join_triggers_reselect() {
    init_logger();
    let ports = [free_port(), free_port(), free_port(), free_port()];
    // Both nodes believe they are master.
    let node_a = Server::start(two_node_config("split", &ports, 1, 1)).unwrap();
    let node_b = Server::start(two_node_config("split", &ports, 2, 2)).unwrap();

    // Each node's join attempt is answered with the master-inconsistency
    // status, which must trigger a reselection on the joiner.
    assert!(wait_until(Duration::from_secs(20), || {
        node_a.ctx().cluster.reselect_count() > 0
            || node_b.ctx().cluster.reselect_count() > 0
    }));

    node_a.shutdown();
    node_b.shutdown();
}
