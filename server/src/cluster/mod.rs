// SPDX-License-Identifier: MPL-2.0

//! Cluster membership state.
//!
//! Election itself is out of scope: the configured master id is the
//! oracle, and the pre-set/commit next-master commands adjust it. What
//! lives here is the member table with per-server status, the persisted
//! `cluster.info` file, and the brain-split bookkeeping.

pub mod handler;
pub mod relationship;

use std::path::PathBuf;

use crate::config::{PeerConfig, ServerConfig};
use crate::ini::{IniDocument, IniSection};
use crate::prelude::*;
use crate::types::{ServerStatus, REPLICA_KEY_SIZE};

const CLUSTER_INFO_FILENAME: &str = "cluster.info";
const SERVER_SECTION_PREFIX: &str = "server-";
const ITEM_IS_MASTER: &str = "is_master";
const ITEM_STATUS: &str = "status";
const ITEM_LAST_DATA_VERSION: &str = "last_data_version";

pub struct PeerState {
    pub config: PeerConfig,
    status: Mutex<ServerStatus>,
    pub last_data_version: AtomicU64,
    /// The replica key the peer handed us via `JOIN_MASTER`.
    key: Mutex<Option<[u8; REPLICA_KEY_SIZE]>>,
    /// Whether the peer currently has a relationship with us.
    pub joined: AtomicBool,
}

impl PeerState {
    fn new(config: PeerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            status: Mutex::new(ServerStatus::Init),
            last_data_version: AtomicU64::new(0),
            key: Mutex::new(None),
            joined: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_key(&self, key: [u8; REPLICA_KEY_SIZE]) {
        *self.key.lock().unwrap() = Some(key);
    }

    pub fn key(&self) -> Option<[u8; REPLICA_KEY_SIZE]> {
        *self.key.lock().unwrap()
    }
}

pub struct ClusterState {
    cluster_id: u16,
    my_id: u32,
    peers: Vec<Arc<PeerState>>,
    master_id: AtomicU32,
    /// Nonzero while a master hand-over is being prepared.
    next_master_id: AtomicU32,
    /// Bumped on any membership/status change so pingers resend the table.
    pub change_version: AtomicU64,
    reselect_count: AtomicU64,
    config_sign: [u8; 16],
    info_path: PathBuf,
}

impl ClusterState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let peers = config
            .servers
            .iter()
            .map(|peer| PeerState::new(peer.clone()))
            .collect();
        let state = Self {
            cluster_id: config.cluster_id,
            my_id: config.my_server_id,
            peers,
            master_id: AtomicU32::new(config.master_server_id),
            next_master_id: AtomicU32::new(0),
            change_version: AtomicU64::new(1),
            reselect_count: AtomicU64::new(0),
            config_sign: config.config_sign(),
            info_path: config.data_path.join(CLUSTER_INFO_FILENAME),
        };
        state.load_info()?;
        Ok(state)
    }

    pub fn cluster_id(&self) -> u16 {
        self.cluster_id
    }

    pub fn my_id(&self) -> u32 {
        self.my_id
    }

    pub fn config_sign(&self) -> &[u8; 16] {
        &self.config_sign
    }

    pub fn peers(&self) -> &[Arc<PeerState>] {
        &self.peers
    }

    pub fn peer(&self, id: u32) -> Option<&Arc<PeerState>> {
        self.peers.iter().find(|peer| peer.id() == id)
    }

    pub fn myself(&self) -> &Arc<PeerState> {
        self.peer(self.my_id).expect("myself is in the member table")
    }

    pub fn master_id(&self) -> u32 {
        self.master_id.load(Ordering::SeqCst)
    }

    pub fn master(&self) -> Option<&Arc<PeerState>> {
        self.peer(self.master_id())
    }

    pub fn is_myself_master(&self) -> bool {
        self.master_id() == self.my_id
    }

    pub fn next_master_id(&self) -> u32 {
        self.next_master_id.load(Ordering::SeqCst)
    }

    pub fn pre_set_next_master(&self, id: u32) -> Result<()> {
        if self.is_myself_master() {
            return_errno_with_message!(Errno::EEXIST, "i am already master");
        }
        self.next_master_id.store(id, Ordering::SeqCst);
        info!("next master candidate: server {}", id);
        Ok(())
    }

    pub fn commit_next_master(&self, id: u32) -> Result<()> {
        if self.peer(id).is_none() {
            return_errno_with_message!(Errno::ENOENT, "master server id not exist");
        }
        self.master_id.store(id, Ordering::SeqCst);
        self.next_master_id.store(0, Ordering::SeqCst);
        self.change_version.fetch_add(1, Ordering::SeqCst);
        info!("master committed: server {}", id);
        self.write_info()
    }

    /// Called when any side observes `STATUS_MASTER_INCONSISTENT`:
    /// more than one node believes it is master, and a re-election must
    /// be forced.
    pub fn trigger_reselect_master(&self) {
        self.reselect_count.fetch_add(1, Ordering::SeqCst);
        warn!(
            "more than one master occurred, brain-split suspected, \
             triggering master reselection"
        );
    }

    pub fn reselect_count(&self) -> u64 {
        self.reselect_count.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, id: u32, status: ServerStatus) {
        let Some(peer) = self.peer(id) else { return };
        let changed = {
            let mut current = peer.status.lock().unwrap();
            if *current == status {
                false
            } else {
                debug!("server {} status {:?} -> {:?}", id, *current, status);
                *current = status;
                true
            }
        };
        if changed {
            self.change_version.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = self.write_info() {
                error!("write cluster info fail: {}", err);
            }
        }
    }

    fn load_info(&self) -> Result<()> {
        if !self.info_path.exists() {
            return self.write_info();
        }
        let doc = IniDocument::load(&self.info_path)?;
        for peer in &self.peers {
            let section_name = format!("{}{}", SERVER_SECTION_PREFIX, peer.id());
            let Some(section) = doc.section(&section_name) else {
                continue;
            };
            let status_value: u8 = section.get_int(ITEM_STATUS, ServerStatus::Init as u8);
            if let Ok(status) = ServerStatus::try_from(status_value) {
                *peer.status.lock().unwrap() = status;
            }
            peer.last_data_version
                .store(section.get_int(ITEM_LAST_DATA_VERSION, 0u64), Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn write_info(&self) -> Result<()> {
        let mut doc = IniDocument::new();
        let master_id = self.master_id();
        for peer in &self.peers {
            let mut section =
                IniSection::new(&format!("{}{}", SERVER_SECTION_PREFIX, peer.id()));
            section.set(ITEM_IS_MASTER, (peer.id() == master_id) as u8);
            section.set(ITEM_STATUS, peer.status() as u8);
            section.set(
                ITEM_LAST_DATA_VERSION,
                peer.last_data_version.load(Ordering::SeqCst),
            );
            doc.push_section(section);
        }
        doc.save(&self.info_path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerConfig;

    fn test_config(name: &str) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.data_path = std::env::temp_dir()
            .join("metadir-cluster-test")
            .join(format!("{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&config.data_path);
        std::fs::create_dir_all(&config.data_path).unwrap();
        config.servers.push(PeerConfig {
            id: 2,
            cluster_addr: "127.0.0.1:11021".into(),
            service_addr: "127.0.0.1:11022".into(),
        });
        config
    }

    #[test]
    fn statuses_persist_across_restart() {
        let config = test_config("persist");
        {
            let cluster = ClusterState::new(&config).unwrap();
            cluster.set_status(2, ServerStatus::Active);
            cluster
                .peer(2)
                .unwrap()
                .last_data_version
                .store(42, Ordering::SeqCst);
            cluster.write_info().unwrap();
        }
        let cluster = ClusterState::new(&config).unwrap();
        assert_eq!(cluster.peer(2).unwrap().status(), ServerStatus::Active);
        assert_eq!(
            cluster.peer(2).unwrap().last_data_version.load(Ordering::SeqCst),
            42
        );
    }

    #[test]
    fn next_master_handover() {
        let config = test_config("handover");
        let cluster = ClusterState::new(&config).unwrap();
        assert!(cluster.is_myself_master());
        // The sitting master refuses a pre-set.
        assert_eq!(
            cluster.pre_set_next_master(2).unwrap_err().error(),
            Errno::EEXIST
        );

        let mut slave_config = config.clone();
        slave_config.my_server_id = 2;
        slave_config.data_path = config.data_path.join("slave");
        std::fs::create_dir_all(&slave_config.data_path).unwrap();
        let slave = ClusterState::new(&slave_config).unwrap();
        slave.pre_set_next_master(2).unwrap();
        assert_eq!(slave.next_master_id(), 2);
        slave.commit_next_master(2).unwrap();
        assert!(slave.is_myself_master());
        assert_eq!(slave.next_master_id(), 0);
    }
}
