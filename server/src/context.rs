// SPDX-License-Identifier: MPL-2.0

//! Process-wide state, gathered into one explicit context that every
//! component receives instead of reaching for globals.

use hashbrown::HashMap;
use rand::Rng as _;

use crate::binlog::producer::BinlogProducer;
use crate::binlog::writer::BinlogWriter;
use crate::cluster::ClusterState;
use crate::config::ServerConfig;
use crate::data_thread::{DataThreadPool, QueuedRecord};
use crate::dentry::DentryStore;
use crate::inode_generator::InodeGenerator;
use crate::inode_index::InodeIndex;
use crate::prelude::*;
use crate::types::REPLICA_KEY_SIZE;

/// Per-connection bookkeeping shared with the replication layer.
///
/// The `task_version` counter guards against stale notifications: it is
/// bumped when the connection goes away, so acknowledgements referencing
/// an older capture are detected and dropped.
pub struct ConnState {
    pub id: u64,
    pub task_version: AtomicU64,
}

#[derive(Default)]
pub struct ConnRegistry {
    next_id: AtomicU64,
    map: Mutex<HashMap<u64, Arc<ConnState>>>,
    max_count: AtomicU64,
}

impl ConnRegistry {
    pub fn register(&self) -> Arc<ConnState> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(ConnState {
            id,
            task_version: AtomicU64::new(1),
        });
        let mut map = self.map.lock().unwrap();
        map.insert(id, conn.clone());
        self.max_count
            .fetch_max(map.len() as u64, Ordering::Relaxed);
        conn
    }

    pub fn unregister(&self, id: u64) {
        if let Some(conn) = self.map.lock().unwrap().remove(&id) {
            conn.task_version.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<ConnState>> {
        self.map.lock().unwrap().get(&id).cloned()
    }

    pub fn current_count(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn max_count(&self) -> u64 {
        self.max_count.load(Ordering::Relaxed)
    }
}

pub struct ServerContext {
    pub config: ServerConfig,
    /// This node's replica key; slaves hand it to the master on
    /// `JOIN_MASTER`, and require it back on `JOIN_SLAVE_REQ`.
    pub replica_key: [u8; REPLICA_KEY_SIZE],
    /// The monotonic mutation counter (`data_version` source).
    pub data_version: AtomicU64,
    pub store: DentryStore,
    pub cluster: ClusterState,
    pub producer: BinlogProducer,
    pub conns: ConnRegistry,
    /// Source of dentry-list cursor tokens, seeded from the clock so
    /// tokens from a previous incarnation never validate.
    pub next_list_token: AtomicU64,
    data_pool: RwLock<Option<DataThreadPool>>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, writer: Arc<BinlogWriter>) -> Result<Arc<Self>> {
        config.validate()?;
        let index = Arc::new(InodeIndex::new(
            config.inode_hashtable_capacity,
            config.inode_shared_locks_count,
        ));
        let store = DentryStore::new(
            config.namespace_hashtable_capacity,
            index,
            InodeGenerator::new(config.cluster_id),
        );
        let cluster = ClusterState::new(&config)?;
        let producer = BinlogProducer::new(writer);

        let mut replica_key = [0u8; REPLICA_KEY_SIZE];
        rand::rng().fill(&mut replica_key[..]);

        Ok(Arc::new(Self {
            config,
            replica_key,
            data_version: AtomicU64::new(0),
            store,
            cluster,
            producer,
            conns: ConnRegistry::default(),
            next_list_token: AtomicU64::new(
                (crate::clock::current_time_secs() as u64) << 32,
            ),
            data_pool: RwLock::new(None),
        }))
    }

    pub fn current_data_version(&self) -> u64 {
        self.data_version.load(Ordering::SeqCst)
    }

    pub fn install_data_pool(&self, pool: DataThreadPool) {
        *self.data_pool.write().unwrap() = Some(pool);
    }

    /// Drops the worker senders; data threads drain and exit.
    pub fn take_data_pool(&self) -> Option<DataThreadPool> {
        self.data_pool.write().unwrap().take()
    }

    /// Routes a record to the data thread owning its namespace hash.
    pub fn push_to_data_thread(&self, record: QueuedRecord) -> Result<()> {
        let pool = self.data_pool.read().unwrap();
        match pool.as_ref() {
            Some(pool) => pool.push(record),
            None => return_errno_with_message!(Errno::EBUSY, "data threads not running"),
        }
    }
}
