// SPDX-License-Identifier: MPL-2.0

//! Server configuration.
//!
//! Every knob has a default so tests can build configs programmatically;
//! the binary loads the same structure from an INI file.

use std::path::PathBuf;

use crate::ini::IniDocument;
use crate::prelude::*;

pub const DEFAULT_CLUSTER_PORT: u16 = 11011;
pub const DEFAULT_SERVICE_PORT: u16 = 11012;
pub const DEFAULT_TASK_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_BINLOG_ROTATE_SIZE: u64 = 512 * 1024 * 1024;

pub const CONNECT_TIMEOUT_SECS: u64 = 5;
pub const NETWORK_TIMEOUT_SECS: u64 = 30;

/// One statically configured cluster member.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub id: u32,
    pub cluster_addr: String,
    pub service_addr: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cluster_id: u16,
    /// This server's id; must name an entry of `servers`.
    pub my_server_id: u32,
    /// The election oracle: the id all members currently agree is master.
    pub master_server_id: u32,
    pub servers: Vec<PeerConfig>,
    pub data_path: PathBuf,

    pub data_thread_count: usize,
    pub namespace_hashtable_capacity: usize,
    pub inode_hashtable_capacity: u64,
    pub inode_shared_locks_count: usize,
    pub task_buffer_size: usize,
    pub binlog_rotate_size: u64,
    pub log_level: log::LevelFilter,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cluster_id: 1,
            my_server_id: 1,
            master_server_id: 1,
            servers: vec![PeerConfig {
                id: 1,
                cluster_addr: format!("127.0.0.1:{}", DEFAULT_CLUSTER_PORT),
                service_addr: format!("127.0.0.1:{}", DEFAULT_SERVICE_PORT),
            }],
            data_path: PathBuf::from("/tmp/metadir"),
            data_thread_count: 2,
            namespace_hashtable_capacity: 1361,
            inode_hashtable_capacity: 1 << 20,
            inode_shared_locks_count: 163,
            task_buffer_size: DEFAULT_TASK_BUFFER_SIZE,
            binlog_rotate_size: DEFAULT_BINLOG_ROTATE_SIZE,
            log_level: log::LevelFilter::Info,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let doc = IniDocument::load(path)?;
        let mut config = Self::default();

        if let Some(cluster) = doc.section("cluster") {
            config.cluster_id = cluster.get_int("cluster_id", config.cluster_id);
            config.my_server_id = cluster.get_int("my_server_id", config.my_server_id);
            config.master_server_id =
                cluster.get_int("master_server_id", config.master_server_id);
            if let Some(path) = cluster.get("data_path") {
                config.data_path = PathBuf::from(path);
            }
            config.data_thread_count =
                cluster.get_int("data_threads", config.data_thread_count);
            config.namespace_hashtable_capacity = cluster.get_int(
                "namespace_hashtable_capacity",
                config.namespace_hashtable_capacity,
            );
            config.inode_hashtable_capacity = cluster.get_int(
                "inode_hashtable_capacity",
                config.inode_hashtable_capacity,
            );
            config.inode_shared_locks_count = cluster.get_int(
                "inode_shared_locks_count",
                config.inode_shared_locks_count,
            );
            config.task_buffer_size =
                cluster.get_int("task_buffer_size", config.task_buffer_size);
            config.binlog_rotate_size =
                cluster.get_int("binlog_rotate_size", config.binlog_rotate_size);
            if let Some(level) = cluster.get("log_level") {
                config.log_level = match level {
                    "error" => log::LevelFilter::Error,
                    "warn" => log::LevelFilter::Warn,
                    "info" => log::LevelFilter::Info,
                    "debug" => log::LevelFilter::Debug,
                    "trace" => log::LevelFilter::Trace,
                    _ => return_errno_with_message!(Errno::EINVAL, "unknown log level"),
                };
            }
        }

        let mut servers = Vec::new();
        for section in doc.sections() {
            let Some(id_str) = section.name.strip_prefix("server-") else {
                continue;
            };
            let id: u32 = id_str.parse()?;
            let Some(cluster_addr) = section.get("cluster_addr") else {
                return_errno_with_message!(Errno::EINVAL, "server section lacks cluster_addr");
            };
            let Some(service_addr) = section.get("service_addr") else {
                return_errno_with_message!(Errno::EINVAL, "server section lacks service_addr");
            };
            servers.push(PeerConfig {
                id,
                cluster_addr: cluster_addr.to_string(),
                service_addr: service_addr.to_string(),
            });
        }
        if !servers.is_empty() {
            servers.sort_by_key(|s| s.id);
            config.servers = servers;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return_errno_with_message!(Errno::EINVAL, "no cluster members configured");
        }
        if !self.servers.iter().any(|s| s.id == self.my_server_id) {
            return_errno_with_message!(Errno::EINVAL, "my_server_id not in member table");
        }
        if !self.servers.iter().any(|s| s.id == self.master_server_id) {
            return_errno_with_message!(Errno::EINVAL, "master_server_id not in member table");
        }
        if self.data_thread_count == 0 {
            return_errno_with_message!(Errno::EINVAL, "data_threads must be positive");
        }
        if self.inode_shared_locks_count == 0 || self.inode_hashtable_capacity == 0 {
            return_errno_with_message!(Errno::EINVAL, "inode table sizing must be positive");
        }
        Ok(())
    }

    pub fn peer(&self, id: u32) -> Option<&PeerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// A 16-byte signature of the member table; peers with different
    /// cluster configs must not replicate to each other.
    pub fn config_sign(&self) -> [u8; 16] {
        let mut sign = [0u8; 16];
        let id_bytes: Vec<[u8; 4]> =
            self.servers.iter().map(|s| s.id.to_be_bytes()).collect();
        for (i, chunk) in sign.chunks_mut(4).enumerate() {
            let tag = [i as u8];
            let mut parts: Vec<&[u8]> = vec![&tag];
            for (server, id) in self.servers.iter().zip(id_bytes.iter()) {
                parts.push(id);
                parts.push(server.cluster_addr.as_bytes());
                parts.push(server.service_addr.as_bytes());
            }
            chunk.copy_from_slice(&times33::times33_hash_slices(&parts).to_be_bytes());
        }
        sign
    }

    pub fn slave_count(&self) -> usize {
        self.servers.len() - 1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn load_from_ini() {
        let text = "\
[cluster]
cluster_id = 7
my_server_id = 2
master_server_id = 1
data_path = /tmp/md-test
data_threads = 4

[server-1]
cluster_addr = 127.0.0.1:11011
service_addr = 127.0.0.1:11012

[server-2]
cluster_addr = 127.0.0.1:11021
service_addr = 127.0.0.1:11022
";
        let dir = std::env::temp_dir().join("metadir-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.conf");
        std::fs::write(&path, text).unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.cluster_id, 7);
        assert_eq!(config.my_server_id, 2);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.peer(1).unwrap().cluster_addr, "127.0.0.1:11011");
        assert_eq!(config.slave_count(), 1);
    }

    #[test]
    fn signature_tracks_member_table() {
        let a = ServerConfig::default();
        let mut b = ServerConfig::default();
        assert_eq!(a.config_sign(), b.config_sign());
        b.servers.push(PeerConfig {
            id: 2,
            cluster_addr: "127.0.0.1:11021".into(),
            service_addr: "127.0.0.1:11022".into(),
        });
        b.master_server_id = 1;
        assert_ne!(a.config_sign(), b.config_sign());
    }

    #[test]
    fn validation_rejects_unknown_ids() {
        let mut config = ServerConfig::default();
        config.my_server_id = 9;
        assert_eq!(config.validate().unwrap_err().error(), Errno::EINVAL);
    }
}
