// SPDX-License-Identifier: MPL-2.0

//! Server bootstrap and lifetime.
//!
//! Startup order: open the binlog (truncating any torn tail), build the
//! context, start the data threads, replay the on-disk binlog into the
//! fresh store, then bring up the listeners and — depending on the
//! oracle — either the replication engine (master) or the relationship
//! thread (slave).

use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::binlog::{self, replication::ReplicationManager, writer::BinlogWriter};
use crate::clock;
use crate::cluster::handler as cluster_handler;
use crate::cluster::relationship::RelationshipThread;
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::data_thread::DataThreadPool;
use crate::prelude::*;
use crate::service;

pub struct Server;

pub struct ServerHandle {
    ctx: Arc<ServerContext>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    replication: Option<ReplicationManager>,
    relationship: Option<RelationshipThread>,
    service_addr: SocketAddr,
    cluster_addr: SocketAddr,
}

type ConnHandler = fn(Arc<ServerContext>, std::net::TcpStream, Arc<AtomicBool>);

fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    stop: Arc<AtomicBool>,
    handler: ConnHandler,
    name: &'static str,
) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("{} accepts {}", name, peer);
                let ctx = ctx.clone();
                let stop = stop.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("{}-conn", name))
                    .spawn(move || handler(ctx, stream, stop));
                if let Err(err) = spawned {
                    error!("spawn {} connection thread fail: {}", name, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                error!("{} accept fail: {}", name, err);
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

impl Server {
    pub fn start(config: ServerConfig) -> Result<ServerHandle> {
        std::fs::create_dir_all(&config.data_path)?;
        let (writer, last_data_version) =
            BinlogWriter::open(&config.data_path, config.binlog_rotate_size)?;
        let ctx = ServerContext::new(config, Arc::new(writer))?;

        ctx.install_data_pool(DataThreadPool::start(&ctx));
        binlog::binlog_load(&ctx)?;
        if ctx.current_data_version() < last_data_version {
            // The tail scan saw further than the replay; trust the scan.
            ctx.data_version.store(last_data_version, Ordering::SeqCst);
        }
        ctx.cluster
            .myself()
            .last_data_version
            .store(ctx.current_data_version(), Ordering::SeqCst);
        cluster_handler::init_self_status(&ctx);

        let my_config = ctx.cluster.myself().config.clone();
        let service_listener = TcpListener::bind(&my_config.service_addr)?;
        let cluster_listener = TcpListener::bind(&my_config.cluster_addr)?;
        let service_addr = service_listener.local_addr()?;
        let cluster_addr = cluster_listener.local_addr()?;
        service_listener.set_nonblocking(true)?;
        cluster_listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();
        {
            let ctx = ctx.clone();
            let stop = stop.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("service-accept".into())
                    .spawn(move || {
                        accept_loop(
                            service_listener,
                            ctx,
                            stop,
                            service::serve_connection,
                            "service",
                        )
                    })
                    .expect("spawn service accept loop"),
            );
        }
        {
            let ctx = ctx.clone();
            let stop = stop.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("cluster-accept".into())
                    .spawn(move || {
                        accept_loop(
                            cluster_listener,
                            ctx,
                            stop,
                            cluster_handler::serve_connection,
                            "cluster",
                        )
                    })
                    .expect("spawn cluster accept loop"),
            );
        }
        {
            // Delay-free sweeper.
            let ctx = ctx.clone();
            let stop = stop.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("delay-free".into())
                    .spawn(move || {
                        while !stop.load(Ordering::SeqCst) {
                            std::thread::sleep(Duration::from_secs(1));
                            ctx.store.sweep_delay_free(clock::current_time_secs());
                        }
                    })
                    .expect("spawn delay-free sweeper"),
            );
        }

        let (replication, relationship) = if ctx.cluster.is_myself_master() {
            (Some(ReplicationManager::start(&ctx)), None)
        } else {
            (None, Some(RelationshipThread::start(ctx.clone())))
        };

        info!(
            "server {} up, master: {}, service: {}, cluster: {}, data_version: {}",
            ctx.cluster.my_id(),
            ctx.cluster.master_id(),
            service_addr,
            cluster_addr,
            ctx.current_data_version()
        );
        Ok(ServerHandle {
            ctx,
            stop,
            threads,
            replication,
            relationship,
            service_addr,
            cluster_addr,
        })
    }
}

impl ServerHandle {
    pub fn ctx(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn service_addr(&self) -> SocketAddr {
        self.service_addr
    }

    pub fn cluster_addr(&self) -> SocketAddr {
        self.cluster_addr
    }

    pub fn shutdown(mut self) {
        info!("server {} shutting down", self.ctx.cluster.my_id());
        self.stop.store(true, Ordering::SeqCst);
        if let Some(replication) = self.replication.take() {
            replication.shutdown(&self.ctx);
        }
        if let Some(relationship) = self.relationship.take() {
            relationship.shutdown();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        if let Some(pool) = self.ctx.take_data_pool() {
            pool.join();
        }
        self.ctx
            .cluster
            .myself()
            .last_data_version
            .store(self.ctx.current_data_version(), Ordering::SeqCst);
        if let Err(err) = self.ctx.cluster.write_info() {
            error!("write cluster info fail: {}", err);
        }
    }
}
