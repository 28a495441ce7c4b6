// SPDX-License-Identifier: MPL-2.0

//! The sharded apply pipeline.
//!
//! Requests route to worker `hash(namespace) % DATA_THREAD_COUNT`, which
//! guarantees single-threaded access to any one namespace's dentry tree.
//! A worker applies each record, has the producer assign its
//! `data_version` and emit the binlog entry, and only then notifies the
//! originating task.

use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::binlog::record::{BinlogRecord, RecordOp};
use crate::binlog::replay::ReplayShared;
use crate::context::ServerContext;
use crate::prelude::*;
use crate::types::DentryStat;

/// Who to tell once the record has been dealt with.
pub enum RecordNotify {
    /// A service connection parked on the reply channel.
    Service(mpsc::SyncSender<Result<AppliedResult>>),
    /// A replay batch; `slot` indexes the batch's result table.
    Replay {
        shared: Arc<ReplayShared>,
        slot: usize,
    },
}

/// Identity of the originating connection, carried into the replication
/// push-result ring for stale-notification detection.
#[derive(Debug, Clone, Copy)]
pub struct RecordOrigin {
    pub conn_id: u64,
    pub task_version: u64,
}

pub struct QueuedRecord {
    pub record: BinlogRecord,
    pub notify: RecordNotify,
    pub origin: Option<RecordOrigin>,
}

/// What a completed mutation reports back to its handler.
#[derive(Debug, Clone, Copy)]
pub struct AppliedResult {
    pub inode: u64,
    pub stat: DentryStat,
    pub data_version: u64,
}

pub struct DataThreadPool {
    senders: Vec<Mutex<mpsc::Sender<QueuedRecord>>>,
    handles: Vec<JoinHandle<()>>,
}

impl DataThreadPool {
    pub fn start(ctx: &Arc<ServerContext>) -> Self {
        let count = ctx.config.data_thread_count;
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for thread_index in 0..count {
            let (tx, rx) = mpsc::channel();
            let ctx = ctx.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("data-{}", thread_index))
                    .spawn(move || worker_loop(ctx, rx))
                    .expect("spawn data thread"),
            );
            senders.push(Mutex::new(tx));
        }
        Self { senders, handles }
    }

    pub fn push(&self, queued: QueuedRecord) -> Result<()> {
        let index = queued.record.hash_code as usize % self.senders.len();
        let sender = self.senders[index].lock().unwrap().clone();
        if sender.send(queued).is_err() {
            return_errno_with_message!(Errno::EBUSY, "data thread is gone");
        }
        Ok(())
    }

    /// Drops the senders and joins the workers.
    pub fn join(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn apply_record(ctx: &ServerContext, record: &mut BinlogRecord) -> Result<AppliedResult> {
    let dentry = match record.operation {
        RecordOp::Create => ctx.store.create(record)?,
        RecordOp::Remove => ctx.store.remove(record)?,
        RecordOp::Update => ctx.store.index().update_dentry(record)?,
        RecordOp::Rename | RecordOp::None => {
            return_errno_with_message!(Errno::EINVAL, "unsupported record operation")
        }
    };
    if record.inode == 0 {
        record.inode = dentry.inode();
    }
    Ok(AppliedResult {
        inode: dentry.inode(),
        stat: dentry.stat(),
        data_version: record.data_version,
    })
}

fn deal_master_record(ctx: &Arc<ServerContext>, queued: QueuedRecord) {
    let QueuedRecord {
        mut record,
        notify,
        origin,
    } = queued;

    let result = apply_record(ctx, &mut record).and_then(|mut applied| {
        let data_version = ctx
            .producer
            .produce(&ctx.data_version, &mut record, origin)?;
        applied.data_version = data_version;
        Ok(applied)
    });

    if let Err(err) = &result {
        warn!(
            "{} dentry fail, errno: {:?}, namespace: {}, path: {}",
            record.operation.label(),
            err.error(),
            String::from_utf8_lossy(&record.fullname.ns),
            String::from_utf8_lossy(&record.fullname.path),
        );
    }

    if let RecordNotify::Service(tx) = notify {
        let _ = tx.send(result);
    }
}

fn deal_replay_record(ctx: &Arc<ServerContext>, queued: QueuedRecord) {
    let QueuedRecord {
        mut record, notify, ..
    } = queued;
    let RecordNotify::Replay { shared, slot } = notify else {
        unreachable!("replay records carry replay notifies");
    };

    // Records at or below the batch's base version were already applied.
    let data_version = record.data_version;
    if data_version <= shared.base_version() {
        shared.complete(slot, data_version, None, true);
        return;
    }

    match apply_record(ctx, &mut record) {
        Ok(_) => {
            ctx.data_version.fetch_max(data_version, Ordering::SeqCst);
            shared.complete(slot, data_version, None, false);
        }
        Err(err) => {
            error!(
                "replay {} fail, data_version: {}, errno: {:?}",
                record.operation.label(),
                data_version,
                err.error()
            );
            shared.complete(slot, data_version, Some(err.error()), false);
        }
    }
}

fn worker_loop(ctx: Arc<ServerContext>, rx: mpsc::Receiver<QueuedRecord>) {
    while let Ok(queued) = rx.recv() {
        if queued.record.data_version == 0 {
            deal_master_record(&ctx, queued);
        } else {
            deal_replay_record(&ctx, queued);
        }
    }
    debug!("data thread exits");
}
