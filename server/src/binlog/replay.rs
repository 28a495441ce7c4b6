// SPDX-License-Identifier: MPL-2.0

//! Binlog replay.
//!
//! Unpacks a buffer of records, pushes each to its owning data thread,
//! and waits on a condition variable until the whole batch has been
//! dealt with. Used both for startup recovery and for buffers a master
//! pushes to its slaves.

use super::pack;
use crate::context::ServerContext;
use crate::data_thread::{QueuedRecord, RecordNotify};
use crate::prelude::*;
use crate::proto::wire::PushResultEntry;

#[derive(Default)]
struct ReplayState {
    waiting_count: usize,
    results: Vec<PushResultEntry>,
    skip_count: u64,
    fail_count: u64,
    last_errno: Option<Errno>,
}

/// Shared between the replaying thread and the data threads.
pub struct ReplayShared {
    state: Mutex<ReplayState>,
    cond: Condvar,
    /// The store's `data_version` when the current batch started; records
    /// at or below it were applied before this batch and must be skipped.
    /// Comparing against the live counter instead would falsely skip a
    /// batch member whenever a sibling data thread has already advanced it.
    base_version: AtomicU64,
}

impl ReplayShared {
    pub fn base_version(&self) -> u64 {
        self.base_version.load(Ordering::SeqCst)
    }

    /// Called from a data thread when one record is done.
    pub fn complete(&self, slot: usize, data_version: u64, err: Option<Errno>, skipped: bool) {
        let mut state = self.state.lock().unwrap();
        state.results[slot] = PushResultEntry {
            data_version,
            err_no: err.map(|e| e.as_i32() as u16).unwrap_or(0),
        };
        if skipped {
            state.skip_count += 1;
        }
        if let Some(errno) = err {
            state.fail_count += 1;
            state.last_errno = Some(errno);
        }
        state.waiting_count -= 1;
        if state.waiting_count == 0 {
            self.cond.notify_all();
        }
    }
}

/// Counters surviving across `deal_buffer` calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayCounters {
    pub record_count: u64,
    pub skip_count: u64,
    pub warning_count: u64,
    pub fail_count: u64,
    pub last_errno: Option<Errno>,
}

pub struct ReplayContext {
    shared: Arc<ReplayShared>,
    counters: Mutex<ReplayCounters>,
}

impl Default for ReplayContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayContext {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ReplayShared {
                state: Mutex::new(ReplayState::default()),
                cond: Condvar::new(),
                base_version: AtomicU64::new(0),
            }),
            counters: Mutex::new(ReplayCounters::default()),
        }
    }

    pub fn counters(&self) -> ReplayCounters {
        *self.counters.lock().unwrap()
    }

    /// Replays every record in `buf`, returning one `(data_version,
    /// err_no)` entry per record in input order.
    pub fn deal_buffer(
        &self,
        ctx: &Arc<ServerContext>,
        buf: &[u8],
    ) -> Result<Vec<PushResultEntry>> {
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (record, end) = match pack::unpack_record(&buf[offset..]) {
                Ok(parsed) => parsed,
                Err(err) => {
                    error!(
                        "unpack binlog record fail at offset {}: {}",
                        offset, err
                    );
                    return Err(err);
                }
            };
            offset += end;
            records.push(record);
        }

        self.shared
            .base_version
            .store(ctx.current_data_version(), Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock().unwrap();
            debug_assert_eq!(state.waiting_count, 0);
            state.waiting_count = records.len();
            state.results = vec![
                PushResultEntry {
                    data_version: 0,
                    err_no: 0,
                };
                records.len()
            ];
        }

        let batch_size = records.len() as u64;
        for (slot, record) in records.into_iter().enumerate() {
            let queued = QueuedRecord {
                record,
                notify: RecordNotify::Replay {
                    shared: self.shared.clone(),
                    slot,
                },
                origin: None,
            };
            if let Err(err) = ctx.push_to_data_thread(queued) {
                // The slot will never complete; give up on the batch.
                let mut state = self.shared.state.lock().unwrap();
                state.waiting_count -= 1;
                drop(state);
                self.wait_batch_done();
                return Err(err);
            }
        }

        self.wait_batch_done();

        let mut state = self.shared.state.lock().unwrap();
        let results = std::mem::take(&mut state.results);
        let batch_fail = state.fail_count;
        let batch_skip = state.skip_count;
        let last_errno = state.last_errno.take();
        state.fail_count = 0;
        state.skip_count = 0;
        drop(state);

        let mut counters = self.counters.lock().unwrap();
        counters.record_count += batch_size;
        counters.skip_count += batch_skip;
        counters.fail_count += batch_fail;
        if last_errno.is_some() {
            counters.last_errno = last_errno;
        }
        drop(counters);

        // Per-record errors stay in the entries; the caller decides
        // whether they abort (startup load) or get acknowledged back to
        // the master (slave push path).
        if batch_fail > 0 {
            warn!(
                "replay batch: {} records, {} skipped, {} failed",
                batch_size, batch_skip, batch_fail
            );
        }
        Ok(results)
    }

    fn wait_batch_done(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.waiting_count > 0 {
            state = self.shared.cond.wait(state).unwrap();
        }
    }
}
