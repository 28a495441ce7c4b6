// SPDX-License-Identifier: MPL-2.0

//! The push-result ring: outstanding `data_version`s awaiting a slave's
//! acknowledgement, mapped back to the tasks that originated them.

use std::collections::VecDeque;

use crate::data_thread::RecordOrigin;
use crate::prelude::*;

/// Entries unacknowledged for this long are expired by `clear_timeouts`.
const ENTRY_TIMEOUT_SECS: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct PendingPush {
    pub data_version: u64,
    pub origin: Option<RecordOrigin>,
    pub enqueue_time: i64,
}

pub struct PushResultRing {
    capacity: usize,
    entries: VecDeque<PendingPush>,
}

impl PushResultRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries arrive in increasing `data_version` order.
    pub fn add(
        &mut self,
        data_version: u64,
        origin: Option<RecordOrigin>,
        now: i64,
    ) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return_errno_with_message!(Errno::EBUSY, "push result ring is full");
        }
        debug_assert!(self
            .entries
            .back()
            .map(|entry| entry.data_version < data_version)
            .unwrap_or(true));
        self.entries.push_back(PendingPush {
            data_version,
            origin,
            enqueue_time: now,
        });
        Ok(())
    }

    /// Removes and returns the entry acknowledged by `data_version`.
    pub fn remove(&mut self, data_version: u64) -> Result<PendingPush> {
        let slice = self.entries.make_contiguous();
        match slice.binary_search_by_key(&data_version, |entry| entry.data_version) {
            Ok(position) => Ok(self.entries.remove(position).unwrap()),
            Err(_) => {
                return_errno_with_message!(Errno::ENOENT, "data version not in push ring")
            }
        }
    }

    /// Expires entries the slave failed to acknowledge in time.
    pub fn clear_timeouts(&mut self, now: i64) -> Vec<PendingPush> {
        let mut expired = Vec::new();
        while matches!(
            self.entries.front(),
            Some(entry) if now - entry.enqueue_time >= ENTRY_TIMEOUT_SECS
        ) {
            expired.push(self.entries.pop_front().unwrap());
        }
        expired
    }

    pub fn clear_all(&mut self) -> Vec<PendingPush> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_remove_in_order() {
        let mut ring = PushResultRing::new(16);
        for data_version in [10u64, 11, 12] {
            ring.add(data_version, None, 100).unwrap();
        }
        assert_eq!(ring.len(), 3);

        let entry = ring.remove(11).unwrap();
        assert_eq!(entry.data_version, 11);
        assert_eq!(ring.remove(11).unwrap_err().error(), Errno::ENOENT);
        assert_eq!(ring.remove(10).unwrap().data_version, 10);
        assert_eq!(ring.remove(12).unwrap().data_version, 12);
        assert!(ring.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let mut ring = PushResultRing::new(2);
        ring.add(1, None, 0).unwrap();
        ring.add(2, None, 0).unwrap();
        assert_eq!(ring.add(3, None, 0).unwrap_err().error(), Errno::EBUSY);
    }

    #[test]
    fn timeouts_expire_from_the_front() {
        let mut ring = PushResultRing::new(8);
        ring.add(1, None, 0).unwrap();
        ring.add(2, None, 100).unwrap();
        let expired = ring.clear_timeouts(ENTRY_TIMEOUT_SECS + 1);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].data_version, 1);
        assert_eq!(ring.len(), 1);

        let cleared = ring.clear_all();
        assert_eq!(cleared.len(), 1);
        assert!(ring.is_empty());
    }
}
