// SPDX-License-Identifier: MPL-2.0

//! Advisory-lock primitives: byte-range locks plus the whole-inode system
//! lock that serializes append/truncate sequences.
//!
//! The state here is pure bookkeeping; blocking and wake-up live in the
//! inode index, whose shard mutex guards every `LockEntry`.

use std::collections::VecDeque;

use crate::types::FlockOwner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

/// One granted byte-range lock. `length == 0` reaches to end of file.
#[derive(Debug, Clone, Copy)]
pub struct GrantedLock {
    pub id: u64,
    pub lock_type: LockType,
    pub offset: i64,
    pub length: i64,
    pub owner: FlockOwner,
}

fn region_end(offset: i64, length: i64) -> i64 {
    if length == 0 {
        i64::MAX
    } else {
        offset.saturating_add(length)
    }
}

pub fn regions_overlap(offset1: i64, length1: i64, offset2: i64, length2: i64) -> bool {
    offset1 < region_end(offset2, length2) && offset2 < region_end(offset1, length1)
}

impl GrantedLock {
    /// A new lock conflicts with a granted one of another owner when the
    /// regions overlap and at least one side is exclusive. `owner == None`
    /// is the getlk probe, which never owns anything.
    fn conflicts_with(
        &self,
        lock_type: LockType,
        offset: i64,
        length: i64,
        owner: Option<&FlockOwner>,
    ) -> bool {
        if owner == Some(&self.owner) {
            return false;
        }
        if self.lock_type != LockType::Exclusive && lock_type != LockType::Exclusive {
            return false;
        }
        regions_overlap(self.offset, self.length, offset, length)
    }
}

/// Per-inode lock state, lazily allocated in the owning shard's table on
/// first use and dropped once idle again.
#[derive(Debug, Default)]
pub struct LockEntry {
    granted: VecDeque<GrantedLock>,
    pub flock_waiting: usize,
    sys_holder: Option<u64>,
    pub sys_waiting: usize,
}

impl LockEntry {
    pub fn find_flock_conflict(
        &self,
        lock_type: LockType,
        offset: i64,
        length: i64,
        owner: Option<&FlockOwner>,
    ) -> Option<&GrantedLock> {
        self.granted
            .iter()
            .find(|lock| lock.conflicts_with(lock_type, offset, length, owner))
    }

    pub fn grant_flock(&mut self, lock: GrantedLock) {
        self.granted.push_back(lock);
    }

    pub fn release_flock(&mut self, id: u64) -> Option<GrantedLock> {
        let position = self.granted.iter().position(|lock| lock.id == id)?;
        self.granted.remove(position)
    }

    pub fn sys_holder(&self) -> Option<u64> {
        self.sys_holder
    }

    pub fn sys_acquire(&mut self, id: u64) -> bool {
        if self.sys_holder.is_some() {
            return false;
        }
        self.sys_holder = Some(id);
        true
    }

    pub fn sys_release(&mut self, id: u64) -> bool {
        if self.sys_holder == Some(id) {
            self.sys_holder = None;
            true
        } else {
            false
        }
    }

    /// True when the entry can be dropped from the shard table.
    pub fn is_idle(&self) -> bool {
        self.granted.is_empty()
            && self.flock_waiting == 0
            && self.sys_holder.is_none()
            && self.sys_waiting == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const OWNER_A: FlockOwner = FlockOwner { tid: 1, pid: 10 };
    const OWNER_B: FlockOwner = FlockOwner { tid: 2, pid: 20 };

    fn lock(id: u64, lock_type: LockType, offset: i64, length: i64, owner: FlockOwner) -> GrantedLock {
        GrantedLock {
            id,
            lock_type,
            offset,
            length,
            owner,
        }
    }

    #[test]
    fn overlap_rules() {
        assert!(regions_overlap(0, 10, 5, 10));
        assert!(!regions_overlap(0, 10, 10, 10));
        // Zero length reaches to end of file.
        assert!(regions_overlap(100, 0, 1000, 10));
        assert!(regions_overlap(0, 0, 0, 0));
        assert!(!regions_overlap(100, 0, 0, 50));
    }

    #[test]
    fn conflict_requires_exclusive_and_foreign_owner() {
        let mut entry = LockEntry::default();
        entry.grant_flock(lock(1, LockType::Exclusive, 0, 10, OWNER_A));

        // Same owner never conflicts.
        assert!(entry
            .find_flock_conflict(LockType::Exclusive, 0, 10, Some(&OWNER_A))
            .is_none());
        // Foreign shared vs granted exclusive conflicts.
        assert!(entry
            .find_flock_conflict(LockType::Shared, 5, 1, Some(&OWNER_B))
            .is_some());
        // Non-overlapping foreign exclusive is fine.
        assert!(entry
            .find_flock_conflict(LockType::Exclusive, 10, 5, Some(&OWNER_B))
            .is_none());

        // Shared vs shared coexists even across owners.
        let mut entry = LockEntry::default();
        entry.grant_flock(lock(2, LockType::Shared, 0, 0, OWNER_A));
        assert!(entry
            .find_flock_conflict(LockType::Shared, 0, 0, Some(&OWNER_B))
            .is_none());
        // The getlk probe has no owner, so even a shared-vs-exclusive
        // pairing reports the blocker.
        assert!(entry
            .find_flock_conflict(LockType::Exclusive, 0, 0, None)
            .is_some());
    }

    #[test]
    fn release_and_idle_tracking() {
        let mut entry = LockEntry::default();
        entry.grant_flock(lock(1, LockType::Exclusive, 0, 0, OWNER_A));
        assert!(!entry.is_idle());
        assert!(entry.release_flock(99).is_none());
        assert!(entry.release_flock(1).is_some());
        assert!(entry.is_idle());

        assert!(entry.sys_acquire(7));
        assert!(!entry.sys_acquire(8));
        assert!(!entry.sys_release(8));
        assert!(entry.sys_release(7));
        assert!(entry.is_idle());
    }
}
