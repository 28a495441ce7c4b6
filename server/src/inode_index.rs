// SPDX-License-Identifier: MPL-2.0

//! The sharded inode index.
//!
//! Buckets select by `inode % capacity`, the guarding shard by
//! `bucket % shard_count`; every shard keeps its entries sorted by inode
//! and owns the advisory-lock tables of the inodes it guards. A shard
//! lock is held only for map work, never across I/O, and no operation
//! reaches across shards.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::binlog::record::{BinlogRecord, RecordOptions};
use crate::dentry::{Dentry, DentryStore};
use crate::flock::{GrantedLock, LockEntry, LockType};
use crate::prelude::*;
use crate::types::FlockOwner;

struct ShardData {
    entries: BTreeMap<u64, Arc<Dentry>>,
    locks: HashMap<u64, LockEntry>,
}

struct Shard {
    data: Mutex<ShardData>,
    cond: Condvar,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: Mutex::new(ShardData {
                entries: BTreeMap::new(),
                locks: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

/// A granted byte-range lock, as held by a service connection. Dropping
/// the handle does not release the lock; connections release explicitly.
#[derive(Debug, Clone, Copy)]
pub struct FlockHandle {
    pub inode: u64,
    pub grant_id: u64,
    pub lock_type: LockType,
    pub offset: i64,
    pub length: i64,
    pub owner: FlockOwner,
}

#[derive(Debug, Clone, Copy)]
pub struct SysLockHandle {
    pub inode: u64,
    pub grant_id: u64,
}

pub struct InodeIndex {
    capacity: u64,
    shards: Vec<Shard>,
    grant_ids: AtomicU64,
}

impl InodeIndex {
    pub fn new(capacity: u64, shard_count: usize) -> Self {
        Self {
            capacity,
            shards: (0..shard_count).map(|_| Shard::new()).collect(),
            grant_ids: AtomicU64::new(1),
        }
    }

    fn shard(&self, inode: u64) -> &Shard {
        let bucket = inode % self.capacity;
        &self.shards[(bucket % self.shards.len() as u64) as usize]
    }

    fn next_grant_id(&self) -> u64 {
        self.grant_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add(&self, dentry: &Arc<Dentry>) -> Result<()> {
        let shard = self.shard(dentry.inode());
        let mut data = shard.data.lock().unwrap();
        if data.entries.contains_key(&dentry.inode()) {
            return_errno!(Errno::EEXIST);
        }
        data.entries.insert(dentry.inode(), dentry.clone());
        Ok(())
    }

    pub fn del(&self, dentry: &Arc<Dentry>) -> Result<()> {
        let shard = self.shard(dentry.inode());
        let mut data = shard.data.lock().unwrap();
        if data.entries.remove(&dentry.inode()).is_none() {
            return_errno!(Errno::ENOENT);
        }
        // Lock waiters re-resolve the inode on wake-up and observe the
        // removal as ENOENT.
        if data.locks.remove(&dentry.inode()).is_some() {
            shard.cond.notify_all();
        }
        Ok(())
    }

    pub fn get(&self, inode: u64) -> Option<Arc<Dentry>> {
        let shard = self.shard(inode);
        let data = shard.data.lock().unwrap();
        data.entries.get(&inode).cloned()
    }

    pub fn get_by_pname(&self, parent_inode: u64, name: &[u8]) -> Result<Arc<Dentry>> {
        let parent = self
            .get(parent_inode)
            .ok_or(Error::with_message(Errno::ENOENT, "parent inode not found"))?;
        DentryStore::find_by_pname(&parent, name)
    }

    fn check_set_size_locked(
        dentry: &Arc<Dentry>,
        new_size: i64,
        force: bool,
        now: i64,
    ) -> RecordOptions {
        let mut modified = RecordOptions::empty();
        dentry.update_stat(|stat| {
            if (force || stat.size < new_size) && stat.size != new_size {
                stat.size = new_size;
                modified |= RecordOptions::SIZE;
            }
            if stat.mtime != now {
                stat.mtime = now;
                modified |= RecordOptions::MTIME;
            }
        });
        modified
    }

    /// Applies the grow-only size rule: `size` is set when `force` or the
    /// current size is smaller, and `mtime` advances whenever it differs
    /// from `now`. Returns which fields changed so the caller can emit a
    /// minimal update record.
    pub fn check_set_dentry_size(
        &self,
        inode: u64,
        new_size: i64,
        force: bool,
        now: i64,
    ) -> Result<(Arc<Dentry>, RecordOptions)> {
        let shard = self.shard(inode);
        let data = shard.data.lock().unwrap();
        let Some(dentry) = data.entries.get(&inode) else {
            return_errno!(Errno::ENOENT);
        };
        let modified = Self::check_set_size_locked(dentry, new_size, force, now);
        Ok((dentry.clone(), modified))
    }

    /// Copies the record's masked stat fields onto the dentry.
    pub fn update_dentry(&self, record: &BinlogRecord) -> Result<Arc<Dentry>> {
        let shard = self.shard(record.inode);
        let data = shard.data.lock().unwrap();
        let Some(dentry) = data.entries.get(&record.inode) else {
            return_errno!(Errno::ENOENT);
        };
        dentry.update_stat(|stat| {
            if record.options.contains(RecordOptions::MODE) {
                stat.mode = record.stat.mode;
            }
            if record.options.contains(RecordOptions::ATIME) {
                stat.atime = record.stat.atime;
            }
            if record.options.contains(RecordOptions::CTIME) {
                stat.ctime = record.stat.ctime;
            }
            if record.options.contains(RecordOptions::MTIME) {
                stat.mtime = record.stat.mtime;
            }
            if record.options.contains(RecordOptions::UID) {
                stat.uid = record.stat.uid;
            }
            if record.options.contains(RecordOptions::GID) {
                stat.gid = record.stat.gid;
            }
            if record.options.contains(RecordOptions::SIZE) {
                stat.size = record.stat.size;
            }
        });
        Ok(dentry.clone())
    }

    /// Tries to take a byte-range lock.
    ///
    /// A conflict returns `ENOLCK` when non-blocking (the handler surfaces
    /// it as `EAGAIN`); otherwise the calling thread parks on the shard
    /// condvar and retries after every release in the shard.
    pub fn flock_apply(
        &self,
        inode: u64,
        lock_type: LockType,
        offset: i64,
        length: i64,
        block: bool,
        owner: FlockOwner,
    ) -> Result<FlockHandle> {
        let shard = self.shard(inode);
        let mut data = shard.data.lock().unwrap();
        loop {
            if !data.entries.contains_key(&inode) {
                return_errno!(Errno::ENOENT);
            }
            let conflicts = data
                .locks
                .get(&inode)
                .and_then(|entry| {
                    entry.find_flock_conflict(lock_type, offset, length, Some(&owner))
                })
                .is_some();
            if !conflicts {
                let grant_id = self.next_grant_id();
                let entry = data.locks.entry(inode).or_default();
                entry.grant_flock(GrantedLock {
                    id: grant_id,
                    lock_type,
                    offset,
                    length,
                    owner,
                });
                return Ok(FlockHandle {
                    inode,
                    grant_id,
                    lock_type,
                    offset,
                    length,
                    owner,
                });
            }
            if !block {
                return_errno_with_message!(Errno::ENOLCK, "conflicting lock held");
            }
            data.locks.get_mut(&inode).unwrap().flock_waiting += 1;
            data = shard.cond.wait(data).unwrap();
            if let Some(entry) = data.locks.get_mut(&inode) {
                entry.flock_waiting -= 1;
            }
        }
    }

    /// Releases a granted lock and wakes every parked applicant of the
    /// shard; each re-checks its own conflict set.
    pub fn flock_release(&self, handle: &FlockHandle) {
        let shard = self.shard(handle.inode);
        let mut data = shard.data.lock().unwrap();
        if let Some(entry) = data.locks.get_mut(&handle.inode) {
            entry.release_flock(handle.grant_id);
            if entry.is_idle() {
                data.locks.remove(&handle.inode);
            }
            shard.cond.notify_all();
        }
    }

    /// Probes for the lock that would block the described request,
    /// without acquiring anything.
    pub fn flock_getlk(
        &self,
        inode: u64,
        lock_type: LockType,
        offset: i64,
        length: i64,
    ) -> Result<GrantedLock> {
        let shard = self.shard(inode);
        let data = shard.data.lock().unwrap();
        if !data.entries.contains_key(&inode) {
            return_errno!(Errno::ENOENT);
        }
        let Some(entry) = data.locks.get(&inode) else {
            return_errno_with_message!(Errno::ENOENT, "no conflicting lock");
        };
        match entry.find_flock_conflict(lock_type, offset, length, None) {
            Some(blocker) => Ok(*blocker),
            None => return_errno_with_message!(Errno::ENOENT, "no conflicting lock"),
        }
    }

    /// Takes the whole-inode system lock, returning the file size observed
    /// under the shard lock.
    pub fn sys_lock_apply(&self, inode: u64, block: bool) -> Result<(SysLockHandle, i64)> {
        let shard = self.shard(inode);
        let mut data = shard.data.lock().unwrap();
        loop {
            let Some(dentry) = data.entries.get(&inode).cloned() else {
                return_errno!(Errno::ENOENT);
            };
            let grant_id = self.next_grant_id();
            let entry = data.locks.entry(inode).or_default();
            if entry.sys_acquire(grant_id) {
                return Ok((SysLockHandle { inode, grant_id }, dentry.stat().size));
            }
            if !block {
                return_errno_with_message!(Errno::ENOLCK, "sys lock held");
            }
            entry.sys_waiting += 1;
            data = shard.cond.wait(data).unwrap();
            if let Some(entry) = data.locks.get_mut(&inode) {
                entry.sys_waiting -= 1;
            }
        }
    }

    /// Releases the system lock. When `set_size` is given, the grow-only
    /// size update runs under the same shard-lock acquisition, making the
    /// unlock-and-resize pair atomic; the modified-field mask is returned
    /// for binlog emission.
    pub fn sys_lock_release(
        &self,
        handle: &SysLockHandle,
        set_size: Option<(i64, bool)>,
        now: i64,
    ) -> Result<Option<(Arc<Dentry>, RecordOptions)>> {
        let shard = self.shard(handle.inode);
        let mut data = shard.data.lock().unwrap();
        let Some(entry) = data.locks.get_mut(&handle.inode) else {
            return_errno!(Errno::ENOENT);
        };
        if !entry.sys_release(handle.grant_id) {
            return_errno_with_message!(Errno::ENOENT, "sys lock not held by caller");
        }
        if entry.is_idle() {
            data.locks.remove(&handle.inode);
        }

        let result = match set_size {
            Some((new_size, force)) => {
                let Some(dentry) = data.entries.get(&handle.inode) else {
                    shard.cond.notify_all();
                    return_errno!(Errno::ENOENT);
                };
                let modified = Self::check_set_size_locked(dentry, new_size, force, now);
                Some((dentry.clone(), modified))
            }
            None => None,
        };
        shard.cond.notify_all();
        Ok(result)
    }
}
