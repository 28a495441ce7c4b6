// SPDX-License-Identifier: MPL-2.0

//! The per-namespace dentry tree.
//!
//! Namespaces live in a process-wide table keyed by name. Each namespace
//! owns at most one root dentry; a directory dentry exclusively owns its
//! children map and the dentries stored as values. Parent back-links are
//! weak so the tree stays acyclic for ownership purposes.
//!
//! Structural mutation of one namespace only ever happens on the data
//! thread its hash routes to; readers on service threads walk the tree
//! under per-dentry children locks.

use std::collections::{BTreeMap, VecDeque};

use hashbrown::HashMap;

use crate::binlog::record::BinlogRecord;
use crate::clock;
use crate::inode_generator::InodeGenerator;
use crate::inode_index::InodeIndex;
use crate::prelude::*;
use crate::types::{mode_is_dir, DentryStat, FullName, MAX_PATH_DEPTH, MODE_TYPE_MASK};

/// Reclamation of unlinked dentries is deferred this long so readers that
/// resolved a dentry just before its removal keep a valid object.
pub const DELAY_FREE_SECONDS: i64 = 60;

type Children = BTreeMap<Box<[u8]>, Arc<Dentry>>;

pub struct Dentry {
    inode: u64,
    name: Box<[u8]>,
    parent: Weak<Dentry>,
    stat: RwLock<DentryStat>,
    /// Present iff this dentry is a directory.
    children: Option<RwLock<Children>>,
}

impl Dentry {
    fn new(
        inode: u64,
        name: &[u8],
        parent: Weak<Dentry>,
        stat: DentryStat,
        is_dir: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            inode,
            name: name.to_vec().into_boxed_slice(),
            parent,
            stat: RwLock::new(stat),
            children: is_dir.then(|| RwLock::new(Children::new())),
        })
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.upgrade()
    }

    pub fn is_dir(&self) -> bool {
        self.children.is_some()
    }

    pub fn stat(&self) -> DentryStat {
        *self.stat.read().unwrap()
    }

    pub(crate) fn update_stat(&self, update: impl FnOnce(&mut DentryStat)) {
        let mut stat = self.stat.write().unwrap();
        update(&mut stat);
    }

    pub fn children_count(&self) -> usize {
        match &self.children {
            Some(children) => children.read().unwrap().len(),
            None => 0,
        }
    }

    fn lookup_child(&self, name: &[u8]) -> Option<Arc<Dentry>> {
        self.children
            .as_ref()?
            .read()
            .unwrap()
            .get(name)
            .cloned()
    }
}

impl core::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dentry")
            .field("inode", &self.inode)
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("is_dir", &self.is_dir())
            .finish()
    }
}

pub struct Namespace {
    name: Box<[u8]>,
    root: RwLock<Option<Arc<Dentry>>>,
}

impl Namespace {
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn root(&self) -> Option<Arc<Dentry>> {
        self.root.read().unwrap().clone()
    }
}

struct NamespaceTable {
    map: Mutex<HashMap<Box<[u8]>, Arc<Namespace>>>,
}

impl NamespaceTable {
    fn new(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    fn get(
        &self,
        name: &[u8],
        create: bool,
        counters: &DentryCounters,
    ) -> Result<Arc<Namespace>> {
        let mut map = self.map.lock().unwrap();
        if let Some(entry) = map.get(name) {
            return Ok(entry.clone());
        }
        if !create {
            return_errno!(Errno::ENOENT);
        }
        let entry = Arc::new(Namespace {
            name: name.to_vec().into_boxed_slice(),
            root: RwLock::new(None),
        });
        map.insert(name.to_vec().into_boxed_slice(), entry.clone());
        counters.ns.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }
}

#[derive(Default)]
pub struct DentryCounters {
    pub ns: AtomicI64,
    pub dir: AtomicI64,
    pub file: AtomicI64,
}

/// Unlinked dentries parked until their delay-free deadline.
struct DelayFreeQueue {
    queue: Mutex<VecDeque<(i64, Arc<Dentry>)>>,
}

impl DelayFreeQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, dentry: Arc<Dentry>) {
        let expires = clock::current_time_secs() + DELAY_FREE_SECONDS;
        self.queue.lock().unwrap().push_back((expires, dentry));
    }

    fn sweep(&self, now: i64) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let mut freed = 0;
        while matches!(queue.front(), Some((expires, _)) if *expires <= now) {
            queue.pop_front();
            freed += 1;
        }
        freed
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

struct Resolved {
    ns: Arc<Namespace>,
    parent: Option<Arc<Dentry>>,
    me: Option<Arc<Dentry>>,
    leaf: Vec<u8>,
}

pub struct DentryStore {
    namespaces: NamespaceTable,
    index: Arc<InodeIndex>,
    generator: InodeGenerator,
    counters: DentryCounters,
    delay_free: DelayFreeQueue,
}

impl DentryStore {
    pub fn new(
        namespace_capacity: usize,
        index: Arc<InodeIndex>,
        generator: InodeGenerator,
    ) -> Self {
        Self {
            namespaces: NamespaceTable::new(namespace_capacity),
            index,
            generator,
            counters: DentryCounters::default(),
            delay_free: DelayFreeQueue::new(),
        }
    }

    pub fn index(&self) -> &Arc<InodeIndex> {
        &self.index
    }

    pub fn generator(&self) -> &InodeGenerator {
        &self.generator
    }

    pub fn counters(&self) -> &DentryCounters {
        &self.counters
    }

    fn split_path(path: &[u8]) -> Result<Vec<&[u8]>> {
        let components: Vec<&[u8]> = path
            .split(|b| *b == b'/')
            .filter(|c| !c.is_empty())
            .collect();
        if components.len() > MAX_PATH_DEPTH {
            return_errno_with_message!(Errno::EINVAL, "path depth exceeds limit");
        }
        Ok(components)
    }

    fn walk<'a>(root: Arc<Dentry>, components: &[&'a [u8]]) -> Option<Arc<Dentry>> {
        let mut current = root;
        for component in components {
            if !current.is_dir() {
                return None;
            }
            current = current.lookup_child(component)?;
        }
        Some(current)
    }

    /// Resolves the parent directory and (if present) the leaf itself.
    fn resolve(&self, fullname: &FullName, create_ns: bool) -> Result<Resolved> {
        if fullname.path.is_empty() || fullname.path[0] != b'/' {
            return_errno_with_message!(Errno::EINVAL, "path must start with /");
        }
        let ns = self
            .namespaces
            .get(&fullname.ns, create_ns, &self.counters)?;

        let components = Self::split_path(&fullname.path)?;
        let Some(root) = ns.root() else {
            // A fresh namespace has no tree yet; only create("/") may
            // proceed from here.
            return Ok(Resolved {
                ns,
                parent: None,
                me: None,
                leaf: components.last().map(|c| c.to_vec()).unwrap_or_default(),
            });
        };

        if components.is_empty() {
            return Ok(Resolved {
                ns,
                parent: None,
                me: Some(root),
                leaf: Vec::new(),
            });
        }

        let leaf = components[components.len() - 1].to_vec();
        let parent = if components.len() == 1 {
            root
        } else {
            match Self::walk(root, &components[..components.len() - 1]) {
                Some(parent) => parent,
                None => return_errno!(Errno::ENOENT),
            }
        };
        if !parent.is_dir() {
            return_errno!(Errno::ENOENT);
        }
        let me = parent.lookup_child(&leaf);
        Ok(Resolved {
            ns,
            parent: Some(parent),
            me,
            leaf,
        })
    }

    /// Creates the dentry a `create` record names.
    ///
    /// A zero `record.inode` draws a fresh id from the generator; a
    /// nonzero one is the replay path and reuses the carried id. The inode
    /// index entry is added before the dentry is linked into its parent.
    pub fn create(&self, record: &BinlogRecord) -> Result<Arc<Dentry>> {
        if record.stat.mode & MODE_TYPE_MASK == 0 {
            error!("invalid file mode: {:o}", record.stat.mode);
            return_errno_with_message!(Errno::EINVAL, "mode lacks file type bits");
        }

        let resolved = self.resolve(&record.fullname, true)?;
        if resolved.me.is_some() {
            return_errno!(Errno::EEXIST);
        }
        // The only parentless create is the namespace root itself.
        if resolved.parent.is_none() && !resolved.leaf.is_empty() {
            return_errno!(Errno::ENOENT);
        }

        let inode = if record.inode == 0 {
            self.generator.next()
        } else {
            self.generator.observe(record.inode);
            record.inode
        };
        let is_dir = mode_is_dir(record.stat.mode);
        let parent_ref = resolved
            .parent
            .as_ref()
            .map(Arc::downgrade)
            .unwrap_or_default();
        let dentry = Dentry::new(inode, &resolved.leaf, parent_ref, record.stat, is_dir);

        self.index.add(&dentry)?;

        match &resolved.parent {
            None => {
                let mut root = resolved.ns.root.write().unwrap();
                if root.is_some() {
                    // Raced replay of the same root; roll the index back.
                    let _ = self.index.del(&dentry);
                    return_errno!(Errno::EEXIST);
                }
                *root = Some(dentry.clone());
            }
            Some(parent) => {
                let children = parent.children.as_ref().unwrap();
                let mut children = children.write().unwrap();
                if children.contains_key(resolved.leaf.as_slice()) {
                    let _ = self.index.del(&dentry);
                    return_errno!(Errno::EEXIST);
                }
                children.insert(resolved.leaf.clone().into_boxed_slice(), dentry.clone());
            }
        }

        if is_dir {
            self.counters.dir.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.file.fetch_add(1, Ordering::Relaxed);
        }
        Ok(dentry)
    }

    /// Removes the dentry a `remove` record names and parks it on the
    /// delay-free queue. The inode index entry goes away only after the
    /// unlink.
    pub fn remove(&self, record: &BinlogRecord) -> Result<Arc<Dentry>> {
        let resolved = self.resolve(&record.fullname, false)?;
        let Some(dentry) = resolved.me else {
            return_errno!(Errno::ENOENT);
        };

        let is_dir = dentry.is_dir();
        if is_dir && dentry.children_count() > 0 {
            return_errno!(Errno::ENOTEMPTY);
        }

        match &resolved.parent {
            None => {
                *resolved.ns.root.write().unwrap() = None;
            }
            Some(parent) => {
                let children = parent.children.as_ref().unwrap();
                let removed = children.write().unwrap().remove(dentry.name());
                if removed.is_none() {
                    return_errno!(Errno::ENOENT);
                }
            }
        }

        if is_dir {
            self.counters.dir.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.counters.file.fetch_sub(1, Ordering::Relaxed);
        }
        self.index.del(&dentry)?;
        self.delay_free.push(dentry.clone());
        Ok(dentry)
    }

    pub fn find(&self, fullname: &FullName) -> Result<Arc<Dentry>> {
        let resolved = self.resolve(fullname, false)?;
        resolved.me.ok_or(Error::new(Errno::ENOENT))
    }

    pub fn find_by_pname(parent: &Arc<Dentry>, name: &[u8]) -> Result<Arc<Dentry>> {
        if !parent.is_dir() {
            return_errno!(Errno::ENOENT);
        }
        parent
            .lookup_child(name)
            .ok_or(Error::new(Errno::ENOENT))
    }

    /// Snapshots the children of a directory in byte-lexicographic order,
    /// or the dentry itself for a non-directory.
    pub fn list(&self, fullname: &FullName) -> Result<Vec<Arc<Dentry>>> {
        let dentry = self.find(fullname)?;
        match &dentry.children {
            Some(children) => Ok(children.read().unwrap().values().cloned().collect()),
            None => Ok(vec![dentry]),
        }
    }

    /// Rebuilds the absolute path of `dentry` by walking parent links.
    ///
    /// The namespace root contributes no component, so the result for the
    /// root itself is empty; callers append `/name` pieces onto it. Walks
    /// deeper than [`MAX_PATH_DEPTH`] fail with `EOVERFLOW`.
    pub fn get_full_path(dentry: &Arc<Dentry>) -> Result<Vec<u8>> {
        let mut parts: Vec<Box<[u8]>> = Vec::new();
        let mut current = dentry.clone();
        while let Some(parent) = current.parent() {
            if parts.len() >= MAX_PATH_DEPTH {
                return_errno_with_message!(Errno::EOVERFLOW, "path depth exceeds limit");
            }
            parts.push(current.name.clone());
            current = parent;
        }

        let mut path = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
        for part in parts.iter().rev() {
            path.push(b'/');
            path.extend_from_slice(part);
        }
        Ok(path)
    }

    pub fn sweep_delay_free(&self, now: i64) -> usize {
        self.delay_free.sweep(now)
    }

    pub fn delay_free_len(&self) -> usize {
        self.delay_free.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::binlog::record::{RecordOp, RecordOptions};
    use crate::types::{MODE_DIR, MODE_FILE};

    fn new_store() -> DentryStore {
        let index = Arc::new(InodeIndex::new(1024, 7));
        DentryStore::new(64, index, InodeGenerator::new(1))
    }

    fn create_record(ns: &[u8], path: &[u8], mode: u32) -> BinlogRecord {
        let mut record =
            BinlogRecord::with_fullname(RecordOp::Create, FullName::new(ns, path), 0);
        record.stat.mode = mode;
        record.stat.ctime = 100;
        record.stat.mtime = 100;
        record.options |= RecordOptions::MODE | RecordOptions::CTIME | RecordOptions::MTIME;
        record
    }

    fn remove_record(ns: &[u8], path: &[u8]) -> BinlogRecord {
        BinlogRecord::with_fullname(RecordOp::Remove, FullName::new(ns, path), 0)
    }

    #[test]
    fn create_list_remove_scenario() {
        let store = new_store();

        let root = store
            .create(&create_record(b"nsA", b"/", MODE_DIR | 0o755))
            .unwrap();
        assert!(root.is_dir());

        let a = store
            .create(&create_record(b"nsA", b"/a", MODE_DIR | 0o755))
            .unwrap();
        let b = store
            .create(&create_record(b"nsA", b"/a/b", MODE_FILE | 0o644))
            .unwrap();
        assert!(!b.is_dir());
        assert_eq!(b.parent().unwrap().inode(), a.inode());

        // All three are resolvable by path and by inode.
        let found = store.find(&FullName::new(b"nsA", b"/a/b")).unwrap();
        assert_eq!(found.inode(), b.inode());
        assert_eq!(store.index().get(b.inode()).unwrap().inode(), b.inode());

        let listing = store.list(&FullName::new(b"nsA", b"/a")).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name(), b"b");

        // Listing a regular file yields the file itself.
        let listing = store.list(&FullName::new(b"nsA", b"/a/b")).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].inode(), b.inode());

        assert_eq!(
            store
                .remove(&remove_record(b"nsA", b"/a"))
                .unwrap_err()
                .error(),
            Errno::ENOTEMPTY
        );
        store.remove(&remove_record(b"nsA", b"/a/b")).unwrap();
        store.remove(&remove_record(b"nsA", b"/a")).unwrap();

        assert_eq!(
            store
                .find(&FullName::new(b"nsA", b"/a"))
                .unwrap_err()
                .error(),
            Errno::ENOENT
        );
        assert!(store.index().get(b.inode()).is_none());
        // Removed dentries sit on the delay-free queue, not yet reclaimed.
        assert_eq!(store.delay_free_len(), 2);
        assert_eq!(store.sweep_delay_free(clock::current_time_secs() - 1), 0);
        assert_eq!(
            store.sweep_delay_free(clock::current_time_secs() + DELAY_FREE_SECONDS + 1),
            2
        );
    }

    #[test]
    fn create_validations() {
        let store = new_store();

        // Mode without type bits.
        assert_eq!(
            store
                .create(&create_record(b"ns", b"/", 0o755))
                .unwrap_err()
                .error(),
            Errno::EINVAL
        );
        // Relative path.
        assert_eq!(
            store
                .create(&create_record(b"ns", b"a", MODE_DIR | 0o755))
                .unwrap_err()
                .error(),
            Errno::EINVAL
        );
        // Parent missing in a fresh namespace.
        assert_eq!(
            store
                .create(&create_record(b"ns", b"/a", MODE_DIR | 0o755))
                .unwrap_err()
                .error(),
            Errno::ENOENT
        );

        store
            .create(&create_record(b"ns", b"/", MODE_DIR | 0o755))
            .unwrap();
        store
            .create(&create_record(b"ns", b"/f", MODE_FILE | 0o644))
            .unwrap();
        // Duplicate leaf.
        assert_eq!(
            store
                .create(&create_record(b"ns", b"/f", MODE_FILE | 0o644))
                .unwrap_err()
                .error(),
            Errno::EEXIST
        );
        // A non-directory as intermediate component.
        assert_eq!(
            store
                .create(&create_record(b"ns", b"/f/x", MODE_FILE | 0o644))
                .unwrap_err()
                .error(),
            Errno::ENOENT
        );
    }

    #[test]
    fn replay_reuses_carried_inode() {
        let store = new_store();
        let mut record = create_record(b"ns", b"/", MODE_DIR | 0o755);
        record.inode = (1u64 << 48) | 77;
        let root = store.create(&record).unwrap();
        assert_eq!(root.inode(), record.inode);
        // The generator skips past replayed serials.
        assert!(store.generator().current_serial() >= 77);
    }

    #[test]
    fn children_iterate_in_byte_order() {
        let store = new_store();
        store
            .create(&create_record(b"ns", b"/", MODE_DIR | 0o755))
            .unwrap();
        for name in ["zz", "aa", "Z", "mid", "a"] {
            let path = format!("/{}", name);
            store
                .create(&create_record(b"ns", path.as_bytes(), MODE_FILE | 0o644))
                .unwrap();
        }
        let names: Vec<Vec<u8>> = store
            .list(&FullName::new(b"ns", b"/"))
            .unwrap()
            .iter()
            .map(|d| d.name().to_vec())
            .collect();
        assert_eq!(names, vec![b"Z".to_vec(), b"a".to_vec(), b"aa".to_vec(), b"mid".to_vec(), b"zz".to_vec()]);
    }

    #[test]
    fn full_path_round_trip() {
        let store = new_store();
        store
            .create(&create_record(b"ns", b"/", MODE_DIR | 0o755))
            .unwrap();
        store
            .create(&create_record(b"ns", b"/a", MODE_DIR | 0o755))
            .unwrap();
        let leaf = store
            .create(&create_record(b"ns", b"//a//deep", MODE_FILE | 0o644))
            .unwrap();

        assert_eq!(DentryStore::get_full_path(&leaf).unwrap(), b"/a/deep");
        let root = store.find(&FullName::new(b"ns", b"/")).unwrap();
        assert_eq!(DentryStore::get_full_path(&root).unwrap(), b"");
    }

    #[test]
    fn namespaces_are_isolated() {
        let store = new_store();
        store
            .create(&create_record(b"one", b"/", MODE_DIR | 0o755))
            .unwrap();
        store
            .create(&create_record(b"one", b"/x", MODE_FILE | 0o644))
            .unwrap();
        assert_eq!(
            store
                .find(&FullName::new(b"two", b"/x"))
                .unwrap_err()
                .error(),
            Errno::ENOENT
        );
        assert_eq!(store.counters().ns.load(Ordering::Relaxed), 2);
    }
}
