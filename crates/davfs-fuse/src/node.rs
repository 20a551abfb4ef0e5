//! In-memory mirror of remote paths.
//!
//! A [`Node`] owns its children (parent → child is the only owning edge)
//! and keeps a weak back-link to its parent for path derivation. All mutable
//! fields live behind one mutex per node; the in-flight operation counters
//! are atomics outside it (see [`crate::locking`]).
//!
//! Code outside the rename protocol never holds two node locks at once.

use davfs_client::Metadata;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use crate::error::{FsError, Result};
use crate::locking::RefCounters;

pub type NodeId = u64;

/// Id of the root node, equal to the kernel's root inode number.
pub const ROOT_ID: NodeId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub fn of(meta: &Metadata) -> Self {
        if meta.is_dir {
            NodeKind::Directory
        } else {
            NodeKind::File
        }
    }
}

/// Fields guarded by the node lock.
#[derive(Debug)]
pub struct NodeState {
    /// Segment name, unique among siblings; empty only for the root.
    pub name: String,
    pub parent: Weak<Node>,
    /// Present only for directories. `children[k].name == k` always holds.
    pub children: Option<HashMap<String, Arc<Node>>>,
    /// Children dropped from `children` by release that the kernel may
    /// still address, by the name they were released under. Rename and
    /// remove reach them through here.
    pub released: HashMap<String, Vec<Weak<Node>>>,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Removed remotely; never present in any children map.
    pub deleted: bool,
    /// Kind drifted from the remote store; never present in any children map.
    pub stale: bool,
}

/// Point-in-time copy of the cached attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub kind: NodeKind,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

pub struct Node {
    id: NodeId,
    kind: NodeKind,
    state: Mutex<NodeState>,
    refs: RefCounters,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Node {
    fn build(id: NodeId, kind: NodeKind, state: NodeState) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            state: Mutex::new(state),
            refs: RefCounters::new(),
        })
    }

    pub fn new_root() -> Arc<Self> {
        let now = SystemTime::now();
        Self::build(
            ROOT_ID,
            NodeKind::Directory,
            NodeState {
                name: String::new(),
                parent: Weak::new(),
                children: Some(HashMap::new()),
                released: HashMap::new(),
                size: 0,
                atime: now,
                mtime: now,
                ctime: now,
                deleted: false,
                stale: false,
            },
        )
    }

    /// A detached node for `name` under `parent`, seeded from `meta`. It
    /// becomes reachable only once inserted with [`Node::insert_child`].
    pub fn new_child(id: NodeId, parent: &Arc<Node>, name: &str, meta: &Metadata) -> Arc<Self> {
        let kind = NodeKind::of(meta);
        Self::build(
            id,
            kind,
            NodeState {
                name: name.to_string(),
                parent: Arc::downgrade(parent),
                children: (kind == NodeKind::Directory).then(HashMap::new),
                released: HashMap::new(),
                size: meta.size,
                atime: meta.mtime,
                mtime: meta.mtime,
                ctime: meta.ctime,
                deleted: false,
                stale: false,
            },
        )
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub(crate) fn refs(&self) -> &RefCounters {
        &self.refs
    }

    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn name_and_parent(&self) -> (String, Option<Arc<Node>>) {
        let state = self.lock();
        (state.name.clone(), state.parent.upgrade())
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    /// Fails with a stale fault once the node is tombstoned or has drifted.
    pub fn ensure_live(&self) -> Result<()> {
        let state = self.lock();
        if state.deleted || state.stale {
            return Err(FsError::stale(&state.name));
        }
        Ok(())
    }

    pub fn ensure_dir(&self) -> Result<()> {
        if self.is_dir() {
            return Ok(());
        }
        Err(FsError::NotDirectory { path: self.name() })
    }

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.lock()
            .children
            .as_ref()
            .and_then(|c| c.get(name).cloned())
    }

    pub fn child_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .children
            .as_ref()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Insert `fresh` under its own name, or return the live entry already
    /// there when it has the same kind. An entry of the other kind is
    /// displaced and returned so the caller can retire it.
    pub fn insert_child(&self, fresh: Arc<Node>) -> (Arc<Node>, Option<Arc<Node>>) {
        let name = fresh.name();
        let mut state = self.lock();
        let Some(children) = state.children.as_mut() else {
            return (fresh, None);
        };
        if let Some(existing) = children.get(&name) {
            if existing.kind == fresh.kind {
                return (existing.clone(), None);
            }
        }
        let displaced = children.insert(name, fresh.clone());
        (fresh, displaced)
    }

    /// Remove the entry for `name`, returning it.
    pub fn take_child(&self, name: &str) -> Option<Arc<Node>> {
        self.lock().children.as_mut().and_then(|c| c.remove(name))
    }

    /// Remove this node from its parent's map if the entry still points at
    /// this very object.
    pub fn detach_from_parent(self: &Arc<Self>) {
        let (name, parent) = self.name_and_parent();
        let Some(parent) = parent else {
            return;
        };
        let mut state = parent.lock();
        if let Some(children) = state.children.as_mut() {
            if children
                .get(&name)
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                children.remove(&name);
            }
        }
    }

    /// Detach this node like [`Node::detach_from_parent`], but remember it
    /// in the parent's released set so a later rename or remove of the name
    /// still reaches it.
    pub fn release_from_parent(self: &Arc<Self>) {
        let (name, parent) = self.name_and_parent();
        let Some(parent) = parent else {
            return;
        };
        let mut state = parent.lock();
        let detached = state.children.as_mut().is_some_and(|children| {
            children
                .get(&name)
                .is_some_and(|current| Arc::ptr_eq(current, self))
                && children.remove(&name).is_some()
        });
        if detached {
            let entry = state.released.entry(name).or_default();
            entry.retain(|w| w.strong_count() > 0);
            entry.push(Arc::downgrade(self));
        }
    }

    /// Released children still alive under `name`.
    pub fn released(&self, name: &str) -> Vec<Arc<Node>> {
        released_in(&self.lock(), name)
    }

    /// Forget the released children under `name`, returning those alive.
    pub fn take_released(&self, name: &str) -> Vec<Arc<Node>> {
        self.lock()
            .released
            .remove(name)
            .map(|list| list.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    pub fn tombstone(&self) {
        self.lock().deleted = true;
    }

    pub fn mark_stale(&self) {
        self.lock().stale = true;
    }

    /// Adopt size and times from a fresh remote stat.
    pub fn refresh(&self, meta: &Metadata) {
        let mut state = self.lock();
        state.size = meta.size;
        state.mtime = meta.mtime;
        state.ctime = meta.ctime;
    }

    /// Grow the cached size to `end` after a successful write; never shrinks.
    pub fn extend_size(&self, end: u64) {
        let mut state = self.lock();
        if end > state.size {
            state.size = end;
        }
        state.mtime = SystemTime::now();
    }

    pub fn set_size(&self, size: u64) {
        self.lock().size = size;
    }

    pub fn set_times(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) {
        let mut state = self.lock();
        if let Some(atime) = atime {
            state.atime = atime;
        }
        if let Some(mtime) = mtime {
            state.mtime = mtime;
        }
    }

    /// Snapshot the cached attributes, raising atime to mtime when older.
    pub fn snapshot(&self) -> NodeSnapshot {
        let mut state = self.lock();
        if state.atime < state.mtime {
            state.atime = state.mtime;
        }
        NodeSnapshot {
            kind: self.kind,
            size: state.size,
            atime: state.atime,
            mtime: state.mtime,
            ctime: state.ctime,
        }
    }
}

/// Released children alive under `name` in an already locked state.
pub fn released_in(state: &NodeState, name: &str) -> Vec<Arc<Node>> {
    state
        .released
        .get(name)
        .map(|list| list.iter().filter_map(Weak::upgrade).collect())
        .unwrap_or_default()
}
