//! Reference counting and multi-node locking.
//!
//! Every node carries two counters of in-flight operations that run while
//! its lock is *not* held: structural references for create, mkdir, remove
//! and rename, and I/O references for lookup, readdir, getattr, read and
//! write. References are RAII guards. [`RefCounters::wait_idle`] is the
//! drain barrier used by release: a node is not detached while either
//! counter is nonzero.
//!
//! Rename is the only operation that holds several node locks at once. It
//! takes them through [`NodeLocks`], which always acquires in ascending id
//! order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

use crate::error::{FsError, Result};
use crate::node::{Node, NodeState};
use crate::path::{is_same_or_ancestor, node_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Tree-shape mutation in flight.
    Meta,
    /// Content or attribute access in flight.
    Io,
}

#[derive(Debug, Default)]
pub struct RefCounters {
    meta: AtomicUsize,
    io: AtomicUsize,
    drained: Notify,
}

impl RefCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: RefKind) -> &AtomicUsize {
        match kind {
            RefKind::Meta => &self.meta,
            RefKind::Io => &self.io,
        }
    }

    pub fn count(&self, kind: RefKind) -> usize {
        self.counter(kind).load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.count(RefKind::Meta) == 0 && self.count(RefKind::Io) == 0
    }

    /// Resolve once both counters are zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// One outstanding reference; dropping it releases the count.
#[must_use = "a reference is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RefGuard {
    node: Arc<Node>,
    kind: RefKind,
}

impl RefGuard {
    pub fn new(node: &Arc<Node>, kind: RefKind) -> Self {
        node.refs().counter(kind).fetch_add(1, Ordering::AcqRel);
        Self {
            node: node.clone(),
            kind,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        let refs = self.node.refs();
        if refs.counter(self.kind).fetch_sub(1, Ordering::AcqRel) == 1 && refs.is_idle() {
            refs.drained.notify_waiters();
        }
    }
}

impl Node {
    pub fn meta_ref(self: &Arc<Self>) -> RefGuard {
        RefGuard::new(self, RefKind::Meta)
    }

    pub fn io_ref(self: &Arc<Self>) -> RefGuard {
        RefGuard::new(self, RefKind::Io)
    }

    pub fn ref_count(&self, kind: RefKind) -> usize {
        self.refs().count(kind)
    }

    /// Wait until no operation holds a reference on this node.
    pub async fn drain(&self) {
        self.refs().wait_idle().await
    }
}

/// Directories a rename must hold structural references on.
#[derive(Debug, Clone)]
pub enum LockSet {
    /// Same directory, or one directory nested inside the other: only the
    /// outer one.
    Single(Arc<Node>),
    /// Unrelated directories, source first.
    Pair(Arc<Node>, Arc<Node>),
}

impl LockSet {
    pub fn nodes(&self) -> Vec<&Arc<Node>> {
        match self {
            LockSet::Single(n) => vec![n],
            LockSet::Pair(a, b) => vec![a, b],
        }
    }

    pub fn same_as(&self, other: &LockSet) -> bool {
        match (self, other) {
            (LockSet::Single(a), LockSet::Single(b)) => Arc::ptr_eq(a, b),
            (LockSet::Pair(a1, b1), LockSet::Pair(a2, b2)) => {
                Arc::ptr_eq(a1, a2) && Arc::ptr_eq(b1, b2)
            }
            _ => false,
        }
    }

    /// Take a structural reference on every member, in order.
    pub fn acquire(&self) -> Vec<RefGuard> {
        self.nodes().into_iter().map(|n| n.meta_ref()).collect()
    }
}

/// Choose the lock set for renaming between `src` and `dst`, given their
/// current paths.
pub fn rename_lock_set(src: &Arc<Node>, src_path: &str, dst: &Arc<Node>, dst_path: &str) -> LockSet {
    if Arc::ptr_eq(src, dst) || is_same_or_ancestor(src_path, dst_path) {
        LockSet::Single(src.clone())
    } else if is_same_or_ancestor(dst_path, src_path) {
        LockSet::Single(dst.clone())
    } else {
        LockSet::Pair(src.clone(), dst.clone())
    }
}

/// A lock set that held still across one full recomputation, with the
/// directory paths it was computed from and the references that pin it.
#[derive(Debug)]
pub struct SettledLocks {
    pub set: LockSet,
    pub src_path: String,
    pub dst_path: String,
    refs: Vec<RefGuard>,
}

impl SettledLocks {
    pub fn held(&self) -> usize {
        self.refs.len()
    }
}

/// Recompute the rename lock set until two consecutive rounds agree,
/// holding structural references on the previous round's set meanwhile.
pub fn settle_rename_locks(
    src: &Arc<Node>,
    dst: &Arc<Node>,
    retry_limit: usize,
    max_depth: usize,
) -> Result<SettledLocks> {
    settle_rename_locks_with(src, dst, retry_limit, max_depth, || {})
}

/// [`settle_rename_locks`] with `between_rounds` run after each round's
/// references are taken.
fn settle_rename_locks_with<F: FnMut()>(
    src: &Arc<Node>,
    dst: &Arc<Node>,
    retry_limit: usize,
    max_depth: usize,
    mut between_rounds: F,
) -> Result<SettledLocks> {
    let rounds = retry_limit.max(2);
    let mut held: Option<(LockSet, Vec<RefGuard>)> = None;

    for round in 0..rounds {
        let src_path = node_path(src, max_depth)?;
        let dst_path = node_path(dst, max_depth)?;
        let set = rename_lock_set(src, &src_path, dst, &dst_path);

        match held.take() {
            Some((prev, refs)) if prev.same_as(&set) => {
                trace!("rename lock set settled after {} rounds", round);
                return Ok(SettledLocks {
                    set: prev,
                    src_path,
                    dst_path,
                    refs,
                });
            }
            _ => {}
        }
        let refs = set.acquire();
        held = Some((set, refs));
        between_rounds();
    }

    Err(FsError::RenameContention {
        from: node_path(src, max_depth).unwrap_or_default(),
        attempts: rounds,
    })
}

/// Several node locks taken together in ascending id order.
pub struct NodeLocks<'a> {
    ids: Vec<u64>,
    guards: Vec<MutexGuard<'a, NodeState>>,
}

impl<'a> NodeLocks<'a> {
    /// Lock every distinct node in `nodes`.
    pub fn acquire(nodes: &'a [Arc<Node>]) -> Self {
        let mut ordered: Vec<&'a Arc<Node>> = nodes.iter().collect();
        ordered.sort_by_key(|n| n.id());
        ordered.dedup_by_key(|n| n.id());
        let ids = ordered.iter().map(|n| n.id()).collect();
        let guards = ordered.into_iter().map(|n| n.lock()).collect();
        Self { ids, guards }
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// State of `node`, if it is one of the locked nodes.
    pub fn state(&mut self, node: &Node) -> Option<&mut NodeState> {
        let idx = self.ids.iter().position(|id| *id == node.id())?;
        Some(&mut *self.guards[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use davfs_client::Metadata;
    use proptest::prelude::*;
    use std::time::{Duration, SystemTime};

    fn dir(id: u64, parent: &Arc<Node>, name: &str) -> Arc<Node> {
        let now = SystemTime::now();
        let node = Node::new_child(id, parent, name, &Metadata::collection(name, now, now));
        parent.insert_child(node.clone());
        node
    }

    fn single(set: &LockSet) -> Option<u64> {
        match set {
            LockSet::Single(n) => Some(n.id()),
            LockSet::Pair(..) => None,
        }
    }

    #[test]
    fn test_guard_counts_and_releases() {
        let root = Node::new_root();
        let a = root.meta_ref();
        let b = root.io_ref();
        let c = root.io_ref();
        assert_eq!(root.ref_count(RefKind::Meta), 1);
        assert_eq!(root.ref_count(RefKind::Io), 2);
        assert_eq!(b.kind(), RefKind::Io);
        drop(a);
        drop(b);
        assert_eq!(root.ref_count(RefKind::Meta), 0);
        assert_eq!(root.ref_count(RefKind::Io), 1);
        drop(c);
        assert!(root.refs().is_idle());
    }

    #[tokio::test]
    async fn test_drain_returns_immediately_when_idle() {
        let root = Node::new_root();
        tokio::time::timeout(Duration::from_secs(1), root.drain())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_last_reference() {
        let root = Node::new_root();
        let guard = root.io_ref();
        let waiter = {
            let root = root.clone();
            tokio::spawn(async move { root.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_lock_set_same_directory() {
        let root = Node::new_root();
        let a = dir(2, &root, "a");
        let set = rename_lock_set(&a, "/a", &a, "/a");
        assert_eq!(single(&set), Some(2));
    }

    #[test]
    fn test_lock_set_nested_picks_outer() {
        let root = Node::new_root();
        let a = dir(2, &root, "a");
        let b = dir(3, &a, "b");
        assert_eq!(single(&rename_lock_set(&a, "/a", &b, "/a/b")), Some(2));
        assert_eq!(single(&rename_lock_set(&b, "/a/b", &a, "/a")), Some(2));
        assert_eq!(single(&rename_lock_set(&b, "/a/b", &root, "/")), Some(1));
    }

    #[test]
    fn test_lock_set_disjoint_orders_source_first() {
        let root = Node::new_root();
        let a = dir(2, &root, "a");
        let ab = dir(3, &root, "ab");
        match rename_lock_set(&ab, "/ab", &a, "/a") {
            LockSet::Pair(first, second) => {
                assert_eq!(first.id(), 3);
                assert_eq!(second.id(), 2);
            }
            other => panic!("expected a pair, got {:?}", other),
        }
    }

    #[test]
    fn test_settle_holds_references() {
        let root = Node::new_root();
        let a = dir(2, &root, "a");
        let b = dir(3, &root, "b");
        let settled = settle_rename_locks(&a, &b, 8, 64).unwrap();
        assert_eq!(settled.src_path, "/a");
        assert_eq!(settled.dst_path, "/b");
        assert_eq!(settled.held(), 2);
        assert_eq!(a.ref_count(RefKind::Meta), 1);
        assert_eq!(b.ref_count(RefKind::Meta), 1);
        drop(settled);
        assert_eq!(a.ref_count(RefKind::Meta), 0);
        assert_eq!(b.ref_count(RefKind::Meta), 0);
    }

    #[test]
    fn test_settle_nested_holds_one_reference() {
        let root = Node::new_root();
        let a = dir(2, &root, "a");
        let b = dir(3, &a, "b");
        let settled = settle_rename_locks(&b, &a, 8, 64).unwrap();
        assert_eq!(settled.held(), 1);
        assert_eq!(a.ref_count(RefKind::Meta), 1);
        assert_eq!(b.ref_count(RefKind::Meta), 0);
    }

    fn reparent(node: &Arc<Node>, from: &Arc<Node>, to: &Arc<Node>) {
        let name = node.name();
        from.take_child(&name);
        node.lock().parent = Arc::downgrade(to);
        to.insert_child(node.clone());
    }

    #[test]
    fn test_settle_gives_up_when_set_keeps_changing() {
        let root = Node::new_root();
        let a = dir(2, &root, "a");
        let b = dir(3, &root, "b");
        let mut nested = false;
        let result = settle_rename_locks_with(&a, &b, 4, 64, || {
            if nested {
                reparent(&b, &a, &root);
            } else {
                reparent(&b, &root, &a);
            }
            nested = !nested;
        });
        match result {
            Err(FsError::RenameContention { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected contention, got {:?}", other.map(|s| s.held())),
        }
        assert_eq!(a.ref_count(RefKind::Meta), 0);
        assert_eq!(b.ref_count(RefKind::Meta), 0);
    }

    #[test]
    fn test_settle_converges_after_one_change() {
        let root = Node::new_root();
        let a = dir(2, &root, "a");
        let b = dir(3, &root, "b");
        let mut moved = false;
        let settled = settle_rename_locks_with(&a, &b, 4, 64, || {
            if !moved {
                reparent(&b, &root, &a);
                moved = true;
            }
        })
        .unwrap();
        assert_eq!(settled.dst_path, "/a/b");
        assert_eq!(settled.held(), 1);
        assert_eq!(b.ref_count(RefKind::Meta), 0);
    }

    #[test]
    fn test_settle_fails_on_orphan() {
        let root = Node::new_root();
        let a = dir(2, &root, "a");
        let b = dir(3, &a, "b");
        root.take_child("a");
        drop(a);
        assert!(matches!(
            settle_rename_locks(&b, &root, 8, 64),
            Err(FsError::Stale { .. })
        ));
    }

    #[test]
    fn test_node_locks_dedup_and_order() {
        let root = Node::new_root();
        let a = dir(5, &root, "a");
        let b = dir(3, &root, "b");
        let nodes = vec![a.clone(), b.clone(), a.clone(), root.clone()];
        let mut locks = NodeLocks::acquire(&nodes);
        assert_eq!(locks.ids(), &[1, 3, 5]);
        assert_eq!(locks.len(), 3);
        locks.state(&a).unwrap().size = 7;
        drop(locks);
        assert_eq!(a.snapshot().size, 7);
    }

    proptest! {
        #[test]
        fn prop_lock_set_single_iff_related(
            left in proptest::collection::vec("[ab]", 0..4),
            right in proptest::collection::vec("[ab]", 0..4),
        ) {
            let src_path = format!("/{}", left.join("/"));
            let dst_path = format!("/{}", right.join("/"));
            let root = Node::new_root();
            let src = dir(10, &root, "src");
            let dst = dir(11, &root, "dst");
            let related = is_same_or_ancestor(&src_path, &dst_path)
                || is_same_or_ancestor(&dst_path, &src_path);
            match rename_lock_set(&src, &src_path, &dst, &dst_path) {
                LockSet::Single(n) => {
                    prop_assert!(related);
                    let outer = if is_same_or_ancestor(&src_path, &dst_path) { 10 } else { 11 };
                    prop_assert_eq!(n.id(), outer);
                }
                LockSet::Pair(first, second) => {
                    prop_assert!(!related);
                    prop_assert_eq!(first.id(), 10);
                    prop_assert_eq!(second.id(), 11);
                }
            }
        }
    }
}
