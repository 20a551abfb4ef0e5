//! Filesystem operation handlers.
//!
//! [`DavFs`] is the explicit context every operation runs against: the
//! remote store handle, the root node and the tunables. Handlers take node
//! references from the caller (the kernel adapter or a test) and return
//! typed results; they never retry a remote call.
//!
//! Each handler holds a node lock only while it reads or mutates that
//! node's fields. Across a remote round trip it holds a structural or I/O
//! reference instead.

use bytes::Bytes;
use davfs_client::{Depth, Metadata, RemoteStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::attr::Attr;
use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::locking::{settle_rename_locks, NodeLocks};
use crate::node::{released_in, Node, NodeId, NodeKind, NodeState, ROOT_ID};
use crate::path::{collection_path, is_same_or_ancestor, join_path, node_path};

/// Decoded open/create flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn from_libc(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        OpenFlags {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            create: flags & libc::O_CREAT != 0,
            truncate: flags & libc::O_TRUNC != 0,
            exclusive: flags & libc::O_EXCL != 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenReply {
    /// Cached content is still valid and may be kept by the kernel.
    pub keep_cache: bool,
}

pub struct StatfsReply {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

const RELINK_ATTEMPTS: usize = 8;

pub struct DavFs {
    store: Arc<dyn RemoteStore>,
    root: Arc<Node>,
    config: FsConfig,
    next_id: AtomicU64,
}

impl DavFs {
    pub fn new(store: Arc<dyn RemoteStore>, config: FsConfig) -> Self {
        Self {
            store,
            root: Node::new_root(),
            config,
            next_id: AtomicU64::new(ROOT_ID + 1),
        }
    }

    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn path_of(&self, node: &Node) -> Result<String> {
        node_path(node, self.config.max_path_depth)
    }

    fn alloc_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Path of `name` under the directory `parent`.
    fn child_path(&self, parent: &Node, name: &str) -> Result<String> {
        Ok(join_path(&self.path_of(parent)?, name))
    }

    /// Insert a node for `name` under `parent`, or reuse the one already
    /// there. A node of the other kind occupying the name is tombstoned.
    fn materialize(&self, parent: &Arc<Node>, name: &str, meta: &Metadata) -> Arc<Node> {
        let fresh = Node::new_child(self.alloc_id(), parent, name, meta);
        let (node, displaced) = parent.insert_child(fresh.clone());
        if let Some(old) = displaced {
            debug!("{} changed kind, replacing node {}", name, old.id());
            old.tombstone();
        }
        if !Arc::ptr_eq(&node, &fresh) {
            node.refresh(meta);
        }
        node
    }

    pub fn cached_attr(&self, node: &Node) -> Attr {
        Attr::from_snapshot(&node.snapshot(), &self.config)
    }

    /// Resolve `name` in the directory `parent` against the remote store.
    pub async fn lookup(&self, parent: &Arc<Node>, name: &str) -> Result<Arc<Node>> {
        check_name(name)?;
        parent.ensure_live()?;
        parent.ensure_dir()?;
        let _io = parent.io_ref();
        let path = self.child_path(parent, name)?;
        debug!("lookup {}", path);

        let meta = self
            .store
            .stat(&path)
            .await
            .map_err(|e| FsError::remote(e, &path))?;
        Ok(self.materialize(parent, name, &meta))
    }

    /// List the members of `dir`. Listed entries are not materialized.
    pub async fn read_dir(&self, dir: &Arc<Node>) -> Result<Vec<DirEntry>> {
        dir.ensure_live()?;
        dir.ensure_dir()?;
        let _io = dir.io_ref();
        let path = self.path_of(dir)?;
        debug!("readdir {}", path);

        let listing = self
            .store
            .list(&path, Depth::One)
            .await
            .map_err(|e| FsError::remote(e, &path))?;
        Ok(listing
            .into_iter()
            .skip(1)
            .filter(|m| !m.name.is_empty())
            .map(|m| DirEntry {
                kind: NodeKind::of(&m),
                name: m.name,
            })
            .collect())
    }

    /// Refresh `node` from a remote stat and return its attributes.
    pub async fn getattr(&self, node: &Arc<Node>) -> Result<Attr> {
        node.ensure_live()?;
        let _io = node.io_ref();
        let path = self.path_of(node)?;

        let meta = self
            .store
            .stat(&path)
            .await
            .map_err(|e| FsError::remote(e, &path))?;
        if NodeKind::of(&meta) != node.kind() {
            warn!(
                "{} changed kind remotely (cached {:?}), marking stale",
                path,
                node.kind()
            );
            if !node.is_root() {
                node.mark_stale();
                node.detach_from_parent();
            }
            return Err(FsError::stale(&path));
        }
        node.refresh(&meta);
        Ok(self.cached_attr(node))
    }

    /// Create (or touch) the file `name` in `parent`. The returned node is
    /// also the open handle.
    pub async fn create(
        &self,
        parent: &Arc<Node>,
        name: &str,
        flags: OpenFlags,
    ) -> Result<Arc<Node>> {
        check_name(name)?;
        parent.ensure_live()?;
        parent.ensure_dir()?;
        let _meta = parent.meta_ref();
        let path = self.child_path(parent, name)?;
        debug!("create {} {:?}", path, flags);

        if flags.exclusive {
            match self.store.stat(&path).await {
                Ok(_) => return Err(FsError::AlreadyExists { path }),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(FsError::remote(e, &path)),
            }
        }

        let written = if flags.truncate {
            self.store.write_whole(&path, &[]).await
        } else {
            self.store.write_range(&path, &[], 0).await
        };
        let created = written.map_err(|e| FsError::remote(e, &path))?;
        if flags.exclusive && !created {
            return Err(FsError::AlreadyExists { path });
        }

        let meta = self
            .store
            .stat(&path)
            .await
            .map_err(|e| FsError::remote(e, &path))?;
        if meta.is_collection() {
            return Err(FsError::IsDirectory { path });
        }
        Ok(self.materialize(parent, name, &meta))
    }

    pub async fn mkdir(&self, parent: &Arc<Node>, name: &str) -> Result<Arc<Node>> {
        check_name(name)?;
        parent.ensure_live()?;
        parent.ensure_dir()?;
        let _meta = parent.meta_ref();
        let path = self.child_path(parent, name)?;
        debug!("mkdir {}", path);

        self.store
            .create_collection(&collection_path(&path))
            .await
            .map_err(|e| FsError::remote(e, &path))?;
        let now = SystemTime::now();
        Ok(self.materialize(parent, name, &Metadata::collection(name, now, now)))
    }

    /// Remove `name` from `parent`. `dir` selects rmdir semantics.
    pub async fn remove(&self, parent: &Arc<Node>, name: &str, dir: bool) -> Result<()> {
        check_name(name)?;
        parent.ensure_live()?;
        parent.ensure_dir()?;
        let _meta = parent.meta_ref();
        let path = self.child_path(parent, name)?;
        debug!("remove {} dir={}", path, dir);

        let listing = self
            .store
            .list(&path, Depth::One)
            .await
            .map_err(|e| FsError::remote(e, &path))?;
        let target = listing
            .first()
            .ok_or_else(|| FsError::NotFound { path: path.clone() })?;
        match (dir, target.is_collection()) {
            (true, false) => return Err(FsError::NotDirectory { path }),
            (false, true) => return Err(FsError::IsDirectory { path }),
            (true, true) if listing.len() > 1 => return Err(FsError::NotEmpty { path }),
            _ => {}
        }

        let remote_path = if dir { collection_path(&path) } else { path.clone() };
        self.store
            .delete(&remote_path)
            .await
            .map_err(|e| FsError::remote(e, &path))?;

        if let Some(child) = parent.take_child(name) {
            child.tombstone();
        }
        for released in parent.take_released(name) {
            released.tombstone();
        }
        Ok(())
    }

    /// Move `old_name` in `src` to `new_name` in `dst`.
    pub async fn rename(
        &self,
        src: &Arc<Node>,
        old_name: &str,
        dst: &Arc<Node>,
        new_name: &str,
    ) -> Result<()> {
        check_name(old_name)?;
        check_name(new_name)?;
        for dir in [src, dst] {
            dir.ensure_live()?;
            dir.ensure_dir()?;
        }

        let settled = settle_rename_locks(
            src,
            dst,
            self.config.rename_retry_limit,
            self.config.max_path_depth,
        )?;
        let from = join_path(&settled.src_path, old_name);
        let to = join_path(&settled.dst_path, new_name);
        debug!("rename {} -> {}", from, to);
        if from == to {
            return Ok(());
        }
        if is_same_or_ancestor(&from, &settled.dst_path) {
            return Err(FsError::InvalidArgument {
                msg: format!("cannot move {} into its own subtree {}", from, to),
            });
        }

        let meta = self
            .store
            .stat(&from)
            .await
            .map_err(|e| FsError::remote(e, &from))?;
        let (remote_from, remote_to) = if meta.is_collection() {
            (collection_path(&from), collection_path(&to))
        } else {
            (from.clone(), to.clone())
        };
        self.store
            .move_resource(&remote_from, &remote_to)
            .await
            .map_err(|e| FsError::remote(e, &from))?;

        relink(src, old_name, dst, new_name, || {});
        drop(settled);
        Ok(())
    }

    /// Open `node`. Directories are their own handle; files are re-statted
    /// to decide whether cached content is still valid.
    pub async fn open(&self, node: &Arc<Node>, flags: OpenFlags) -> Result<OpenReply> {
        node.ensure_live()?;
        if node.is_dir() {
            return Ok(OpenReply { keep_cache: false });
        }
        let _io = node.io_ref();
        let path = self.path_of(node)?;
        debug!("open {} {:?}", path, flags);

        if flags.truncate {
            self.store
                .write_whole(&path, &[])
                .await
                .map_err(|e| FsError::remote(e, &path))?;
            node.set_size(0);
            node.set_times(None, Some(SystemTime::now()));
        }

        let before = node.snapshot();
        let keep_cache = match self.store.stat(&path).await {
            Ok(meta) if NodeKind::of(&meta) == node.kind() => {
                let valid =
                    !flags.truncate && meta.size == before.size && meta.mtime == before.mtime;
                node.refresh(&meta);
                valid
            }
            Ok(_) => {
                warn!("{} changed kind remotely during open", path);
                false
            }
            Err(e) => {
                warn!("re-stat of {} on open failed: {}", path, e);
                false
            }
        };
        Ok(OpenReply { keep_cache })
    }

    pub async fn read(&self, node: &Arc<Node>, offset: u64, len: u32) -> Result<Bytes> {
        node.ensure_live()?;
        let _io = node.io_ref();
        let path = self.path_of(node)?;
        if node.is_dir() {
            return Err(FsError::IsDirectory { path });
        }
        self.store
            .read_range(&path, offset, len)
            .await
            .map_err(|e| FsError::remote(e, &path))
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    pub async fn write(&self, node: &Arc<Node>, offset: u64, data: &[u8]) -> Result<u32> {
        node.ensure_live()?;
        let _io = node.io_ref();
        let path = self.path_of(node)?;
        if node.is_dir() {
            return Err(FsError::IsDirectory { path });
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.store
            .write_range(&path, data, offset)
            .await
            .map_err(|e| FsError::remote(e, &path))?;
        node.extend_size(offset + data.len() as u64);
        Ok(data.len() as u32)
    }

    /// Apply size and time changes. Mode and ownership changes are refused.
    pub async fn setattr(&self, node: &Arc<Node>, req: &SetAttrRequest) -> Result<Attr> {
        node.ensure_live()?;
        if req.mode.is_some() {
            return Err(FsError::PermissionDenied { op: "chmod".into() });
        }
        if req.uid.is_some() || req.gid.is_some() {
            return Err(FsError::PermissionDenied { op: "chown".into() });
        }
        if let Some(size) = req.size {
            self.truncate(node, size).await?;
        }
        node.set_times(req.atime, req.mtime);
        Ok(self.cached_attr(node))
    }

    async fn truncate(&self, node: &Arc<Node>, size: u64) -> Result<()> {
        let _io = node.io_ref();
        let path = self.path_of(node)?;
        if node.is_dir() {
            return Err(FsError::IsDirectory { path });
        }
        let current = node.snapshot().size;
        debug!("truncate {} {} -> {}", path, current, size);

        if size == current {
            return Ok(());
        }
        if size == 0 {
            self.store
                .write_whole(&path, &[])
                .await
                .map_err(|e| FsError::remote(e, &path))?;
        } else if size > current {
            self.store
                .write_range(&path, &[], size)
                .await
                .map_err(|e| FsError::remote(e, &path))?;
        } else {
            return Err(FsError::OutOfRange {
                path,
                from: current,
                to: size,
            });
        }
        node.set_size(size);
        node.set_times(None, Some(SystemTime::now()));
        Ok(())
    }

    pub async fn fsync(&self, node: &Arc<Node>) -> Result<()> {
        node.ensure_live()
    }

    /// End of use: wait for in-flight operations on `node` to finish, then
    /// detach it from its parent so the next lookup materializes a fresh
    /// node.
    pub async fn release(&self, node: &Arc<Node>) {
        node.drain().await;
        if !node.is_root() {
            node.release_from_parent();
        }
    }

    pub fn statfs(&self) -> StatfsReply {
        StatfsReply {
            blocks: 1 << 30,
            bfree: 1 << 29,
            bavail: 1 << 29,
            files: 1 << 20,
            ffree: 1 << 19,
            bsize: self.config.block_size,
            namelen: 255,
            frsize: self.config.block_size,
        }
    }
}

/// Mirror a confirmed remote move in the tree: the moving child leaves
/// `src`, anything already named `new_name` in `dst` is tombstoned, and the
/// child is attached under its new name. Released nodes under either name
/// follow the same rules, so handles the kernel still holds stay correct.
///
/// `before_lock` runs after each snapshot of the entries and before the
/// locks are taken.
fn relink<F: FnMut()>(
    src: &Arc<Node>,
    old_name: &str,
    dst: &Arc<Node>,
    new_name: &str,
    mut before_lock: F,
) {
    for attempt in 0..RELINK_ATTEMPTS {
        let moving = src.child(old_name);
        let displaced = dst.child(new_name);
        let moving_released = src.released(old_name);
        let displaced_released = dst.released(new_name);
        before_lock();

        let mut members = vec![src.clone(), dst.clone()];
        members.extend(moving.iter().cloned());
        members.extend(displaced.iter().cloned());
        members.extend(moving_released.iter().cloned());
        members.extend(displaced_released.iter().cloned());
        let mut locks = NodeLocks::acquire(&members);

        let unchanged = locks.state(src).is_some_and(|s| {
            same_entry(lookup_entry(s, old_name), &moving)
                && same_nodes(&released_in(s, old_name), &moving_released)
        }) && locks.state(dst).is_some_and(|s| {
            same_entry(lookup_entry(s, new_name), &displaced)
                && same_nodes(&released_in(s, new_name), &displaced_released)
        });
        if !unchanged {
            debug!("children changed during rename relink, attempt {}", attempt);
            continue;
        }

        if let Some(state) = locks.state(src) {
            if let Some(children) = state.children.as_mut() {
                children.remove(old_name);
            }
            state.released.remove(old_name);
        }
        if let Some(state) = locks.state(dst) {
            if displaced.is_some() {
                if let Some(children) = state.children.as_mut() {
                    children.remove(new_name);
                }
            }
            state.released.remove(new_name);
        }
        for old in displaced.iter().chain(displaced_released.iter()) {
            if let Some(state) = locks.state(old) {
                state.deleted = true;
            }
        }
        let now = SystemTime::now();
        for child in moving.iter().chain(moving_released.iter()) {
            if let Some(state) = locks.state(child) {
                state.name = new_name.to_string();
                state.parent = Arc::downgrade(dst);
                state.ctime = now;
            }
        }
        if let Some(state) = locks.state(dst) {
            if let Some(child) = &moving {
                if let Some(children) = state.children.as_mut() {
                    children.insert(new_name.to_string(), child.clone());
                }
            }
            if !moving_released.is_empty() {
                state.released.insert(
                    new_name.to_string(),
                    moving_released.iter().map(Arc::downgrade).collect(),
                );
            }
        }
        return;
    }

    warn!(
        "rename relink of {} -> {} kept racing, dropping both names",
        old_name, new_name
    );
    let moved = src.take_child(old_name).into_iter().chain(src.take_released(old_name));
    for node in moved {
        node.mark_stale();
    }
    let replaced = dst.take_child(new_name).into_iter().chain(dst.take_released(new_name));
    for node in replaced {
        node.tombstone();
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument {
            msg: format!("invalid name {:?}", name),
        });
    }
    Ok(())
}

fn lookup_entry(state: &NodeState, name: &str) -> Option<Arc<Node>> {
    state.children.as_ref().and_then(|c| c.get(name).cloned())
}

fn same_nodes(current: &[Arc<Node>], seen: &[Arc<Node>]) -> bool {
    current.len() == seen.len() && current.iter().zip(seen).all(|(a, b)| Arc::ptr_eq(a, b))
}

fn same_entry(current: Option<Arc<Node>>, seen: &Option<Arc<Node>>) -> bool {
    match (current, seen) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(&a, b),
        _ => false,
    }
}
