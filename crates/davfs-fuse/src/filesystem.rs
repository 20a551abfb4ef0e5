//! Kernel-facing FUSE adapter.
//!
//! Implements `fuser::Filesystem` on top of [`DavFs`]. Inode numbers are
//! node ids. Every request is moved onto the tokio runtime as its own task
//! together with its reply object, so slow remote calls on one path never
//! hold up requests on another.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use fuser::{
    consts::FOPEN_KEEP_CACHE, FileType as FuserFileType, Filesystem, KernelConfig, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::attr::kind_to_fuser_type;
use crate::error::FsError;
use crate::node::{Node, ROOT_ID};
use crate::operations::{DavFs, DirEntry, OpenFlags, SetAttrRequest};

/// Inode number reported for listed entries that have not been looked up.
const UNRESOLVED_INO: u64 = u64::MAX;

struct InodeEntry {
    node: Arc<Node>,
    lookups: u64,
}

/// Nodes the kernel currently holds references to, by inode number.
pub struct InodeTable {
    entries: DashMap<u64, InodeEntry>,
}

impl InodeTable {
    pub fn new(root: Arc<Node>) -> Self {
        let entries = DashMap::new();
        entries.insert(root.id(), InodeEntry { node: root, lookups: 1 });
        Self { entries }
    }

    /// Record one more kernel reference to `node` and return its inode.
    pub fn remember(&self, node: &Arc<Node>) -> u64 {
        let ino = node.id();
        self.entries
            .entry(ino)
            .and_modify(|e| e.lookups += 1)
            .or_insert_with(|| InodeEntry {
                node: node.clone(),
                lookups: 1,
            });
        ino
    }

    pub fn get(&self, ino: u64) -> Option<Arc<Node>> {
        self.entries.get(&ino).map(|e| e.node.clone())
    }

    /// Drop `nlookup` kernel references. The root is never forgotten.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_ID {
            return;
        }
        let gone = match self.entries.get_mut(&ino) {
            Some(mut e) => {
                e.lookups = e.lookups.saturating_sub(nlookup);
                e.lookups == 0
            }
            None => false,
        };
        if gone {
            self.entries.remove_if(&ino, |_, e| e.lookups == 0);
        }
    }

    pub fn lookups(&self, ino: u64) -> u64 {
        self.entries.get(&ino).map(|e| e.lookups).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One row of a directory listing as handed to the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub ino: u64,
    pub kind: FuserFileType,
    pub name: String,
}

/// Build the full listing for `dir`, including `.` and `..`.
pub fn listing_entries(dir: &Node, entries: Vec<DirEntry>) -> Vec<ListingEntry> {
    let parent_ino = dir
        .name_and_parent()
        .1
        .map(|p| p.id())
        .unwrap_or(dir.id());
    let mut out = Vec::with_capacity(entries.len() + 2);
    out.push(ListingEntry {
        ino: dir.id(),
        kind: FuserFileType::Directory,
        name: ".".to_string(),
    });
    out.push(ListingEntry {
        ino: parent_ino,
        kind: FuserFileType::Directory,
        name: "..".to_string(),
    });
    for entry in entries {
        let ino = dir
            .child(&entry.name)
            .map(|c| c.id())
            .unwrap_or(UNRESOLVED_INO);
        out.push(ListingEntry {
            ino,
            kind: kind_to_fuser_type(entry.kind),
            name: entry.name,
        });
    }
    out
}

fn errno(op: &str, err: &FsError) -> c_int {
    match err {
        FsError::Remote(_) | FsError::RenameContention { .. } => warn!("{} failed: {}", op, err),
        _ => debug!("{} failed: {}", op, err),
    }
    err.to_errno()
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

pub struct DavFuse {
    fs: Arc<DavFs>,
    inodes: Arc<InodeTable>,
    listings: Arc<DashMap<u64, Vec<ListingEntry>>>,
    next_fh: AtomicU64,
    runtime: Handle,
}

impl DavFuse {
    pub fn new(fs: Arc<DavFs>, runtime: Handle) -> Self {
        let inodes = Arc::new(InodeTable::new(fs.root()));
        Self {
            fs,
            inodes,
            listings: Arc::new(DashMap::new()),
            next_fh: AtomicU64::new(1),
            runtime,
        }
    }

    pub fn fs(&self) -> &Arc<DavFs> {
        &self.fs
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn node(&self, ino: u64) -> Result<Arc<Node>, c_int> {
        self.inodes.get(ino).ok_or(libc::ENOENT)
    }
}

impl Filesystem for DavFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("davfs filesystem init");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("davfs filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy().into_owned();
        debug!("lookup parent={} name={}", parent, name);
        let dir = match self.node(parent) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match fs.lookup(&dir, &name).await {
                Ok(node) => {
                    let ino = inodes.remember(&node);
                    let attr = fs.cached_attr(&node);
                    reply.entry(&fs.config().entry_timeout, &attr.to_fuser(ino), 0);
                }
                Err(e) => reply.error(errno("lookup", &e)),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!("forget ino={} nlookup={}", ino, nlookup);
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr ino={}", ino);
        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.getattr(&node).await {
                Ok(attr) => reply.attr(&attr.valid, &attr.to_fuser(ino)),
                Err(e) => reply.error(errno("getattr", &e)),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr ino={} size={:?} mode={:?} uid={:?} gid={:?}",
            ino, size, mode, uid, gid
        );
        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let req = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        };
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.setattr(&node, &req).await {
                Ok(attr) => reply.attr(&attr.valid, &attr.to_fuser(ino)),
                Err(e) => reply.error(errno("setattr", &e)),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_string_lossy().into_owned();
        debug!("mkdir parent={} name={} mode={:o}", parent, name, mode);
        let dir = match self.node(parent) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match fs.mkdir(&dir, &name).await {
                Ok(node) => {
                    let ino = inodes.remember(&node);
                    let attr = fs.cached_attr(&node);
                    reply.entry(&fs.config().entry_timeout, &attr.to_fuser(ino), 0);
                }
                Err(e) => reply.error(errno("mkdir", &e)),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, false, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, true, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy().into_owned();
        let newname = newname.to_string_lossy().into_owned();
        debug!(
            "rename parent={} name={} newparent={} newname={}",
            parent, name, newparent, newname
        );
        if flags != 0 {
            return reply.error(libc::EINVAL);
        }
        let (src, dst) = match (self.node(parent), self.node(newparent)) {
            (Ok(s), Ok(d)) => (s, d),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.rename(&src, &name, &dst, &newname).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("rename", &e)),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open ino={} flags={:#o}", ino, flags);
        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let fh = self.alloc_fh();
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.open(&node, OpenFlags::from_libc(flags)).await {
                Ok(opened) => {
                    let open_flags = if opened.keep_cache { FOPEN_KEEP_CACHE } else { 0 };
                    reply.opened(fh, open_flags);
                }
                Err(e) => reply.error(errno("open", &e)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino={} offset={} size={}", ino, offset, size);
        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.read(&node, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(errno("read", &e)),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write ino={} offset={} size={}", ino, offset, data.len());
        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let data = data.to_vec();
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.write(&node, offset, &data).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(errno("write", &e)),
            }
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        debug!("flush ino={}", ino);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release ino={}", ino);
        self.release_node(ino, reply);
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        debug!("fsync ino={}", ino);
        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.fsync(&node).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("fsync", &e)),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir ino={}", ino);
        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        if !node.is_dir() {
            return reply.error(libc::ENOTDIR);
        }
        reply.opened(self.alloc_fh(), 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir ino={} fh={} offset={}", ino, fh, offset);
        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let fs = self.fs.clone();
        let listings = self.listings.clone();
        self.runtime.spawn(async move {
            let cached = if offset > 0 {
                listings.get(&fh).map(|l| l.value().clone())
            } else {
                None
            };
            let listing = match cached {
                Some(listing) => listing,
                None => match fs.read_dir(&node).await {
                    Ok(entries) => {
                        let listing = listing_entries(&node, entries);
                        listings.insert(fh, listing.clone());
                        listing
                    }
                    Err(e) => return reply.error(errno("readdir", &e)),
                },
            };

            let skip = usize::try_from(offset).unwrap_or(0);
            for (i, entry) in listing.iter().enumerate().skip(skip) {
                if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        debug!("releasedir ino={} fh={}", ino, fh);
        self.listings.remove(&fh);
        self.release_node(ino, reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        debug!("statfs");
        let st = self.fs.statfs();
        reply.statfs(
            st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_string_lossy().into_owned();
        debug!(
            "create parent={} name={} mode={:o} flags={:#o}",
            parent, name, mode, flags
        );
        let dir = match self.node(parent) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let fh = self.alloc_fh();
        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        self.runtime.spawn(async move {
            match fs.create(&dir, &name, OpenFlags::from_libc(flags)).await {
                Ok(node) => {
                    let ino = inodes.remember(&node);
                    let attr = fs.cached_attr(&node);
                    reply.created(&fs.config().entry_timeout, &attr.to_fuser(ino), 0, fh, 0);
                }
                Err(e) => reply.error(errno("create", &e)),
            }
        });
    }
}

impl DavFuse {
    fn remove(&self, parent: u64, name: &OsStr, dir: bool, reply: ReplyEmpty) {
        let name = name.to_string_lossy().into_owned();
        debug!("remove parent={} name={} dir={}", parent, name, dir);
        let parent = match self.node(parent) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.remove(&parent, &name, dir).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(if dir { "rmdir" } else { "unlink" }, &e)),
            }
        });
    }

    fn release_node(&self, ino: u64, reply: ReplyEmpty) {
        let Some(node) = self.inodes.get(ino) else {
            return reply.ok();
        };
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            fs.release(&node).await;
            reply.ok();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::node::NodeKind;
    use davfs_client::MemStore;

    fn make_fs() -> Arc<DavFs> {
        Arc::new(DavFs::new(Arc::new(MemStore::new()), FsConfig::default()))
    }

    #[test]
    fn test_inode_table_starts_with_root() {
        let fs = make_fs();
        let table = InodeTable::new(fs.root());
        assert_eq!(table.len(), 1);
        assert!(Arc::ptr_eq(&table.get(ROOT_ID).unwrap(), &fs.root()));
    }

    #[test]
    fn test_root_is_never_forgotten() {
        let fs = make_fs();
        let table = InodeTable::new(fs.root());
        table.forget(ROOT_ID, 100);
        assert!(table.get(ROOT_ID).is_some());
    }

    #[tokio::test]
    async fn test_forget_drops_after_last_lookup() {
        let fs = make_fs();
        let root = fs.root();
        let node = fs.mkdir(&root, "d").await.unwrap();
        let table = InodeTable::new(root);
        let ino = table.remember(&node);
        assert_eq!(table.remember(&node), ino);
        assert_eq!(table.lookups(ino), 2);
        table.forget(ino, 1);
        assert!(table.get(ino).is_some());
        table.forget(ino, 1);
        assert!(table.get(ino).is_none());
        table.forget(ino, 1);
        assert_eq!(table.lookups(ino), 0);
    }

    #[tokio::test]
    async fn test_listing_includes_dot_entries() {
        let fs = make_fs();
        let root = fs.root();
        let sub = fs.mkdir(&root, "sub").await.unwrap();
        let known = fs.mkdir(&sub, "known").await.unwrap();
        let entries = vec![
            DirEntry { name: "known".into(), kind: NodeKind::Directory },
            DirEntry { name: "file".into(), kind: NodeKind::File },
        ];
        let listing = listing_entries(&sub, entries);
        assert_eq!(listing.len(), 4);
        assert_eq!(listing[0].name, ".");
        assert_eq!(listing[0].ino, sub.id());
        assert_eq!(listing[1].name, "..");
        assert_eq!(listing[1].ino, ROOT_ID);
        assert_eq!(listing[2].ino, known.id());
        assert_eq!(listing[2].kind, FuserFileType::Directory);
        assert_eq!(listing[3].ino, UNRESOLVED_INO);
        assert_eq!(listing[3].kind, FuserFileType::RegularFile);
    }

    #[test]
    fn test_root_listing_parent_is_root() {
        let fs = make_fs();
        let listing = listing_entries(&fs.root(), Vec::new());
        assert_eq!(listing[1].ino, ROOT_ID);
    }

    #[test]
    fn test_resolve_time_specific() {
        let t = SystemTime::UNIX_EPOCH;
        assert_eq!(resolve_time(TimeOrNow::SpecificTime(t)), t);
        assert!(resolve_time(TimeOrNow::Now) > t);
    }

    #[tokio::test]
    async fn test_adapter_registers_root_inode() {
        let fs = make_fs();
        let adapter = DavFuse::new(fs.clone(), Handle::current());
        assert!(Arc::ptr_eq(&adapter.inodes().get(ROOT_ID).unwrap(), &fs.root()));
        assert_eq!(adapter.node(42).err(), Some(libc::ENOENT));
    }
}
