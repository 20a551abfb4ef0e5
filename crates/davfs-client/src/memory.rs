//! In-process remote store.
//!
//! Keeps resources in a sorted map keyed by normalized path. Every call is
//! recorded in a journal so callers can assert on the exact remote traffic,
//! and a fault can be armed for the next call of a given kind.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::store::{base_name, normalize_path, parent_path, Depth, Metadata, RemoteStore};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Body {
    Collection,
    Data(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Resource {
    body: Body,
    mtime: SystemTime,
    ctime: SystemTime,
}

impl Resource {
    fn collection() -> Self {
        let now = SystemTime::now();
        Self {
            body: Body::Collection,
            mtime: now,
            ctime: now,
        }
    }

    fn empty_file() -> Self {
        let now = SystemTime::now();
        Self {
            body: Body::Data(Vec::new()),
            mtime: now,
            ctime: now,
        }
    }

    fn metadata(&self, path: &str) -> Metadata {
        let name = base_name(path);
        match &self.body {
            Body::Collection => Metadata::collection(name, self.mtime, self.ctime),
            Body::Data(data) => Metadata::file(name, data.len() as u64, self.mtime, self.ctime),
        }
    }
}

/// Kind of remote call, used for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOpKind {
    Stat,
    List,
    CreateCollection,
    Move,
    Delete,
    WriteWhole,
    WriteRange,
    ReadRange,
}

/// One journaled remote call, with paths exactly as the caller passed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Stat(String),
    List(String, Depth),
    CreateCollection(String),
    Move { from: String, to: String },
    Delete(String),
    WriteWhole { path: String, len: usize },
    WriteRange { path: String, offset: u64, len: usize },
    ReadRange { path: String, offset: u64, len: u32 },
}

impl StoreOp {
    pub fn kind(&self) -> StoreOpKind {
        match self {
            StoreOp::Stat(_) => StoreOpKind::Stat,
            StoreOp::List(..) => StoreOpKind::List,
            StoreOp::CreateCollection(_) => StoreOpKind::CreateCollection,
            StoreOp::Move { .. } => StoreOpKind::Move,
            StoreOp::Delete(_) => StoreOpKind::Delete,
            StoreOp::WriteWhole { .. } => StoreOpKind::WriteWhole,
            StoreOp::WriteRange { .. } => StoreOpKind::WriteRange,
            StoreOp::ReadRange { .. } => StoreOpKind::ReadRange,
        }
    }
}

struct MemState {
    resources: BTreeMap<String, Resource>,
    journal: Vec<StoreOp>,
    faults: HashMap<StoreOpKind, StoreError>,
}

/// Remote store kept entirely in memory.
pub struct MemStore {
    state: Mutex<MemState>,
    latency: Option<Duration>,
}

impl MemStore {
    pub fn new() -> Self {
        let mut resources = BTreeMap::new();
        resources.insert("/".to_string(), Resource::collection());
        Self {
            state: Mutex::new(MemState {
                resources,
                journal: Vec::new(),
                faults: HashMap::new(),
            }),
            latency: None,
        }
    }

    /// Delay every call by `latency` before it touches the store.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a one-shot failure for the next call of `kind`.
    pub fn fail_next(&self, kind: StoreOpKind, err: StoreError) {
        self.lock().faults.insert(kind, err);
    }

    pub fn journal(&self) -> Vec<StoreOp> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Journaled calls of one kind, in order.
    pub fn ops_of(&self, kind: StoreOpKind) -> Vec<StoreOp> {
        self.lock()
            .journal
            .iter()
            .filter(|op| op.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().resources.contains_key(&normalize_path(path))
    }

    /// Body of a file, or `None` for a collection or missing path.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().resources.get(&normalize_path(path)) {
            Some(Resource {
                body: Body::Data(data),
                ..
            }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Seed a collection, creating missing ancestors.
    pub fn insert_collection(&self, path: &str) {
        let mut state = self.lock();
        let path = normalize_path(path);
        insert_ancestors(&mut state.resources, &path);
        state.resources.insert(path, Resource::collection());
    }

    /// Seed a file, creating missing ancestors.
    pub fn insert_file(&self, path: &str, data: &[u8]) {
        let mut state = self.lock();
        let path = normalize_path(path);
        insert_ancestors(&mut state.resources, &path);
        let mut res = Resource::empty_file();
        res.body = Body::Data(data.to_vec());
        state.resources.insert(path, res);
    }

    async fn begin(&self, op: StoreOp) -> Result<MutexGuard<'_, MemState>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        trace!("memstore: {:?}", op);
        let kind = op.kind();
        state.journal.push(op);
        if let Some(err) = state.faults.remove(&kind) {
            return Err(err);
        }
        Ok(state)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_ancestors(resources: &mut BTreeMap<String, Resource>, path: &str) {
    let mut parent = parent_path(path);
    while parent != "/" && !resources.contains_key(&parent) {
        resources.insert(parent.clone(), Resource::collection());
        parent = parent_path(&parent);
    }
}

fn is_below(candidate: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return candidate != "/";
    }
    candidate.len() > ancestor.len()
        && candidate.starts_with(ancestor)
        && candidate.as_bytes()[ancestor.len()] == b'/'
}

fn require_parent_collection(state: &MemState, path: &str) -> Result<()> {
    let parent = parent_path(path);
    match state.resources.get(&parent) {
        Some(Resource {
            body: Body::Collection,
            ..
        }) => Ok(()),
        Some(_) => Err(StoreError::conflict(path, "parent is not a collection")),
        None => Err(StoreError::conflict(path, "parent does not exist")),
    }
}

fn file_for_write<'a>(state: &'a mut MemState, path: &str) -> Result<(&'a mut Vec<u8>, bool)> {
    require_parent_collection(state, path)?;
    let created = !state.resources.contains_key(path);
    let res = state
        .resources
        .entry(path.to_string())
        .or_insert_with(Resource::empty_file);
    res.mtime = SystemTime::now();
    match &mut res.body {
        Body::Data(data) => Ok((data, created)),
        Body::Collection => Err(StoreError::conflict(path, "cannot write to a collection")),
    }
}

#[async_trait]
impl RemoteStore for MemStore {
    async fn stat(&self, path: &str) -> Result<Metadata> {
        let state = self.begin(StoreOp::Stat(path.to_string())).await?;
        let key = normalize_path(path);
        state
            .resources
            .get(&key)
            .map(|res| res.metadata(&key))
            .ok_or_else(|| StoreError::not_found(path))
    }

    async fn list(&self, path: &str, depth: Depth) -> Result<Vec<Metadata>> {
        let state = self.begin(StoreOp::List(path.to_string(), depth)).await?;
        let key = normalize_path(path);
        let this = state
            .resources
            .get(&key)
            .ok_or_else(|| StoreError::not_found(path))?;
        let mut out = vec![this.metadata(&key)];
        if depth == Depth::One && this.body == Body::Collection {
            for (child, res) in state.resources.iter() {
                if is_below(child, &key) && parent_path(child) == key {
                    out.push(res.metadata(child));
                }
            }
        }
        Ok(out)
    }

    async fn create_collection(&self, path: &str) -> Result<()> {
        let mut state = self
            .begin(StoreOp::CreateCollection(path.to_string()))
            .await?;
        let key = normalize_path(path);
        if state.resources.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                path: path.to_string(),
            });
        }
        require_parent_collection(&state, &key)?;
        state.resources.insert(key, Resource::collection());
        Ok(())
    }

    async fn move_resource(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self
            .begin(StoreOp::Move {
                from: from.to_string(),
                to: to.to_string(),
            })
            .await?;
        let src = normalize_path(from);
        let dst = normalize_path(to);
        if src == "/" || !state.resources.contains_key(&src) {
            return Err(StoreError::not_found(from));
        }
        if src == dst {
            return Ok(());
        }
        if is_below(&dst, &src) {
            return Err(StoreError::conflict(to, "destination is inside the source"));
        }
        require_parent_collection(&state, &dst)?;

        let doomed: Vec<String> = state
            .resources
            .keys()
            .filter(|k| **k == dst || is_below(k, &dst))
            .cloned()
            .collect();
        for key in doomed {
            state.resources.remove(&key);
        }
        let moving: Vec<String> = state
            .resources
            .keys()
            .filter(|k| **k == src || is_below(k, &src))
            .cloned()
            .collect();
        for key in moving {
            if let Some(res) = state.resources.remove(&key) {
                let renamed = format!("{}{}", dst, &key[src.len()..]);
                state.resources.insert(renamed, res);
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.begin(StoreOp::Delete(path.to_string())).await?;
        let key = normalize_path(path);
        if key == "/" {
            return Err(StoreError::PermissionDenied {
                path: path.to_string(),
            });
        }
        if !state.resources.contains_key(&key) {
            return Err(StoreError::not_found(path));
        }
        state
            .resources
            .retain(|k, _| *k != key && !is_below(k, &key));
        Ok(())
    }

    async fn write_whole(&self, path: &str, data: &[u8]) -> Result<bool> {
        let mut state = self
            .begin(StoreOp::WriteWhole {
                path: path.to_string(),
                len: data.len(),
            })
            .await?;
        let key = normalize_path(path);
        let (body, created) = file_for_write(&mut state, &key)?;
        body.clear();
        body.extend_from_slice(data);
        Ok(created)
    }

    async fn write_range(&self, path: &str, data: &[u8], offset: u64) -> Result<bool> {
        let mut state = self
            .begin(StoreOp::WriteRange {
                path: path.to_string(),
                offset,
                len: data.len(),
            })
            .await?;
        let key = normalize_path(path);
        let (body, created) = file_for_write(&mut state, &key)?;
        let start = offset as usize;
        let end = start + data.len();
        if body.len() < end {
            body.resize(end, 0);
        }
        body[start..end].copy_from_slice(data);
        Ok(created)
    }

    async fn read_range(&self, path: &str, offset: u64, len: u32) -> Result<Bytes> {
        let state = self
            .begin(StoreOp::ReadRange {
                path: path.to_string(),
                offset,
                len,
            })
            .await?;
        let key = normalize_path(path);
        match state.resources.get(&key) {
            Some(Resource {
                body: Body::Data(data),
                ..
            }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len as usize).min(data.len());
                Ok(Bytes::copy_from_slice(&data[start..end]))
            }
            Some(_) => Err(StoreError::conflict(path, "cannot read a collection")),
            None => Err(StoreError::not_found(path)),
        }
    }
}
