//! Shared fixtures for the filesystem integration tests.

#![allow(dead_code)]

use davfs_client::MemStore;
use davfs_fuse::{DavFs, FsConfig, FsError, Node};
use std::sync::Arc;
use std::time::Duration;

/// A filesystem core wired to an in-memory remote store.
pub struct Harness {
    pub store: Arc<MemStore>,
    pub fs: Arc<DavFs>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemStore::new())
    }

    /// Every remote call sleeps for `latency` first, widening race windows.
    pub fn with_latency(latency: Duration) -> Self {
        Self::with_store(MemStore::new().with_latency(latency))
    }

    pub fn with_store(store: MemStore) -> Self {
        let store = Arc::new(store);
        let fs = Arc::new(DavFs::new(store.clone(), FsConfig::default()));
        Self { store, fs }
    }

    pub fn root(&self) -> Arc<Node> {
        self.fs.root()
    }

    /// Look up every segment of `path` starting at the root.
    pub async fn resolve(&self, path: &str) -> Result<Arc<Node>, FsError> {
        let mut node = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = self.fs.lookup(&node, segment).await?;
        }
        Ok(node)
    }

    pub async fn mkdir_p(&self, path: &str) -> Arc<Node> {
        let mut node = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = match self.fs.lookup(&node, segment).await {
                Ok(existing) => existing,
                Err(_) => self.fs.mkdir(&node, segment).await.unwrap(),
            };
        }
        node
    }

    pub fn path_of(&self, node: &Node) -> String {
        self.fs.path_of(node).unwrap()
    }
}

/// Names present in `dir`'s children map, checking that every entry is
/// keyed by its own name and is live.
pub fn checked_children(dir: &Node) -> Vec<String> {
    let names = dir.child_names();
    for name in &names {
        let child = dir.child(name).unwrap();
        assert_eq!(&child.name(), name, "child keyed under a foreign name");
        assert!(!child.is_deleted(), "tombstoned node {} still linked", name);
    }
    names
}
