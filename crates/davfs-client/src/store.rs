//! Remote store interface.
//!
//! The filesystem core talks to the backing document server only through
//! [`RemoteStore`]. Paths are absolute, `/`-separated and unencoded. A path
//! naming a collection may carry a trailing separator; implementations must
//! accept both forms.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;

use crate::error::Result;

/// Resource type marker reported for collections.
pub const COLLECTION: &str = "collection";

/// Listing depth, mirroring the WebDAV `Depth` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Depth {
    /// Only the resource itself.
    Zero,
    /// The resource and its direct members.
    One,
}

impl Depth {
    pub fn as_header(&self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// Metadata for one remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Last path segment; empty for the store root.
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Raw resource type marker, [`COLLECTION`] for collections.
    pub resource_type: String,
}

impl Metadata {
    pub fn file(name: &str, size: u64, mtime: SystemTime, ctime: SystemTime) -> Self {
        Self {
            name: name.to_string(),
            is_dir: false,
            size,
            mtime,
            ctime,
            resource_type: String::new(),
        }
    }

    pub fn collection(name: &str, mtime: SystemTime, ctime: SystemTime) -> Self {
        Self {
            name: name.to_string(),
            is_dir: true,
            size: 0,
            mtime,
            ctime,
            resource_type: COLLECTION.to_string(),
        }
    }

    /// True when the resource type marker names a collection.
    pub fn is_collection(&self) -> bool {
        self.resource_type == COLLECTION
    }
}

/// Operations the filesystem core consumes from the backing store.
///
/// Implementations own retry policy, redirects and authentication. Every
/// failure is returned as a typed [`crate::StoreError`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch metadata for a single resource.
    async fn stat(&self, path: &str) -> Result<Metadata>;

    /// List a resource. The first element is always the resource itself,
    /// followed by its members when `depth` is [`Depth::One`].
    async fn list(&self, path: &str, depth: Depth) -> Result<Vec<Metadata>>;

    /// Create a collection. `path` carries a trailing separator.
    async fn create_collection(&self, path: &str) -> Result<()>;

    /// Move a resource, replacing any existing destination.
    async fn move_resource(&self, from: &str, to: &str) -> Result<()>;

    /// Delete a resource and, for collections, everything below it.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Replace the whole body. Returns true when the resource was created.
    async fn write_whole(&self, path: &str, data: &[u8]) -> Result<bool>;

    /// Write `data` at `offset`, creating or extending the resource as
    /// needed. An empty `data` creates a missing resource and otherwise
    /// extends it to at least `offset` bytes. Returns true when created.
    async fn write_range(&self, path: &str, data: &[u8], offset: u64) -> Result<bool>;

    /// Read up to `len` bytes at `offset`. Short reads signal end of file.
    async fn read_range(&self, path: &str, offset: u64, len: u32) -> Result<Bytes>;
}

/// Strips a trailing separator and guarantees a leading one.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Last segment of a normalized path.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Parent of a normalized path; the root is its own parent.
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}
