#![warn(missing_docs)]

//! davfs filesystem core and FUSE daemon.
//!
//! Mirrors a remote WebDAV tree as an in-memory node tree and serves it to
//! the kernel. The core (`node`, `path`, `locking`, `operations`) only
//! talks to the abstract [`davfs_client::RemoteStore`]; `filesystem` and
//! `mount` adapt it to FUSE.

pub mod attr;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod locking;
pub mod mount;
pub mod node;
pub mod operations;
pub mod path;

pub use attr::Attr;
pub use config::{DaemonConfig, FsConfig};
pub use error::{FsError, Result};
pub use filesystem::DavFuse;
pub use locking::{rename_lock_set, LockSet, RefKind};
pub use mount::{MountConfig, MountOptions};
pub use node::{Node, NodeKind, ROOT_ID};
pub use operations::{DavFs, DirEntry, OpenFlags, OpenReply, SetAttrRequest};
