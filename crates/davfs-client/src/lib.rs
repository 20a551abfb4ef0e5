#![warn(missing_docs)]

//! davfs remote store client.
//!
//! Defines the [`RemoteStore`] interface the filesystem core consumes and
//! ships two implementations: [`DavClient`] for WebDAV servers and
//! [`MemStore`] for tests and local development.

pub mod config;
pub mod dav;
pub mod error;
pub mod memory;
pub mod multistatus;
pub mod store;

pub use config::DavConfig;
pub use dav::DavClient;
pub use error::{Result, StoreError};
pub use memory::{MemStore, StoreOp, StoreOpKind};
pub use store::{Depth, Metadata, RemoteStore, COLLECTION};
