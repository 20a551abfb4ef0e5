//! Remote path derivation.
//!
//! A node's path is rebuilt on demand by walking parent links, taking each
//! node's lock only long enough to read its name. A derived path is a
//! snapshot: once any lock is released a concurrent rename may invalidate
//! it, so callers that cross a remote round trip re-derive it afterwards.

use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::node::Node;

/// Join a directory path and a child name with exactly one separator.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if name.is_empty() {
        if dir.is_empty() {
            return "/".to_string();
        }
        return dir.to_string();
    }
    format!("{}/{}", dir, name)
}

/// Collection form of a path: a trailing separator, except for the root.
pub fn collection_path(path: &str) -> String {
    if path.ends_with('/') {
        return path.to_string();
    }
    format!("{}/", path)
}

/// True when `ancestor` equals `path` or is one of its ancestors, compared
/// component-wise so `/a/b` is not treated as an ancestor of `/a/bc`.
pub fn is_same_or_ancestor(ancestor: &str, path: &str) -> bool {
    let ancestor = ancestor.trim_end_matches('/');
    let path = path.trim_end_matches('/');
    if ancestor.is_empty() || ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Derive the absolute remote path of `node`.
///
/// Fails with a stale fault when the walk reaches a non-root node whose
/// parent is gone, or exceeds `max_depth` links.
pub fn node_path(node: &Node, max_depth: usize) -> Result<String> {
    let (mut name, mut parent): (String, Option<Arc<Node>>) = node.name_and_parent();
    let mut segments: Vec<String> = Vec::new();

    for _ in 0..=max_depth {
        match parent {
            None if name.is_empty() => {
                if segments.is_empty() {
                    return Ok("/".to_string());
                }
                segments.reverse();
                return Ok(segments.iter().fold(String::new(), |mut acc, s| {
                    acc.push('/');
                    acc.push_str(s);
                    acc
                }));
            }
            None => return Err(FsError::stale(&name)),
            Some(up) => {
                segments.push(name);
                (name, parent) = up.name_and_parent();
            }
        }
    }
    Err(FsError::stale(&node.name()))
}
