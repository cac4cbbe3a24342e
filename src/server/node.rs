//! The file tree abstraction served to clients.
//!
//! Implement [`Node`] to expose anything as a file: the defaults reject
//! every mutation, so a read-only synthetic file only has to provide
//! `qid`, `stat` and `read`. Directories additionally answer `lookup` and
//! `list`; the session layer walks, reads directories and checks the
//! permission bits, so nodes only implement behavior.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::proto::{OpenMode, Qid, Stat};

fn denied<T>() -> Result<T> {
    Err(Error::Remote("permission denied".to_string()))
}

/// One file or directory in a served tree.
#[async_trait]
pub trait Node: Send + Sync {
    /// Stable identity. The path must be unique within the tree and the
    /// version should change when the content does.
    fn qid(&self) -> Qid;

    /// Current metadata. `stat().qid` must agree with [`Node::qid`].
    fn stat(&self) -> Stat;

    /// Child by name. Only meaningful for directories.
    fn lookup(&self, _name: &str) -> Option<Arc<dyn Node>> {
        None
    }

    /// Children in listing order. Only meaningful for directories.
    fn list(&self) -> Vec<Arc<dyn Node>> {
        Vec::new()
    }

    /// Called when a client opens this file, after the permission checks.
    /// Nodes that need per-open state can claim it here.
    async fn open(&self, _mode: OpenMode) -> Result<()> {
        Ok(())
    }

    /// Read `count` bytes at `offset`. Reads past the end return empty
    /// data, short reads are fine.
    async fn read(&self, _offset: u64, _count: u32) -> Result<Bytes> {
        denied()
    }

    /// Write at `offset`, returning the bytes accepted. Append-only files
    /// may ignore the offset.
    async fn write(&self, _offset: u64, _data: Bytes) -> Result<u32> {
        denied()
    }

    /// Cut or extend to `length` bytes.
    async fn truncate(&self, _length: u64) -> Result<()> {
        denied()
    }

    /// Create a child and return it. Directories that allow creation
    /// override this.
    async fn create(&self, _name: &str, _perm: u32, _mode: OpenMode) -> Result<Arc<dyn Node>> {
        Err(Error::Remote("not a directory".to_string()))
    }

    /// Remove the named child.
    async fn remove_child(&self, _name: &str) -> Result<()> {
        denied()
    }

    /// Rename the child `from` to `to`.
    async fn rename_child(&self, _from: &str, _to: &str) -> Result<()> {
        denied()
    }

    /// Notification that a parent directory renamed this node; adjust the
    /// name reported by [`Node::stat`].
    fn renamed(&self, _new_name: &str) {}

    /// Apply a metadata change. Fields that are `None` stay untouched.
    async fn wstat_meta(&self, _mode: Option<u32>, _mtime: Option<u32>) -> Result<()> {
        Err(Error::Remote("wstat not supported".to_string()))
    }
}
