//! In-memory file tree: the batteries-included [`Node`] implementation.
//!
//! `MemDir` holds children behind a mutex in name order; `MemFile` keeps
//! its content in a `RwLock<Vec<u8>>` and bumps its qid version on every
//! mutation. Custom nodes mix in through [`MemDir::mount`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::proto::{OpenMode, Qid, QidType, Stat, DMAPPEND, DMDIR, DMEXCL};

use super::node::Node;

/// Owner reported for files created without any account information.
const DEFAULT_OWNER: &str = "styx";

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn bad_name<T>() -> Result<T> {
    Err(Error::Remote("file name syntax".to_string()))
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return bad_name();
    }
    Ok(())
}

/// Mints unique qid paths for one tree.
pub struct QidAllocator {
    next: AtomicU64,
}

impl QidAllocator {
    pub fn new() -> QidAllocator {
        QidAllocator {
            next: AtomicU64::new(0),
        }
    }

    pub fn next_path(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for QidAllocator {
    fn default() -> Self {
        QidAllocator::new()
    }
}

#[derive(Debug)]
struct NodeMeta {
    name: String,
    mode: u32,
    atime: u32,
    mtime: u32,
    uid: String,
    gid: String,
}

impl NodeMeta {
    fn new(name: &str, mode: u32) -> NodeMeta {
        let now = unix_now();
        NodeMeta {
            name: name.to_string(),
            mode,
            atime: now,
            mtime: now,
            uid: DEFAULT_OWNER.to_string(),
            gid: DEFAULT_OWNER.to_string(),
        }
    }

    fn stat(&self, qid: Qid, length: u64) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid,
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length,
            name: self.name.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            muid: self.uid.clone(),
        }
    }

    fn apply(&mut self, mode: Option<u32>, mtime: Option<u32>, keep_bits: u32) {
        if let Some(mode) = mode {
            self.mode = (self.mode & keep_bits) | (mode & !keep_bits);
        }
        if let Some(mtime) = mtime {
            self.mtime = mtime;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Files
// =============================================================================

/// A plain file held in memory.
pub struct MemFile {
    qid: Mutex<Qid>,
    meta: Mutex<NodeMeta>,
    content: RwLock<Vec<u8>>,
}

impl MemFile {
    /// A standalone file; `path` must be unique in the tree, usually from
    /// the tree's [`QidAllocator`].
    pub fn new(path: u64, name: &str, perm: u32, content: impl Into<Vec<u8>>) -> Arc<MemFile> {
        Arc::new(MemFile {
            qid: Mutex::new(Qid {
                typ: QidType::FILE,
                version: 0,
                path,
            }),
            meta: Mutex::new(NodeMeta::new(name, perm & (DMAPPEND | DMEXCL | 0o777))),
            content: RwLock::new(content.into()),
        })
    }

    fn touch(&self) {
        let mut qid = lock(&self.qid);
        qid.version = qid.version.wrapping_add(1);
        lock(&self.meta).mtime = unix_now();
    }

    fn read_content(&self) -> std::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.content.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_content(&self) -> std::sync::RwLockWriteGuard<'_, Vec<u8>> {
        self.content.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Node for MemFile {
    fn qid(&self) -> Qid {
        *lock(&self.qid)
    }

    fn stat(&self) -> Stat {
        let length = self.read_content().len() as u64;
        lock(&self.meta).stat(self.qid(), length)
    }

    async fn read(&self, offset: u64, count: u32) -> Result<Bytes> {
        let content = self.read_content();
        let len = content.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }
        let end = len.min(offset + count as u64) as usize;
        Ok(Bytes::copy_from_slice(&content[offset as usize..end]))
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<u32> {
        let at = if lock(&self.meta).mode & DMAPPEND != 0 {
            self.read_content().len()
        } else {
            usize::try_from(offset)
                .map_err(|_| Error::Remote("write offset out of range".to_string()))?
        };
        {
            let mut content = self.write_content();
            let end = at + data.len();
            if end > content.len() {
                content.resize(end, 0);
            }
            content[at..end].copy_from_slice(&data);
        }
        self.touch();
        Ok(data.len() as u32)
    }

    async fn truncate(&self, length: u64) -> Result<()> {
        let length = usize::try_from(length)
            .map_err(|_| Error::Remote("length out of range".to_string()))?;
        self.write_content().resize(length, 0);
        self.touch();
        Ok(())
    }

    fn renamed(&self, new_name: &str) {
        lock(&self.meta).name = new_name.to_string();
    }

    async fn wstat_meta(&self, mode: Option<u32>, mtime: Option<u32>) -> Result<()> {
        lock(&self.meta).apply(mode, mtime, DMDIR);
        Ok(())
    }
}

// =============================================================================
// Directories
// =============================================================================

/// A directory held in memory, children sorted by name.
pub struct MemDir {
    qid: Qid,
    meta: Mutex<NodeMeta>,
    children: Mutex<BTreeMap<String, Arc<dyn Node>>>,
    alloc: Arc<QidAllocator>,
}

impl MemDir {
    /// A fresh tree root with its own qid allocator.
    pub fn root() -> Arc<MemDir> {
        let alloc = Arc::new(QidAllocator::new());
        Arc::new(MemDir::raw(alloc, "/", DMDIR | 0o755))
    }

    fn raw(alloc: Arc<QidAllocator>, name: &str, mode: u32) -> MemDir {
        MemDir {
            qid: Qid {
                typ: QidType::DIR,
                version: 0,
                path: alloc.next_path(),
            },
            meta: Mutex::new(NodeMeta::new(name, DMDIR | (mode & 0o777))),
            children: Mutex::new(BTreeMap::new()),
            alloc,
        }
    }

    /// The allocator shared by this tree, for minting qid paths of custom
    /// nodes before [`MemDir::mount`].
    pub fn allocator(&self) -> Arc<QidAllocator> {
        self.alloc.clone()
    }

    /// Add a subdirectory while building a tree.
    pub fn mkdir(&self, name: &str) -> Result<Arc<MemDir>> {
        let dir = Arc::new(MemDir::raw(self.alloc.clone(), name, DMDIR | 0o755));
        self.insert(name, dir.clone())?;
        Ok(dir)
    }

    /// Add a plain file while building a tree.
    pub fn put_file(&self, name: &str, content: impl Into<Vec<u8>>) -> Result<Arc<MemFile>> {
        let file = MemFile::new(self.alloc.next_path(), name, 0o644, content);
        self.insert(name, file.clone())?;
        Ok(file)
    }

    /// Mount any node implementation as a child.
    pub fn mount(&self, name: &str, node: Arc<dyn Node>) -> Result<()> {
        self.insert(name, node)
    }

    fn insert(&self, name: &str, node: Arc<dyn Node>) -> Result<()> {
        check_name(name)?;
        let mut children = lock(&self.children);
        if children.contains_key(name) {
            return Err(Error::Remote("file already exists".to_string()));
        }
        children.insert(name.to_string(), node);
        lock(&self.meta).mtime = unix_now();
        Ok(())
    }
}

#[async_trait]
impl Node for MemDir {
    fn qid(&self) -> Qid {
        self.qid
    }

    fn stat(&self) -> Stat {
        lock(&self.meta).stat(self.qid, 0)
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn Node>> {
        lock(&self.children).get(name).cloned()
    }

    fn list(&self) -> Vec<Arc<dyn Node>> {
        lock(&self.children).values().cloned().collect()
    }

    async fn create(&self, name: &str, perm: u32, _mode: OpenMode) -> Result<Arc<dyn Node>> {
        let node: Arc<dyn Node> = if perm & DMDIR != 0 {
            Arc::new(MemDir::raw(self.alloc.clone(), name, perm))
        } else {
            MemFile::new(self.alloc.next_path(), name, perm, Vec::new())
        };
        self.insert(name, node.clone())?;
        Ok(node)
    }

    async fn remove_child(&self, name: &str) -> Result<()> {
        let mut children = lock(&self.children);
        let Some(child) = children.get(name) else {
            return Err(Error::Remote("file does not exist".to_string()));
        };
        if child.qid().is_dir() && !child.list().is_empty() {
            return Err(Error::Remote("directory not empty".to_string()));
        }
        children.remove(name);
        lock(&self.meta).mtime = unix_now();
        Ok(())
    }

    async fn rename_child(&self, from: &str, to: &str) -> Result<()> {
        check_name(to)?;
        let mut children = lock(&self.children);
        if children.contains_key(to) {
            return Err(Error::Remote("file already exists".to_string()));
        }
        let Some(child) = children.remove(from) else {
            return Err(Error::Remote("file does not exist".to_string()));
        };
        child.renamed(to);
        children.insert(to.to_string(), child);
        lock(&self.meta).mtime = unix_now();
        Ok(())
    }

    fn renamed(&self, new_name: &str) {
        lock(&self.meta).name = new_name.to_string();
    }

    async fn wstat_meta(&self, mode: Option<u32>, mtime: Option<u32>) -> Result<()> {
        lock(&self.meta).apply(mode, mtime, DMDIR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_building_and_lookup() {
        let root = MemDir::root();
        let usr = root.mkdir("usr").unwrap();
        usr.put_file("fortune", "so it goes").unwrap();

        assert!(root.qid().is_dir());
        let found = root.lookup("usr").expect("usr exists");
        assert!(found.qid().is_dir());
        assert!(found.lookup("fortune").is_some());
        assert!(root.lookup("fortune").is_none());

        // Duplicate names are refused.
        assert!(root.mkdir("usr").is_err());
        // Qid paths are distinct across the tree.
        assert_ne!(root.qid().path, usr.qid().path);
    }

    #[test]
    fn test_listing_is_name_ordered() {
        let root = MemDir::root();
        root.put_file("zeta", "").unwrap();
        root.put_file("alpha", "").unwrap();
        root.put_file("mid", "").unwrap();
        let names: Vec<String> = root.list().iter().map(|n| n.stat().name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_file_reads_clamp_to_content() {
        let file = MemFile::new(9, "notes", 0o644, "0123456789");
        assert_eq!(file.read(3, 4).await.unwrap(), Bytes::from_static(b"3456"));
        assert_eq!(file.read(8, 100).await.unwrap(), Bytes::from_static(b"89"));
        assert!(file.read(10, 4).await.unwrap().is_empty());
        assert!(file.read(50, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_past_end_zero_fills_and_bumps_version() {
        let file = MemFile::new(9, "notes", 0o644, "ab");
        let v0 = file.qid().version;
        file.write(4, Bytes::from_static(b"cd")).await.unwrap();
        assert_eq!(file.read(0, 16).await.unwrap(), Bytes::from_static(b"ab\0\0cd"));
        assert!(file.qid().version > v0);
        assert_eq!(file.stat().length, 6);
    }

    #[tokio::test]
    async fn test_append_mode_ignores_offset() {
        let file = MemFile::new(9, "log", DMAPPEND | 0o644, "one");
        file.write(0, Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(file.read(0, 16).await.unwrap(), Bytes::from_static(b"onetwo"));
    }

    #[tokio::test]
    async fn test_truncate_cuts_and_extends() {
        let file = MemFile::new(9, "notes", 0o644, "0123456789");
        file.truncate(4).await.unwrap();
        assert_eq!(file.stat().length, 4);
        file.truncate(6).await.unwrap();
        assert_eq!(file.read(0, 16).await.unwrap(), Bytes::from_static(b"0123\0\0"));
    }

    #[tokio::test]
    async fn test_create_respects_dmdir() {
        let root = MemDir::root();
        let dir = root
            .create("work", DMDIR | 0o700, OpenMode::READ)
            .await
            .unwrap();
        assert!(dir.qid().is_dir());
        assert_eq!(dir.stat().mode & 0o777, 0o700);

        let file = root.create("todo", 0o600, OpenMode::WRITE).await.unwrap();
        assert!(!file.qid().is_dir());
        assert!(root.create("todo", 0o600, OpenMode::WRITE).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_refuses_populated_directories() {
        let root = MemDir::root();
        let work = root.mkdir("work").unwrap();
        work.put_file("wip", "x").unwrap();

        let err = root.remove_child("work").await.unwrap_err();
        assert!(err.to_string().contains("not empty"));
        work.remove_child("wip").await.unwrap();
        root.remove_child("work").await.unwrap();
        assert!(root.lookup("work").is_none());
    }

    #[tokio::test]
    async fn test_rename_rekeys_and_renames() {
        let root = MemDir::root();
        root.put_file("old", "data").unwrap();
        root.rename_child("old", "new").await.unwrap();
        assert!(root.lookup("old").is_none());
        let node = root.lookup("new").expect("renamed child");
        assert_eq!(node.stat().name, "new");

        root.put_file("other", "").unwrap();
        assert!(root.rename_child("new", "other").await.is_err());
        assert!(root.rename_child("ghost", "x").await.is_err());
        assert!(root.rename_child("new", "a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_wstat_meta_keeps_directory_bit() {
        let root = MemDir::root();
        root.wstat_meta(Some(0o700), None).await.unwrap();
        let mode = root.stat().mode;
        assert_ne!(mode & DMDIR, 0);
        assert_eq!(mode & 0o777, 0o700);
    }
}
