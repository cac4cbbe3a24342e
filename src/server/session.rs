//! Per-connection protocol state.
//!
//! A [`Session`] owns the fid table for one client and turns each request
//! into a reply. Failures surface as `Rerror`, so the connection loop never
//! tears down over a bad request; only transport errors end a session.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proto::{
    OpenMode, Rmsg, Stat, Tmsg, DMDIR, IOHDRSZ, MAXWELEM, MIN_MSIZE, NOFID, NOTAG, VERSION,
};

use super::node::Node;

fn deny<T>(msg: &str) -> Result<T> {
    Err(Error::Remote(msg.to_string()))
}

/// Directory reads hand out whole stat records in list order. The cursor
/// pins the snapshot taken at offset zero so a listing stays consistent
/// even while the tree changes underneath it.
struct DirCursor {
    records: Vec<bytes::Bytes>,
    index: usize,
    offset: u64,
}

struct OpenFid {
    mode: OpenMode,
    dir: Option<DirCursor>,
}

struct FidEntry {
    node: Arc<dyn Node>,
    /// Ancestors, nearest last. Empty at the attach root; ".." walks pop.
    parents: Vec<Arc<dyn Node>>,
    open: Option<OpenFid>,
}

impl FidEntry {
    fn root(node: Arc<dyn Node>) -> FidEntry {
        FidEntry {
            node,
            parents: Vec::new(),
            open: None,
        }
    }
}

/// Protocol state for one client connection.
pub(crate) struct Session {
    root: Arc<dyn Node>,
    msize_limit: u32,
    msize: u32,
    negotiated: bool,
    fids: HashMap<u32, FidEntry>,
}

impl Session {
    pub(crate) fn new(root: Arc<dyn Node>, msize_limit: u32) -> Session {
        Session {
            root,
            msize_limit,
            msize: msize_limit,
            negotiated: false,
            fids: HashMap::new(),
        }
    }

    /// Largest read payload the negotiated msize can carry.
    fn iosize(&self) -> u32 {
        self.msize.saturating_sub(IOHDRSZ)
    }

    /// Current frame-size bound: the configured limit until negotiation,
    /// the agreed msize after.
    pub(crate) fn msize(&self) -> u32 {
        self.msize
    }

    /// Handle one request, mapping failures onto `Rerror`.
    pub(crate) async fn dispatch(&mut self, tag: u16, msg: Tmsg) -> Rmsg {
        match self.handle(tag, msg).await {
            Ok(reply) => reply,
            Err(Error::Remote(ename)) => Rmsg::Error { ename },
            Err(other) => Rmsg::Error {
                ename: other.to_string(),
            },
        }
    }

    async fn handle(&mut self, tag: u16, msg: Tmsg) -> Result<Rmsg> {
        match msg {
            Tmsg::Version { msize, version } => self.version(tag, msize, &version),
            _ if !self.negotiated => deny("version not negotiated"),
            Tmsg::Auth { .. } => deny("authentication not required"),
            // Requests are served one at a time, so by the time a flush
            // arrives the flushed request has already been answered.
            Tmsg::Flush { .. } => Ok(Rmsg::Flush),
            Tmsg::Attach {
                fid, afid, uname, ..
            } => self.attach(fid, afid, &uname),
            Tmsg::Walk { fid, newfid, wnames } => self.walk(fid, newfid, &wnames),
            Tmsg::Open { fid, mode } => self.open(fid, mode).await,
            Tmsg::Create {
                fid,
                name,
                perm,
                mode,
            } => self.create(fid, &name, perm, mode).await,
            Tmsg::Read { fid, offset, count } => self.read(fid, offset, count).await,
            Tmsg::Write { fid, offset, data } => self.write(fid, offset, data).await,
            Tmsg::Clunk { fid } => self.clunk(fid).await,
            Tmsg::Remove { fid } => self.remove(fid).await,
            Tmsg::Stat { fid } => self.stat(fid),
            Tmsg::Wstat { fid, stat } => self.wstat(fid, stat).await,
        }
    }

    // ===== Session setup =====

    fn version(&mut self, tag: u16, msize: u32, version: &str) -> Result<Rmsg> {
        if tag != NOTAG {
            return deny("version requires NOTAG");
        }
        // Version aborts everything in progress and invalidates all fids.
        self.fids.clear();
        self.negotiated = false;
        if msize < MIN_MSIZE {
            return deny("msize too small");
        }
        let msize = msize.min(self.msize_limit);
        if version != VERSION && !version.starts_with("9P2000.") {
            return Ok(Rmsg::Version {
                msize,
                version: "unknown".to_string(),
            });
        }
        self.msize = msize;
        self.negotiated = true;
        debug!(msize, "version negotiated");
        Ok(Rmsg::Version {
            msize,
            version: VERSION.to_string(),
        })
    }

    fn attach(&mut self, fid: u32, afid: u32, uname: &str) -> Result<Rmsg> {
        if afid != NOFID {
            return deny("authentication not required");
        }
        if fid == NOFID {
            return deny("bad fid");
        }
        if self.fids.contains_key(&fid) {
            return deny("fid already in use");
        }
        let qid = self.root.qid();
        self.fids.insert(fid, FidEntry::root(self.root.clone()));
        debug!(fid, uname, "attached");
        Ok(Rmsg::Attach { qid })
    }

    // ===== Navigation =====

    fn walk(&mut self, fid: u32, newfid: u32, wnames: &[String]) -> Result<Rmsg> {
        if wnames.len() > MAXWELEM {
            return deny("too many walk elements");
        }
        if newfid == NOFID {
            return deny("bad fid");
        }
        let (mut node, mut parents) = {
            let entry = self.entry(fid)?;
            if entry.open.is_some() {
                return deny("cannot walk an open fid");
            }
            (entry.node.clone(), entry.parents.clone())
        };
        if newfid != fid && self.fids.contains_key(&newfid) {
            return deny("newfid already in use");
        }

        let mut wqids = Vec::with_capacity(wnames.len());
        let mut failed = None;
        for name in wnames {
            if name == ".." {
                // The root is its own parent.
                let parent = parents.pop().unwrap_or_else(|| node.clone());
                wqids.push(parent.qid());
                node = parent;
                continue;
            }
            if !node.qid().is_dir() {
                failed = Some("not a directory".to_string());
                break;
            }
            match node.lookup(name) {
                Some(child) => {
                    parents.push(node);
                    wqids.push(child.qid());
                    node = child;
                }
                None => {
                    failed = Some(format!("{name}: no such file or directory"));
                    break;
                }
            }
        }
        if let Some(ename) = failed {
            if wqids.is_empty() {
                return Err(Error::Remote(ename));
            }
            // Partial walk: report how far we got, newfid stays unbound.
            return Ok(Rmsg::Walk { wqids });
        }
        self.fids.insert(
            newfid,
            FidEntry {
                node,
                parents,
                open: None,
            },
        );
        Ok(Rmsg::Walk { wqids })
    }

    // ===== Opening =====

    // With authentication out of the picture the attached client acts as
    // the owner of the whole tree, so the owner bits decide.
    fn check_perm(stat: &Stat, mode: OpenMode) -> Result<()> {
        let bits = (stat.mode >> 6) & 0o7;
        if mode.wants_read() && bits & 0o4 == 0 {
            return deny("permission denied");
        }
        if mode.wants_write() && bits & 0o2 == 0 {
            return deny("permission denied");
        }
        if mode.wants_exec() && bits & 0o1 == 0 {
            return deny("permission denied");
        }
        Ok(())
    }

    async fn open(&mut self, fid: u32, mode: OpenMode) -> Result<Rmsg> {
        let node = {
            let entry = self.entry(fid)?;
            if entry.open.is_some() {
                return deny("fid already open");
            }
            entry.node.clone()
        };
        if node.qid().is_dir() && mode.wants_write() {
            return deny("is a directory");
        }
        Self::check_perm(&node.stat(), mode)?;
        node.open(mode).await?;
        if mode.is_truncate() {
            node.truncate(0).await?;
        }
        let entry = self.entry_mut(fid)?;
        entry.open = Some(OpenFid { mode, dir: None });
        // Truncation may have bumped the version, so re-read the qid.
        Ok(Rmsg::Open {
            qid: node.qid(),
            iounit: 0,
        })
    }

    async fn create(&mut self, fid: u32, name: &str, perm: u32, mode: OpenMode) -> Result<Rmsg> {
        let parent = {
            let entry = self.entry(fid)?;
            if entry.open.is_some() {
                return deny("fid already open");
            }
            entry.node.clone()
        };
        if !parent.qid().is_dir() {
            return deny("not a directory");
        }
        if (parent.stat().mode >> 6) & 0o2 == 0 {
            return deny("permission denied");
        }
        if perm & DMDIR != 0 && mode.wants_write() {
            return deny("is a directory");
        }
        let child = parent.create(name, perm, mode).await?;
        child.open(mode).await?;
        if mode.is_truncate() {
            child.truncate(0).await?;
        }
        let qid = child.qid();
        let entry = self.entry_mut(fid)?;
        entry.parents.push(parent);
        entry.node = child;
        entry.open = Some(OpenFid { mode, dir: None });
        Ok(Rmsg::Create { qid, iounit: 0 })
    }

    // ===== I/O =====

    async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Rmsg> {
        let count = count.min(self.iosize());
        let node = {
            let entry = self.entry(fid)?;
            let Some(open) = &entry.open else {
                return deny("fid not open");
            };
            if !open.mode.wants_read() {
                return deny("fid not open for reading");
            }
            entry.node.clone()
        };
        if node.qid().is_dir() {
            return self.read_dir(fid, &node, offset, count);
        }
        let mut data = node.read(offset, count).await?;
        if data.len() > count as usize {
            warn!(
                got = data.len(),
                count, "node returned more than requested, clamping"
            );
            data = data.slice(..count as usize);
        }
        Ok(Rmsg::Read { data })
    }

    fn read_dir(
        &mut self,
        fid: u32,
        node: &Arc<dyn Node>,
        offset: u64,
        count: u32,
    ) -> Result<Rmsg> {
        let entry = self.entry_mut(fid)?;
        let Some(open) = entry.open.as_mut() else {
            return deny("fid not open");
        };
        if offset == 0 {
            let records = node.list().iter().map(|c| c.stat().encode()).collect();
            open.dir = Some(DirCursor {
                records,
                index: 0,
                offset: 0,
            });
        }
        let Some(cursor) = open.dir.as_mut() else {
            return deny("directory read must start at offset 0");
        };
        if offset != cursor.offset {
            return deny("bad offset in directory read");
        }
        let mut data = BytesMut::new();
        while cursor.index < cursor.records.len() {
            let record = &cursor.records[cursor.index];
            if data.len() + record.len() > count as usize {
                break;
            }
            data.extend_from_slice(record);
            cursor.index += 1;
        }
        if data.is_empty() && cursor.index < cursor.records.len() {
            return deny("count too small for directory entry");
        }
        cursor.offset += data.len() as u64;
        Ok(Rmsg::Read { data: data.freeze() })
    }

    async fn write(&mut self, fid: u32, offset: u64, data: bytes::Bytes) -> Result<Rmsg> {
        let node = {
            let entry = self.entry(fid)?;
            let Some(open) = &entry.open else {
                return deny("fid not open");
            };
            // Truncate alone grants no write access after the open.
            let access = open.mode.access();
            if access != OpenMode::WRITE.bits() && access != OpenMode::RDWR.bits() {
                return deny("fid not open for writing");
            }
            entry.node.clone()
        };
        let count = node.write(offset, data).await?;
        Ok(Rmsg::Write { count })
    }

    // ===== Retirement =====

    async fn clunk(&mut self, fid: u32) -> Result<Rmsg> {
        let Some(entry) = self.fids.remove(&fid) else {
            return deny("unknown fid");
        };
        if entry
            .open
            .as_ref()
            .is_some_and(|o| o.mode.is_remove_on_close())
        {
            let name = entry.node.stat().name;
            match entry.parents.last() {
                Some(parent) => {
                    if let Err(e) = parent.remove_child(&name).await {
                        warn!(name, error = %e, "remove on close failed");
                    }
                }
                None => warn!(name, "remove on close ignored for the root"),
            }
        }
        Ok(Rmsg::Clunk)
    }

    async fn remove(&mut self, fid: u32) -> Result<Rmsg> {
        // The fid is retired even when the removal itself fails.
        let Some(entry) = self.fids.remove(&fid) else {
            return deny("unknown fid");
        };
        let Some(parent) = entry.parents.last() else {
            return deny("cannot remove the root");
        };
        let name = entry.node.stat().name;
        parent.remove_child(&name).await?;
        Ok(Rmsg::Remove)
    }

    // ===== Metadata =====

    fn stat(&self, fid: u32) -> Result<Rmsg> {
        let entry = self.entry(fid)?;
        Ok(Rmsg::Stat {
            stat: entry.node.stat(),
        })
    }

    async fn wstat(&mut self, fid: u32, stat: Stat) -> Result<Rmsg> {
        let (node, parent) = {
            let entry = self.entry(fid)?;
            (entry.node.clone(), entry.parents.last().cloned())
        };
        if !stat.uid.is_empty() || !stat.gid.is_empty() || !stat.muid.is_empty() {
            return deny("cannot change file ownership");
        }
        if !stat.name.is_empty() {
            if stat.name == "." || stat.name == ".." || stat.name.contains('/') {
                return deny("file name syntax");
            }
            let Some(parent) = parent else {
                return deny("cannot rename the root");
            };
            let from = node.stat().name;
            if from != stat.name {
                parent.rename_child(&from, &stat.name).await?;
            }
        }
        if stat.length != !0u64 {
            if node.qid().is_dir() {
                return deny("cannot set the length of a directory");
            }
            node.truncate(stat.length).await?;
        }
        let mode = (stat.mode != !0u32).then_some(stat.mode);
        let mtime = (stat.mtime != !0u32).then_some(stat.mtime);
        if mode.is_some() || mtime.is_some() {
            node.wstat_meta(mode, mtime).await?;
        }
        Ok(Rmsg::Wstat)
    }

    // ===== Fid table =====

    fn entry(&self, fid: u32) -> Result<&FidEntry> {
        self.fids
            .get(&fid)
            .ok_or_else(|| Error::Remote("unknown fid".to_string()))
    }

    fn entry_mut(&mut self, fid: u32) -> Result<&mut FidEntry> {
        self.fids
            .get_mut(&fid)
            .ok_or_else(|| Error::Remote("unknown fid".to_string()))
    }
}
