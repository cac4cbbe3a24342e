//! High-level file handles.
//!
//! A [`StyxFile`] names one path on a connection and caches the fid it
//! resolves to, together with its open state. Handles are cheap clones
//! sharing one core; compound flows (walk then open, walk parent then
//! create, transfer preludes) are serialized per file by an async gate so
//! concurrent callers cannot interleave half-finished state.
//!
//! Interested parties can subscribe to a broadcast of [`FileEvent`]s, which
//! is how background transfers report progress without anyone polling.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::proto::{OpenMode, Qid, Stat};

use super::conn::Connection;
use super::transfer::pump_to_sink;

/// Default permission bits for files created implicitly, as by
/// [`StyxFile::open_or_create`] or an upload to a missing file.
pub const DEFAULT_CREATE_PERM: u32 = 0o644;

const EVENT_CAPACITY: usize = 32;

// =============================================================================
// Events
// =============================================================================

/// Lifecycle notifications broadcast by a file handle.
#[derive(Debug, Clone)]
pub enum FileEvent {
    Opened { qid: Qid },
    Created { qid: Qid },
    Refreshed { stat: Stat },
    Written { offset: u64, count: u32 },
    ChildrenListed { count: usize },
    Removed,
    Closed,
    DownloadCompleted { bytes: u64 },
    UploadCompleted { bytes: u64 },
    OperationFailed { operation: &'static str, message: String },
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug, Clone)]
struct OpenState {
    mode: OpenMode,
    iounit: u32,
}

#[derive(Debug)]
struct FileState {
    path: String,
    fid: Option<u32>,
    qid: Option<Qid>,
    open: Option<OpenState>,
}

struct FileCore {
    conn: Arc<Connection>,
    state: Mutex<FileState>,
    events: broadcast::Sender<FileEvent>,
    /// Serializes compound operations on this file.
    gate: tokio::sync::Mutex<()>,
}

/// A handle onto one file or directory of the remote tree.
#[derive(Clone)]
pub struct StyxFile {
    core: Arc<FileCore>,
}

impl StyxFile {
    pub(crate) fn new(conn: Arc<Connection>, path: &str) -> StyxFile {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        StyxFile {
            core: Arc::new(FileCore {
                conn,
                state: Mutex::new(FileState {
                    path: split_path(path).join("/"),
                    fid: None,
                    qid: None,
                    open: None,
                }),
                events,
                gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Path relative to the attach root; "" is the root itself.
    pub fn path(&self) -> String {
        self.state().path.clone()
    }

    /// Last path element, or "" for the root.
    pub fn name(&self) -> String {
        self.state()
            .path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Qid from the last successful walk, open or create.
    pub fn qid(&self) -> Option<Qid> {
        self.state().qid
    }

    pub fn is_open(&self) -> bool {
        self.state().open.is_some()
    }

    /// Subscribe to this handle's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.core.events.subscribe()
    }

    // =========================================================================
    // Open / create
    // =========================================================================

    /// Open the file, walking to it first if this handle has no fid yet.
    /// Opening an already-open handle with the same access is a no-op;
    /// asking for different access is an error.
    pub async fn open(&self, mode: OpenMode) -> Result<Qid> {
        let _g = self.core.gate.lock().await;
        self.open_locked(mode)
            .await
            .map_err(|e| self.fail_ev("open", e))
    }

    /// Create this file under its parent directory and leave it open.
    /// The handle must not already be bound to an existing file.
    pub async fn create(&self, perm: u32, mode: OpenMode) -> Result<Qid> {
        let _g = self.core.gate.lock().await;
        self.create_locked(perm, mode)
            .await
            .map_err(|e| self.fail_ev("create", e))
    }

    /// Open the file if it exists, create it otherwise.
    pub async fn open_or_create(&self, perm: u32, mode: OpenMode) -> Result<Qid> {
        let _g = self.core.gate.lock().await;
        self.open_or_create_locked(perm, mode)
            .await
            .map_err(|e| self.fail_ev("open_or_create", e))
    }

    async fn open_locked(&self, mode: OpenMode) -> Result<Qid> {
        if let Some((qid, open)) = self.cached_open() {
            if open.mode.access() == mode.access() {
                return Ok(qid);
            }
            return Err(Error::Usage(format!(
                "already open with access {} (wanted {})",
                open.mode.access(),
                mode.access()
            )));
        }
        let (fid, _) = self.ensure_bound_locked().await?;
        let (qid, iounit) = self.core.conn.open_fid(fid, mode).await?;
        {
            let mut st = self.state();
            st.qid = Some(qid);
            st.open = Some(OpenState { mode, iounit });
        }
        debug!(path = %self.path(), ?mode, "opened");
        self.emit(FileEvent::Opened { qid });
        Ok(qid)
    }

    async fn create_locked(&self, perm: u32, mode: OpenMode) -> Result<Qid> {
        if self.state().fid.is_some() {
            return Err(Error::Usage(
                "handle already bound to an existing file".to_string(),
            ));
        }
        let (parents, name) = self
            .parent_and_name()
            .ok_or_else(|| Error::Usage("cannot create the root directory".to_string()))?;
        let conn = &self.core.conn;
        let (pfid, _) = conn
            .walk_fid(conn.root_fid(), conn.root_qid(), parents)
            .await?;
        // On success the parent fid becomes this file's fid; on failure the
        // operation clunks it.
        let (qid, iounit) = conn.create_fid(pfid, name, perm, mode).await?;
        {
            let mut st = self.state();
            st.fid = Some(pfid);
            st.qid = Some(qid);
            st.open = Some(OpenState { mode, iounit });
        }
        debug!(path = %self.path(), perm, "created");
        self.emit(FileEvent::Created { qid });
        Ok(qid)
    }

    async fn open_or_create_locked(&self, perm: u32, mode: OpenMode) -> Result<Qid> {
        if let Some((qid, open)) = self.cached_open() {
            if open.mode.access() == mode.access() {
                return Ok(qid);
            }
            return Err(Error::Usage(format!(
                "already open with access {} (wanted {})",
                open.mode.access(),
                mode.access()
            )));
        }
        if self.state().fid.is_some() {
            // Bound means it exists.
            return self.open_locked(mode).await;
        }
        let Some((parents, name)) = self.parent_and_name() else {
            // The root always exists.
            return self.open_locked(mode).await;
        };

        let conn = &self.core.conn;
        let (pfid, pqid) = conn
            .walk_fid(conn.root_fid(), conn.root_qid(), parents)
            .await?;
        match conn.walk_fid(pfid, pqid, vec![name.clone()]).await {
            Ok((fid, qid)) => {
                conn.tidy_fid(pfid);
                {
                    let mut st = self.state();
                    st.fid = Some(fid);
                    st.qid = Some(qid);
                }
                self.open_locked(mode).await
            }
            Err(Error::NotFound(_)) => {
                let (qid, iounit) = conn.create_fid(pfid, name, perm, mode).await?;
                {
                    let mut st = self.state();
                    st.fid = Some(pfid);
                    st.qid = Some(qid);
                    st.open = Some(OpenState { mode, iounit });
                }
                debug!(path = %self.path(), perm, "created");
                self.emit(FileEvent::Created { qid });
                Ok(qid)
            }
            Err(e) => {
                conn.tidy_fid(pfid);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Reads and writes
    // =========================================================================

    /// Read up to `count` bytes at `offset`, opening the file read-only
    /// first if needed. A single request is issued, so the result may be
    /// shorter than asked; empty means end of file.
    pub async fn read_at(&self, offset: u64, count: u32) -> Result<Bytes> {
        let _g = self.core.gate.lock().await;
        let out = async {
            let (fid, iounit) = self.ensure_open_locked(OpenMode::READ).await?;
            self.core.conn.read_fid(fid, offset, count.min(iounit)).await
        }
        .await;
        out.map_err(|e| self.fail_ev("read", e))
    }

    /// Write all of `data` at `offset`, opening the file write-only first
    /// if needed. Data larger than the negotiated I/O unit goes out as a
    /// sequence of writes at increasing offsets.
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<u32> {
        let _g = self.core.gate.lock().await;
        let out = self.write_at_locked(offset, data).await;
        out.map_err(|e| self.fail_ev("write", e))
    }

    async fn write_at_locked(&self, offset: u64, mut data: Bytes) -> Result<u32> {
        let (fid, iounit) = self.ensure_open_locked(OpenMode::WRITE).await?;
        let start = offset;
        let mut at = offset;
        let mut written = 0u32;
        while !data.is_empty() {
            let n = (iounit as usize).min(data.len());
            let chunk = data.split_to(n);
            let count = self.core.conn.write_fid(fid, at, chunk).await?;
            written += count;
            at += count as u64;
        }
        self.emit(FileEvent::Written {
            offset: start,
            count: written,
        });
        Ok(written)
    }

    /// Make sure the file is open with the wanted access, auto-opening it
    /// like the classical read/write convenience calls do.
    async fn ensure_open_locked(&self, want: OpenMode) -> Result<(u32, u32)> {
        if let Some((_, open)) = self.cached_open() {
            let fits = if want.wants_write() {
                open.mode.wants_write()
            } else {
                open.mode.wants_read()
            };
            if !fits {
                return Err(Error::Usage(format!(
                    "open with access {} does not allow this operation",
                    open.mode.access()
                )));
            }
            let st = self.state();
            let open = st.open.as_ref().ok_or_else(|| {
                Error::Consistency("open state changed underneath the gate".to_string())
            })?;
            return Ok((
                st.fid.ok_or_else(|| {
                    Error::Consistency("open state without a fid".to_string())
                })?,
                open.iounit,
            ));
        }
        self.open_locked(want).await?;
        let st = self.state();
        match (st.fid, &st.open) {
            (Some(fid), Some(open)) => Ok((fid, open.iounit)),
            _ => Err(Error::Consistency(
                "open state missing after successful open".to_string(),
            )),
        }
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Fetch fresh metadata for this file.
    pub async fn stat(&self) -> Result<Stat> {
        let _g = self.core.gate.lock().await;
        let out = async {
            let (fid, _) = self.ensure_bound_locked().await?;
            self.core.conn.stat_fid(fid).await
        }
        .await;
        match out {
            Ok(stat) => {
                self.state().qid = Some(stat.qid);
                self.emit(FileEvent::Refreshed { stat: stat.clone() });
                Ok(stat)
            }
            Err(e) => Err(self.fail_ev("stat", e)),
        }
    }

    /// Rewrite metadata. Use [`Stat::keep`] as the base and change only the
    /// fields to be touched.
    pub async fn wstat(&self, stat: Stat) -> Result<()> {
        let _g = self.core.gate.lock().await;
        let out = async {
            let (fid, _) = self.ensure_bound_locked().await?;
            self.core.conn.wstat_fid(fid, stat).await
        }
        .await;
        out.map_err(|e| self.fail_ev("wstat", e))
    }

    /// Rename within the parent directory.
    pub async fn rename(&self, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(self.fail_ev(
                "rename",
                Error::Usage(format!("invalid file name {new_name:?}")),
            ));
        }
        let _g = self.core.gate.lock().await;
        let (parents, _) = match self.parent_and_name() {
            Some(split) => split,
            None => {
                return Err(self.fail_ev(
                    "rename",
                    Error::Usage("cannot rename the root directory".to_string()),
                ))
            }
        };
        let out = async {
            let (fid, _) = self.ensure_bound_locked().await?;
            let mut stat = Stat::keep();
            stat.name = new_name.to_string();
            self.core.conn.wstat_fid(fid, stat).await
        }
        .await;
        match out {
            Ok(()) => {
                let mut path = parents.join("/");
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(new_name);
                self.state().path = path;
                Ok(())
            }
            Err(e) => Err(self.fail_ev("rename", e)),
        }
    }

    /// Truncate or extend the file to `length` bytes.
    pub async fn set_length(&self, length: u64) -> Result<()> {
        let _g = self.core.gate.lock().await;
        let out = self.set_length_locked(length).await;
        out.map_err(|e| self.fail_ev("set_length", e))
    }

    async fn set_length_locked(&self, length: u64) -> Result<()> {
        let (fid, _) = self.ensure_bound_locked().await?;
        let mut stat = Stat::keep();
        stat.length = length;
        self.core.conn.wstat_fid(fid, stat).await
    }

    // =========================================================================
    // Directory listing
    // =========================================================================

    /// Read this directory to its end and return the decoded entries.
    ///
    /// A handle already open for reading is read in place and stays open.
    /// A bound handle is cloned onto a private fid, and an unwalked handle
    /// resolved from the root, so the caller's state is never disturbed.
    pub async fn children(&self) -> Result<Vec<Stat>> {
        let _g = self.core.gate.lock().await;
        let out = self.children_locked().await;
        match out {
            Ok(entries) => {
                self.emit(FileEvent::ChildrenListed {
                    count: entries.len(),
                });
                Ok(entries)
            }
            Err(e) => Err(self.fail_ev("children", e)),
        }
    }

    async fn children_locked(&self) -> Result<Vec<Stat>> {
        let conn = &self.core.conn;
        let (fid, qid, open) = {
            let st = self.state();
            (st.fid, st.qid, st.open.clone())
        };
        if let Some(qid) = qid {
            if !qid.is_dir() {
                return Err(Error::Usage("not a directory".to_string()));
            }
        }
        match (fid, open) {
            (Some(fid), Some(open)) => {
                if !open.mode.wants_read() {
                    return Err(Error::Usage(
                        "directory is open without read access".to_string(),
                    ));
                }
                conn.list_open_fid(fid, open.iounit).await
            }
            (Some(fid), None) => {
                let qid = qid.ok_or_else(|| {
                    Error::Consistency("bound fid without a qid".to_string())
                })?;
                conn.list_walk(fid, qid, vec![]).await
            }
            _ => {
                conn.list_walk(conn.root_fid(), conn.root_qid(), self.names())
                    .await
            }
        }
    }

    // =========================================================================
    // Remove / close
    // =========================================================================

    /// Remove the file. The fid is spent whether or not the server agrees,
    /// so the handle ends up unbound either way.
    pub async fn remove(&self) -> Result<()> {
        let _g = self.core.gate.lock().await;
        let out = async {
            let (fid, _) = self.ensure_bound_locked().await?;
            self.core.conn.remove_fid(fid).await
        }
        .await;
        self.clear_state();
        match out {
            Ok(()) => {
                self.emit(FileEvent::Removed);
                Ok(())
            }
            Err(e) => Err(self.fail_ev("remove", e)),
        }
    }

    /// Release the fid behind this handle. Idempotent; the handle can be
    /// used again afterwards and will walk anew.
    pub async fn close(&self) -> Result<()> {
        let _g = self.core.gate.lock().await;
        let fid = {
            let mut st = self.state();
            st.open = None;
            st.qid = None;
            st.fid.take()
        };
        let Some(fid) = fid else { return Ok(()) };
        let out = self.core.conn.clunk_fid(fid).await;
        self.emit(FileEvent::Closed);
        out.map_err(|e| self.fail_ev("close", e))
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Download the whole file into `sink`, keeping several reads in
    /// flight. Chunks are written at their own offsets, so the sink must
    /// seek. Returns the bytes received.
    pub async fn download_to<W>(&self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + AsyncSeek + Unpin,
    {
        let _g = self.core.gate.lock().await;
        let out = self.download_locked(sink).await;
        match out {
            Ok(bytes) => {
                self.emit(FileEvent::DownloadCompleted { bytes });
                Ok(bytes)
            }
            Err(e) => Err(self.fail_ev("download", e)),
        }
    }

    /// Download into a freshly created local file.
    pub async fn download_to_path(&self, path: impl AsRef<Path>) -> Result<u64> {
        let mut file = tokio::fs::File::create(path.as_ref()).await?;
        self.download_to(&mut file).await
    }

    async fn download_locked<W>(&self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + AsyncSeek + Unpin,
    {
        let (fid, iounit) = self.ensure_open_locked(OpenMode::READ).await?;
        let conn = &self.core.conn;
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (op_id, done_rx) = conn.start_download(fid, iounit, chunk_tx)?;
        let (outcome, pumped) =
            tokio::join!(conn.await_op(op_id, done_rx), pump_to_sink(chunk_rx, sink));
        match (outcome, pumped) {
            (Ok(bytes), Ok(_)) => Ok(bytes),
            // A sink failure cancels the transfer; report the root cause.
            (Err(Error::Cancelled), Err(io)) => Err(Error::Io(io)),
            (Ok(_), Err(io)) => Err(Error::Io(io)),
            (Err(e), _) => Err(e),
        }
    }

    /// Upload `source` as this file's new content, truncating whatever was
    /// there. Missing files are created with [`DEFAULT_CREATE_PERM`]. The
    /// transfer ends with a zero-length marker write and a clunk, so the
    /// handle is closed afterwards. Returns the bytes sent.
    pub async fn upload_from<R>(&self, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let _g = self.core.gate.lock().await;
        let out = self.upload_locked(source).await;
        // The fid was spent by the transfer one way or the other.
        self.clear_state();
        match out {
            Ok(bytes) => {
                self.emit(FileEvent::UploadCompleted { bytes });
                Ok(bytes)
            }
            Err(e) => Err(self.fail_ev("upload", e)),
        }
    }

    /// Upload a local file's content.
    pub async fn upload_from_path(&self, path: impl AsRef<Path>) -> Result<u64> {
        let mut file = tokio::fs::File::open(path.as_ref()).await?;
        self.upload_from(&mut file).await
    }

    async fn upload_locked<R>(&self, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let conn = &self.core.conn;
        let (fid, iounit) = match self.cached_open() {
            Some((_, open)) => {
                if !open.mode.wants_write() {
                    return Err(Error::Usage(
                        "open without write access; cannot upload".to_string(),
                    ));
                }
                // Already open: truncate in place instead of reopening.
                self.set_length_locked(0).await?;
                let st = self.state();
                (
                    st.fid.ok_or_else(|| {
                        Error::Consistency("open state without a fid".to_string())
                    })?,
                    open.iounit,
                )
            }
            None => {
                self.open_or_create_locked(DEFAULT_CREATE_PERM, OpenMode::WRITE.truncate())
                    .await?;
                let st = self.state();
                match (st.fid, &st.open) {
                    (Some(fid), Some(open)) => (fid, open.iounit),
                    _ => {
                        return Err(Error::Consistency(
                            "open state missing after successful open".to_string(),
                        ))
                    }
                }
            }
        };

        let (pull_tx, mut pull_rx) = mpsc::unbounded_channel();
        let (op_id, done_rx) = conn.start_upload(fid, iounit, pull_tx)?;
        let mut buf = vec![0u8; iounit as usize];
        // Answer pull tokens until the machine stops asking or the source
        // runs dry. The machine closes the channel when it fails.
        while pull_rx.recv().await.is_some() {
            let n = match read_full(source, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    conn.cancel_op(op_id, Error::Io(e));
                    break;
                }
            };
            if n == 0 {
                conn.deliver_chunk(op_id, None);
                break;
            }
            if !conn.deliver_chunk(op_id, Some(Bytes::copy_from_slice(&buf[..n]))) {
                break;
            }
        }
        conn.await_op(op_id, done_rx).await
    }

    /// Download to a local path on a spawned task. Completion or failure
    /// arrives as a [`FileEvent`] on this handle's subscription.
    pub fn download_in_background(&self, path: impl Into<PathBuf>) -> JoinHandle<()> {
        let file = self.clone();
        let path = path.into();
        tokio::spawn(async move {
            let _ = file.download_to_path(&path).await;
        })
    }

    /// Upload from a local path on a spawned task, reporting through
    /// [`FileEvent`]s like [`StyxFile::download_in_background`].
    pub fn upload_in_background(&self, path: impl Into<PathBuf>) -> JoinHandle<()> {
        let file = self.clone();
        let path = path.into();
        tokio::spawn(async move {
            let _ = file.upload_from_path(&path).await;
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn state(&self) -> MutexGuard<'_, FileState> {
        self.core.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached_open(&self) -> Option<(Qid, OpenState)> {
        let st = self.state();
        match (st.qid, &st.open) {
            (Some(qid), Some(open)) => Some((qid, open.clone())),
            _ => None,
        }
    }

    fn clear_state(&self) {
        let mut st = self.state();
        st.fid = None;
        st.qid = None;
        st.open = None;
    }

    fn names(&self) -> Vec<String> {
        split_path(&self.state().path)
    }

    /// Split into (parent path elements, last element). None for the root.
    fn parent_and_name(&self) -> Option<(Vec<String>, String)> {
        let names = self.names();
        let (name, parents) = names.split_last()?;
        Some((parents.to_vec(), name.clone()))
    }

    /// Walk this handle's path onto a fid if it has none yet.
    async fn ensure_bound_locked(&self) -> Result<(u32, Qid)> {
        {
            let st = self.state();
            if let (Some(fid), Some(qid)) = (st.fid, st.qid) {
                return Ok((fid, qid));
            }
        }
        let conn = &self.core.conn;
        let (fid, qid) = conn
            .walk_fid(conn.root_fid(), conn.root_qid(), self.names())
            .await?;
        let mut st = self.state();
        st.fid = Some(fid);
        st.qid = Some(qid);
        Ok((fid, qid))
    }

    fn emit(&self, event: FileEvent) {
        let _ = self.core.events.send(event);
    }

    fn fail_ev(&self, operation: &'static str, err: Error) -> Error {
        self.emit(FileEvent::OperationFailed {
            operation,
            message: err.to_string(),
        });
        err
    }
}

impl Drop for FileCore {
    fn drop(&mut self) {
        let fid = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fid
            .take();
        if let Some(fid) = fid {
            self.conn.tidy_fid(fid);
        }
    }
}

impl std::fmt::Debug for StyxFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state();
        f.debug_struct("StyxFile")
            .field("path", &st.path)
            .field("fid", &st.fid)
            .field("open", &st.open.is_some())
            .finish()
    }
}

/// Path elements of a slash-separated path. Empty elements and "." are
/// dropped; ".." is kept and resolved by the server.
fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_string)
        .collect()
}

async fn read_full<R: AsyncRead + Unpin>(src: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path_normalizes() {
        assert_eq!(split_path("/usr//glenda/"), vec!["usr", "glenda"]);
        assert_eq!(split_path("a/./b"), vec!["a", "b"]);
        assert_eq!(split_path("a/../b"), vec!["a", "..", "b"]);
        assert!(split_path("").is_empty());
        assert!(split_path("/").is_empty());
    }

    #[test]
    fn test_read_full_collects_short_reads() {
        let data = b"abcdefgh".to_vec();
        let mut src = std::io::Cursor::new(data);
        let mut buf = [0u8; 5];
        let n = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(read_full(&mut src, &mut buf))
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"abcde");
    }
}
