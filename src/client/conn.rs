//! Connection core: one writer task draining an outbound queue, one reader
//! task decoding frames and dispatching replies to operation machines.
//!
//! All mutable connection state lives in a single `ConnState` behind a std
//! mutex. The lock is only ever held for table lookups and machine steps,
//! never across an await point. Requests go out through an unbounded
//! channel, so machines can send from inside the lock without blocking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::proto::{
    encode, read_message, write_message, FrameReader, Message, OpenMode, Qid, Rmsg, Stat, Tmsg,
    DEFAULT_MSIZE, MIN_MSIZE, NOFID, NOTAG, VERSION,
};

use super::file::StyxFile;
use super::ops::{
    ClunkOp, CreateOp, ListOp, OpenOp, Operation, ReadOp, RemoveOp, StatOp, Step, TidyOp, WalkOp,
    WriteOp, WstatOp,
};
use super::registry::{FidTable, TagEntry, TagTable};
use super::transfer::{DownloadOp, UploadOp};

// =============================================================================
// Configuration
// =============================================================================

/// Client-side connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum message size to propose during version negotiation.
    pub msize: u32,
    /// User name presented at attach.
    pub uname: String,
    /// File tree to attach to; servers exporting one tree accept "".
    pub aname: String,
    /// Outstanding requests per windowed transfer.
    pub window: usize,
    /// Per-operation deadline. Expired operations are flushed and fail
    /// with `Error::TimedOut`; `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            msize: DEFAULT_MSIZE,
            uname: "nobody".to_string(),
            aname: String::new(),
            window: 4,
            request_timeout: None,
        }
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// What the writer task pulls off the outbound queue.
pub(crate) enum Outbound {
    Frame(Bytes),
    Shutdown,
}

pub(crate) struct ConnState {
    pub tags: TagTable,
    pub fids: FidTable,
    pub ops: HashMap<u64, Operation>,
    pub next_op: u64,
    pub msize: u32,
    /// Set once, with the reason, when the connection dies.
    pub closed: Option<String>,
}

impl ConnState {
    pub fn new(msize: u32) -> Self {
        ConnState {
            tags: TagTable::default(),
            fids: FidTable::default(),
            ops: HashMap::new(),
            next_op: 1,
            msize,
            closed: None,
        }
    }
}

/// Everything a machine needs while being stepped: the locked state plus
/// the outbound queue, bound to the operation being stepped.
pub(crate) struct OpCtx<'a> {
    pub state: &'a mut ConnState,
    pub out: &'a mpsc::UnboundedSender<Outbound>,
    pub op_id: u64,
}

impl<'a> OpCtx<'a> {
    pub fn new(
        state: &'a mut ConnState,
        out: &'a mpsc::UnboundedSender<Outbound>,
        op_id: u64,
    ) -> Self {
        OpCtx { state, out, op_id }
    }

    /// Allocate a tag for this operation, encode and queue the request.
    pub fn send(&mut self, msg: &Tmsg) -> Result<u16> {
        if let Some(reason) = &self.state.closed {
            return Err(Error::ConnectionClosed(reason.clone()));
        }
        let tag = self.state.tags.alloc(self.op_id)?;
        let frame = match encode(tag, msg) {
            Ok(frame) => frame,
            Err(e) => {
                self.state.tags.free(tag);
                return Err(e);
            }
        };
        trace!(tag, msg = msg.name(), "sending request");
        if self.out.send(Outbound::Frame(frame)).is_err() {
            self.state.tags.free(tag);
            return Err(Error::ConnectionClosed("writer task is gone".to_string()));
        }
        Ok(tag)
    }

    /// Clunk a fid nobody waits for, under a detached operation. Failures
    /// are logged; the fid is dropped from the local table either way.
    pub fn send_tidy(&mut self, fid: u32) {
        if self.state.closed.is_some() {
            self.state.fids.release(fid);
            return;
        }
        let op_id = self.state.next_op;
        self.state.next_op += 1;
        let tag = match self.state.tags.alloc(op_id) {
            Ok(tag) => tag,
            Err(e) => {
                warn!(fid, error = %e, "cannot clunk orphaned fid");
                self.state.fids.release(fid);
                return;
            }
        };
        let frame = match encode(tag, &Tmsg::Clunk { fid }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(fid, error = %e, "cannot clunk orphaned fid");
                self.state.tags.free(tag);
                self.state.fids.release(fid);
                return;
            }
        };
        if self.out.send(Outbound::Frame(frame)).is_err() {
            self.state.tags.free(tag);
            self.state.fids.release(fid);
            return;
        }
        trace!(fid, "clunking orphaned fid");
        self.state.ops.insert(op_id, Operation::Tidy(TidyOp { fid }));
    }

    /// Flush every request still in flight for this operation. The flushed
    /// tags stay quarantined until their Rflush lands.
    pub fn flush_tags(&mut self) {
        for tag in self.state.tags.tags_of(self.op_id) {
            self.state.tags.set_flushing(tag);
            match self.state.tags.alloc_flush(tag) {
                Ok(ftag) => match encode(ftag, &Tmsg::Flush { oldtag: tag }) {
                    Ok(frame) => {
                        let _ = self.out.send(Outbound::Frame(frame));
                    }
                    Err(e) => warn!(tag, error = %e, "cannot flush request"),
                },
                Err(e) => warn!(tag, error = %e, "cannot flush request"),
            }
        }
    }
}

pub(crate) struct ConnShared {
    state: Mutex<ConnState>,
    pub out: mpsc::UnboundedSender<Outbound>,
}

impl ConnShared {
    pub fn new(msize: u32, out: mpsc::UnboundedSender<Outbound>) -> Self {
        ConnShared {
            state: Mutex::new(ConnState::new(msize)),
            out,
        }
    }

    /// A poisoned lock only means some thread panicked mid-step; the tables
    /// themselves are still consistent enough to tear down.
    pub fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route one decoded reply. Errors returned here are protocol failures
    /// that poison the whole connection.
    pub fn dispatch(&self, tag: u16, msg: Rmsg) -> Result<()> {
        enum Route {
            Discard,
            FlushDone { oldtag: u16 },
            Op { op: u64 },
        }

        let mut st = self.lock();
        if st.closed.is_some() {
            return Ok(());
        }
        let route = match st.tags.get(tag) {
            None => {
                return Err(Error::Protocol(format!(
                    "reply {} carries unknown tag {tag}",
                    msg.name()
                )))
            }
            Some(TagEntry::Flushing) => Route::Discard,
            Some(TagEntry::Flush { oldtag }) => Route::FlushDone { oldtag: *oldtag },
            Some(TagEntry::InFlight { op }) => Route::Op { op: *op },
        };

        match route {
            Route::Discard => {
                // The genuine reply won the race against Rflush. The tag
                // stays quarantined until the flush acknowledgement lands.
                trace!(tag, msg = msg.name(), "discarding reply to a flushed request");
                Ok(())
            }
            Route::FlushDone { oldtag } => {
                match msg {
                    Rmsg::Flush => {}
                    Rmsg::Error { ename } => {
                        warn!(tag, oldtag, %ename, "flush request rejected")
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "Tflush answered with {}",
                            other.name()
                        )))
                    }
                }
                st.tags.free(tag);
                st.tags.free(oldtag);
                Ok(())
            }
            Route::Op { op } => {
                st.tags.free(tag);
                let reply = match msg {
                    Rmsg::Error { ename } => Err(Error::Remote(ename)),
                    other => Ok(other),
                };
                let operation = st.ops.remove(&op).ok_or_else(|| {
                    Error::Protocol(format!("tag {tag} bound to a vanished operation"))
                })?;
                let mut ctx = OpCtx::new(&mut st, &self.out, op);
                match operation.on_reply(&mut ctx, tag, reply) {
                    Step::Continue(next) => {
                        st.ops.insert(op, next);
                    }
                    Step::Done => {}
                }
                Ok(())
            }
        }
    }

    /// Abort one operation: flush its outstanding tags and resolve its
    /// completion with `err`.
    pub fn cancel_op(&self, op_id: u64, err: Error) {
        let mut st = self.lock();
        if st.closed.is_some() {
            return;
        }
        let Some(op) = st.ops.remove(&op_id) else {
            return;
        };
        debug!(op = op.label(), op_id, "cancelling operation");
        let mut ctx = OpCtx::new(&mut st, &self.out, op_id);
        ctx.flush_tags();
        op.cancel(&mut ctx, err);
    }

    /// Kill the connection: resolve every pending operation with an error,
    /// drop all tables and stop the writer.
    pub fn fail_all(&self, reason: &str) {
        let mut st = self.lock();
        if st.closed.is_some() {
            return;
        }
        st.closed = Some(reason.to_string());
        let pending: Vec<Operation> = st.ops.drain().map(|(_, op)| op).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), reason, "failing pending operations");
        }
        for op in pending {
            op.resolve_err(Error::ConnectionClosed(reason.to_string()));
        }
        st.tags.clear();
        st.fids.clear();
        drop(st);
        let _ = self.out.send(Outbound::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .lock()
            .closed
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        Error::ConnectionClosed(reason)
    }
}

// =============================================================================
// I/O tasks
// =============================================================================

async fn run_reader<R>(shared: Arc<ConnShared>, mut reader: R, max_size: u32)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::<Rmsg>::new(max_size);
    let mut buf = [0u8; 8192];
    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                shared.fail_all("connection closed by server");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                shared.fail_all(&format!("read failed: {e}"));
                break;
            }
        };
        frames.feed(&buf[..n]);
        loop {
            match frames.try_next() {
                Ok(Some((tag, msg))) => {
                    trace!(tag, msg = msg.name(), "received reply");
                    if let Err(e) = shared.dispatch(tag, msg) {
                        error!(error = %e, "protocol failure, dropping connection");
                        shared.fail_all(&e.to_string());
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "undecodable frame, dropping connection");
                    shared.fail_all(&e.to_string());
                    break 'read;
                }
            }
        }
    }
    trace!("reader task finished");
}

async fn run_writer<W>(
    shared: Arc<ConnShared>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut writer: W,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    shared.fail_all(&format!("write failed: {e}"));
                    break;
                }
                if let Err(e) = writer.flush().await {
                    shared.fail_all(&format!("write failed: {e}"));
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
    trace!("writer task finished");
}

// =============================================================================
// Connection
// =============================================================================

/// An established session with a server: version negotiated, root attached.
///
/// Cheap handles onto files come from [`Connection::file`]; the connection
/// itself is shared behind an `Arc` and multiplexes any number of
/// concurrent operations over the one stream.
pub struct Connection {
    shared: Arc<ConnShared>,
    msize: u32,
    window: usize,
    request_timeout: Option<Duration>,
    root_fid: u32,
    root_qid: Qid,
}

impl Connection {
    /// Negotiate a session over an already-connected stream.
    ///
    /// The version and attach exchanges happen inline before the reader and
    /// writer tasks are spawned, so a broken handshake surfaces directly as
    /// the returned error.
    pub async fn connect<S>(stream: S, config: ClientConfig) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if config.msize < MIN_MSIZE {
            return Err(Error::Usage(format!(
                "msize {} below protocol minimum {MIN_MSIZE}",
                config.msize
            )));
        }
        if config.window == 0 {
            return Err(Error::Usage("transfer window must be at least 1".to_string()));
        }
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_message(
            &mut writer,
            NOTAG,
            &Tmsg::Version {
                msize: config.msize,
                version: VERSION.to_string(),
            },
        )
        .await?;
        let (tag, reply) = read_message::<_, Rmsg>(&mut reader, config.msize).await?;
        if tag != NOTAG {
            return Err(Error::Protocol(format!(
                "version reply carries tag {tag} instead of NOTAG"
            )));
        }
        let msize = match reply {
            Rmsg::Version { msize, version } => {
                if version != VERSION {
                    return Err(Error::Protocol(format!(
                        "server offered unsupported version {version:?}"
                    )));
                }
                if msize > config.msize {
                    return Err(Error::Protocol(format!(
                        "server raised msize from {} to {msize}",
                        config.msize
                    )));
                }
                if msize < MIN_MSIZE {
                    return Err(Error::Protocol(format!(
                        "negotiated msize {msize} below protocol minimum {MIN_MSIZE}"
                    )));
                }
                msize
            }
            Rmsg::Error { ename } => return Err(Error::Remote(ename)),
            other => {
                return Err(Error::Protocol(format!(
                    "Tversion answered with {}",
                    other.name()
                )))
            }
        };
        debug!(msize, "version negotiated");

        let mut state = ConnState::new(msize);
        let root_fid = state.fids.alloc()?;
        write_message(
            &mut writer,
            0,
            &Tmsg::Attach {
                fid: root_fid,
                afid: NOFID,
                uname: config.uname.clone(),
                aname: config.aname.clone(),
            },
        )
        .await?;
        let (tag, reply) = read_message::<_, Rmsg>(&mut reader, msize).await?;
        if tag != 0 {
            return Err(Error::Protocol(format!(
                "attach reply carries unexpected tag {tag}"
            )));
        }
        let root_qid = match reply {
            Rmsg::Attach { qid } => qid,
            Rmsg::Error { ename } => return Err(Error::Remote(ename)),
            other => {
                return Err(Error::Protocol(format!(
                    "Tattach answered with {}",
                    other.name()
                )))
            }
        };
        state.fids.bind(root_fid, root_qid)?;
        debug!(uname = %config.uname, aname = %config.aname, "attached to file tree");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnShared {
            state: Mutex::new(state),
            out: out_tx,
        });
        tokio::spawn(run_reader(shared.clone(), reader, msize));
        tokio::spawn(run_writer(shared.clone(), out_rx, writer));

        Ok(Arc::new(Connection {
            shared,
            msize,
            window: config.window,
            request_timeout: config.request_timeout,
            root_fid,
            root_qid,
        }))
    }

    /// Connect over TCP and negotiate a session.
    pub async fn dial<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Arc<Connection>> {
        let stream = TcpStream::connect(addr).await?;
        Connection::connect(stream, config).await
    }

    /// A handle onto the file at `path` (slash-separated, relative to the
    /// attach root; "" or "/" names the root itself). Nothing is sent until
    /// the handle is first used.
    pub fn file(self: &Arc<Self>, path: &str) -> StyxFile {
        StyxFile::new(self.clone(), path)
    }

    /// A handle onto the attach root.
    pub fn root(self: &Arc<Self>) -> StyxFile {
        self.file("")
    }

    /// Negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Shut the connection down. The root fid gets a best-effort clunk,
    /// every pending operation fails with `ConnectionClosed`, and the
    /// stream is closed.
    pub fn close(&self) {
        {
            let mut st = self.shared.lock();
            if st.closed.is_some() {
                return;
            }
            let mut ctx = OpCtx::new(&mut st, &self.shared.out, 0);
            ctx.send_tidy(self.root_fid);
        }
        self.shared.fail_all("connection closed");
    }

    pub(crate) fn window(&self) -> usize {
        self.window
    }

    pub(crate) fn root_fid(&self) -> u32 {
        self.root_fid
    }

    pub(crate) fn root_qid(&self) -> Qid {
        self.root_qid
    }

    // =========================================================================
    // Operation plumbing
    // =========================================================================

    /// Install a new operation under the lock. `build` sends the opening
    /// request(s); if it fails nothing is left behind.
    pub(crate) fn start_op<F>(&self, build: F) -> Result<u64>
    where
        F: FnOnce(&mut OpCtx<'_>) -> Result<Operation>,
    {
        let mut st = self.shared.lock();
        if let Some(reason) = &st.closed {
            return Err(Error::ConnectionClosed(reason.clone()));
        }
        let op_id = st.next_op;
        st.next_op += 1;
        let op = {
            let mut ctx = OpCtx::new(&mut st, &self.shared.out, op_id);
            build(&mut ctx)?
        };
        st.ops.insert(op_id, op);
        Ok(op_id)
    }

    /// Wait for an operation's completion, honoring the configured request
    /// timeout. On expiry the operation is cancelled and its outstanding
    /// requests flushed.
    pub(crate) async fn await_op<T>(
        &self,
        op_id: u64,
        mut rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        match self.request_timeout {
            None => match rx.await {
                Ok(out) => out,
                Err(_) => Err(self.shared.closed_error()),
            },
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(Ok(out)) => out,
                Ok(Err(_)) => Err(self.shared.closed_error()),
                Err(_) => {
                    self.shared.cancel_op(op_id, Error::TimedOut);
                    // cancel resolves the completion; a genuine reply can
                    // still win the race, in which case we return it.
                    match rx.await {
                        Ok(out) => out,
                        Err(_) => Err(Error::TimedOut),
                    }
                }
            },
        }
    }

    /// Feed the next local chunk to an upload operation. Returns false once
    /// the operation no longer accepts input.
    pub(crate) fn deliver_chunk(&self, op_id: u64, chunk: Option<Bytes>) -> bool {
        let mut st = self.shared.lock();
        if st.closed.is_some() {
            return false;
        }
        let op = match st.ops.remove(&op_id) {
            Some(Operation::Upload(op)) => op,
            Some(other) => {
                st.ops.insert(op_id, other);
                return false;
            }
            None => return false,
        };
        let mut ctx = OpCtx::new(&mut st, &self.shared.out, op_id);
        match op.on_chunk(&mut ctx, chunk) {
            Step::Continue(next) => {
                st.ops.insert(op_id, next);
                true
            }
            Step::Done => false,
        }
    }

    pub(crate) fn cancel_op(&self, op_id: u64, err: Error) {
        self.shared.cancel_op(op_id, err);
    }

    /// Detached best-effort clunk, for drop paths.
    pub(crate) fn tidy_fid(&self, fid: u32) {
        let mut st = self.shared.lock();
        let mut ctx = OpCtx::new(&mut st, &self.shared.out, 0);
        ctx.send_tidy(fid);
    }

    // =========================================================================
    // Typed operations
    // =========================================================================

    pub(crate) async fn walk_fid(
        &self,
        source: u32,
        base: Qid,
        names: Vec<String>,
    ) -> Result<(u32, Qid)> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| WalkOp::start(ctx, source, base, names, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn open_fid(&self, fid: u32, mode: OpenMode) -> Result<(Qid, u32)> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| OpenOp::start(ctx, fid, mode, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn create_fid(
        &self,
        fid: u32,
        name: String,
        perm: u32,
        mode: OpenMode,
    ) -> Result<(Qid, u32)> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| CreateOp::start(ctx, fid, name, perm, mode, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn read_fid(&self, fid: u32, offset: u64, count: u32) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| ReadOp::start(ctx, fid, offset, count, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn write_fid(&self, fid: u32, offset: u64, data: Bytes) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| WriteOp::start(ctx, fid, offset, data, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn stat_fid(&self, fid: u32) -> Result<Stat> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| StatOp::start(ctx, fid, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn wstat_fid(&self, fid: u32, stat: Stat) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| WstatOp::start(ctx, fid, stat, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn remove_fid(&self, fid: u32) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| RemoveOp::start(ctx, fid, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn clunk_fid(&self, fid: u32) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| ClunkOp::start(ctx, fid, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn list_open_fid(&self, fid: u32, iounit: u32) -> Result<Vec<Stat>> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| ListOp::start_on_open_fid(ctx, fid, iounit, tx))?;
        self.await_op(op_id, rx).await
    }

    pub(crate) async fn list_walk(
        &self,
        source: u32,
        base: Qid,
        names: Vec<String>,
    ) -> Result<Vec<Stat>> {
        let (tx, rx) = oneshot::channel();
        let op_id = self.start_op(|ctx| ListOp::start_walk(ctx, source, base, names, tx))?;
        self.await_op(op_id, rx).await
    }

    /// Start a windowed download; chunks arrive on `chunks` as
    /// `(offset, data)` pairs. The returned receiver resolves with the
    /// total byte count once the remote end of file is reached.
    pub(crate) fn start_download(
        &self,
        fid: u32,
        iounit: u32,
        chunks: mpsc::UnboundedSender<(u64, Bytes)>,
    ) -> Result<(u64, oneshot::Receiver<Result<u64>>)> {
        let (tx, rx) = oneshot::channel();
        let window = self.window;
        let op_id =
            self.start_op(|ctx| DownloadOp::start(ctx, fid, iounit, window, chunks, tx))?;
        Ok((op_id, rx))
    }

    /// Start a windowed upload. Each token on `pull` invites one call to
    /// [`Connection::deliver_chunk`]. The receiver resolves with the byte
    /// count once the end-of-file marker is acknowledged and the fid
    /// clunked.
    pub(crate) fn start_upload(
        &self,
        fid: u32,
        iounit: u32,
        pull: mpsc::UnboundedSender<()>,
    ) -> Result<(u64, oneshot::Receiver<Result<u64>>)> {
        let (tx, rx) = oneshot::channel();
        let window = self.window;
        let op_id = self.start_op(|ctx| UploadOp::start(ctx, fid, iounit, window, pull, tx))?;
        Ok((op_id, rx))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.fail_all("connection dropped");
    }
}
