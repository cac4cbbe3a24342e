//! Client operation state machines.
//!
//! Every high-level operation in flight on a connection is one value of
//! `Operation`: an explicit stage plus accumulated state. Machines never
//! block and never own a task; the connection's reply dispatch removes the
//! machine from the operation table, steps it with the reply, and reinserts
//! it if it wants to continue. Completion is a typed oneshot resolved
//! exactly once per operation, on success, failure, or cancellation.
//!
//! Failure paths release whatever the machine holds: a reserved fid goes
//! back to the pool, a fid already bound on the server gets a detached
//! best-effort clunk.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::{Error, Result};
use crate::proto::{parse_dir, Message, OpenMode, Qid, Rmsg, Stat, Tmsg, IOHDRSZ, MAXWELEM};

use super::conn::OpCtx;
use super::transfer::{DownloadOp, UploadOp};

/// What a machine wants after seeing a reply.
pub(crate) enum Step {
    Continue(Operation),
    Done,
}

pub(crate) enum Operation {
    Walk(WalkOp),
    Open(OpenOp),
    Create(CreateOp),
    Read(ReadOp),
    Write(WriteOp),
    Stat(StatOp),
    Wstat(WstatOp),
    Remove(RemoveOp),
    Clunk(ClunkOp),
    List(ListOp),
    Download(DownloadOp),
    Upload(UploadOp),
    /// Detached clunk of an orphaned fid; nobody waits for it.
    Tidy(TidyOp),
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Walk(_) => "walk",
            Operation::Open(_) => "open",
            Operation::Create(_) => "create",
            Operation::Read(_) => "read",
            Operation::Write(_) => "write",
            Operation::Stat(_) => "stat",
            Operation::Wstat(_) => "wstat",
            Operation::Remove(_) => "remove",
            Operation::Clunk(_) => "clunk",
            Operation::List(_) => "list",
            Operation::Download(_) => "download",
            Operation::Upload(_) => "upload",
            Operation::Tidy(_) => "tidy",
        }
    }

    /// Step the machine with a demultiplexed reply. Rerror has already been
    /// converted to `Err(Error::Remote)` by the dispatcher.
    pub fn on_reply(self, ctx: &mut OpCtx<'_>, tag: u16, reply: Result<Rmsg>) -> Step {
        match self {
            Operation::Walk(op) => op.on_reply(ctx, reply),
            Operation::Open(op) => op.on_reply(ctx, reply),
            Operation::Create(op) => op.on_reply(ctx, reply),
            Operation::Read(op) => op.on_reply(reply),
            Operation::Write(op) => op.on_reply(reply),
            Operation::Stat(op) => op.on_reply(reply),
            Operation::Wstat(op) => op.on_reply(reply),
            Operation::Remove(op) => op.on_reply(ctx, reply),
            Operation::Clunk(op) => op.on_reply(ctx, reply),
            Operation::List(op) => op.on_reply(ctx, reply),
            Operation::Download(op) => op.on_reply(ctx, tag, reply),
            Operation::Upload(op) => op.on_reply(ctx, tag, reply),
            Operation::Tidy(op) => op.on_reply(ctx, reply),
        }
    }

    /// Cancel in place: clean up held resources and resolve the completion
    /// with `err`. Outstanding tags are flushed by the caller.
    pub fn cancel(self, ctx: &mut OpCtx<'_>, err: Error) {
        match self {
            Operation::Walk(mut op) => {
                op.seq.abandon(ctx);
                let _ = op.done.send(Err(err));
            }
            Operation::Open(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Create(op) => {
                // The fid points at the parent directory and would leak.
                ctx.send_tidy(op.fid);
                let _ = op.done.send(Err(err));
            }
            Operation::Read(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Write(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Stat(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Wstat(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Remove(op) => {
                // Outcome unknown; the fid is dropped locally either way.
                ctx.state.fids.release(op.fid);
                let _ = op.done.send(Err(err));
            }
            Operation::Clunk(op) => {
                ctx.state.fids.release(op.fid);
                let _ = op.done.send(Err(err));
            }
            Operation::List(op) => op.cancel(ctx, err),
            Operation::Download(op) => op.cancel(err),
            Operation::Upload(op) => op.cancel(ctx, err),
            Operation::Tidy(op) => {
                ctx.state.fids.release(op.fid);
            }
        }
    }

    /// Resolve with an error during connection teardown. No wire traffic,
    /// no table changes: the tables die with the connection.
    pub fn resolve_err(self, err: Error) {
        match self {
            Operation::Walk(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Open(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Create(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Read(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Write(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Stat(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Wstat(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Remove(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Clunk(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::List(op) => {
                let _ = op.done.send(Err(err));
            }
            Operation::Download(op) => op.resolve_err(err),
            Operation::Upload(op) => op.resolve_err(err),
            Operation::Tidy(_) => {}
        }
    }
}

fn unexpected_reply(request: &str, got: &Rmsg) -> Error {
    Error::Consistency(format!("{request} answered with {}", got.name()))
}

/// Effective I/O unit: servers may advertise 0, meaning "anything that fits
/// in a message".
pub(crate) fn effective_iounit(msize: u32, iounit: u32) -> u32 {
    if iounit == 0 {
        msize - IOHDRSZ
    } else {
        iounit
    }
}

// =============================================================================
// Walk sequence
// =============================================================================

/// Shared walk logic: resolves a path from a source fid onto a freshly
/// allocated fid, in chunks of at most MAXWELEM elements. The first chunk
/// walks from the source; once any chunk succeeds the destination fid is
/// bound and later chunks walk it forward in place.
pub(crate) struct WalkSeq {
    source: u32,
    pub newfid: u32,
    names: Vec<String>,
    resolved: usize,
    issued: usize,
    last_qid: Qid,
    started: bool,
}

pub(crate) enum WalkProgress {
    Continue,
    Done { qid: Qid },
}

impl WalkSeq {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        source: u32,
        base_qid: Qid,
        names: Vec<String>,
    ) -> Result<WalkSeq> {
        let newfid = ctx.state.fids.alloc()?;
        let mut seq = WalkSeq {
            source,
            newfid,
            names,
            resolved: 0,
            issued: 0,
            last_qid: base_qid,
            started: false,
        };
        if let Err(e) = seq.send_chunk(ctx) {
            ctx.state.fids.release(newfid);
            return Err(e);
        }
        Ok(seq)
    }

    fn send_chunk(&mut self, ctx: &mut OpCtx<'_>) -> Result<()> {
        let end = (self.resolved + MAXWELEM).min(self.names.len());
        let fid = if self.started { self.newfid } else { self.source };
        ctx.send(&Tmsg::Walk {
            fid,
            newfid: self.newfid,
            wnames: self.names[self.resolved..end].to_vec(),
        })?;
        self.issued = end;
        Ok(())
    }

    /// Give up on the destination fid. Before the first chunk succeeds it
    /// exists only in the local table; afterwards the server knows it too.
    pub fn abandon(&mut self, ctx: &mut OpCtx<'_>) {
        if self.started {
            ctx.send_tidy(self.newfid);
        } else {
            ctx.state.fids.release(self.newfid);
        }
    }

    pub fn on_reply(&mut self, ctx: &mut OpCtx<'_>, reply: Result<Rmsg>) -> Result<WalkProgress> {
        let wqids = match reply {
            Ok(Rmsg::Walk { wqids }) => wqids,
            Ok(other) => {
                self.abandon(ctx);
                return Err(unexpected_reply("Twalk", &other));
            }
            Err(e) => {
                self.abandon(ctx);
                // Rerror on a walk means its first element failed.
                return Err(match e {
                    Error::Remote(_) => Error::NotFound(self.names[self.resolved].clone()),
                    e => e,
                });
            }
        };

        let expected = self.issued - self.resolved;
        if wqids.len() > expected {
            self.abandon(ctx);
            return Err(Error::Consistency(format!(
                "walk returned {} qids for {expected} names",
                wqids.len()
            )));
        }
        if wqids.len() < expected {
            // Partial walk: this chunk did not move the destination fid.
            let missing = self.names[self.resolved + wqids.len()].clone();
            self.abandon(ctx);
            return Err(Error::NotFound(missing));
        }

        if let Some(qid) = wqids.last() {
            self.last_qid = *qid;
        }
        self.resolved = self.issued;
        self.started = true;

        if self.resolved == self.names.len() {
            if let Err(e) = ctx.state.fids.bind(self.newfid, self.last_qid) {
                self.abandon(ctx);
                return Err(e);
            }
            Ok(WalkProgress::Done { qid: self.last_qid })
        } else {
            if let Err(e) = self.send_chunk(ctx) {
                self.abandon(ctx);
                return Err(e);
            }
            Ok(WalkProgress::Continue)
        }
    }
}

// =============================================================================
// Walk
// =============================================================================

/// Bind a path onto a fresh fid. Completes with `(fid, qid)`.
pub(crate) struct WalkOp {
    seq: WalkSeq,
    done: oneshot::Sender<Result<(u32, Qid)>>,
}

impl WalkOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        source: u32,
        base_qid: Qid,
        names: Vec<String>,
        done: oneshot::Sender<Result<(u32, Qid)>>,
    ) -> Result<Operation> {
        let seq = WalkSeq::start(ctx, source, base_qid, names)?;
        Ok(Operation::Walk(WalkOp { seq, done }))
    }

    fn on_reply(mut self, ctx: &mut OpCtx<'_>, reply: Result<Rmsg>) -> Step {
        match self.seq.on_reply(ctx, reply) {
            Ok(WalkProgress::Continue) => Step::Continue(Operation::Walk(self)),
            Ok(WalkProgress::Done { qid }) => {
                let _ = self.done.send(Ok((self.seq.newfid, qid)));
                Step::Done
            }
            Err(e) => {
                let _ = self.done.send(Err(e));
                Step::Done
            }
        }
    }
}

// =============================================================================
// Open
// =============================================================================

/// Topen on a bound fid. Completes with `(qid, effective iounit)`.
pub(crate) struct OpenOp {
    fid: u32,
    mode: OpenMode,
    done: oneshot::Sender<Result<(Qid, u32)>>,
}

impl OpenOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        mode: OpenMode,
        done: oneshot::Sender<Result<(Qid, u32)>>,
    ) -> Result<Operation> {
        ctx.send(&Tmsg::Open { fid, mode })?;
        Ok(Operation::Open(OpenOp { fid, mode, done }))
    }

    fn on_reply(self, ctx: &mut OpCtx<'_>, reply: Result<Rmsg>) -> Step {
        let out = match reply {
            Ok(Rmsg::Open { qid, iounit }) => {
                let iounit = effective_iounit(ctx.state.msize, iounit);
                ctx.state
                    .fids
                    .open(self.fid, qid, self.mode, iounit)
                    .map(|_| (qid, iounit))
            }
            Ok(other) => Err(unexpected_reply("Topen", &other)),
            Err(e) => Err(e),
        };
        let _ = self.done.send(out);
        Step::Done
    }
}

// =============================================================================
// Create
// =============================================================================

/// Tcreate on a fid bound to the parent directory. On success the fid moves
/// to the created file, already open. On failure the fid still points at
/// the parent and is clunked so it cannot leak.
pub(crate) struct CreateOp {
    fid: u32,
    mode: OpenMode,
    done: oneshot::Sender<Result<(Qid, u32)>>,
}

impl CreateOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        name: String,
        perm: u32,
        mode: OpenMode,
        done: oneshot::Sender<Result<(Qid, u32)>>,
    ) -> Result<Operation> {
        if let Err(e) = ctx.send(&Tmsg::Create {
            fid,
            name,
            perm,
            mode,
        }) {
            ctx.send_tidy(fid);
            return Err(e);
        }
        Ok(Operation::Create(CreateOp { fid, mode, done }))
    }

    fn on_reply(self, ctx: &mut OpCtx<'_>, reply: Result<Rmsg>) -> Step {
        let out = match reply {
            Ok(Rmsg::Create { qid, iounit }) => {
                let iounit = effective_iounit(ctx.state.msize, iounit);
                ctx.state
                    .fids
                    .bind(self.fid, qid)
                    .and_then(|_| ctx.state.fids.open(self.fid, qid, self.mode, iounit))
                    .map(|_| (qid, iounit))
            }
            Ok(other) => {
                ctx.send_tidy(self.fid);
                Err(unexpected_reply("Tcreate", &other))
            }
            Err(e) => {
                ctx.send_tidy(self.fid);
                Err(e)
            }
        };
        let _ = self.done.send(out);
        Step::Done
    }
}

// =============================================================================
// Read / Write
// =============================================================================

/// Single Tread. Completes with the returned bytes; empty means EOF.
pub(crate) struct ReadOp {
    count: u32,
    done: oneshot::Sender<Result<Bytes>>,
}

impl ReadOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        offset: u64,
        count: u32,
        done: oneshot::Sender<Result<Bytes>>,
    ) -> Result<Operation> {
        ctx.send(&Tmsg::Read { fid, offset, count })?;
        Ok(Operation::Read(ReadOp { count, done }))
    }

    fn on_reply(self, reply: Result<Rmsg>) -> Step {
        let out = match reply {
            Ok(Rmsg::Read { data }) => {
                if data.len() > self.count as usize {
                    Err(Error::Consistency(format!(
                        "read returned {} bytes for a request of {}",
                        data.len(),
                        self.count
                    )))
                } else {
                    Ok(data)
                }
            }
            Ok(other) => Err(unexpected_reply("Tread", &other)),
            Err(e) => Err(e),
        };
        let _ = self.done.send(out);
        Step::Done
    }
}

/// Single Twrite. Writes are all-or-nothing: a short count is an error.
pub(crate) struct WriteOp {
    expected: u32,
    done: oneshot::Sender<Result<u32>>,
}

impl WriteOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        offset: u64,
        data: Bytes,
        done: oneshot::Sender<Result<u32>>,
    ) -> Result<Operation> {
        let expected = data.len() as u32;
        ctx.send(&Tmsg::Write { fid, offset, data })?;
        Ok(Operation::Write(WriteOp { expected, done }))
    }

    fn on_reply(self, reply: Result<Rmsg>) -> Step {
        let out = match reply {
            Ok(Rmsg::Write { count }) => {
                if count != self.expected {
                    Err(Error::Consistency(format!(
                        "short write: {count} of {} bytes accepted",
                        self.expected
                    )))
                } else {
                    Ok(count)
                }
            }
            Ok(other) => Err(unexpected_reply("Twrite", &other)),
            Err(e) => Err(e),
        };
        let _ = self.done.send(out);
        Step::Done
    }
}

// =============================================================================
// Stat / Wstat
// =============================================================================

pub(crate) struct StatOp {
    done: oneshot::Sender<Result<Stat>>,
}

impl StatOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        done: oneshot::Sender<Result<Stat>>,
    ) -> Result<Operation> {
        ctx.send(&Tmsg::Stat { fid })?;
        Ok(Operation::Stat(StatOp { done }))
    }

    fn on_reply(self, reply: Result<Rmsg>) -> Step {
        let out = match reply {
            Ok(Rmsg::Stat { stat }) => Ok(stat),
            Ok(other) => Err(unexpected_reply("Tstat", &other)),
            Err(e) => Err(e),
        };
        let _ = self.done.send(out);
        Step::Done
    }
}

pub(crate) struct WstatOp {
    done: oneshot::Sender<Result<()>>,
}

impl WstatOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        stat: Stat,
        done: oneshot::Sender<Result<()>>,
    ) -> Result<Operation> {
        ctx.send(&Tmsg::Wstat { fid, stat })?;
        Ok(Operation::Wstat(WstatOp { done }))
    }

    fn on_reply(self, reply: Result<Rmsg>) -> Step {
        let out = match reply {
            Ok(Rmsg::Wstat) => Ok(()),
            Ok(other) => Err(unexpected_reply("Twstat", &other)),
            Err(e) => Err(e),
        };
        let _ = self.done.send(out);
        Step::Done
    }
}

// =============================================================================
// Remove / Clunk / Tidy
// =============================================================================

/// Tremove invalidates the fid even when the server refuses the removal.
pub(crate) struct RemoveOp {
    fid: u32,
    done: oneshot::Sender<Result<()>>,
}

impl RemoveOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        done: oneshot::Sender<Result<()>>,
    ) -> Result<Operation> {
        ctx.send(&Tmsg::Remove { fid })?;
        Ok(Operation::Remove(RemoveOp { fid, done }))
    }

    fn on_reply(self, ctx: &mut OpCtx<'_>, reply: Result<Rmsg>) -> Step {
        ctx.state.fids.release(self.fid);
        let out = match reply {
            Ok(Rmsg::Remove) => Ok(()),
            Ok(other) => Err(unexpected_reply("Tremove", &other)),
            Err(e) => Err(e),
        };
        let _ = self.done.send(out);
        Step::Done
    }
}

/// Tclunk invalidates the fid even when the reply is Rerror.
pub(crate) struct ClunkOp {
    fid: u32,
    done: oneshot::Sender<Result<()>>,
}

impl ClunkOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        done: oneshot::Sender<Result<()>>,
    ) -> Result<Operation> {
        ctx.send(&Tmsg::Clunk { fid })?;
        Ok(Operation::Clunk(ClunkOp { fid, done }))
    }

    fn on_reply(self, ctx: &mut OpCtx<'_>, reply: Result<Rmsg>) -> Step {
        ctx.state.fids.release(self.fid);
        let out = match reply {
            Ok(Rmsg::Clunk) => Ok(()),
            Ok(other) => Err(unexpected_reply("Tclunk", &other)),
            Err(e) => Err(e),
        };
        let _ = self.done.send(out);
        Step::Done
    }
}

/// Fire-and-forget clunk for fids orphaned by failed or cancelled
/// operations. Failures are logged and swallowed: the primary outcome has
/// already been delivered elsewhere.
pub(crate) struct TidyOp {
    pub fid: u32,
}

impl TidyOp {
    fn on_reply(self, ctx: &mut OpCtx<'_>, reply: Result<Rmsg>) -> Step {
        ctx.state.fids.release(self.fid);
        if let Err(e) = reply {
            warn!(fid = self.fid, error = %e, "clunk of orphaned fid failed");
        }
        Step::Done
    }
}

// =============================================================================
// List
// =============================================================================

enum ListStage {
    /// Establishing a private fid for the directory (clone or fresh walk).
    Walking(WalkSeq),
    Opening,
    Reading,
    /// EOF reached on a fid this machine owns; clunking it.
    Closing,
}

/// Read a directory to EOF and parse whole stat records. If the caller's
/// fid was already open for reading it is used in place and left open;
/// otherwise the machine acquires its own fid and clunks it afterwards.
pub(crate) struct ListOp {
    stage: ListStage,
    fid: u32,
    owns_fid: bool,
    count: u32,
    offset: u64,
    entries: Vec<Stat>,
    done: oneshot::Sender<Result<Vec<Stat>>>,
}

impl ListOp {
    /// List through a fid that is already open for reading.
    pub fn start_on_open_fid(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        iounit: u32,
        done: oneshot::Sender<Result<Vec<Stat>>>,
    ) -> Result<Operation> {
        ctx.send(&Tmsg::Read {
            fid,
            offset: 0,
            count: iounit,
        })?;
        Ok(Operation::List(ListOp {
            stage: ListStage::Reading,
            fid,
            owns_fid: false,
            count: iounit,
            offset: 0,
            entries: Vec::new(),
            done,
        }))
    }

    /// List by acquiring a private fid: walk `names` from `source` (empty
    /// names clone a bound fid), open it read-only, read, clunk.
    pub fn start_walk(
        ctx: &mut OpCtx<'_>,
        source: u32,
        base_qid: Qid,
        names: Vec<String>,
        done: oneshot::Sender<Result<Vec<Stat>>>,
    ) -> Result<Operation> {
        let seq = WalkSeq::start(ctx, source, base_qid, names)?;
        let fid = seq.newfid;
        Ok(Operation::List(ListOp {
            stage: ListStage::Walking(seq),
            fid,
            owns_fid: true,
            count: 0,
            offset: 0,
            entries: Vec::new(),
            done,
        }))
    }

    fn fail(self, ctx: &mut OpCtx<'_>, err: Error) -> Step {
        // In the walking stage the sequence already cleaned up after itself.
        if self.owns_fid && !matches!(self.stage, ListStage::Walking(_)) {
            ctx.send_tidy(self.fid);
        }
        let _ = self.done.send(Err(err));
        Step::Done
    }

    fn cancel(self, ctx: &mut OpCtx<'_>, err: Error) {
        match &self.stage {
            ListStage::Walking(_) => {
                if let ListStage::Walking(mut seq) = self.stage {
                    seq.abandon(ctx);
                    let _ = self.done.send(Err(err));
                }
            }
            ListStage::Opening | ListStage::Reading => {
                if self.owns_fid {
                    ctx.send_tidy(self.fid);
                }
                let _ = self.done.send(Err(err));
            }
            ListStage::Closing => {
                // The clunk may or may not land; drop the fid locally.
                ctx.state.fids.release(self.fid);
                let _ = self.done.send(Err(err));
            }
        }
    }

    fn on_reply(mut self, ctx: &mut OpCtx<'_>, reply: Result<Rmsg>) -> Step {
        match &mut self.stage {
            ListStage::Walking(seq) => match seq.on_reply(ctx, reply) {
                Ok(WalkProgress::Continue) => Step::Continue(Operation::List(self)),
                Ok(WalkProgress::Done { qid }) => {
                    if !qid.is_dir() {
                        return self.fail(ctx, Error::Consistency("not a directory".into()));
                    }
                    if let Err(e) = ctx.send(&Tmsg::Open {
                        fid: self.fid,
                        mode: OpenMode::READ,
                    }) {
                        return self.fail(ctx, e);
                    }
                    self.stage = ListStage::Opening;
                    Step::Continue(Operation::List(self))
                }
                Err(e) => {
                    // The sequence released or tidied its fid already.
                    let _ = self.done.send(Err(e));
                    Step::Done
                }
            },
            ListStage::Opening => match reply {
                Ok(Rmsg::Open { qid, iounit }) => {
                    let iounit = effective_iounit(ctx.state.msize, iounit);
                    if let Err(e) = ctx.state.fids.open(self.fid, qid, OpenMode::READ, iounit) {
                        return self.fail(ctx, e);
                    }
                    self.count = iounit;
                    if let Err(e) = ctx.send(&Tmsg::Read {
                        fid: self.fid,
                        offset: 0,
                        count: iounit,
                    }) {
                        return self.fail(ctx, e);
                    }
                    self.stage = ListStage::Reading;
                    Step::Continue(Operation::List(self))
                }
                Ok(other) => {
                    let err = unexpected_reply("Topen", &other);
                    self.fail(ctx, err)
                }
                Err(e) => self.fail(ctx, e),
            },
            ListStage::Reading => match reply {
                Ok(Rmsg::Read { data }) => {
                    if data.len() > self.count as usize {
                        let err = Error::Consistency(format!(
                            "read returned {} bytes for a request of {}",
                            data.len(),
                            self.count
                        ));
                        return self.fail(ctx, err);
                    }
                    if data.is_empty() {
                        // EOF.
                        if self.owns_fid {
                            if let Err(e) = ctx.send(&Tmsg::Clunk { fid: self.fid }) {
                                return self.fail(ctx, e);
                            }
                            self.stage = ListStage::Closing;
                            return Step::Continue(Operation::List(self));
                        }
                        let _ = self.done.send(Ok(self.entries));
                        return Step::Done;
                    }
                    self.offset += data.len() as u64;
                    let parsed = match parse_dir(data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            let err = Error::Consistency(format!(
                                "directory read returned torn records: {e}"
                            ));
                            return self.fail(ctx, err);
                        }
                    };
                    self.entries.extend(parsed);
                    if let Err(e) = ctx.send(&Tmsg::Read {
                        fid: self.fid,
                        offset: self.offset,
                        count: self.count,
                    }) {
                        return self.fail(ctx, e);
                    }
                    Step::Continue(Operation::List(self))
                }
                Ok(other) => {
                    let err = unexpected_reply("Tread", &other);
                    self.fail(ctx, err)
                }
                Err(e) => self.fail(ctx, e),
            },
            ListStage::Closing => {
                ctx.state.fids.release(self.fid);
                if let Err(e) = reply {
                    warn!(fid = self.fid, error = %e, "clunk after directory listing failed");
                }
                let _ = self.done.send(Ok(self.entries));
                Step::Done
            }
        }
    }
}
