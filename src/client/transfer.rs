//! Windowed bulk transfers.
//!
//! Downloads keep a fixed window of Treads in flight and forward whatever
//! comes back, tagged with its file offset, to a pump that writes the
//! local sink. Uploads invert the flow: the machine hands out pull tokens,
//! one per free window slot, and a feeder answers each token with the next
//! chunk of local data.

use std::collections::HashMap;
use std::io::SeekFrom;

use bytes::Bytes;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proto::{Message, Rmsg, Tmsg};

use super::conn::OpCtx;
use super::ops::{Operation, Step};

// =============================================================================
// Download
// =============================================================================

struct PendingRead {
    offset: u64,
    count: u32,
}

/// Read a file to its end with `window` requests outstanding. Replies may
/// land out of order; each chunk carries its own offset. A short read gets
/// exactly one corrective request for the remainder, and a zero-length
/// reply marks the end of file.
pub(crate) struct DownloadOp {
    fid: u32,
    iounit: u32,
    window: usize,
    next_offset: u64,
    received: u64,
    outstanding: HashMap<u16, PendingRead>,
    eof: bool,
    chunks: mpsc::UnboundedSender<(u64, Bytes)>,
    done: oneshot::Sender<Result<u64>>,
}

impl DownloadOp {
    pub fn start(
        ctx: &mut OpCtx<'_>,
        fid: u32,
        iounit: u32,
        window: usize,
        chunks: mpsc::UnboundedSender<(u64, Bytes)>,
        done: oneshot::Sender<Result<u64>>,
    ) -> Result<Operation> {
        let mut op = DownloadOp {
            fid,
            iounit,
            window,
            next_offset: 0,
            received: 0,
            outstanding: HashMap::new(),
            eof: false,
            chunks,
            done,
        };
        op.fill_window(ctx)?;
        Ok(Operation::Download(op))
    }

    /// Issue reads until the window is full. Failing to refill with other
    /// requests still outstanding is not fatal; the window just runs
    /// narrower until the next acknowledgement.
    fn fill_window(&mut self, ctx: &mut OpCtx<'_>) -> Result<()> {
        while !self.eof && self.outstanding.len() < self.window {
            let count = self.iounit;
            match ctx.send(&Tmsg::Read {
                fid: self.fid,
                offset: self.next_offset,
                count,
            }) {
                Ok(tag) => {
                    self.outstanding.insert(
                        tag,
                        PendingRead {
                            offset: self.next_offset,
                            count,
                        },
                    );
                    self.next_offset += count as u64;
                }
                Err(e) => {
                    if self.outstanding.is_empty() {
                        return Err(e);
                    }
                    debug!(error = %e, "window refill deferred");
                    break;
                }
            }
        }
        Ok(())
    }

    fn fail(self, ctx: &mut OpCtx<'_>, err: Error) -> Step {
        ctx.flush_tags();
        let _ = self.done.send(Err(err));
        Step::Done
    }

    pub(crate) fn cancel(self, err: Error) {
        let _ = self.done.send(Err(err));
    }

    pub(crate) fn resolve_err(self, err: Error) {
        let _ = self.done.send(Err(err));
    }

    pub(crate) fn on_reply(mut self, ctx: &mut OpCtx<'_>, tag: u16, reply: Result<Rmsg>) -> Step {
        let Some(pending) = self.outstanding.remove(&tag) else {
            return self.fail(
                ctx,
                Error::Consistency("download reply on an untracked tag".to_string()),
            );
        };
        let data = match reply {
            Ok(Rmsg::Read { data }) => data,
            Ok(other) => {
                let err = Error::Consistency(format!("Tread answered with {}", other.name()));
                return self.fail(ctx, err);
            }
            Err(e) => return self.fail(ctx, e),
        };
        if data.len() > pending.count as usize {
            let err = Error::Consistency(format!(
                "read returned {} bytes for a request of {}",
                data.len(),
                pending.count
            ));
            return self.fail(ctx, err);
        }

        if data.is_empty() {
            self.eof = true;
        } else {
            let len = data.len() as u32;
            self.received += len as u64;
            if self.chunks.send((pending.offset, data)).is_err() {
                // The pump hung up; nobody wants the rest.
                return self.fail(ctx, Error::Cancelled);
            }
            if len < pending.count {
                // Short read. Ask once for the remainder; if this lands on
                // the end of file it comes back empty.
                match ctx.send(&Tmsg::Read {
                    fid: self.fid,
                    offset: pending.offset + len as u64,
                    count: pending.count - len,
                }) {
                    Ok(tag) => {
                        self.outstanding.insert(
                            tag,
                            PendingRead {
                                offset: pending.offset + len as u64,
                                count: pending.count - len,
                            },
                        );
                    }
                    Err(e) => return self.fail(ctx, e),
                }
            }
        }

        if !self.eof {
            if let Err(e) = self.fill_window(ctx) {
                return self.fail(ctx, e);
            }
        }
        if self.eof && self.outstanding.is_empty() {
            let _ = self.done.send(Ok(self.received));
            return Step::Done;
        }
        Step::Continue(Operation::Download(self))
    }
}

/// Write downloaded chunks into a seekable sink as they arrive, in whatever
/// order the window produces them. Returns the bytes written once the
/// chunk channel closes.
pub(crate) async fn pump_to_sink<W>(
    mut chunks: mpsc::UnboundedReceiver<(u64, Bytes)>,
    sink: &mut W,
) -> std::io::Result<u64>
where
    W: AsyncWrite + AsyncSeek + Unpin,
{
    let mut written = 0u64;
    while let Some((offset, data)) = chunks.recv().await {
        sink.seek(SeekFrom::Start(offset)).await?;
        sink.write_all(&data).await?;
        written += data.len() as u64;
    }
    sink.flush().await?;
    Ok(written)
}

// =============================================================================
// Upload
// =============================================================================

enum UploadStage {
    /// Accepting chunks and writing them.
    Streaming,
    /// Source drained and all data acknowledged; the zero-length
    /// end-of-file marker write is in flight.
    MarkerSent,
    /// Marker acknowledged; clunking the fid.
    Closing,
}

/// Stream local chunks to the server with `window` Twrites outstanding.
/// The machine owns its fid for the whole transfer: after the final data
/// acknowledgement it writes a zero-length marker, then clunks the fid, and
/// only then resolves. On any failure the fid is tidied away.
pub(crate) struct UploadOp {
    fid: u32,
    iounit: u32,
    stage: UploadStage,
    next_offset: u64,
    sent: u64,
    outstanding: HashMap<u16, u32>,
    source_eof: bool,
    pull: mpsc::UnboundedSender<()>,
    done: oneshot::Sender<Result<u64>>,
}

impl UploadOp {
    pub fn start(
        _ctx: &mut OpCtx<'_>,
        fid: u32,
        iounit: u32,
        window: usize,
        pull: mpsc::UnboundedSender<()>,
        done: oneshot::Sender<Result<u64>>,
    ) -> Result<Operation> {
        // Invite one chunk per window slot; acknowledgements reissue them.
        for _ in 0..window {
            let _ = pull.send(());
        }
        Ok(Operation::Upload(UploadOp {
            fid,
            iounit,
            stage: UploadStage::Streaming,
            next_offset: 0,
            sent: 0,
            outstanding: HashMap::new(),
            source_eof: false,
            pull,
            done,
        }))
    }

    fn fail(self, ctx: &mut OpCtx<'_>, err: Error) -> Step {
        ctx.flush_tags();
        self.release_fid(ctx);
        let _ = self.done.send(Err(err));
        Step::Done
    }

    fn release_fid(&self, ctx: &mut OpCtx<'_>) {
        if matches!(self.stage, UploadStage::Closing) {
            // A clunk is already in flight; whatever happens to it the fid
            // is dead on both sides.
            ctx.state.fids.release(self.fid);
        } else {
            ctx.send_tidy(self.fid);
        }
    }

    pub(crate) fn cancel(self, ctx: &mut OpCtx<'_>, err: Error) {
        self.release_fid(ctx);
        let _ = self.done.send(Err(err));
    }

    pub(crate) fn resolve_err(self, err: Error) {
        let _ = self.done.send(Err(err));
    }

    fn send_marker(&mut self, ctx: &mut OpCtx<'_>) -> Result<()> {
        let tag = ctx.send(&Tmsg::Write {
            fid: self.fid,
            offset: self.next_offset,
            data: Bytes::new(),
        })?;
        self.outstanding.insert(tag, 0);
        self.stage = UploadStage::MarkerSent;
        Ok(())
    }

    /// Feed the next chunk of local data; `None` means the source is
    /// drained.
    pub(crate) fn on_chunk(mut self, ctx: &mut OpCtx<'_>, chunk: Option<Bytes>) -> Step {
        let data = match chunk {
            Some(data) => data,
            None => {
                self.source_eof = true;
                if self.outstanding.is_empty() && matches!(self.stage, UploadStage::Streaming) {
                    if let Err(e) = self.send_marker(ctx) {
                        return self.fail(ctx, e);
                    }
                }
                return Step::Continue(Operation::Upload(self));
            }
        };
        if data.len() > self.iounit as usize {
            let err = Error::Consistency(format!(
                "upload chunk of {} bytes exceeds iounit {}",
                data.len(),
                self.iounit
            ));
            return self.fail(ctx, err);
        }
        let len = data.len() as u32;
        match ctx.send(&Tmsg::Write {
            fid: self.fid,
            offset: self.next_offset,
            data,
        }) {
            Ok(tag) => {
                self.outstanding.insert(tag, len);
                self.next_offset += len as u64;
                Step::Continue(Operation::Upload(self))
            }
            Err(e) => self.fail(ctx, e),
        }
    }

    pub(crate) fn on_reply(mut self, ctx: &mut OpCtx<'_>, tag: u16, reply: Result<Rmsg>) -> Step {
        if matches!(self.stage, UploadStage::Closing) {
            let out = match reply {
                Ok(Rmsg::Clunk) => Ok(self.sent),
                Ok(other) => Err(Error::Consistency(format!(
                    "Tclunk answered with {}",
                    other.name()
                ))),
                // An error at clunk can mean the server failed to commit
                // buffered data; surface it.
                Err(e) => Err(e),
            };
            ctx.state.fids.release(self.fid);
            let _ = self.done.send(out);
            return Step::Done;
        }

        let Some(expected) = self.outstanding.remove(&tag) else {
            return self.fail(
                ctx,
                Error::Consistency("upload reply on an untracked tag".to_string()),
            );
        };
        let count = match reply {
            Ok(Rmsg::Write { count }) => count,
            Ok(other) => {
                let err = Error::Consistency(format!("Twrite answered with {}", other.name()));
                return self.fail(ctx, err);
            }
            Err(e) => return self.fail(ctx, e),
        };
        if count != expected {
            let err = Error::Consistency(format!(
                "short write: {count} of {expected} bytes accepted"
            ));
            return self.fail(ctx, err);
        }
        self.sent += count as u64;

        if matches!(self.stage, UploadStage::MarkerSent) {
            // That was the end-of-file marker.
            match ctx.send(&Tmsg::Clunk { fid: self.fid }) {
                Ok(_) => {
                    self.stage = UploadStage::Closing;
                    return Step::Continue(Operation::Upload(self));
                }
                Err(e) => {
                    ctx.state.fids.release(self.fid);
                    let _ = self.done.send(Err(e));
                    return Step::Done;
                }
            }
        }

        if self.source_eof {
            if self.outstanding.is_empty() {
                if let Err(e) = self.send_marker(ctx) {
                    return self.fail(ctx, e);
                }
            }
        } else {
            // One slot freed, invite one more chunk.
            if self.pull.send(()).is_err() && self.outstanding.is_empty() {
                // Feeder vanished without signalling end of file.
                warn!(fid = self.fid, "upload feeder hung up mid-transfer");
                return self.fail(ctx, Error::Cancelled);
            }
        }
        Step::Continue(Operation::Upload(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::conn::{ConnState, Outbound};
    use crate::proto::{Message, DEFAULT_MSIZE, HEADER_LEN};
    use bytes::Buf;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    fn harness() -> (
        ConnState,
        UnboundedSender<Outbound>,
        UnboundedReceiver<Outbound>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnState::new(DEFAULT_MSIZE), tx, rx)
    }

    fn sent(rx: &mut UnboundedReceiver<Outbound>) -> (u16, Tmsg) {
        match rx.try_recv().expect("expected an outgoing frame") {
            Outbound::Frame(frame) => {
                let mut head = frame.slice(..HEADER_LEN);
                let _size = head.get_u32_le();
                let mtype = head.get_u8();
                let tag = head.get_u16_le();
                (tag, Tmsg::decode_body(mtype, frame.slice(HEADER_LEN..)).unwrap())
            }
            Outbound::Shutdown => panic!("unexpected shutdown"),
        }
    }

    fn reply(op: Operation, st: &mut ConnState, tx: &UnboundedSender<Outbound>, tag: u16, msg: Rmsg) -> Step {
        let mut ctx = OpCtx::new(st, tx, 1);
        op.on_reply(&mut ctx, tag, Ok(msg))
    }

    fn continue_or_panic(step: Step) -> Operation {
        match step {
            Step::Continue(op) => op,
            Step::Done => panic!("operation finished early"),
        }
    }

    #[test]
    fn test_download_keeps_window_full_and_resolves_at_eof() {
        let (mut st, tx, mut rx) = harness();
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = DownloadOp::start(&mut ctx, 7, 8, 2, chunk_tx, done_tx).unwrap();

        // Two reads in flight immediately.
        let (tag0, msg0) = sent(&mut rx);
        let (tag1, msg1) = sent(&mut rx);
        assert_eq!(msg0, Tmsg::Read { fid: 7, offset: 0, count: 8 });
        assert_eq!(msg1, Tmsg::Read { fid: 7, offset: 8, count: 8 });

        // Full chunk at 0: delivered, window refilled at 16.
        let op = continue_or_panic(reply(
            op,
            &mut st,
            &tx,
            tag0,
            Rmsg::Read { data: Bytes::from_static(b"01234567") },
        ));
        assert_eq!(chunk_rx.try_recv().unwrap(), (0, Bytes::from_static(b"01234567")));
        let (tag2, msg2) = sent(&mut rx);
        assert_eq!(msg2, Tmsg::Read { fid: 7, offset: 16, count: 8 });

        // Full chunk at 8, then empty replies drain the window.
        let op = continue_or_panic(reply(
            op,
            &mut st,
            &tx,
            tag1,
            Rmsg::Read { data: Bytes::from_static(b"89abcdef") },
        ));
        let (tag3, _) = sent(&mut rx);
        let op = continue_or_panic(reply(op, &mut st, &tx, tag2, Rmsg::Read { data: Bytes::new() }));
        let step = reply(op, &mut st, &tx, tag3, Rmsg::Read { data: Bytes::new() });
        assert!(matches!(step, Step::Done));

        assert_eq!(done_rx.try_recv().unwrap().unwrap(), 16);
        // Channel closed with the machine.
        assert_eq!(chunk_rx.try_recv().unwrap(), (8, Bytes::from_static(b"89abcdef")));
        assert!(chunk_rx.try_recv().is_err());
    }

    #[test]
    fn test_download_short_read_gets_one_corrective_request() {
        let (mut st, tx, mut rx) = harness();
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = DownloadOp::start(&mut ctx, 7, 8, 1, chunk_tx, done_tx).unwrap();
        let (tag0, _) = sent(&mut rx);

        // 5 of 8 bytes: a corrective read covers the remaining 3.
        let op = continue_or_panic(reply(
            op,
            &mut st,
            &tx,
            tag0,
            Rmsg::Read { data: Bytes::from_static(b"01234") },
        ));
        let (tag1, msg1) = sent(&mut rx);
        assert_eq!(msg1, Tmsg::Read { fid: 7, offset: 5, count: 3 });

        let op = continue_or_panic(reply(
            op,
            &mut st,
            &tx,
            tag1,
            Rmsg::Read { data: Bytes::from_static(b"567") },
        ));
        // Window advances to the next aligned offset afterwards.
        let (tag2, msg2) = sent(&mut rx);
        assert_eq!(msg2, Tmsg::Read { fid: 7, offset: 8, count: 8 });

        let step = reply(op, &mut st, &tx, tag2, Rmsg::Read { data: Bytes::new() });
        assert!(matches!(step, Step::Done));
        assert_eq!(done_rx.try_recv().unwrap().unwrap(), 8);
        assert_eq!(chunk_rx.try_recv().unwrap().0, 0);
        assert_eq!(chunk_rx.try_recv().unwrap(), (5, Bytes::from_static(b"567")));
    }

    #[test]
    fn test_upload_marker_then_clunk() {
        let (mut st, tx, mut rx) = harness();
        let fid = st.fids.alloc().unwrap();
        let (pull_tx, mut pull_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = UploadOp::start(&mut ctx, fid, 8, 2, pull_tx, done_tx).unwrap();
        assert!(pull_rx.try_recv().is_ok());
        assert!(pull_rx.try_recv().is_ok());
        assert!(pull_rx.try_recv().is_err());

        // Two chunks, then end of source.
        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = continue_or_panic(op_on_chunk(op, &mut ctx, Some(Bytes::from_static(b"01234567"))));
        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = continue_or_panic(op_on_chunk(op, &mut ctx, Some(Bytes::from_static(b"89ab"))));
        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = continue_or_panic(op_on_chunk(op, &mut ctx, None));

        let (tag0, msg0) = sent(&mut rx);
        let (tag1, msg1) = sent(&mut rx);
        assert_eq!(
            msg0,
            Tmsg::Write { fid, offset: 0, data: Bytes::from_static(b"01234567") }
        );
        assert_eq!(
            msg1,
            Tmsg::Write { fid, offset: 8, data: Bytes::from_static(b"89ab") }
        );

        // Acks drain the window; the source is done, so no new tokens.
        let op = continue_or_panic(reply(op, &mut st, &tx, tag0, Rmsg::Write { count: 8 }));
        assert!(pull_rx.try_recv().is_err());
        let op = continue_or_panic(reply(op, &mut st, &tx, tag1, Rmsg::Write { count: 4 }));

        // Zero-length marker at the final offset, then the clunk.
        let (tag2, msg2) = sent(&mut rx);
        assert_eq!(msg2, Tmsg::Write { fid, offset: 12, data: Bytes::new() });
        let op = continue_or_panic(reply(op, &mut st, &tx, tag2, Rmsg::Write { count: 0 }));
        let (tag3, msg3) = sent(&mut rx);
        assert_eq!(msg3, Tmsg::Clunk { fid });
        let step = reply(op, &mut st, &tx, tag3, Rmsg::Clunk);
        assert!(matches!(step, Step::Done));

        assert_eq!(done_rx.try_recv().unwrap().unwrap(), 12);
        assert!(st.fids.get(fid).is_none());
    }

    #[test]
    fn test_upload_short_write_fails_and_tidies_fid() {
        let (mut st, tx, mut rx) = harness();
        let fid = st.fids.alloc().unwrap();
        let (pull_tx, mut pull_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = UploadOp::start(&mut ctx, fid, 8, 1, pull_tx, done_tx).unwrap();
        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = continue_or_panic(op_on_chunk(op, &mut ctx, Some(Bytes::from_static(b"01234567"))));
        let (tag0, _) = sent(&mut rx);

        let step = reply(op, &mut st, &tx, tag0, Rmsg::Write { count: 3 });
        assert!(matches!(step, Step::Done));
        assert!(matches!(
            done_rx.try_recv().unwrap().unwrap_err(),
            Error::Consistency(_)
        ));

        // The fid got a detached clunk and the feeder channel closed.
        let (_, msg) = sent(&mut rx);
        assert_eq!(msg, Tmsg::Clunk { fid });
        while pull_rx.try_recv().is_ok() {}
        assert!(matches!(
            pull_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_upload_of_empty_source() {
        let (mut st, tx, mut rx) = harness();
        let fid = st.fids.alloc().unwrap();
        let (pull_tx, _pull_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = UploadOp::start(&mut ctx, fid, 8, 2, pull_tx, done_tx).unwrap();
        let mut ctx = OpCtx::new(&mut st, &tx, 1);
        let op = continue_or_panic(op_on_chunk(op, &mut ctx, None));

        let (tag0, msg0) = sent(&mut rx);
        assert_eq!(msg0, Tmsg::Write { fid, offset: 0, data: Bytes::new() });
        let op = continue_or_panic(reply(op, &mut st, &tx, tag0, Rmsg::Write { count: 0 }));
        let (tag1, _) = sent(&mut rx);
        let step = reply(op, &mut st, &tx, tag1, Rmsg::Clunk);
        assert!(matches!(step, Step::Done));
        assert_eq!(done_rx.try_recv().unwrap().unwrap(), 0);
    }

    fn op_on_chunk(op: Operation, ctx: &mut OpCtx<'_>, chunk: Option<Bytes>) -> Step {
        match op {
            Operation::Upload(op) => op.on_chunk(ctx, chunk),
            _ => panic!("not an upload"),
        }
    }

    #[tokio::test]
    async fn test_pump_writes_chunks_at_their_offsets() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send((8, Bytes::from_static(b"89abcdef"))).unwrap();
        tx.send((0, Bytes::from_static(b"01234567"))).unwrap();
        drop(tx);

        let mut sink = std::io::Cursor::new(Vec::new());
        let written = pump_to_sink(rx, &mut sink).await.unwrap();
        assert_eq!(written, 16);
        assert_eq!(sink.into_inner(), b"0123456789abcdef");
    }
}
