//! Incremental frame decoding over an ordered byte stream.
//!
//! `FrameReader` accepts bytes in whatever chunks the transport produces
//! and yields complete tagged messages. At most one message is under
//! construction at a time and no byte is examined twice; leftovers stay
//! buffered between calls.

use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::messages::{encode, Message};
use super::types::HEADER_LEN;

enum DecodeState {
    /// Waiting for the 7-byte size/type/tag header.
    Header,
    /// Header consumed; waiting for the body it announced.
    Body { mtype: u8, tag: u16, body_len: usize },
}

pub struct FrameReader<M> {
    buf: BytesMut,
    state: DecodeState,
    max_size: usize,
    _direction: PhantomData<M>,
}

impl<M: Message> FrameReader<M> {
    /// `max_size` is the negotiated (or proposed) msize: frames claiming to
    /// be larger are a protocol violation, checked before any allocation.
    pub fn new(max_size: u32) -> Self {
        FrameReader {
            buf: BytesMut::with_capacity(HEADER_LEN),
            state: DecodeState::Header,
            max_size: max_size as usize,
            _direction: PhantomData,
        }
    }

    /// Tighten the size bound after version negotiation settles on a
    /// smaller msize.
    pub fn set_max_size(&mut self, max_size: u32) {
        self.max_size = max_size as usize;
    }

    /// Append transport bytes. Chunk boundaries carry no meaning.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Yield the next complete message, or `Ok(None)` if more bytes are
    /// needed. Errors are fatal to the stream: framing cannot resynchronize
    /// after a bad size field.
    pub fn try_next(&mut self) -> Result<Option<(u16, M)>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let size = self.buf.get_u32_le() as usize;
                    let mtype = self.buf.get_u8();
                    let tag = self.buf.get_u16_le();
                    if size < HEADER_LEN {
                        return Err(Error::Protocol(format!(
                            "frame size {size} smaller than its header"
                        )));
                    }
                    if size > self.max_size {
                        return Err(Error::Protocol(format!(
                            "frame size {size} exceeds negotiated msize {}",
                            self.max_size
                        )));
                    }
                    self.state = DecodeState::Body {
                        mtype,
                        tag,
                        body_len: size - HEADER_LEN,
                    };
                }
                DecodeState::Body {
                    mtype,
                    tag,
                    body_len,
                } => {
                    if self.buf.len() < body_len {
                        return Ok(None);
                    }
                    let body = self.buf.split_to(body_len).freeze();
                    self.state = DecodeState::Header;
                    let msg = M::decode_body(mtype, body)?;
                    return Ok(Some((tag, msg)));
                }
            }
        }
    }
}

// =============================================================================
// Stream helpers
// =============================================================================

/// Read exactly one tagged message from a stream.
pub async fn read_message<R, M>(r: &mut R, max_size: u32) -> Result<(u16, M)>
where
    R: AsyncRead + Unpin,
    M: Message,
{
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).await?;

    let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mtype = header[4];
    let tag = u16::from_le_bytes([header[5], header[6]]);
    if size < HEADER_LEN {
        return Err(Error::Protocol(format!(
            "frame size {size} smaller than its header"
        )));
    }
    if size > max_size as usize {
        return Err(Error::Protocol(format!(
            "frame size {size} exceeds negotiated msize {max_size}"
        )));
    }

    let mut body = vec![0u8; size - HEADER_LEN];
    r.read_exact(&mut body).await?;
    let msg = M::decode_body(mtype, body.into())?;
    Ok((tag, msg))
}

/// Encode and write one tagged message.
pub async fn write_message<W, M>(w: &mut W, tag: u16, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let frame = encode(tag, msg)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::messages::{Rmsg, Tmsg};
    use crate::proto::types::DEFAULT_MSIZE;
    use bytes::Bytes;

    fn frames() -> Vec<(u16, Tmsg)> {
        vec![
            (
                !0,
                Tmsg::Version {
                    msize: 8216,
                    version: "9P2000".to_string(),
                },
            ),
            (
                1,
                Tmsg::Walk {
                    fid: 0,
                    newfid: 1,
                    wnames: vec!["date".to_string()],
                },
            ),
            (
                2,
                Tmsg::Write {
                    fid: 1,
                    offset: 0,
                    data: Bytes::from_static(b"payload bytes"),
                },
            ),
            (3, Tmsg::Clunk { fid: 1 }),
        ]
    }

    fn wire(frames: &[(u16, Tmsg)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, msg) in frames {
            out.extend_from_slice(&encode(*tag, msg).unwrap());
        }
        out
    }

    #[test]
    fn test_whole_stream_in_one_feed() {
        let expected = frames();
        let mut reader = FrameReader::<Tmsg>::new(DEFAULT_MSIZE);
        reader.feed(&wire(&expected));

        for (tag, msg) in &expected {
            let (got_tag, got) = reader.try_next().unwrap().unwrap();
            assert_eq!(got_tag, *tag);
            assert_eq!(&got, msg);
        }
        assert!(reader.try_next().unwrap().is_none());
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_feed() {
        let expected = frames();
        let stream = wire(&expected);

        let mut reader = FrameReader::<Tmsg>::new(DEFAULT_MSIZE);
        let mut got = Vec::new();
        for byte in &stream {
            reader.feed(std::slice::from_ref(byte));
            while let Some(frame) = reader.try_next().unwrap() {
                got.push(frame);
            }
        }

        assert_eq!(got.len(), expected.len());
        for ((gt, gm), (et, em)) in got.iter().zip(expected.iter()) {
            assert_eq!(gt, et);
            assert_eq!(gm, em);
        }
    }

    #[test]
    fn test_split_across_header_boundary() {
        let expected = frames();
        let stream = wire(&expected);

        // Split mid-header of the second frame.
        let first_len = encode(expected[0].0, &expected[0].1).unwrap().len();
        let cut = first_len + 3;

        let mut reader = FrameReader::<Tmsg>::new(DEFAULT_MSIZE);
        reader.feed(&stream[..cut]);
        assert!(reader.try_next().unwrap().is_some());
        assert!(reader.try_next().unwrap().is_none());

        reader.feed(&stream[cut..]);
        let mut rest = 0;
        while reader.try_next().unwrap().is_some() {
            rest += 1;
        }
        assert_eq!(rest, expected.len() - 1);
    }

    #[test]
    fn test_undersized_frame_rejected() {
        let mut reader = FrameReader::<Tmsg>::new(DEFAULT_MSIZE);
        reader.feed(&[6, 0, 0, 0, 120, 0, 0]);
        assert!(reader.try_next().is_err());
    }

    #[test]
    fn test_oversized_frame_rejected_before_body_arrives() {
        let mut reader = FrameReader::<Tmsg>::new(64);
        // Claims 1 MiB; only the header has arrived.
        let mut header = Vec::new();
        header.extend_from_slice(&(1024u32 * 1024).to_le_bytes());
        header.push(116);
        header.extend_from_slice(&[0, 0]);
        reader.feed(&header);
        assert!(reader.try_next().is_err());
    }

    #[test]
    fn test_garbage_opcode_surfaces_decode_error() {
        let mut reader = FrameReader::<Tmsg>::new(DEFAULT_MSIZE);
        reader.feed(&[7, 0, 0, 0, 42, 1, 0]);
        assert!(reader.try_next().is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_message(&mut a, 7, &Rmsg::Write { count: 13 })
            .await
            .unwrap();
        let (tag, msg): (u16, Rmsg) = read_message(&mut b, DEFAULT_MSIZE).await.unwrap();
        assert_eq!(tag, 7);
        assert_eq!(msg, Rmsg::Write { count: 13 });
    }

    #[tokio::test]
    async fn test_stream_read_rejects_oversized() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(
            &mut a,
            1,
            &Rmsg::Read {
                data: Bytes::from(vec![0u8; 256]),
            },
        )
        .await
        .unwrap();

        let got: Result<(u16, Rmsg)> = read_message(&mut b, 64).await;
        assert!(got.is_err());
    }
}
