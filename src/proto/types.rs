//! Core wire types shared by requests and replies.
//!
//! All multi-byte integers are little-endian. Strings are length-prefixed
//! (u16 len + UTF-8). Stat records carry their own leading size so a
//! directory read can be split into whole records without lookahead.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Tag reserved for version negotiation.
pub const NOTAG: u16 = !0;

/// Fid value meaning "no fid" (the afid of an unauthenticated attach).
pub const NOFID: u32 = !0;

/// Bytes in every message header: size[4] type[1] tag[2].
pub const HEADER_LEN: usize = 7;

/// Room for a Twrite/Rread header inside a message:
/// size[4] type[1] tag[2] fid[4] offset[8] count[4] and change.
pub const IOHDRSZ: u32 = 24;

/// Maximum number of path elements a single Twalk may carry.
pub const MAXWELEM: usize = 16;

/// Protocol version spoken by this crate.
pub const VERSION: &str = "9P2000";

/// Default maximum message size proposed during version negotiation.
pub const DEFAULT_MSIZE: u32 = 8216;

/// Smallest msize either side will agree to. Anything lower cannot carry a
/// Twrite header plus one byte of data alongside ordinary stat traffic.
pub const MIN_MSIZE: u32 = 256;

// =============================================================================
// Buffer helpers
// =============================================================================

pub(crate) fn need(payload: &Bytes, n: usize, what: &str) -> Result<()> {
    if payload.remaining() < n {
        return Err(Error::Protocol(format!("{what} truncated")));
    }
    Ok(())
}

pub(crate) fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    need(payload, 2, what)?;
    let len = payload.get_u16_le() as usize;
    need(payload, len, what)?;
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| Error::Protocol(format!("{what}: invalid UTF-8")))
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Encoded length of a string field.
pub(crate) fn str_len(s: &str) -> usize {
    2 + s.len()
}

pub(crate) fn check_str(s: &str, what: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::Protocol(format!("{what} exceeds 65535 bytes")));
    }
    Ok(())
}

// =============================================================================
// Qid
// =============================================================================

bitflags::bitflags! {
    /// Type bits of a qid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QidType: u8 {
        const DIR    = 0x80;
        const APPEND = 0x40;
        const EXCL   = 0x20;
        const MOUNT  = 0x10;
        const AUTH   = 0x08;
        const FILE   = 0x00;
    }
}

/// Server-unique identity of a file: type bits, a version bumped on every
/// mutation, and a path number unique across the served tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub const WIRE_LEN: usize = 13;

    pub fn is_dir(&self) -> bool {
        self.typ.contains(QidType::DIR)
    }

    pub(crate) fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.typ.bits());
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.path);
    }

    pub(crate) fn get(payload: &mut Bytes) -> Result<Self> {
        need(payload, Self::WIRE_LEN, "qid")?;
        Ok(Qid {
            typ: QidType::from_bits_truncate(payload.get_u8()),
            version: payload.get_u32_le(),
            path: payload.get_u64_le(),
        })
    }
}

// =============================================================================
// Open modes and permissions
// =============================================================================

/// Mode byte of Topen/Tcreate: a two-bit access field plus flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(0);
    pub const WRITE: OpenMode = OpenMode(1);
    pub const RDWR: OpenMode = OpenMode(2);
    pub const EXEC: OpenMode = OpenMode(3);

    const TRUNC: u8 = 0x10;
    const RCLOSE: u8 = 0x40;

    pub fn from_bits(bits: u8) -> OpenMode {
        OpenMode(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Truncate the file to zero length on open.
    pub fn truncate(self) -> OpenMode {
        OpenMode(self.0 | Self::TRUNC)
    }

    /// Remove the file when the fid is clunked.
    pub fn remove_on_close(self) -> OpenMode {
        OpenMode(self.0 | Self::RCLOSE)
    }

    /// The two-bit access field, flags stripped.
    pub fn access(self) -> u8 {
        self.0 & 0x03
    }

    pub fn is_truncate(self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub fn is_remove_on_close(self) -> bool {
        self.0 & Self::RCLOSE != 0
    }

    pub fn wants_read(self) -> bool {
        matches!(self.access(), 0 | 2)
    }

    pub fn wants_write(self) -> bool {
        matches!(self.access(), 1 | 2) || self.is_truncate()
    }

    pub fn wants_exec(self) -> bool {
        self.access() == 3
    }
}

/// Directory bit in Stat.mode and Tcreate perm.
pub const DMDIR: u32 = 1 << 31;
/// Append-only bit.
pub const DMAPPEND: u32 = 1 << 30;
/// Exclusive-use bit.
pub const DMEXCL: u32 = 1 << 29;
/// Authentication-file bit.
pub const DMAUTH: u32 = 1 << 27;

// =============================================================================
// Stat
// =============================================================================

/// Machine-independent directory entry, the payload of Rstat/Twstat and the
/// record type of directory reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Stat {
    /// Total encoded length including the leading 2-byte size field.
    pub fn wire_len(&self) -> usize {
        2 + 2
            + 4
            + Qid::WIRE_LEN
            + 4
            + 4
            + 4
            + 8
            + str_len(&self.name)
            + str_len(&self.uid)
            + str_len(&self.gid)
            + str_len(&self.muid)
    }

    pub(crate) fn put(&self, buf: &mut BytesMut) {
        buf.put_u16_le((self.wire_len() - 2) as u16);
        buf.put_u16_le(self.typ);
        buf.put_u32_le(self.dev);
        self.qid.put(buf);
        buf.put_u32_le(self.mode);
        buf.put_u32_le(self.atime);
        buf.put_u32_le(self.mtime);
        buf.put_u64_le(self.length);
        put_str(buf, &self.name);
        put_str(buf, &self.uid);
        put_str(buf, &self.gid);
        put_str(buf, &self.muid);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.put(&mut buf);
        buf.freeze()
    }

    pub(crate) fn get(payload: &mut Bytes) -> Result<Self> {
        need(payload, 2, "stat")?;
        let size = payload.get_u16_le() as usize;
        need(payload, size, "stat")?;
        let mut body = payload.split_to(size);

        need(&body, 2 + 4 + Qid::WIRE_LEN + 4 + 4 + 4 + 8, "stat fields")?;
        let typ = body.get_u16_le();
        let dev = body.get_u32_le();
        let qid = Qid::get(&mut body)?;
        let mode = body.get_u32_le();
        let atime = body.get_u32_le();
        let mtime = body.get_u32_le();
        let length = body.get_u64_le();
        let name = get_str(&mut body, "stat name")?;
        let uid = get_str(&mut body, "stat uid")?;
        let gid = get_str(&mut body, "stat gid")?;
        let muid = get_str(&mut body, "stat muid")?;

        Ok(Stat {
            typ,
            dev,
            qid,
            mode,
            atime,
            mtime,
            length,
            name,
            uid,
            gid,
            muid,
        })
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Self::get(&mut payload)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & DMDIR != 0
    }

    /// A wstat record that changes nothing: all-ones integers and empty
    /// strings are the "don't touch" sentinels. Set individual fields on
    /// the result to request changes.
    pub fn keep() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: Qid {
                typ: QidType::from_bits_truncate(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }
}

/// Split the payload of a directory read into whole stat records.
pub fn parse_dir(mut data: Bytes) -> Result<Vec<Stat>> {
    let mut entries = Vec::new();
    while data.has_remaining() {
        entries.push(Stat::get(&mut data)?);
    }
    Ok(entries)
}
