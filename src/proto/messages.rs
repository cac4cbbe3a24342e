//! Request and reply message types with their binary layouts.
//!
//! Frame format: size:u32 | type:u8 | tag:u16 | body, size counts the whole
//! frame including itself. Requests (`Tmsg`) and replies (`Rmsg`) are
//! separate sum types so each side of a connection only ever decodes the
//! direction it expects; an opcode from the wrong direction is a protocol
//! violation, not a wildcard.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

use super::types::{
    check_str, get_str, need, put_str, str_len, OpenMode, Qid, Stat, HEADER_LEN, MAXWELEM,
};

// =============================================================================
// Message Type Codes
// =============================================================================

/// Opcode space 100..=127, code 106 unused. Even codes are requests, the
/// following odd code is the matching reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            100 => Some(Self::Tversion),
            101 => Some(Self::Rversion),
            102 => Some(Self::Tauth),
            103 => Some(Self::Rauth),
            104 => Some(Self::Tattach),
            105 => Some(Self::Rattach),
            107 => Some(Self::Rerror),
            108 => Some(Self::Tflush),
            109 => Some(Self::Rflush),
            110 => Some(Self::Twalk),
            111 => Some(Self::Rwalk),
            112 => Some(Self::Topen),
            113 => Some(Self::Ropen),
            114 => Some(Self::Tcreate),
            115 => Some(Self::Rcreate),
            116 => Some(Self::Tread),
            117 => Some(Self::Rread),
            118 => Some(Self::Twrite),
            119 => Some(Self::Rwrite),
            120 => Some(Self::Tclunk),
            121 => Some(Self::Rclunk),
            122 => Some(Self::Tremove),
            123 => Some(Self::Rremove),
            124 => Some(Self::Tstat),
            125 => Some(Self::Rstat),
            126 => Some(Self::Twstat),
            127 => Some(Self::Rwstat),
            _ => None,
        }
    }
}

/// Name of an opcode for diagnostics, defined for unknown codes too.
pub fn message_name(b: u8) -> &'static str {
    match MessageType::from_u8(b) {
        Some(MessageType::Tversion) => "Tversion",
        Some(MessageType::Rversion) => "Rversion",
        Some(MessageType::Tauth) => "Tauth",
        Some(MessageType::Rauth) => "Rauth",
        Some(MessageType::Tattach) => "Tattach",
        Some(MessageType::Rattach) => "Rattach",
        Some(MessageType::Rerror) => "Rerror",
        Some(MessageType::Tflush) => "Tflush",
        Some(MessageType::Rflush) => "Rflush",
        Some(MessageType::Twalk) => "Twalk",
        Some(MessageType::Rwalk) => "Rwalk",
        Some(MessageType::Topen) => "Topen",
        Some(MessageType::Ropen) => "Ropen",
        Some(MessageType::Tcreate) => "Tcreate",
        Some(MessageType::Rcreate) => "Rcreate",
        Some(MessageType::Tread) => "Tread",
        Some(MessageType::Rread) => "Rread",
        Some(MessageType::Twrite) => "Twrite",
        Some(MessageType::Rwrite) => "Rwrite",
        Some(MessageType::Tclunk) => "Tclunk",
        Some(MessageType::Rclunk) => "Rclunk",
        Some(MessageType::Tremove) => "Tremove",
        Some(MessageType::Rremove) => "Rremove",
        Some(MessageType::Tstat) => "Tstat",
        Some(MessageType::Rstat) => "Rstat",
        Some(MessageType::Twstat) => "Twstat",
        Some(MessageType::Rwstat) => "Rwstat",
        None => "unknown",
    }
}

// =============================================================================
// Message trait
// =============================================================================

/// Implemented by both message directions so framing and transport code can
/// be generic over which side of the connection they serve.
pub trait Message: Sized + Send + std::fmt::Debug + 'static {
    fn mtype(&self) -> MessageType;
    /// Encoded length of the body, excluding the 7-byte header.
    fn body_len(&self) -> usize;
    fn put_body(&self, buf: &mut BytesMut);
    /// Refuse messages that cannot be represented on the wire.
    fn validate(&self) -> Result<()>;
    fn decode_body(mtype: u8, payload: Bytes) -> Result<Self>;

    fn name(&self) -> &'static str {
        message_name(self.mtype() as u8)
    }
}

/// Encode a tagged message into one complete wire frame.
pub fn encode<M: Message>(tag: u16, msg: &M) -> Result<Bytes> {
    msg.validate()?;
    let size = HEADER_LEN + msg.body_len();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32_le(size as u32);
    buf.put_u8(msg.mtype() as u8);
    buf.put_u16_le(tag);
    msg.put_body(&mut buf);
    debug_assert_eq!(buf.len(), size);
    Ok(buf.freeze())
}

fn unexpected(mtype: u8, side: &str) -> Error {
    Error::Protocol(format!(
        "unexpected message type {} ({mtype}) for {side}",
        message_name(mtype)
    ))
}

fn finish<M>(msg: M, payload: &Bytes, name: &str) -> Result<M> {
    if payload.has_remaining() {
        return Err(Error::Protocol(format!(
            "{name}: {} trailing bytes after body",
            payload.remaining()
        )));
    }
    Ok(msg)
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tmsg {
    Version {
        msize: u32,
        version: String,
    },
    Auth {
        afid: u32,
        uname: String,
        aname: String,
    },
    Attach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    Flush {
        oldtag: u16,
    },
    Walk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    Open {
        fid: u32,
        mode: OpenMode,
    },
    Create {
        fid: u32,
        name: String,
        perm: u32,
        mode: OpenMode,
    },
    Read {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Write {
        fid: u32,
        offset: u64,
        data: Bytes,
    },
    Clunk {
        fid: u32,
    },
    Remove {
        fid: u32,
    },
    Stat {
        fid: u32,
    },
    Wstat {
        fid: u32,
        stat: Stat,
    },
}

impl Message for Tmsg {
    fn mtype(&self) -> MessageType {
        match self {
            Tmsg::Version { .. } => MessageType::Tversion,
            Tmsg::Auth { .. } => MessageType::Tauth,
            Tmsg::Attach { .. } => MessageType::Tattach,
            Tmsg::Flush { .. } => MessageType::Tflush,
            Tmsg::Walk { .. } => MessageType::Twalk,
            Tmsg::Open { .. } => MessageType::Topen,
            Tmsg::Create { .. } => MessageType::Tcreate,
            Tmsg::Read { .. } => MessageType::Tread,
            Tmsg::Write { .. } => MessageType::Twrite,
            Tmsg::Clunk { .. } => MessageType::Tclunk,
            Tmsg::Remove { .. } => MessageType::Tremove,
            Tmsg::Stat { .. } => MessageType::Tstat,
            Tmsg::Wstat { .. } => MessageType::Twstat,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Tmsg::Version { version, .. } => 4 + str_len(version),
            Tmsg::Auth { uname, aname, .. } => 4 + str_len(uname) + str_len(aname),
            Tmsg::Attach { uname, aname, .. } => 4 + 4 + str_len(uname) + str_len(aname),
            Tmsg::Flush { .. } => 2,
            Tmsg::Walk { wnames, .. } => {
                4 + 4 + 2 + wnames.iter().map(|w| str_len(w)).sum::<usize>()
            }
            Tmsg::Open { .. } => 4 + 1,
            Tmsg::Create { name, .. } => 4 + str_len(name) + 4 + 1,
            Tmsg::Read { .. } => 4 + 8 + 4,
            Tmsg::Write { data, .. } => 4 + 8 + 4 + data.len(),
            Tmsg::Clunk { .. } | Tmsg::Remove { .. } | Tmsg::Stat { .. } => 4,
            Tmsg::Wstat { stat, .. } => 4 + 2 + stat.wire_len(),
        }
    }

    fn put_body(&self, buf: &mut BytesMut) {
        match self {
            Tmsg::Version { msize, version } => {
                buf.put_u32_le(*msize);
                put_str(buf, version);
            }
            Tmsg::Auth { afid, uname, aname } => {
                buf.put_u32_le(*afid);
                put_str(buf, uname);
                put_str(buf, aname);
            }
            Tmsg::Attach {
                fid,
                afid,
                uname,
                aname,
            } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*afid);
                put_str(buf, uname);
                put_str(buf, aname);
            }
            Tmsg::Flush { oldtag } => {
                buf.put_u16_le(*oldtag);
            }
            Tmsg::Walk {
                fid,
                newfid,
                wnames,
            } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*newfid);
                buf.put_u16_le(wnames.len() as u16);
                for wname in wnames {
                    put_str(buf, wname);
                }
            }
            Tmsg::Open { fid, mode } => {
                buf.put_u32_le(*fid);
                buf.put_u8(mode.bits());
            }
            Tmsg::Create {
                fid,
                name,
                perm,
                mode,
            } => {
                buf.put_u32_le(*fid);
                put_str(buf, name);
                buf.put_u32_le(*perm);
                buf.put_u8(mode.bits());
            }
            Tmsg::Read { fid, offset, count } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(*count);
            }
            Tmsg::Write { fid, offset, data } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            Tmsg::Clunk { fid } | Tmsg::Remove { fid } | Tmsg::Stat { fid } => {
                buf.put_u32_le(*fid);
            }
            Tmsg::Wstat { fid, stat } => {
                buf.put_u32_le(*fid);
                buf.put_u16_le(stat.wire_len() as u16);
                stat.put(buf);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Tmsg::Version { version, .. } => check_str(version, "version"),
            Tmsg::Auth { uname, aname, .. } | Tmsg::Attach { uname, aname, .. } => {
                check_str(uname, "uname")?;
                check_str(aname, "aname")
            }
            Tmsg::Walk { wnames, .. } => {
                if wnames.len() > MAXWELEM {
                    return Err(Error::Protocol(format!(
                        "walk of {} elements exceeds the limit of {MAXWELEM}",
                        wnames.len()
                    )));
                }
                for wname in wnames {
                    check_str(wname, "walk element")?;
                }
                Ok(())
            }
            Tmsg::Create { name, .. } => check_str(name, "create name"),
            Tmsg::Write { data, .. } => {
                if data.len() > u32::MAX as usize {
                    return Err(Error::Protocol("write data exceeds u32 count".into()));
                }
                Ok(())
            }
            Tmsg::Wstat { stat, .. } => {
                check_str(&stat.name, "stat name")?;
                check_str(&stat.uid, "stat uid")?;
                check_str(&stat.gid, "stat gid")?;
                check_str(&stat.muid, "stat muid")
            }
            _ => Ok(()),
        }
    }

    fn decode_body(mtype: u8, mut payload: Bytes) -> Result<Self> {
        let name = message_name(mtype);
        let msg = match MessageType::from_u8(mtype) {
            Some(MessageType::Tversion) => {
                need(&payload, 4, name)?;
                let msize = payload.get_u32_le();
                let version = get_str(&mut payload, "version")?;
                Tmsg::Version { msize, version }
            }
            Some(MessageType::Tauth) => {
                need(&payload, 4, name)?;
                let afid = payload.get_u32_le();
                let uname = get_str(&mut payload, "uname")?;
                let aname = get_str(&mut payload, "aname")?;
                Tmsg::Auth { afid, uname, aname }
            }
            Some(MessageType::Tattach) => {
                need(&payload, 8, name)?;
                let fid = payload.get_u32_le();
                let afid = payload.get_u32_le();
                let uname = get_str(&mut payload, "uname")?;
                let aname = get_str(&mut payload, "aname")?;
                Tmsg::Attach {
                    fid,
                    afid,
                    uname,
                    aname,
                }
            }
            Some(MessageType::Tflush) => {
                need(&payload, 2, name)?;
                Tmsg::Flush {
                    oldtag: payload.get_u16_le(),
                }
            }
            Some(MessageType::Twalk) => {
                need(&payload, 10, name)?;
                let fid = payload.get_u32_le();
                let newfid = payload.get_u32_le();
                let nwname = payload.get_u16_le() as usize;
                if nwname > MAXWELEM {
                    return Err(Error::Protocol(format!(
                        "walk of {nwname} elements exceeds the limit of {MAXWELEM}"
                    )));
                }
                let mut wnames = Vec::with_capacity(nwname);
                for _ in 0..nwname {
                    wnames.push(get_str(&mut payload, "walk element")?);
                }
                Tmsg::Walk {
                    fid,
                    newfid,
                    wnames,
                }
            }
            Some(MessageType::Topen) => {
                need(&payload, 5, name)?;
                let fid = payload.get_u32_le();
                let mode = OpenMode::from_bits(payload.get_u8());
                Tmsg::Open { fid, mode }
            }
            Some(MessageType::Tcreate) => {
                need(&payload, 4, name)?;
                let fid = payload.get_u32_le();
                let fname = get_str(&mut payload, "create name")?;
                need(&payload, 5, name)?;
                let perm = payload.get_u32_le();
                let mode = OpenMode::from_bits(payload.get_u8());
                Tmsg::Create {
                    fid,
                    name: fname,
                    perm,
                    mode,
                }
            }
            Some(MessageType::Tread) => {
                need(&payload, 16, name)?;
                Tmsg::Read {
                    fid: payload.get_u32_le(),
                    offset: payload.get_u64_le(),
                    count: payload.get_u32_le(),
                }
            }
            Some(MessageType::Twrite) => {
                need(&payload, 16, name)?;
                let fid = payload.get_u32_le();
                let offset = payload.get_u64_le();
                let count = payload.get_u32_le() as usize;
                need(&payload, count, "write data")?;
                let data = payload.copy_to_bytes(count);
                Tmsg::Write { fid, offset, data }
            }
            Some(MessageType::Tclunk) => {
                need(&payload, 4, name)?;
                Tmsg::Clunk {
                    fid: payload.get_u32_le(),
                }
            }
            Some(MessageType::Tremove) => {
                need(&payload, 4, name)?;
                Tmsg::Remove {
                    fid: payload.get_u32_le(),
                }
            }
            Some(MessageType::Tstat) => {
                need(&payload, 4, name)?;
                Tmsg::Stat {
                    fid: payload.get_u32_le(),
                }
            }
            Some(MessageType::Twstat) => {
                need(&payload, 6, name)?;
                let fid = payload.get_u32_le();
                let n = payload.get_u16_le() as usize;
                need(&payload, n, "wstat record")?;
                let mut record = payload.split_to(n);
                let stat = Stat::get(&mut record)?;
                if record.has_remaining() {
                    return Err(Error::Protocol("wstat record has trailing bytes".into()));
                }
                Tmsg::Wstat { fid, stat }
            }
            _ => return Err(unexpected(mtype, "a server")),
        };
        finish(msg, &payload, name)
    }
}

// =============================================================================
// Replies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rmsg {
    Version { msize: u32, version: String },
    Auth { aqid: Qid },
    Attach { qid: Qid },
    Error { ename: String },
    Flush,
    Walk { wqids: Vec<Qid> },
    Open { qid: Qid, iounit: u32 },
    Create { qid: Qid, iounit: u32 },
    Read { data: Bytes },
    Write { count: u32 },
    Clunk,
    Remove,
    Stat { stat: Stat },
    Wstat,
}

impl Message for Rmsg {
    fn mtype(&self) -> MessageType {
        match self {
            Rmsg::Version { .. } => MessageType::Rversion,
            Rmsg::Auth { .. } => MessageType::Rauth,
            Rmsg::Attach { .. } => MessageType::Rattach,
            Rmsg::Error { .. } => MessageType::Rerror,
            Rmsg::Flush => MessageType::Rflush,
            Rmsg::Walk { .. } => MessageType::Rwalk,
            Rmsg::Open { .. } => MessageType::Ropen,
            Rmsg::Create { .. } => MessageType::Rcreate,
            Rmsg::Read { .. } => MessageType::Rread,
            Rmsg::Write { .. } => MessageType::Rwrite,
            Rmsg::Clunk => MessageType::Rclunk,
            Rmsg::Remove => MessageType::Rremove,
            Rmsg::Stat { .. } => MessageType::Rstat,
            Rmsg::Wstat => MessageType::Rwstat,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Rmsg::Version { version, .. } => 4 + str_len(version),
            Rmsg::Auth { .. } | Rmsg::Attach { .. } => Qid::WIRE_LEN,
            Rmsg::Error { ename } => str_len(ename),
            Rmsg::Flush | Rmsg::Clunk | Rmsg::Remove | Rmsg::Wstat => 0,
            Rmsg::Walk { wqids } => 2 + Qid::WIRE_LEN * wqids.len(),
            Rmsg::Open { .. } | Rmsg::Create { .. } => Qid::WIRE_LEN + 4,
            Rmsg::Read { data } => 4 + data.len(),
            Rmsg::Write { .. } => 4,
            Rmsg::Stat { stat } => 2 + stat.wire_len(),
        }
    }

    fn put_body(&self, buf: &mut BytesMut) {
        match self {
            Rmsg::Version { msize, version } => {
                buf.put_u32_le(*msize);
                put_str(buf, version);
            }
            Rmsg::Auth { aqid } => aqid.put(buf),
            Rmsg::Attach { qid } => qid.put(buf),
            Rmsg::Error { ename } => put_str(buf, ename),
            Rmsg::Flush | Rmsg::Clunk | Rmsg::Remove | Rmsg::Wstat => {}
            Rmsg::Walk { wqids } => {
                buf.put_u16_le(wqids.len() as u16);
                for wqid in wqids {
                    wqid.put(buf);
                }
            }
            Rmsg::Open { qid, iounit } | Rmsg::Create { qid, iounit } => {
                qid.put(buf);
                buf.put_u32_le(*iounit);
            }
            Rmsg::Read { data } => {
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            Rmsg::Write { count } => {
                buf.put_u32_le(*count);
            }
            Rmsg::Stat { stat } => {
                buf.put_u16_le(stat.wire_len() as u16);
                stat.put(buf);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Rmsg::Version { version, .. } => check_str(version, "version"),
            Rmsg::Error { ename } => check_str(ename, "ename"),
            Rmsg::Walk { wqids } => {
                if wqids.len() > MAXWELEM {
                    return Err(Error::Protocol(format!(
                        "walk reply of {} qids exceeds the limit of {MAXWELEM}",
                        wqids.len()
                    )));
                }
                Ok(())
            }
            Rmsg::Read { data } => {
                if data.len() > u32::MAX as usize {
                    return Err(Error::Protocol("read data exceeds u32 count".into()));
                }
                Ok(())
            }
            Rmsg::Stat { stat } => {
                check_str(&stat.name, "stat name")?;
                check_str(&stat.uid, "stat uid")?;
                check_str(&stat.gid, "stat gid")?;
                check_str(&stat.muid, "stat muid")
            }
            _ => Ok(()),
        }
    }

    fn decode_body(mtype: u8, mut payload: Bytes) -> Result<Self> {
        let name = message_name(mtype);
        let msg = match MessageType::from_u8(mtype) {
            Some(MessageType::Rversion) => {
                need(&payload, 4, name)?;
                let msize = payload.get_u32_le();
                let version = get_str(&mut payload, "version")?;
                Rmsg::Version { msize, version }
            }
            Some(MessageType::Rauth) => Rmsg::Auth {
                aqid: Qid::get(&mut payload)?,
            },
            Some(MessageType::Rattach) => Rmsg::Attach {
                qid: Qid::get(&mut payload)?,
            },
            Some(MessageType::Rerror) => Rmsg::Error {
                ename: get_str(&mut payload, "ename")?,
            },
            Some(MessageType::Rflush) => Rmsg::Flush,
            Some(MessageType::Rwalk) => {
                need(&payload, 2, name)?;
                let nwqid = payload.get_u16_le() as usize;
                if nwqid > MAXWELEM {
                    return Err(Error::Protocol(format!(
                        "walk reply of {nwqid} qids exceeds the limit of {MAXWELEM}"
                    )));
                }
                let mut wqids = Vec::with_capacity(nwqid);
                for _ in 0..nwqid {
                    wqids.push(Qid::get(&mut payload)?);
                }
                Rmsg::Walk { wqids }
            }
            Some(MessageType::Ropen) => {
                let qid = Qid::get(&mut payload)?;
                need(&payload, 4, name)?;
                Rmsg::Open {
                    qid,
                    iounit: payload.get_u32_le(),
                }
            }
            Some(MessageType::Rcreate) => {
                let qid = Qid::get(&mut payload)?;
                need(&payload, 4, name)?;
                Rmsg::Create {
                    qid,
                    iounit: payload.get_u32_le(),
                }
            }
            Some(MessageType::Rread) => {
                need(&payload, 4, name)?;
                let count = payload.get_u32_le() as usize;
                need(&payload, count, "read data")?;
                Rmsg::Read {
                    data: payload.copy_to_bytes(count),
                }
            }
            Some(MessageType::Rwrite) => {
                need(&payload, 4, name)?;
                Rmsg::Write {
                    count: payload.get_u32_le(),
                }
            }
            Some(MessageType::Rclunk) => Rmsg::Clunk,
            Some(MessageType::Rremove) => Rmsg::Remove,
            Some(MessageType::Rstat) => {
                need(&payload, 2, name)?;
                let n = payload.get_u16_le() as usize;
                need(&payload, n, "stat record")?;
                let mut record = payload.split_to(n);
                let stat = Stat::get(&mut record)?;
                if record.has_remaining() {
                    return Err(Error::Protocol("stat record has trailing bytes".into()));
                }
                Rmsg::Stat { stat }
            }
            Some(MessageType::Rwstat) => Rmsg::Wstat,
            _ => return Err(unexpected(mtype, "a client")),
        };
        finish(msg, &payload, name)
    }
}
