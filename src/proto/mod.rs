//! Wire format: types, message codecs, and frame decoding.
//!
//! Frame format: size:u32 | type:u8 | tag:u16 | body (little-endian, size
//! includes the header). Requests and replies are separate sum types; the
//! frame reader is generic over the direction it decodes.

pub mod frame;
pub mod messages;
pub mod types;

pub use frame::{read_message, write_message, FrameReader};
pub use messages::{encode, message_name, Message, MessageType, Rmsg, Tmsg};
pub use types::{
    parse_dir, OpenMode, Qid, QidType, Stat, DEFAULT_MSIZE, DMAPPEND, DMAUTH, DMDIR, DMEXCL,
    HEADER_LEN, IOHDRSZ, MAXWELEM, MIN_MSIZE, NOFID, NOTAG, VERSION,
};
