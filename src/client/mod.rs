//! Client side of the protocol: a multiplexing connection plus high-level
//! file handles.
//!
//! A [`Connection`] owns the stream and two background tasks; every request
//! in flight belongs to an explicit operation state machine stepped by the
//! reply dispatcher, so there is exactly one place where wire traffic meets
//! client state. [`StyxFile`] builds path-oriented conveniences on top:
//! open/create, reads and writes, directory listings, metadata edits and
//! windowed whole-file transfers.

mod conn;
mod file;
mod ops;
mod registry;
mod transfer;

pub use conn::{ClientConfig, Connection};
pub use file::{FileEvent, StyxFile, DEFAULT_CREATE_PERM};
