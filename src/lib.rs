//! Styx (9P2000) protocol stack: wire codec, async client, file-tree server.
//!
//! The crate splits along the protocol's natural seams:
//!
//! - [`proto`] holds the message types and the framing codec. It has no
//!   opinion about transports and is usable on its own.
//! - [`client`] multiplexes concurrent operations over one connection and
//!   hides fid and tag bookkeeping behind [`client::StyxFile`] handles.
//! - [`server`] answers requests out of a tree of [`server::Node`]
//!   implementations, with in-memory files and directories included.

pub mod client;
pub mod error;
pub mod proto;
pub mod server;

pub use client::{ClientConfig, Connection, FileEvent, StyxFile};
pub use error::{Error, Result};
pub use proto::{OpenMode, Qid, Stat};
pub use server::{MemDir, MemFile, Node, Server, ServerConfig};
