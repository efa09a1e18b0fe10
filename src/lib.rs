//! TFTP (RFC 1350) core: packet codec, session state machine, server
//! dispatcher and client, with RFC 2347/2348/2349 option negotiation.
//!
//! The crate is split the way the protocol is: [`packet`] is a pure codec,
//! [`options`] negotiates blksize/timeout/tsize, [`session`] holds the
//! per-transfer state machine, and [`server`]/[`client`] drive sessions to
//! completion over real sockets.

pub mod client;
pub mod config;
pub mod error;
pub mod options;
pub mod packet;
pub mod server;

mod file;
mod session;

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;

/// Size of a DATA/ACK header (2-byte opcode + 2-byte block number); used to
/// size receive buffers as `blksize + HEADER_LEN`.
const HEADER_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

/// Wire error codes, RFC 1350 §5 plus RFC 2347's OptionNotSupported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOp = 4,
    UnknownTid = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNotSupported = 8,
}

/// Invoked for every DATA and ERROR packet crossing a session (spec's
/// per-packet observer, §6/§9). A panic or long callback is the caller's
/// problem, not ours, but the callback must never abort the transfer —
/// sessions call it and discard the return value.
pub type Observer = Arc<dyn Fn(&packet::Packet) + Send + Sync>;

/// Per-session counters, mirrored from the Python original's `TftpMetrics`.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub bytes: u64,
    pub dupcount: u32,
    pub resent_bytes: u64,
    pub start: Option<Instant>,
    pub end: Option<Instant>,
}

impl Metrics {
    pub(crate) fn started() -> Metrics {
        Metrics {
            start: Some(Instant::now()),
            ..Default::default()
        }
    }
}

/// Where a session reads its outbound bytes from. Replaces the
/// file-or-file-like-or-"-" duck typing with an explicit sum type; the `"-"`
/// CLI convention is resolved to `Stdin` by the binary, never sniffed here.
pub enum DataSource {
    Path(PathBuf),
    Stdin,
    Reader(Box<dyn Read + Send>),
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Path(p) => write!(f, "DataSource::Path({})", p.display()),
            DataSource::Stdin => write!(f, "DataSource::Stdin"),
            DataSource::Reader(_) => write!(f, "DataSource::Reader(..)"),
        }
    }
}

/// Where a session writes its inbound bytes to. See [`DataSource`].
pub enum DataSink {
    Path(PathBuf),
    Stdout,
    Writer(Box<dyn Write + Send>),
}

impl fmt::Debug for DataSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSink::Path(p) => write!(f, "DataSink::Path({})", p.display()),
            DataSink::Stdout => write!(f, "DataSink::Stdout"),
            DataSink::Writer(_) => write!(f, "DataSink::Writer(..)"),
        }
    }
}
