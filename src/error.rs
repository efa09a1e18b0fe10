//! Error taxonomy for the TFTP core (spec §7).
//!
//! Each variant maps to a wire [`crate::ErrorCode`] via [`Error::error_code`]
//! so the dispatcher and client can turn an internal failure into the ERROR
//! packet the peer expects, without control flow ever hardcoding wire
//! concerns.

use super::ErrorCode;
use std::io;
use std::net;
use std::string;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("file not found")]
    FileNotFound,

    #[error("access violation: {0}")]
    AccessViolation(&'static str),

    #[error("file already exists")]
    FileExists,

    #[error("option negotiation failed: {0}")]
    OptionNegotiationFailed(&'static str),

    #[error("timed out waiting for peer after {0} retries")]
    Timeout(u32),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown TID from {0}")]
    UnknownTid(net::SocketAddr),

    #[error("invalid address: {0}")]
    AddrParse(#[from] net::AddrParseError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid UTF-8 in packet field: {0}")]
    Utf8(#[from] string::FromUtf8Error),
}

impl Error {
    /// Maps this error to the wire error code a peer should be told about,
    /// per RFC 1350 §5 and RFC 2347 (OptionNegotiationFailed = 8).
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::FileNotFound => ErrorCode::FileNotFound,
            Error::AccessViolation(_) => ErrorCode::AccessViolation,
            Error::FileExists => ErrorCode::FileAlreadyExists,
            Error::OptionNegotiationFailed(_) => ErrorCode::OptionNotSupported,
            Error::MalformedPacket(_) | Error::ProtocolViolation(_) => ErrorCode::IllegalOp,
            Error::UnknownTid(_) => ErrorCode::UnknownTid,
            Error::Timeout(_) | Error::Io(_) | Error::AddrParse(_) | Error::Utf8(_)
            | Error::Config(_) => ErrorCode::NotDefined,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
