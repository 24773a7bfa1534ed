// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Dubbo RPC wire protocol: Hessian-2 object serialization, Dubbo frame
//! codec, and the client/server connection state machine.
//!
//! Serialization id `0x02` (Hessian-2) is the only one this crate speaks;
//! anything else on the wire is a [`ProtocolError::UnsupportedSerialization`].

pub mod client;
pub mod descriptor;
pub mod frame;
pub mod generic;
pub mod hessian;
pub mod primitive;
pub mod registration;
pub mod server;

use std::fmt;

pub use frame::{HeartbeatRequest, HeartbeatResponse, Message, Request, Response};
pub use hessian::{ClassDef, Instance, ListValue, Value};

/// Dubbo status codes.
pub mod status {
    pub const OK: u8 = 20;
    pub const UNKNOWN_ERROR: u8 = 90;
}

/// The only serialization id this crate implements.
pub const HESSIAN2_SERIALIZATION_ID: u8 = 0x02;

/// Top-level crate error.
#[derive(Debug)]
pub enum Error {
    /// A failure decoding or encoding the wire format, before any
    /// connection-level concern applies.
    Protocol(ProtocolError),
    /// The underlying TCP stream failed.
    Transport(std::io::Error),
    /// `sendRequestAndAwait` did not get a response within its timeout.
    Timeout,
    /// The peer closed the connection (EOF on read or write).
    ConnectionClosed,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Protocol-layer decode/encode failures.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// A read ran out of bytes inside the bounded per-frame buffer.
    Truncated,
    /// An unrecognised Hessian-2 tag byte.
    UnknownTag(u8),
    /// A recognised but unimplemented tag (`0x55`, `0x57`).
    Unimplemented(u8),
    /// The frame's serialization id was not `0x02`.
    UnsupportedSerialization(u8),
    /// A 4-byte (non-BMP) UTF-8 lead byte, which the char reader does not
    /// handle.
    MalformedChar,
    /// An instance tag (`0x60..0x6f`) referenced a class-definition slot
    /// that was never written in this decode.
    ClassRefMissing(usize),
    /// A value back-reference (`Q`, `0x51`) referenced an object-reference
    /// slot that does not exist yet in this decode.
    ObjectRefMissing(usize),
    /// A list-terminator/end-of-map tag (`Z`, `0x5a`) was read as a bare
    /// value outside of a list/map loop.
    Eof,
    /// The encoder was given a value it does not know how to represent.
    Unencodable(&'static str),
    /// A generic-call type name has no typed-data converter.
    UnsupportedGenericType(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated frame"),
            Self::UnknownTag(t) => write!(f, "unknown hessian tag 0x{t:02x}"),
            Self::Unimplemented(t) => write!(f, "unimplemented hessian tag 0x{t:02x}"),
            Self::UnsupportedSerialization(id) => {
                write!(f, "unsupported serialization id 0x{id:02x}")
            }
            Self::MalformedChar => write!(f, "malformed utf-8 character"),
            Self::ClassRefMissing(idx) => write!(f, "class definition not found, idx: {idx}"),
            Self::ObjectRefMissing(idx) => write!(f, "object reference not found, idx: {idx}"),
            Self::Eof => write!(f, "end of map/list marker"),
            Self::Unencodable(kind) => write!(f, "cannot encode value of kind {kind}"),
            Self::UnsupportedGenericType(name) => {
                write!(f, "unsupported generic type \"{name}\"")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
