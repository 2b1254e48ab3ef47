//! Wire protocol: framing and message codecs.
//!
//! Every message starts with a 16-byte header of little-endian `i32`s
//! (length, request id, response-to id, opcode). `OP_MSG` is the primary
//! format; `OP_QUERY`/`OP_REPLY` are kept for legacy handshakes.

pub mod conn;
pub mod frame;
pub mod listener;
pub mod message;

use thiserror::Error;

use crate::bson::BsonError;
use crate::error::ErrorKind;

pub use frame::{read_frame, Frame, FrameLimits, Header, OpCode, HEADER_LEN};
pub use listener::Listener;
pub use message::{DocumentSequence, OpMsg, OpQuery, OpReply, Request};

/// Framing and message errors. All of them close the offending connection.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message length {len} is outside the allowed range {min}..={max}")]
    BadLength { len: i64, min: usize, max: usize },

    #[error("unsupported opcode {0}")]
    UnsupportedOpCode(i32),

    #[error("unsupported OP_MSG flags {0:#x}")]
    UnsupportedFlags(u32),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Bson(#[from] BsonError),
}

impl WireError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ProtocolError
    }
}

pub type WireResult<T> = Result<T, WireError>;

pub(crate) fn malformed(msg: impl Into<String>) -> WireError {
    WireError::Malformed(msg.into())
}
