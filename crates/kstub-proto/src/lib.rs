//! GDB Remote Serial Protocol wire layer.
//!
//! Everything here is stateless with respect to the debugged machine:
//! framing and checksums ([`codec`]), the thread-id convention ([`thread`]),
//! command parsing ([`command`]) and reply construction ([`reply`]).
//!
//! # Example
//!
//! ```
//! use kstub_proto::{Command, Event, PacketDecoder, encode};
//!
//! let mut decoder = PacketDecoder::new();
//! let events = decoder.feed(&encode(b"m1000,4"));
//! let Event::Packet(packet) = &events[0] else { unreachable!() };
//! assert!(packet.valid);
//! assert!(matches!(
//!     Command::parse(&packet.payload),
//!     Ok(Command::ReadMemory { address: 0x1000, length: 4 })
//! ));
//! ```

pub mod codec;
pub mod command;
pub mod reply;
pub mod thread;

pub use codec::{Event, INTERRUPT, Packet, PacketDecoder, checksum, encode, escape};
pub use command::{
    BreakpointSpec, BreakpointType, Command, Permissions, ResumeKind, ThreadOp, VContAction,
    WatchKind,
};
pub use reply::{ErrorCode, Reply};
pub use thread::ThreadId;

use thiserror::Error;

/// Command parsing errors.
///
/// A parse error means the command letter was recognized but its arguments
/// were not; the dispatcher answers these with [`ErrorCode::InvalidArgument`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid hex number in {0}")]
    InvalidNumber(&'static str),
    #[error("invalid hex data: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("invalid thread id")]
    InvalidThreadId,
    #[error("length mismatch: header says {expected} bytes, payload has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("invalid permissions: {0:?}")]
    InvalidPermissions(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Parse a hex number with no prefix and no width requirement.
pub(crate) fn parse_hex_u64(field: &[u8], name: &'static str) -> Result<u64> {
    if field.is_empty() {
        return Err(ParseError::MissingField(name));
    }
    let text = std::str::from_utf8(field).map_err(|_| ParseError::InvalidNumber(name))?;
    u64::from_str_radix(text, 16).map_err(|_| ParseError::InvalidNumber(name))
}

pub(crate) fn parse_hex_usize(field: &[u8], name: &'static str) -> Result<usize> {
    let value = parse_hex_u64(field, name)?;
    usize::try_from(value).map_err(|_| ParseError::InvalidNumber(name))
}
