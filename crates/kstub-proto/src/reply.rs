//! Reply payload construction.

use std::fmt;

/// `E nn` error codes reported to the debugger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Arguments could not be parsed or are out of range.
    InvalidArgument = 0x01,
    /// Unknown or disabled thread/CPU id.
    InvalidThread = 0x02,
    /// Memory could not be read or written.
    MemoryFault = 0x03,
    /// No free hardware breakpoint/watchpoint slot.
    SlotsExhausted = 0x04,
    /// The hardware refused to program (or clear) a slot.
    HardwareRejected = 0x05,
    /// Register or memory access on a CPU that is not halted.
    CpuRunning = 0x06,
    /// JIT memory could not be allocated.
    AllocationFailed = 0x07,
    /// Deallocation of an address that was never allocated.
    UnknownAllocation = 0x08,
}

impl ErrorCode {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:02x}", self.code())
    }
}

/// An unframed reply payload.
///
/// An empty reply is the protocol's "command not supported" answer.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Reply {
    buf: Vec<u8>,
}

impl Reply {
    /// Empty ("unsupported") reply.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok() -> Self {
        Self::from("OK")
    }

    pub fn error(code: ErrorCode) -> Self {
        Self::from(code.to_string().as_str())
    }

    pub fn push_str(&mut self, text: &str) -> &mut Self {
        self.buf.extend_from_slice(text.as_bytes());
        self
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Append bytes as lowercase hex, two digits per byte.
    pub fn push_hex(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(hex::encode(bytes).as_bytes());
        self
    }

    /// Append a number as minimal-width lowercase hex.
    pub fn push_num(&mut self, value: u64) -> &mut Self {
        self.push_str(&format!("{value:x}"))
    }

    /// Append a 64-bit address at the target's fixed word width.
    pub fn push_addr(&mut self, value: u64) -> &mut Self {
        self.push_str(&format!("{value:016x}"))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Self {
            buf: text.as_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reply({:?})", String::from_utf8_lossy(&self.buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_format() {
        assert_eq!(Reply::error(ErrorCode::InvalidArgument).as_bytes(), b"E01");
        assert_eq!(Reply::error(ErrorCode::SlotsExhausted).as_bytes(), b"E04");
        assert_eq!(ErrorCode::UnknownAllocation.to_string(), "E08");
    }

    #[test]
    fn test_numbers() {
        let mut reply = Reply::new();
        reply.push_num(0x1000).push_str(",").push_addr(0xdead);
        assert_eq!(reply.as_bytes(), b"1000,000000000000dead");
    }

    #[test]
    fn test_hex_is_lowercase() {
        let mut reply = Reply::new();
        reply.push_hex(&[0xab, 0x01, 0xff]);
        assert_eq!(reply.as_bytes(), b"ab01ff");
    }

    #[test]
    fn test_empty_means_unsupported() {
        assert!(Reply::new().is_empty());
        assert!(!Reply::ok().is_empty());
    }
}
