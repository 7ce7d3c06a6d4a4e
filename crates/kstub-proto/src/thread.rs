//! Thread identifiers.
//!
//! Each CPU is presented to the debugger as one thread. Protocol thread ids
//! are 1-based (`cpu + 1`); `0` means "any thread" and `-1` means "all
//! threads".

use crate::{ParseError, Result, parse_hex_u64};

/// A thread id as written by the debugger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreadId {
    /// `-1`
    All,
    /// `0`
    Any,
    /// A specific CPU, already converted to its 0-based index.
    Cpu(usize),
}

impl ThreadId {
    /// Parse a thread id field (`-1`, `0`, or a positive hex id).
    pub fn parse(field: &[u8]) -> Result<Self> {
        if field == b"-1" {
            return Ok(Self::All);
        }
        let id = parse_hex_u64(field, "thread id").map_err(|_| ParseError::InvalidThreadId)?;
        match id {
            0 => Ok(Self::Any),
            n => usize::try_from(n - 1)
                .map(Self::Cpu)
                .map_err(|_| ParseError::InvalidThreadId),
        }
    }

    /// Protocol id for a CPU index.
    pub const fn protocol_id(cpu: usize) -> usize {
        cpu + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_ids() {
        assert_eq!(ThreadId::parse(b"-1"), Ok(ThreadId::All));
        assert_eq!(ThreadId::parse(b"0"), Ok(ThreadId::Any));
    }

    #[test]
    fn test_one_based_mapping() {
        assert_eq!(ThreadId::parse(b"1"), Ok(ThreadId::Cpu(0)));
        assert_eq!(ThreadId::parse(b"a"), Ok(ThreadId::Cpu(9)));
        assert_eq!(ThreadId::parse(b"0010"), Ok(ThreadId::Cpu(15)));
        assert_eq!(ThreadId::protocol_id(0), 1);
    }

    #[test]
    fn test_invalid_ids() {
        assert_eq!(ThreadId::parse(b""), Err(ParseError::InvalidThreadId));
        assert_eq!(ThreadId::parse(b"-2"), Err(ParseError::InvalidThreadId));
        assert_eq!(ThreadId::parse(b"xyz"), Err(ParseError::InvalidThreadId));
    }
}
