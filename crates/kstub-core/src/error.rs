//! Engine and command error types.

use kstub_proto::{ErrorCode, ParseError};
use thiserror::Error;

use crate::host::CpuId;
use crate::mask::CpuMask;
use crate::table::TableError;

/// Errors returned by [`Engine`](crate::Engine) entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("halted mask {halted} is not a subset of cpu mask {enabled}")]
    InvalidHaltedMask { enabled: CpuMask, halted: CpuMask },

    #[error("cpu {0} is not enabled")]
    InvalidCpu(CpuId),

    #[error("{0} already configured")]
    AlreadyConfigured(&'static str),

    #[error("halted mask mismatch: host asserted {asserted}, engine recorded {recorded}")]
    HaltMaskMismatch { asserted: CpuMask, recorded: CpuMask },

    #[error("engine is faulted")]
    Faulted,
}

/// Failure of a single protocol command. Answered with an `E nn` reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("no such cpu: {0}")]
    InvalidThread(CpuId),

    #[error("thread id does not name a cpu")]
    NoThread,

    #[error("cpu {0} is not halted")]
    CpuRunning(CpuId),

    #[error("memory fault at {address:#x} ({length} bytes)")]
    MemoryFault { address: u64, length: usize },

    #[error("zero-length memory read at {0:#x}")]
    EmptyRead(u64),

    #[error("address range {address:#x}+{length:#x} overflows")]
    AddressOverflow { address: u64, length: usize },

    #[error("unknown register {0}")]
    InvalidRegister(usize),

    #[error("register data has the wrong size")]
    InvalidRegisterData,

    #[error("unknown annex {0:?}")]
    UnknownAnnex(String),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("jit allocation of {size:#x} bytes failed")]
    AllocationFailed { size: usize },

    #[error("no jit allocation at {0:#x}")]
    UnknownAllocation(u64),

    #[error("host refused to free jit allocation at {0:#x}")]
    DeallocationRefused(u64),
}

impl CommandError {
    /// Wire error code for this failure.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_)
            | Self::EmptyRead(_)
            | Self::AddressOverflow { .. }
            | Self::InvalidRegister(_)
            | Self::InvalidRegisterData
            | Self::UnknownAnnex(_)
            | Self::Table(TableError::ZeroSize) => ErrorCode::InvalidArgument,
            Self::InvalidThread(_) | Self::NoThread => ErrorCode::InvalidThread,
            Self::CpuRunning(_) => ErrorCode::CpuRunning,
            Self::MemoryFault { .. } | Self::DeallocationRefused(_) => ErrorCode::MemoryFault,
            Self::Table(TableError::SlotsExhausted { .. }) => ErrorCode::SlotsExhausted,
            Self::Table(TableError::HardwareRejected { .. }) => ErrorCode::HardwareRejected,
            Self::AllocationFailed { .. } => ErrorCode::AllocationFailed,
            Self::UnknownAllocation(_) => ErrorCode::UnknownAllocation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Pool;

    #[test]
    fn test_codes() {
        assert_eq!(
            CommandError::Parse(ParseError::InvalidThreadId).code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            CommandError::Table(TableError::SlotsExhausted {
                pool: Pool::Watchpoint,
                capacity: 4
            })
            .code()
            .to_string(),
            "E04"
        );
        assert_eq!(CommandError::CpuRunning(1).code().to_string(), "E06");
        assert_eq!(CommandError::UnknownAllocation(0).code().to_string(), "E08");
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::HaltMaskMismatch {
            asserted: CpuMask::from_bits(0b111),
            recorded: CpuMask::from_bits(0b101),
        };
        assert_eq!(
            err.to_string(),
            "halted mask mismatch: host asserted {0, 1, 2}, engine recorded {0, 2}"
        );
    }
}
