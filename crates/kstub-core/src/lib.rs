//! kstub engine: halt coordination and command dispatch for a GDB stub
//! embedded in a kernel or hypervisor.
//!
//! The host implements [`Host`] and drives an [`Engine`]:
//!
//! ```ignore
//! use kstub_core::{CpuMask, Engine, StubConfig};
//!
//! let engine = Engine::new(host, StubConfig::default(), CpuMask::from_bits(0b1111), CpuMask::EMPTY)?;
//! engine.set_watchpoint_count(4)?;
//!
//! // In a breakpoint exception handler on cpu 2:
//! engine.record_breakpoint(2)?;
//! // Once every halting CPU has parked:
//! engine.process_halts(CpuMask::single(2))?;
//!
//! // When the transport has bytes:
//! engine.packet_available()?;
//! ```

pub mod arch;
pub mod config;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod host;
pub mod image;
pub mod mask;
pub mod metrics;
pub mod proxy;
pub mod stop;
pub mod table;
pub mod test_support;

pub use arch::Registers;
pub use config::StubConfig;
pub use cpu::{HaltReason, RunState};
pub use engine::Engine;
pub use error::{CommandError, EngineError};
pub use host::{CpuId, Host};
pub use image::ImageDescriptor;
pub use mask::{CpuMask, MAX_CPUS};
pub use table::{BreakpointTable, HARDWARE_BREAKPOINT_COUNT, TableError};

pub type Result<T> = std::result::Result<T, EngineError>;
