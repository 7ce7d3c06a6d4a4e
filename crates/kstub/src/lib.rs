//! kstub - GDB remote stub for kernels and hypervisors
//!
//! Re-exports the protocol layer and the engine, and adds a simulated
//! multi-core AArch64 machine that can be served over TCP for testing with a
//! real debugger.
//!
//! # Example
//!
//! ```ignore
//! use kstub::sim::{SimConfig, SimHost};
//! use kstub::server::Server;
//! use kstub::{Engine, StubConfig};
//!
//! let host = SimHost::new(SimConfig::default());
//! let (cpus, halted) = (host.cpu_mask(), host.parked_mask());
//! let engine = Engine::new(host, StubConfig::default(), cpus, halted)?;
//! Server::new(engine).run_addr("127.0.0.1:1234")?;
//! ```

pub use kstub_core::{
    BreakpointTable, CommandError, CpuId, CpuMask, Engine, EngineError, HARDWARE_BREAKPOINT_COUNT,
    HaltReason, Host, ImageDescriptor, MAX_CPUS, Registers, RunState, StubConfig, TableError,
    arch, metrics as engine_metrics, test_support,
};
pub use kstub_proto as proto;

pub mod recorder;
pub mod server;
pub mod sim;
