//! Capabilities the embedding environment provides to the engine.

use kstub_proto::{Permissions, WatchKind};

use crate::arch::Registers;

/// Index of a CPU core (0-based).
pub type CpuId = usize;

/// Hardware and transport access supplied by the host.
///
/// Every method is a synchronous call that must not block. CPU control
/// (`interrupt_cpu`, `resume_cpu`, `step_cpu`) is fire-and-forget: the host
/// reports the resulting halt later through the engine's recording entry
/// points. Methods take `&self` because halt handlers on different cores may
/// reach the host concurrently; implementations use interior mutability.
/// None of these methods may call back into the engine.
pub trait Host {
    /// Read pending bytes from the debugger. Returns 0 when nothing is pending.
    fn serial_read(&self, buf: &mut [u8]) -> usize;

    /// Write bytes to the debugger, returning how many were accepted.
    fn serial_write(&self, data: &[u8]) -> usize;

    fn set_hardware_breakpoint(&self, address: u64) -> bool;
    fn clear_hardware_breakpoint(&self, address: u64) -> bool;

    fn set_hardware_watchpoint(&self, address: u64, size: usize, kind: WatchKind) -> bool;
    fn clear_hardware_watchpoint(&self, address: u64, size: usize, kind: WatchKind) -> bool;

    /// Ask `cpu` to halt. Must not wait for the halt.
    fn interrupt_cpu(&self, cpu: CpuId);

    /// Let `cpu` run. Must not wait for it to start.
    fn resume_cpu(&self, cpu: CpuId);

    /// Execute one instruction on `cpu`, then halt. Must not wait.
    fn step_cpu(&self, cpu: CpuId);

    /// Current program counter of a halted CPU.
    fn cpu_pc(&self, cpu: CpuId) -> u64;

    fn read_registers(&self, cpu: CpuId, registers: &mut Registers);
    fn write_registers(&self, cpu: CpuId, registers: &Registers);

    /// Read memory as seen by `cpu`. Returns the number of bytes read, which
    /// is less than `data.len()` if a fault stopped the copy.
    fn read_memory(&self, cpu: CpuId, address: u64, data: &mut [u8]) -> usize;

    /// Write memory as seen by `cpu`. Returns the number of bytes written.
    fn write_memory(&self, cpu: CpuId, address: u64, data: &[u8]) -> usize;

    fn allocate_jit_memory(&self, size: usize, permissions: Permissions) -> Option<u64>;
    fn deallocate_jit_memory(&self, address: u64) -> bool;

    /// Emit a diagnostic line through the host's own channel.
    fn log(&self, message: &str);
}
