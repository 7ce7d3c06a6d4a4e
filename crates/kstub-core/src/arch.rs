//! AArch64 register layout.
//!
//! The register record and target description come from `gdbstub_arch`, so
//! the `g`/`G` byte order always matches the XML the debugger is given.

use gdbstub::arch::{Arch, Registers as _};
use gdbstub_arch::aarch64::AArch64;

/// Fixed-layout core register record: x0-x30, sp, pc, cpsr, v0-v31, fpsr, fpcr.
pub type Registers = gdbstub_arch::aarch64::reg::AArch64CoreRegs;

/// GDB register number of the program counter.
pub const PC_REGNUM: usize = 32;

/// Number of registers in the core record.
pub const REGISTER_COUNT: usize = 68;

/// Target description served through `qXfer:features:read:target.xml`.
pub fn target_xml() -> &'static str {
    AArch64::target_description_xml().unwrap_or(
        r#"<?xml version="1.0"?><target version="1.0"><architecture>aarch64</architecture></target>"#,
    )
}

/// Hex-encode the whole record in protocol order.
pub fn encode_registers(registers: &Registers) -> String {
    let mut out = String::new();
    registers.gdb_serialize(|byte| match byte {
        Some(b) => out.push_str(&hex::encode([b])),
        None => out.push_str("xx"),
    });
    out
}

/// Decode a full record from raw bytes (already un-hexed).
pub fn decode_registers(bytes: &[u8]) -> Option<Registers> {
    let mut registers = Registers::default();
    registers.gdb_deserialize(bytes).ok()?;
    Some(registers)
}

/// Little-endian bytes of a single register, by GDB register number.
pub fn register_bytes(registers: &Registers, regno: usize) -> Option<Vec<u8>> {
    let bytes = match regno {
        0..=30 => registers.x[regno].to_le_bytes().to_vec(),
        31 => registers.sp.to_le_bytes().to_vec(),
        PC_REGNUM => registers.pc.to_le_bytes().to_vec(),
        33 => registers.cpsr.to_le_bytes().to_vec(),
        34..=65 => registers.v[regno - 34].to_le_bytes().to_vec(),
        66 => registers.fpsr.to_le_bytes().to_vec(),
        67 => registers.fpcr.to_le_bytes().to_vec(),
        _ => return None,
    };
    Some(bytes)
}
