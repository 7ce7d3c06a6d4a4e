//! Register and memory access through the host.
//!
//! Registers move as one whole record; single-register reads slice it.
//! Memory reads may come back short, which the protocol allows, while a short
//! write cannot be expressed in an `M` reply and is reported as a fault.

use kstub_proto::Permissions;
use tracing::trace;

use crate::arch::{self, Registers};
use crate::error::CommandError;
use crate::host::{CpuId, Host};

pub struct Proxy<'a, H: ?Sized> {
    host: &'a H,
}

impl<'a, H: Host + ?Sized> Proxy<'a, H> {
    pub const fn new(host: &'a H) -> Self {
        Self { host }
    }

    pub fn read_registers(&self, cpu: CpuId) -> Registers {
        let mut registers = Registers::default();
        self.host.read_registers(cpu, &mut registers);
        registers
    }

    pub fn write_registers(&self, cpu: CpuId, registers: &Registers) {
        self.host.write_registers(cpu, registers);
    }

    pub fn read_register(&self, cpu: CpuId, regno: usize) -> Result<Vec<u8>, CommandError> {
        arch::register_bytes(&self.read_registers(cpu), regno)
            .ok_or(CommandError::InvalidRegister(regno))
    }

    pub fn set_pc(&self, cpu: CpuId, pc: u64) {
        let mut registers = self.read_registers(cpu);
        registers.pc = pc;
        self.write_registers(cpu, &registers);
    }

    /// Read up to `length` bytes; returns the prefix the host managed to copy.
    pub fn read_memory(
        &self,
        cpu: CpuId,
        address: u64,
        length: usize,
    ) -> Result<Vec<u8>, CommandError> {
        if length == 0 {
            return Err(CommandError::EmptyRead(address));
        }
        check_range(address, length)?;
        let mut data = vec![0; length];
        let copied = self.host.read_memory(cpu, address, &mut data).min(length);
        trace!(cpu, address = format_args!("{address:#x}"), length, copied, "memory read");
        if copied == 0 {
            return Err(CommandError::MemoryFault { address, length });
        }
        data.truncate(copied);
        Ok(data)
    }

    pub fn write_memory(&self, cpu: CpuId, address: u64, data: &[u8]) -> Result<(), CommandError> {
        check_range(address, data.len())?;
        let written = self.host.write_memory(cpu, address, data);
        trace!(cpu, address = format_args!("{address:#x}"), length = data.len(), written, "memory write");
        if written < data.len() {
            return Err(CommandError::MemoryFault {
                address: address.wrapping_add(written as u64),
                length: data.len() - written,
            });
        }
        Ok(())
    }

    pub fn allocate_jit(&self, size: usize, permissions: Permissions) -> Result<u64, CommandError> {
        self.host
            .allocate_jit_memory(size, permissions)
            .ok_or(CommandError::AllocationFailed { size })
    }

    pub fn deallocate_jit(&self, address: u64) -> Result<(), CommandError> {
        if self.host.deallocate_jit_memory(address) {
            Ok(())
        } else {
            Err(CommandError::DeallocationRefused(address))
        }
    }
}

fn check_range(address: u64, length: usize) -> Result<(), CommandError> {
    let overflow = CommandError::AddressOverflow { address, length };
    let length = u64::try_from(length).map_err(|_| overflow.clone())?;
    // The last byte must be addressable; a range ending exactly at 2^64 is fine.
    if length > 0 && address.checked_add(length - 1).is_none() {
        return Err(overflow);
    }
    Ok(())
}
