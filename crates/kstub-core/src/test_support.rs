//! Deterministic in-memory [`Host`] for tests.
//!
//! Serial input is queued by the test and drained by the engine; output is
//! captured and can be split back into framed replies. CPU control requests
//! are logged as [`HostAction`]s and never complete on their own: tests play
//! the halt handler by calling the engine's recording entry points.

use std::collections::VecDeque;

use kstub_proto::{Event, PacketDecoder, Permissions, WatchKind, encode};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::arch::Registers;
use crate::host::{CpuId, Host};

/// A CPU control request the engine made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostAction {
    Interrupt(CpuId),
    Resume(CpuId),
    Step(CpuId),
}

#[derive(Default)]
struct State {
    input: VecDeque<u8>,
    output: Vec<u8>,
    breakpoints: Vec<u64>,
    watchpoints: Vec<(u64, usize, WatchKind)>,
    refuse_hardware: bool,
    refuse_jit: bool,
    registers: FxHashMap<CpuId, Registers>,
    regions: Vec<(u64, Vec<u8>)>,
    actions: Vec<HostAction>,
    jit: FxHashSet<u64>,
    next_jit: u64,
    logs: Vec<String>,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a block of memory at `base`.
    #[must_use]
    pub fn with_memory(self, base: u64, bytes: &[u8]) -> Self {
        self.state.lock().regions.push((base, bytes.to_vec()));
        self
    }

    /// Copy of `len` mapped bytes at `address` (short if the mapping ends).
    pub fn memory(&self, address: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let mut out = vec![0; len];
        let n = copy_out(&state.regions, address, &mut out);
        out.truncate(n);
        out
    }

    pub fn registers(&self, cpu: CpuId) -> Registers {
        self.state
            .lock()
            .registers
            .get(&cpu)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_registers(&self, cpu: CpuId, registers: Registers) {
        self.state.lock().registers.insert(cpu, registers);
    }

    pub fn set_pc(&self, cpu: CpuId, pc: u64) {
        self.state.lock().registers.entry(cpu).or_default().pc = pc;
    }

    pub fn set_refuse_hardware(&self, refuse: bool) {
        self.state.lock().refuse_hardware = refuse;
    }

    pub fn set_refuse_jit(&self, refuse: bool) {
        self.state.lock().refuse_jit = refuse;
    }

    /// Programmed hardware breakpoints, in programming order.
    pub fn breakpoints(&self) -> Vec<u64> {
        self.state.lock().breakpoints.clone()
    }

    pub fn watchpoints(&self) -> Vec<(u64, usize, WatchKind)> {
        self.state.lock().watchpoints.clone()
    }

    pub fn jit_allocations(&self) -> usize {
        self.state.lock().jit.len()
    }

    pub fn logs(&self) -> Vec<String> {
        self.state.lock().logs.clone()
    }

    /// Queue raw bytes from the debugger.
    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().input.extend(bytes);
    }

    /// Queue one framed packet from the debugger.
    pub fn push_packet(&self, payload: &str) {
        self.push_input(&encode(payload.as_bytes()));
    }

    /// Everything written to the debugger since the last call.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().output)
    }

    /// Framed replies written since the last call, acks dropped.
    pub fn take_replies(&self) -> Vec<String> {
        let output = self.take_output();
        PacketDecoder::new()
            .feed(&output)
            .into_iter()
            .filter_map(|event| match event {
                Event::Packet(packet) => Some(String::from_utf8_lossy(&packet.payload).into_owned()),
                _ => None,
            })
            .collect()
    }

    /// CPU control requests since the last call.
    pub fn take_actions(&self) -> Vec<HostAction> {
        std::mem::take(&mut self.state.lock().actions)
    }
}

fn copy_out(regions: &[(u64, Vec<u8>)], address: u64, out: &mut [u8]) -> usize {
    for (base, bytes) in regions {
        if address < *base {
            continue;
        }
        let Ok(offset) = usize::try_from(address - base) else {
            continue;
        };
        if offset < bytes.len() {
            let n = out.len().min(bytes.len() - offset);
            out[..n].copy_from_slice(&bytes[offset..offset + n]);
            return n;
        }
    }
    0
}

fn copy_in(regions: &mut [(u64, Vec<u8>)], address: u64, data: &[u8]) -> usize {
    for (base, bytes) in regions {
        if address < *base {
            continue;
        }
        let Ok(offset) = usize::try_from(address - *base) else {
            continue;
        };
        if offset < bytes.len() {
            let n = data.len().min(bytes.len() - offset);
            bytes[offset..offset + n].copy_from_slice(&data[..n]);
            return n;
        }
    }
    0
}

impl Host for FakeHost {
    fn serial_read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        let n = buf.len().min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn serial_write(&self, data: &[u8]) -> usize {
        self.state.lock().output.extend_from_slice(data);
        data.len()
    }

    fn set_hardware_breakpoint(&self, address: u64) -> bool {
        let mut state = self.state.lock();
        if state.refuse_hardware {
            return false;
        }
        state.breakpoints.push(address);
        true
    }

    fn clear_hardware_breakpoint(&self, address: u64) -> bool {
        let mut state = self.state.lock();
        if state.refuse_hardware {
            return false;
        }
        state.breakpoints.retain(|&a| a != address);
        true
    }

    fn set_hardware_watchpoint(&self, address: u64, size: usize, kind: WatchKind) -> bool {
        let mut state = self.state.lock();
        if state.refuse_hardware {
            return false;
        }
        state.watchpoints.push((address, size, kind));
        true
    }

    fn clear_hardware_watchpoint(&self, address: u64, size: usize, kind: WatchKind) -> bool {
        let mut state = self.state.lock();
        if state.refuse_hardware {
            return false;
        }
        state.watchpoints.retain(|&wp| wp != (address, size, kind));
        true
    }

    fn interrupt_cpu(&self, cpu: CpuId) {
        self.state.lock().actions.push(HostAction::Interrupt(cpu));
    }

    fn resume_cpu(&self, cpu: CpuId) {
        self.state.lock().actions.push(HostAction::Resume(cpu));
    }

    fn step_cpu(&self, cpu: CpuId) {
        self.state.lock().actions.push(HostAction::Step(cpu));
    }

    fn cpu_pc(&self, cpu: CpuId) -> u64 {
        self.registers(cpu).pc
    }

    fn read_registers(&self, cpu: CpuId, registers: &mut Registers) {
        *registers = self.registers(cpu);
    }

    fn write_registers(&self, cpu: CpuId, registers: &Registers) {
        self.set_registers(cpu, registers.clone());
    }

    fn read_memory(&self, _cpu: CpuId, address: u64, data: &mut [u8]) -> usize {
        copy_out(&self.state.lock().regions, address, data)
    }

    fn write_memory(&self, _cpu: CpuId, address: u64, data: &[u8]) -> usize {
        copy_in(&mut self.state.lock().regions, address, data)
    }

    fn allocate_jit_memory(&self, size: usize, _permissions: Permissions) -> Option<u64> {
        let mut state = self.state.lock();
        if state.refuse_jit || size == 0 {
            return None;
        }
        let address = 0xffff_ffe0_0000_0000 + state.next_jit;
        state.next_jit += (size as u64).next_multiple_of(0x4000);
        state.jit.insert(address);
        Some(address)
    }

    fn deallocate_jit_memory(&self, address: u64) -> bool {
        self.state.lock().jit.remove(&address)
    }

    fn log(&self, message: &str) {
        self.state.lock().logs.push(message.to_owned());
    }
}
