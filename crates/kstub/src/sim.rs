//! Simulated multi-core AArch64 machine.
//!
//! A stand-in for real hardware so the engine can be driven end to end by a
//! real debugger. Each running CPU advances its PC by one instruction per
//! [`SimHost::tick`]; a CPU whose PC lands on a programmed hardware breakpoint
//! parks, a stepping CPU parks after one instruction, and an interrupted CPU
//! parks on the next tick. Parking plays the halt handler: it records the halt
//! with the engine, then asserts the full parked set through
//! `process_halts`. Watchpoints are accepted and tracked but never fire.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use kstub_core::{CpuId, CpuMask, Engine, EngineError, Host, MAX_CPUS, Registers};
use kstub_proto::{Permissions, WatchKind};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

/// Physical address of the simulated RAM.
pub const SIM_MEMORY_BASE: u64 = 0x4000_0000;

/// Base of the simulated JIT region.
pub const SIM_JIT_BASE: u64 = 0xffff_ffe0_0000_0000;

const INSTRUCTION_SIZE: u64 = 4;
const PAGE_SIZE: u64 = 0x4000;

/// Shape of the simulated machine.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub cpus: usize,
    pub memory_size: usize,
    pub watchpoints: usize,
    /// Park every CPU before the first connection.
    pub start_halted: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory_size: 0x10_0000,
            watchpoints: 4,
            start_halted: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Running,
    Stepping,
    /// Interrupt requested; parks on the next tick.
    Halting,
    Parked,
}

#[derive(Clone, Copy, Debug)]
enum Park {
    Breakpoint,
    Step,
    Interrupt,
}

struct SimCpu {
    mode: Mode,
    registers: Registers,
}

#[derive(Default)]
struct Jit {
    next: u64,
    live: FxHashMap<u64, usize>,
}

/// [`Host`] implementation backed by the simulated machine and a TCP link.
pub struct SimHost {
    config: SimConfig,
    link: Mutex<Option<TcpStream>>,
    cpus: Mutex<Vec<SimCpu>>,
    memory: Mutex<Vec<u8>>,
    breakpoints: Mutex<Vec<u64>>,
    watchpoints: Mutex<Vec<(u64, usize, WatchKind)>>,
    jit: Mutex<Jit>,
}

impl SimHost {
    pub fn new(config: SimConfig) -> Self {
        let count = config.cpus.clamp(1, MAX_CPUS);
        let memory_top = SIM_MEMORY_BASE + config.memory_size as u64;
        let mode = if config.start_halted {
            Mode::Parked
        } else {
            Mode::Running
        };
        let cpus = (0..count)
            .map(|id| {
                let mut registers = Registers::default();
                registers.x[0] = id as u64;
                registers.pc = SIM_MEMORY_BASE;
                registers.sp = memory_top - (id as u64) * PAGE_SIZE;
                SimCpu { mode, registers }
            })
            .collect();
        Self {
            link: Mutex::new(None),
            cpus: Mutex::new(cpus),
            memory: Mutex::new(vec![0; config.memory_size]),
            breakpoints: Mutex::new(Vec::new()),
            watchpoints: Mutex::new(Vec::new()),
            jit: Mutex::new(Jit::default()),
            config,
        }
    }

    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Every simulated CPU.
    pub fn cpu_mask(&self) -> CpuMask {
        (0..self.cpus.lock().len()).collect()
    }

    /// CPUs currently parked.
    pub fn parked_mask(&self) -> CpuMask {
        self.cpus
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, cpu)| cpu.mode == Mode::Parked)
            .map(|(id, _)| id)
            .collect()
    }

    /// Connect the debugger transport, replacing any previous one.
    pub fn attach(&self, stream: TcpStream) {
        *self.link.lock() = Some(stream);
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    fn disconnect(&self, reason: &str) {
        if self.link.lock().take().is_some() {
            debug!(reason, "transport closed");
        }
    }

    /// Advance the machine by one instruction and report any new halts.
    pub fn tick(&self, engine: &Engine<Self>) -> Result<(), EngineError> {
        let parks = self.advance();
        if parks.is_empty() {
            return Ok(());
        }
        // The machine lock is released before calling back into the engine,
        // which reads the PC through `cpu_pc`.
        for &(cpu, park) in &parks {
            match park {
                Park::Breakpoint => engine.record_breakpoint(cpu)?,
                Park::Step => engine.record_step(cpu)?,
                Park::Interrupt => engine.record_halt(cpu)?,
            }
        }
        engine.process_halts(self.parked_mask())
    }

    fn advance(&self) -> Vec<(CpuId, Park)> {
        let breakpoints = self.breakpoints.lock().clone();
        let mut cpus = self.cpus.lock();
        let mut parks = Vec::new();
        for (id, cpu) in cpus.iter_mut().enumerate() {
            let park = match cpu.mode {
                Mode::Running => {
                    cpu.registers.pc = self.next_pc(cpu.registers.pc);
                    breakpoints
                        .contains(&cpu.registers.pc)
                        .then_some(Park::Breakpoint)
                }
                Mode::Stepping => {
                    cpu.registers.pc = self.next_pc(cpu.registers.pc);
                    Some(Park::Step)
                }
                Mode::Halting => Some(Park::Interrupt),
                Mode::Parked => None,
            };
            if let Some(park) = park {
                trace!(cpu = id, ?park, pc = format_args!("{:#x}", cpu.registers.pc), "cpu parked");
                cpu.mode = Mode::Parked;
                parks.push((id, park));
            }
        }
        parks
    }

    /// PC after one instruction, wrapping within RAM.
    fn next_pc(&self, pc: u64) -> u64 {
        let next = pc.wrapping_add(INSTRUCTION_SIZE);
        let top = SIM_MEMORY_BASE + self.config.memory_size as u64;
        if (SIM_MEMORY_BASE..top).contains(&next) {
            next
        } else {
            SIM_MEMORY_BASE
        }
    }

    fn set_mode(&self, cpu: CpuId, mode: Mode) {
        if let Some(entry) = self.cpus.lock().get_mut(cpu) {
            entry.mode = mode;
        }
    }

    /// Offset into RAM and the number of bytes available from there.
    fn ram_range(&self, address: u64, len: usize) -> Option<(usize, usize)> {
        let offset = usize::try_from(address.checked_sub(SIM_MEMORY_BASE)?).ok()?;
        let available = self.config.memory_size.checked_sub(offset)?;
        (available > 0).then_some((offset, len.min(available)))
    }
}

impl Host for SimHost {
    fn serial_read(&self, buf: &mut [u8]) -> usize {
        let mut link = self.link.lock();
        let Some(stream) = link.as_mut() else {
            return 0;
        };
        match stream.read(buf) {
            Ok(0) => {
                drop(link);
                self.disconnect("peer closed");
                0
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => 0,
            Err(e) => {
                drop(link);
                warn!(error = %e, "transport read failed");
                self.disconnect("read error");
                0
            }
        }
    }

    fn serial_write(&self, data: &[u8]) -> usize {
        let mut link = self.link.lock();
        let Some(stream) = link.as_mut() else {
            return 0;
        };
        match stream.write(data) {
            Ok(n) => n,
            Err(e) => {
                drop(link);
                warn!(error = %e, "transport write failed");
                self.disconnect("write error");
                0
            }
        }
    }

    fn set_hardware_breakpoint(&self, address: u64) -> bool {
        let mut breakpoints = self.breakpoints.lock();
        if !breakpoints.contains(&address) {
            breakpoints.push(address);
        }
        true
    }

    fn clear_hardware_breakpoint(&self, address: u64) -> bool {
        self.breakpoints.lock().retain(|&a| a != address);
        true
    }

    fn set_hardware_watchpoint(&self, address: u64, size: usize, kind: WatchKind) -> bool {
        let mut watchpoints = self.watchpoints.lock();
        if watchpoints.len() >= self.config.watchpoints {
            return false;
        }
        watchpoints.push((address, size, kind));
        true
    }

    fn clear_hardware_watchpoint(&self, address: u64, size: usize, kind: WatchKind) -> bool {
        self.watchpoints
            .lock()
            .retain(|&wp| wp != (address, size, kind));
        true
    }

    fn interrupt_cpu(&self, cpu: CpuId) {
        self.set_mode(cpu, Mode::Halting);
    }

    fn resume_cpu(&self, cpu: CpuId) {
        self.set_mode(cpu, Mode::Running);
    }

    fn step_cpu(&self, cpu: CpuId) {
        self.set_mode(cpu, Mode::Stepping);
    }

    fn cpu_pc(&self, cpu: CpuId) -> u64 {
        self.cpus
            .lock()
            .get(cpu)
            .map_or(0, |entry| entry.registers.pc)
    }

    fn read_registers(&self, cpu: CpuId, registers: &mut Registers) {
        if let Some(entry) = self.cpus.lock().get(cpu) {
            registers.clone_from(&entry.registers);
        }
    }

    fn write_registers(&self, cpu: CpuId, registers: &Registers) {
        if let Some(entry) = self.cpus.lock().get_mut(cpu) {
            entry.registers.clone_from(registers);
        }
    }

    fn read_memory(&self, _cpu: CpuId, address: u64, data: &mut [u8]) -> usize {
        let Some((offset, n)) = self.ram_range(address, data.len()) else {
            return 0;
        };
        data[..n].copy_from_slice(&self.memory.lock()[offset..offset + n]);
        n
    }

    fn write_memory(&self, _cpu: CpuId, address: u64, data: &[u8]) -> usize {
        let Some((offset, n)) = self.ram_range(address, data.len()) else {
            return 0;
        };
        self.memory.lock()[offset..offset + n].copy_from_slice(&data[..n]);
        n
    }

    fn allocate_jit_memory(&self, size: usize, permissions: Permissions) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let mut jit = self.jit.lock();
        let address = SIM_JIT_BASE.checked_add(jit.next)?;
        jit.next += (size as u64).next_multiple_of(PAGE_SIZE);
        jit.live.insert(address, size);
        debug!(address = format_args!("{address:#x}"), size, ?permissions, "jit region mapped");
        Some(address)
    }

    fn deallocate_jit_memory(&self, address: u64) -> bool {
        self.jit.lock().live.remove(&address).is_some()
    }

    fn log(&self, message: &str) {
        warn!(source = "engine", "{message}");
    }
}
