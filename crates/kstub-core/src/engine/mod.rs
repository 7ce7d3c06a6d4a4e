//! Session orchestrator.
//!
//! [`Engine`] owns the CPU state machine, the slot table and the connection
//! session, and exposes the entry points the host calls: recording halts from
//! halt handlers, committing them with [`Engine::process_halts`], and pumping
//! the transport with [`Engine::packet_available`]. The engine never blocks
//! and never spawns threads; every call runs to completion on the caller.

mod dispatch;
mod session;

#[cfg(test)]
mod tests;

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use kstub_proto::{Event, encode};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::StubConfig;
use crate::cpu::{CpuTable, HaltReason, Recorded, RunState, report_choice};
use crate::error::EngineError;
use crate::host::{CpuId, Host};
use crate::image::ImageDescriptor;
use crate::mask::CpuMask;
use crate::metrics;
use crate::stop::stop_reply;
use crate::table::BreakpointTable;

use session::Session;

const READ_CHUNK: usize = 512;

/// The debugging engine for one machine.
pub struct Engine<H: Host> {
    host: H,
    config: StubConfig,
    cpus: CpuTable,
    table: Mutex<BreakpointTable>,
    session: Mutex<Session>,
    image: OnceLock<ImageDescriptor>,
    watchpoints_configured: AtomicBool,
    faulted: AtomicBool,
}

impl<H: Host> Engine<H> {
    /// Initialize the engine. CPUs in `halted_mask` start halted (reason:
    /// interrupt); every other CPU in `cpu_mask` starts running.
    pub fn new(
        host: H,
        config: StubConfig,
        cpu_mask: CpuMask,
        halted_mask: CpuMask,
    ) -> Result<Self, EngineError> {
        if !halted_mask.is_subset(cpu_mask) {
            return Err(EngineError::InvalidHaltedMask {
                enabled: cpu_mask,
                halted: halted_mask,
            });
        }
        info!(cpus = %cpu_mask, halted = %halted_mask, "engine initialized");
        let session = Session::new(!halted_mask.is_empty(), config.packet_size);
        Ok(Self {
            host,
            config,
            cpus: CpuTable::new(cpu_mask, halted_mask),
            table: Mutex::new(BreakpointTable::new()),
            session: Mutex::new(session),
            image: OnceLock::new(),
            watchpoints_configured: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        })
    }

    pub const fn host(&self) -> &H {
        &self.host
    }

    pub const fn config(&self) -> &StubConfig {
        &self.config
    }

    /// Describe the debugged image. May be called once.
    pub fn set_image(&self, image: ImageDescriptor) -> Result<(), EngineError> {
        self.check_live()?;
        debug!(name = %image.name, slide = format_args!("{:#x}", image.slide()), "image set");
        self.image
            .set(image)
            .map_err(|_| EngineError::AlreadyConfigured("image"))
    }

    pub fn image(&self) -> Option<&ImageDescriptor> {
        self.image.get()
    }

    /// Size the hardware watchpoint pool. May be called once.
    pub fn set_watchpoint_count(&self, count: usize) -> Result<(), EngineError> {
        self.check_live()?;
        if self.watchpoints_configured.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyConfigured("watchpoint count"));
        }
        self.table.lock().set_watchpoint_capacity(count);
        debug!(count, "watchpoint pool sized");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Halt recording (phase one, called from halt handlers)
    // ------------------------------------------------------------------------

    /// Record a breakpoint hit at the CPU's current PC.
    pub fn record_breakpoint(&self, cpu: CpuId) -> Result<(), EngineError> {
        self.check_recordable(cpu)?;
        let address = self.host.cpu_pc(cpu);
        self.record(cpu, HaltReason::Breakpoint { address })
    }

    /// Record a watchpoint hit on data address `address`.
    pub fn record_watchpoint(&self, cpu: CpuId, address: u64) -> Result<(), EngineError> {
        self.check_recordable(cpu)?;
        let kind = self.table.lock().watchpoint_at(address).map(|wp| wp.kind);
        self.record(cpu, HaltReason::Watchpoint { address, kind })
    }

    /// Record completion of a single step.
    pub fn record_step(&self, cpu: CpuId) -> Result<(), EngineError> {
        self.check_recordable(cpu)?;
        self.record(cpu, HaltReason::Step)
    }

    /// Record a halt requested through `Host::interrupt_cpu`.
    pub fn record_halt(&self, cpu: CpuId) -> Result<(), EngineError> {
        self.check_recordable(cpu)?;
        self.record(cpu, HaltReason::Interrupt)
    }

    fn check_recordable(&self, cpu: CpuId) -> Result<(), EngineError> {
        self.check_live()?;
        if self.cpus.enabled().contains(cpu) {
            Ok(())
        } else {
            warn!(cpu, "halt recorded for cpu outside the mask");
            Err(EngineError::InvalidCpu(cpu))
        }
    }

    fn record(&self, cpu: CpuId, reason: HaltReason) -> Result<(), EngineError> {
        match self.cpus.record(cpu, reason) {
            None => Err(EngineError::InvalidCpu(cpu)),
            Some(Recorded::Pending) => {
                trace!(cpu, ?reason, "halt recorded");
                Ok(())
            }
            Some(Recorded::Merged(kept)) => {
                trace!(cpu, ?reason, ?kept, "halt already pending");
                Ok(())
            }
            Some(Recorded::AlreadyHalted) => {
                warn!(cpu, ?reason, "halt recorded for a cpu that is already halted");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Halt processing (phase two)
    // ------------------------------------------------------------------------

    /// Commit recorded halts. `halted_mask` is every CPU the host currently
    /// holds halted; it must match the CPUs the engine has a halt recorded
    /// for, or the engine faults.
    pub fn process_halts(&self, halted_mask: CpuMask) -> Result<(), EngineError> {
        self.check_live()?;
        let mut session = self.session.lock();
        let recorded = self.cpus.recorded_mask();
        if recorded != halted_mask {
            return Err(self.fault(halted_mask, recorded));
        }

        let newly = self.cpus.commit();
        if newly.is_empty() {
            return Ok(());
        }
        metrics::record_halts(
            newly.iter().map(|&(_, reason)| reason),
            self.cpus.halted_mask().len(),
        );
        debug!(cpus = %newly.iter().map(|&(cpu, _)| cpu).collect::<CpuMask>(), "halts committed");

        // Every informative halt is owed a stop reply; the one sent now is
        // dropped from the list by `stop_reply_for`.
        session.unreported.extend(
            newly
                .iter()
                .filter(|&&(_, reason)| !matches!(reason, HaltReason::Interrupt))
                .copied(),
        );
        if session.target_stopped {
            trace!(
                unreported = session.unreported.len(),
                "debugger already stopped, stop reply deferred"
            );
            return Ok(());
        }
        if let Some((cpu, reason)) = report_choice(&newly) {
            self.emit_stop(&mut session, cpu, reason);
        }
        Ok(())
    }

    fn fault(&self, asserted: CpuMask, recorded: CpuMask) -> EngineError {
        self.faulted.store(true, Ordering::Release);
        let message =
            format!("halted mask mismatch: host asserted {asserted}, engine recorded {recorded}");
        error!(%asserted, %recorded, "halted mask mismatch, engine disabled");
        self.host.log(&message);
        EngineError::HaltMaskMismatch { asserted, recorded }
    }

    fn check_live(&self) -> Result<(), EngineError> {
        if self.is_faulted() {
            Err(EngineError::Faulted)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------------

    /// Drain the transport and handle every complete frame.
    pub fn packet_available(&self) -> Result<(), EngineError> {
        self.check_live()?;
        let mut session = self.session.lock();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = self.host.serial_read(&mut buf).min(buf.len());
            if n == 0 {
                break;
            }
            for event in session.decoder.feed(&buf[..n]) {
                self.handle_event(&mut session, event);
            }
        }
        Ok(())
    }

    fn handle_event(&self, session: &mut Session, event: Event) {
        match event {
            Event::Packet(packet) if packet.valid => {
                if !session.no_ack {
                    self.write_all(b"+");
                }
                metrics::record_packet(&packet.payload);
                trace!(payload = %String::from_utf8_lossy(&packet.payload), "packet");
                if let Some(reply) = self.dispatch(session, &packet.payload) {
                    self.send_packet(session, reply.as_bytes());
                }
                if session.detached {
                    debug!("session detached");
                    *session = self.fresh_session();
                }
            }
            Event::Packet(_) => {
                metrics::record_checksum_failure();
                debug!("checksum mismatch, frame dropped");
                if !session.no_ack {
                    self.write_all(b"-");
                }
            }
            Event::Interrupt => {
                debug!("interrupt requested");
                self.interrupt_running(session);
            }
            Event::Ack => {}
            Event::Nack => {
                if let Some(frame) = session.last_frame.clone() {
                    debug!("nack, retransmitting");
                    self.write_all(&frame);
                }
            }
        }
    }

    fn send_packet(&self, session: &mut Session, payload: &[u8]) {
        let frame = encode(payload);
        self.write_all(&frame);
        session.last_frame = Some(frame);
    }

    fn write_all(&self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let n = self.host.serial_write(bytes).min(bytes.len());
            if n == 0 {
                warn!(remaining = bytes.len(), "transport refused write");
                return;
            }
            bytes = &bytes[n..];
        }
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Drop the current connection's state. Breakpoints and JIT memory are
    /// released according to the configuration; the CPU mask, watchpoint
    /// count and image persist.
    pub fn reset(&self) -> Result<(), EngineError> {
        self.check_live()?;
        let mut session = self.session.lock();
        if self.config.clear_breakpoints_on_reset {
            let removed = self.table.lock().clear(&self.host);
            debug!(removed, "breakpoints released on reset");
        }
        self.release_jit(&mut session);
        *session = self.fresh_session();
        info!("session reset");
        Ok(())
    }

    fn fresh_session(&self) -> Session {
        Session::new(!self.cpus.halted_mask().is_empty(), self.config.packet_size)
    }

    fn release_jit(&self, session: &mut Session) {
        if !self.config.reclaim_jit_on_detach {
            session.jit.clear();
            return;
        }
        for address in session.jit.drain(..) {
            if !self.host.deallocate_jit_memory(address) {
                warn!(address = format_args!("{address:#x}"), "host refused to free jit memory");
            }
        }
    }

    // ------------------------------------------------------------------------
    // CPU control
    // ------------------------------------------------------------------------

    fn resume_cpu(&self, cpu: CpuId, step: bool) -> bool {
        if !self.cpus.resume(cpu, step) {
            return false;
        }
        if step {
            self.host.step_cpu(cpu);
        } else {
            self.host.resume_cpu(cpu);
        }
        true
    }

    fn resume_all(&self) -> usize {
        self.cpus
            .halted_mask()
            .iter()
            .filter(|&cpu| self.resume_cpu(cpu, false))
            .count()
    }

    /// Ask every running CPU to halt. If nothing is running or pending but
    /// the debugger still waits for a stop, answer it from the halted set.
    fn interrupt_running(&self, session: &mut Session) {
        let running = self.cpus.running_mask();
        for cpu in running.iter() {
            self.host.interrupt_cpu(cpu);
        }
        metrics::record_interrupts(running.len());
        if !running.is_empty() || session.target_stopped {
            return;
        }
        let halted = self.cpus.halted_mask();
        if self.cpus.recorded_mask() != halted {
            return;
        }
        let halts: Vec<_> = halted
            .iter()
            .filter_map(|cpu| Some((cpu, self.cpus.reason(cpu)?)))
            .collect();
        if let Some((cpu, reason)) = report_choice(&halts) {
            self.emit_stop(session, cpu, reason);
        }
    }

    fn emit_stop(&self, session: &mut Session, cpu: CpuId, reason: HaltReason) {
        let reply = self.stop_reply_for(session, cpu, reason);
        self.send_packet(session, reply.as_bytes());
    }

    fn stop_reply_for(
        &self,
        session: &mut Session,
        cpu: CpuId,
        reason: HaltReason,
    ) -> kstub_proto::Reply {
        let pc = match reason {
            HaltReason::Breakpoint { address } => address,
            _ => self.host.cpu_pc(cpu),
        };
        session.general_cpu = Some(cpu);
        session.target_stopped = true;
        session.unreported.retain(|&(pending, _)| pending != cpu);
        metrics::record_stop_reply();
        debug!(cpu, ?reason, "stop reply");
        stop_reply(cpu, reason, pc)
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub const fn cpu_mask(&self) -> CpuMask {
        self.cpus.enabled()
    }

    pub fn cpu_state(&self, cpu: CpuId) -> Option<RunState> {
        self.cpus.state(cpu)
    }

    pub fn halt_reason(&self, cpu: CpuId) -> Option<HaltReason> {
        self.cpus.reason(cpu)
    }

    pub fn halted_mask(&self) -> CpuMask {
        self.cpus.halted_mask()
    }

    /// CPU that register and memory commands currently address.
    pub fn selected_cpu(&self) -> Option<CpuId> {
        let general = self.session.lock().general_cpu;
        general.or_else(|| self.default_cpu())
    }

    fn default_cpu(&self) -> Option<CpuId> {
        self.cpus
            .halted_mask()
            .first()
            .or_else(|| self.cpus.enabled().first())
    }

    pub fn breakpoint_count(&self) -> usize {
        self.table.lock().breakpoint_count()
    }

    pub fn watchpoint_count_in_use(&self) -> usize {
        self.table.lock().watchpoint_count()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }
}
