//! Command dispatch: one decoded payload in, at most one reply out.

use kstub_proto::{
    BreakpointSpec, BreakpointType, Command, Reply, ResumeKind, ThreadId, ThreadOp, VContAction,
};
use tracing::{debug, info};

use super::Engine;
use super::session::Session;
use crate::arch;
use crate::cpu::{RunState, report_choice};
use crate::error::CommandError;
use crate::host::{CpuId, Host};
use crate::mask::CpuMask;
use crate::proxy::Proxy;

type CommandResult = Result<Option<Reply>, CommandError>;

impl<H: Host> Engine<H> {
    /// Handle one payload. `None` means the answer comes later (a stop reply).
    pub(super) fn dispatch(&self, session: &mut Session, payload: &[u8]) -> Option<Reply> {
        let result = Command::parse(payload)
            .map_err(CommandError::from)
            .and_then(|command| self.execute(session, command));
        match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, payload = %String::from_utf8_lossy(payload), "command failed");
                Some(Reply::error(e.code()))
            }
        }
    }

    fn execute(&self, session: &mut Session, command: Command) -> CommandResult {
        let proxy = Proxy::new(&self.host);
        match command {
            Command::HaltReason => Ok(self.halt_reason_reply(session)),
            Command::ReadRegisters => {
                let cpu = self.halted_cpu(session)?;
                let mut reply = Reply::new();
                reply.push_str(&arch::encode_registers(&proxy.read_registers(cpu)));
                Ok(Some(reply))
            }
            Command::WriteRegisters(bytes) => {
                let cpu = self.halted_cpu(session)?;
                let registers =
                    arch::decode_registers(&bytes).ok_or(CommandError::InvalidRegisterData)?;
                proxy.write_registers(cpu, &registers);
                Ok(Some(Reply::ok()))
            }
            Command::ReadRegister(regno) => {
                let cpu = self.halted_cpu(session)?;
                let mut reply = Reply::new();
                reply.push_hex(&proxy.read_register(cpu, regno)?);
                Ok(Some(reply))
            }
            Command::ReadMemory { address, length } => {
                let cpu = self.halted_cpu(session)?;
                let length = length.min(self.config.max_memory_read());
                let mut reply = Reply::new();
                reply.push_hex(&proxy.read_memory(cpu, address, length)?);
                Ok(Some(reply))
            }
            Command::WriteMemory { address, data } => {
                let cpu = self.halted_cpu(session)?;
                proxy.write_memory(cpu, address, &data)?;
                Ok(Some(Reply::ok()))
            }
            Command::InsertBreakpoint(spec) => self.insert_breakpoint(spec),
            Command::RemoveBreakpoint(spec) => self.remove_breakpoint(spec),
            Command::Continue { address } => self.continue_all(session, address),
            Command::Step { address } => self.step(session, address),
            Command::VContQuery => Ok(Some(Reply::from("vCont;c;C;s;S;t"))),
            Command::VCont(actions) => self.vcont(session, &actions),
            Command::SetThread { op, thread } => {
                let cpu = self.thread_cpu(thread)?;
                match op {
                    ThreadOp::General => session.general_cpu = cpu,
                    ThreadOp::Continue => session.resume_cpu = cpu,
                }
                Ok(Some(Reply::ok()))
            }
            Command::ThreadAlive(thread) => {
                self.thread_cpu(thread)?;
                Ok(Some(Reply::ok()))
            }
            Command::Detach => {
                self.detach(session);
                Ok(Some(Reply::ok()))
            }
            Command::Kill => {
                self.detach(session);
                Ok(None)
            }
            Command::Supported => Ok(Some(self.supported())),
            Command::StartNoAckMode => {
                session.no_ack = true;
                Ok(Some(Reply::ok()))
            }
            Command::Attached => Ok(Some(Reply::from("1"))),
            Command::CurrentThread => {
                let cpu = self.register_cpu(session)?;
                let mut reply = Reply::from("QC");
                reply.push_num(ThreadId::protocol_id(cpu) as u64);
                Ok(Some(reply))
            }
            Command::ThreadInfoFirst => {
                let ids: Vec<String> = self
                    .cpus
                    .enabled()
                    .iter()
                    .map(|cpu| format!("{:x}", ThreadId::protocol_id(cpu)))
                    .collect();
                Ok(Some(Reply::from(format!("m{}", ids.join(",")).as_str())))
            }
            Command::ThreadInfoNext => Ok(Some(Reply::from("l"))),
            Command::ThreadExtraInfo(thread) => {
                let cpu = self.thread_cpu(thread)?.ok_or(CommandError::NoThread)?;
                let state = self.cpus.state(cpu).ok_or(CommandError::InvalidThread(cpu))?;
                let mut reply = Reply::new();
                reply.push_hex(format!("CPU {cpu} ({state})").as_bytes());
                Ok(Some(reply))
            }
            Command::Offsets => Ok(Some(
                self.image
                    .get()
                    .map_or_else(Reply::new, |image| Reply::from(image.offsets().as_str())),
            )),
            Command::ReadFeatures {
                annex,
                offset,
                length,
            } => {
                if annex != "target.xml" {
                    return Err(CommandError::UnknownAnnex(annex));
                }
                Ok(Some(self.xfer(arch::target_xml().as_bytes(), offset, length)))
            }
            Command::ReadLibraries { offset, length } => Ok(Some(match self.image.get() {
                Some(image) => self.xfer(image.library_list_xml().as_bytes(), offset, length),
                None => Reply::new(),
            })),
            Command::AllocateMemory { size, permissions } => {
                let address = proxy.allocate_jit(size, permissions)?;
                session.jit.push(address);
                info!(address = format_args!("{address:#x}"), size, ?permissions, "jit memory allocated");
                let mut reply = Reply::new();
                reply.push_addr(address);
                Ok(Some(reply))
            }
            Command::DeallocateMemory { address } => {
                let index = session
                    .jit
                    .iter()
                    .position(|&a| a == address)
                    .ok_or(CommandError::UnknownAllocation(address))?;
                proxy.deallocate_jit(address)?;
                session.jit.swap_remove(index);
                info!(address = format_args!("{address:#x}"), "jit memory freed");
                Ok(Some(Reply::ok()))
            }
            Command::Unsupported => Ok(Some(Reply::new())),
        }
    }

    // ------------------------------------------------------------------------
    // CPU selection
    // ------------------------------------------------------------------------

    /// CPU addressed by register and memory commands.
    fn register_cpu(&self, session: &Session) -> Result<CpuId, CommandError> {
        session
            .general_cpu
            .or_else(|| self.default_cpu())
            .ok_or(CommandError::NoThread)
    }

    fn halted_cpu(&self, session: &Session) -> Result<CpuId, CommandError> {
        let cpu = self.register_cpu(session)?;
        if self.cpus.state(cpu) == Some(RunState::Halted) {
            Ok(cpu)
        } else {
            Err(CommandError::CpuRunning(cpu))
        }
    }

    /// CPU addressed by `s` and by `c addr`.
    fn resume_target(&self, session: &Session) -> Result<CpuId, CommandError> {
        session
            .resume_cpu
            .map_or_else(|| self.register_cpu(session), Ok)
    }

    /// `Some(cpu)` for a specific enabled CPU, `None` for "all"/"any".
    fn thread_cpu(&self, thread: ThreadId) -> Result<Option<CpuId>, CommandError> {
        match thread {
            ThreadId::Cpu(cpu) if self.cpus.enabled().contains(cpu) => Ok(Some(cpu)),
            ThreadId::Cpu(cpu) => Err(CommandError::InvalidThread(cpu)),
            ThreadId::All | ThreadId::Any => Ok(None),
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn halt_reason_reply(&self, session: &mut Session) -> Option<Reply> {
        let halted = self.cpus.halted_mask();
        if halted.is_empty() {
            session.target_stopped = false;
            self.interrupt_running(session);
            return None;
        }
        let selected = session
            .general_cpu
            .filter(|&cpu| halted.contains(cpu))
            .and_then(|cpu| Some((cpu, self.cpus.reason(cpu)?)));
        let (cpu, reason) = selected.or_else(|| {
            let halts: Vec<_> = halted
                .iter()
                .filter_map(|cpu| Some((cpu, self.cpus.reason(cpu)?)))
                .collect();
            report_choice(&halts)
        })?;
        Some(self.stop_reply_for(session, cpu, reason))
    }

    fn insert_breakpoint(&self, spec: BreakpointSpec) -> CommandResult {
        let mut table = self.table.lock();
        match spec.kind {
            BreakpointType::Software => return Ok(Some(Reply::new())),
            BreakpointType::Hardware => {
                table.insert_breakpoint(&self.host, spec.address)?;
            }
            BreakpointType::Watch(kind) => {
                table.insert_watchpoint(&self.host, spec.address, spec.length, kind)?;
            }
        }
        Ok(Some(Reply::ok()))
    }

    fn remove_breakpoint(&self, spec: BreakpointSpec) -> CommandResult {
        let mut table = self.table.lock();
        match spec.kind {
            BreakpointType::Software => return Ok(Some(Reply::new())),
            BreakpointType::Hardware => {
                table.remove_breakpoint(&self.host, spec.address)?;
            }
            BreakpointType::Watch(kind) => {
                table.remove_watchpoint(&self.host, spec.address, spec.length, kind)?;
            }
        }
        Ok(Some(Reply::ok()))
    }

    /// Stop reply for the lowest CPU whose halt the debugger has not seen.
    /// Resuming commands answer with it instead of moving any CPU.
    fn take_unreported(&self, session: &mut Session) -> Option<Reply> {
        let (cpu, reason) = session
            .unreported
            .iter()
            .copied()
            .filter(|&(cpu, _)| self.cpus.state(cpu) == Some(RunState::Halted))
            .min_by_key(|&(cpu, _)| cpu)?;
        debug!(cpu, "reporting deferred halt instead of resuming");
        Some(self.stop_reply_for(session, cpu, reason))
    }

    fn continue_all(&self, session: &mut Session, address: Option<u64>) -> CommandResult {
        if let Some(reply) = self.take_unreported(session) {
            return Ok(Some(reply));
        }
        if let Some(pc) = address {
            let cpu = self.resume_target(session)?;
            self.require_halted(cpu)?;
            Proxy::new(&self.host).set_pc(cpu, pc);
        }
        let resumed = self.resume_all();
        session.target_stopped = false;
        debug!(resumed, "continue");
        Ok(None)
    }

    fn step(&self, session: &mut Session, address: Option<u64>) -> CommandResult {
        let cpu = self.resume_target(session)?;
        self.require_halted(cpu)?;
        if let Some(reply) = self.take_unreported(session) {
            return Ok(Some(reply));
        }
        if let Some(pc) = address {
            Proxy::new(&self.host).set_pc(cpu, pc);
        }
        self.resume_cpu(cpu, true);
        session.target_stopped = false;
        debug!(cpu, "step");
        Ok(None)
    }

    fn require_halted(&self, cpu: CpuId) -> Result<(), CommandError> {
        match self.cpus.state(cpu) {
            Some(RunState::Halted) => Ok(()),
            Some(_) => Err(CommandError::CpuRunning(cpu)),
            None => Err(CommandError::InvalidThread(cpu)),
        }
    }

    /// Explicit per-thread actions claim their CPUs first; the first action
    /// naming a CPU wins. Thread ids are validated before anything moves.
    fn vcont(&self, session: &mut Session, actions: &[VContAction]) -> CommandResult {
        let enabled = self.cpus.enabled();
        let mut plan = Vec::new();
        let mut claimed = CpuMask::EMPTY;
        let (explicit, defaults): (Vec<&VContAction>, Vec<&VContAction>) = actions
            .iter()
            .partition(|action| matches!(action.thread, Some(ThreadId::Cpu(_))));
        for action in explicit.into_iter().chain(defaults) {
            let targets = match action.thread {
                Some(thread) => self
                    .thread_cpu(thread)?
                    .map_or(enabled, CpuMask::single),
                None => enabled,
            };
            plan.extend(targets.difference(claimed).iter().map(|cpu| (cpu, action.kind)));
            claimed = claimed | targets;
        }

        let resumes = plan
            .iter()
            .any(|&(_, kind)| matches!(kind, ResumeKind::Continue | ResumeKind::Step));
        if resumes {
            if let Some(reply) = self.take_unreported(session) {
                return Ok(Some(reply));
            }
        }

        let running = self.cpus.running_mask();
        let mut resumed = 0;
        let mut interrupted = 0;
        for (cpu, kind) in plan {
            match kind {
                ResumeKind::Continue => resumed += usize::from(self.resume_cpu(cpu, false)),
                ResumeKind::Step => resumed += usize::from(self.resume_cpu(cpu, true)),
                ResumeKind::Stop if running.contains(cpu) => {
                    self.host.interrupt_cpu(cpu);
                    interrupted += 1;
                }
                ResumeKind::Stop => {}
            }
        }
        // A resume aimed only at CPUs that are still running still leaves the
        // debugger waiting for their stop.
        if resumes {
            session.target_stopped = false;
        }
        crate::metrics::record_interrupts(interrupted);
        debug!(resumed, interrupted, "vCont");
        Ok(None)
    }

    fn detach(&self, session: &mut Session) {
        let removed = self.table.lock().clear(&self.host);
        self.release_jit(session);
        let resumed = self.resume_all();
        session.detached = true;
        info!(removed, resumed, "debugger detached");
    }

    fn supported(&self) -> Reply {
        let mut features = format!(
            "PacketSize={:x};qXfer:features:read+;",
            self.config.packet_size
        );
        if self.image.get().is_some() {
            features.push_str("qXfer:libraries:read+;");
        }
        features.push_str("QStartNoAckMode+;vContSupported+;hwbreak+");
        Reply::from(features.as_str())
    }

    /// Serve `length` bytes of `document` from `offset` as an `m`/`l` chunk.
    fn xfer(&self, document: &[u8], offset: usize, length: usize) -> Reply {
        if offset >= document.len() {
            return Reply::from("l");
        }
        let take = length
            .clamp(1, self.config.max_xfer_chunk())
            .min(document.len() - offset);
        let end = offset + take;
        let mut reply = Reply::from(if end < document.len() { "m" } else { "l" });
        reply.push_bytes(&document[offset..end]);
        reply
    }
}
