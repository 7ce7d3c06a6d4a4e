use kstub_proto::PacketDecoder;

use crate::cpu::HaltReason;
use crate::host::CpuId;

/// State that lives for one debugger connection.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) decoder: PacketDecoder,
    /// Acknowledgements disabled by `QStartNoAckMode`.
    pub(crate) no_ack: bool,
    /// Last framed packet sent, kept for retransmission on `-`.
    pub(crate) last_frame: Option<Vec<u8>>,
    /// `Hg` selection; `None` means "lowest halted CPU".
    pub(crate) general_cpu: Option<CpuId>,
    /// `Hc` selection; `None` means no specific CPU.
    pub(crate) resume_cpu: Option<CpuId>,
    /// Whether the debugger has seen a stop reply since its last resume.
    pub(crate) target_stopped: bool,
    /// Halts committed while the debugger was stopped, not yet reported.
    /// Interrupt halts are not kept.
    pub(crate) unreported: Vec<(CpuId, HaltReason)>,
    /// Set by `D`/`k`; the session is replaced once the reply is out.
    pub(crate) detached: bool,
    /// Outstanding JIT allocations.
    pub(crate) jit: Vec<u64>,
}

impl Session {
    pub(crate) fn new(target_stopped: bool, max_payload: usize) -> Self {
        Self {
            decoder: PacketDecoder::with_limit(max_payload),
            no_ack: false,
            last_frame: None,
            general_cpu: None,
            resume_cpu: None,
            target_stopped,
            unreported: Vec::new(),
            detached: false,
            jit: Vec::new(),
        }
    }
}
