//! Stop-reply packets.

use gdbstub::common::Signal;
use kstub_proto::{Reply, ThreadId};

use crate::arch::PC_REGNUM;
use crate::cpu::HaltReason;
use crate::host::CpuId;

/// Signal reported for a halt reason.
pub const fn signal_for(reason: HaltReason) -> Signal {
    match reason {
        HaltReason::Interrupt | HaltReason::None => Signal::SIGINT,
        HaltReason::Breakpoint { .. } | HaltReason::Watchpoint { .. } | HaltReason::Step => {
            Signal::SIGTRAP
        }
    }
}

/// `T` stop reply for `cpu`, expediting its program counter.
///
/// Watchpoint hits with no tracked kind are reported as write watchpoints.
pub fn stop_reply(cpu: CpuId, reason: HaltReason, pc: u64) -> Reply {
    let mut reply = Reply::new();
    reply.push_str(&format!(
        "T{:02x}thread:{:x};{:x}:",
        signal_for(reason).0,
        ThreadId::protocol_id(cpu),
        PC_REGNUM
    ));
    reply.push_hex(&pc.to_le_bytes()).push_str(";");
    match reason {
        HaltReason::Breakpoint { .. } => {
            reply.push_str("hwbreak:;");
        }
        HaltReason::Watchpoint { address, kind } => {
            let field = kind.map_or("watch", |kind| kind.stop_field());
            reply.push_str(field).push_str(":").push_addr(address).push_str(";");
        }
        HaltReason::Step | HaltReason::Interrupt | HaltReason::None => {}
    }
    reply
}
