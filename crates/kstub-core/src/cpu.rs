//! Per-CPU halt state machine.
//!
//! Each core moves through `Running/Stepping -> HaltPending -> Halted` and back.
//! Halt handlers record a reason (phase one), then the host asserts the full
//! halted set through `process_halts` (phase two), which commits every pending
//! CPU at once. Every CPU sits behind its own lock so halt handlers on
//! different cores never contend with each other.

use std::fmt;

use kstub_proto::WatchKind;
use parking_lot::Mutex;

use crate::host::CpuId;
use crate::mask::{CpuMask, MAX_CPUS};

/// Execution state of one CPU as seen by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stepping,
    /// A halt was recorded but not yet processed.
    HaltPending,
    Halted,
}

impl RunState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stepping => "stepping",
            Self::HaltPending => "halt pending",
            Self::Halted => "halted",
        }
    }

    /// Whether a halt reason has been recorded for this state.
    pub const fn is_recorded(self) -> bool {
        matches!(self, Self::HaltPending | Self::Halted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a CPU halted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HaltReason {
    #[default]
    None,
    Breakpoint {
        address: u64,
    },
    /// `kind` is `None` when no tracked watchpoint covers the address.
    Watchpoint {
        address: u64,
        kind: Option<WatchKind>,
    },
    Step,
    Interrupt,
}

impl HaltReason {
    /// Anything beats an interrupt; otherwise the earlier reason stands.
    const fn supersedes(self, current: Self) -> bool {
        matches!(current, Self::None)
            || (matches!(current, Self::Interrupt) && !matches!(self, Self::Interrupt | Self::None))
    }
}

/// Outcome of a recording call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recorded {
    /// The CPU moved to `HaltPending`.
    Pending,
    /// The CPU was already pending; the kept reason is returned.
    Merged(HaltReason),
    /// The CPU was already halted and the call was ignored.
    AlreadyHalted,
}

#[derive(Clone, Copy, Debug)]
struct Cpu {
    state: RunState,
    reason: HaltReason,
}

/// State for every enabled CPU.
pub(crate) struct CpuTable {
    enabled: CpuMask,
    cpus: Vec<Mutex<Cpu>>,
}

impl CpuTable {
    /// CPUs in `halted` start `Halted` with reason `Interrupt`; the rest run.
    pub(crate) fn new(enabled: CpuMask, halted: CpuMask) -> Self {
        let cpus = (0..MAX_CPUS)
            .map(|cpu| {
                let initial = if halted.contains(cpu) {
                    Cpu {
                        state: RunState::Halted,
                        reason: HaltReason::Interrupt,
                    }
                } else {
                    Cpu {
                        state: RunState::Running,
                        reason: HaltReason::None,
                    }
                };
                Mutex::new(initial)
            })
            .collect();
        Self { enabled, cpus }
    }

    pub(crate) const fn enabled(&self) -> CpuMask {
        self.enabled
    }

    fn slot(&self, cpu: CpuId) -> Option<&Mutex<Cpu>> {
        if self.enabled.contains(cpu) {
            self.cpus.get(cpu)
        } else {
            None
        }
    }

    pub(crate) fn state(&self, cpu: CpuId) -> Option<RunState> {
        self.slot(cpu).map(|slot| slot.lock().state)
    }

    pub(crate) fn reason(&self, cpu: CpuId) -> Option<HaltReason> {
        self.slot(cpu).map(|slot| slot.lock().reason)
    }

    /// Record a halt reason. Returns `None` for a CPU outside the mask.
    pub(crate) fn record(&self, cpu: CpuId, reason: HaltReason) -> Option<Recorded> {
        let mut entry = self.slot(cpu)?.lock();
        let outcome = match entry.state {
            RunState::Halted => Recorded::AlreadyHalted,
            RunState::HaltPending => {
                if reason.supersedes(entry.reason) {
                    entry.reason = reason;
                }
                Recorded::Merged(entry.reason)
            }
            RunState::Running | RunState::Stepping => {
                entry.state = RunState::HaltPending;
                entry.reason = reason;
                Recorded::Pending
            }
        };
        Some(outcome)
    }

    fn mask_where(&self, predicate: impl Fn(RunState) -> bool) -> CpuMask {
        self.enabled
            .iter()
            .filter(|&cpu| predicate(self.cpus[cpu].lock().state))
            .collect()
    }

    /// CPUs with a recorded reason (`HaltPending` or `Halted`).
    pub(crate) fn recorded_mask(&self) -> CpuMask {
        self.mask_where(RunState::is_recorded)
    }

    pub(crate) fn halted_mask(&self) -> CpuMask {
        self.mask_where(|state| state == RunState::Halted)
    }

    pub(crate) fn running_mask(&self) -> CpuMask {
        self.mask_where(|state| matches!(state, RunState::Running | RunState::Stepping))
    }

    /// Move every pending CPU to `Halted`, returning them in index order.
    pub(crate) fn commit(&self) -> Vec<(CpuId, HaltReason)> {
        let mut newly = Vec::new();
        for cpu in self.enabled.iter() {
            let mut entry = self.cpus[cpu].lock();
            if entry.state == RunState::HaltPending {
                entry.state = RunState::Halted;
                newly.push((cpu, entry.reason));
            }
        }
        newly
    }

    /// `Halted -> Running` or `Halted -> Stepping`. No-op otherwise.
    pub(crate) fn resume(&self, cpu: CpuId, step: bool) -> bool {
        let Some(slot) = self.slot(cpu) else {
            return false;
        };
        let mut entry = slot.lock();
        if entry.state != RunState::Halted {
            return false;
        }
        entry.state = if step {
            RunState::Stepping
        } else {
            RunState::Running
        };
        entry.reason = HaltReason::None;
        true
    }
}

/// Pick the CPU a stop reply reports: the lowest one that halted for a reason
/// other than an interrupt, else the lowest one.
pub(crate) fn report_choice(newly: &[(CpuId, HaltReason)]) -> Option<(CpuId, HaltReason)> {
    newly
        .iter()
        .find(|(_, reason)| !matches!(reason, HaltReason::Interrupt))
        .or_else(|| newly.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(enabled: u32, halted: u32) -> CpuTable {
        CpuTable::new(CpuMask::from_bits(enabled), CpuMask::from_bits(halted))
    }

    #[test]
    fn test_initial_states() {
        let cpus = table(0b111, 0b010);
        assert_eq!(cpus.state(0), Some(RunState::Running));
        assert_eq!(cpus.state(1), Some(RunState::Halted));
        assert_eq!(cpus.reason(1), Some(HaltReason::Interrupt));
        assert_eq!(cpus.state(3), None);
        assert_eq!(cpus.halted_mask(), CpuMask::single(1));
        assert_eq!(cpus.running_mask(), CpuMask::from_bits(0b101));
    }

    #[test]
    fn test_record_then_commit() {
        let cpus = table(0b111, 0);
        let reason = HaltReason::Breakpoint { address: 0x1000 };
        assert_eq!(cpus.record(0, reason), Some(Recorded::Pending));
        assert_eq!(cpus.record(2, HaltReason::Step), Some(Recorded::Pending));
        assert_eq!(cpus.state(0), Some(RunState::HaltPending));
        assert_eq!(cpus.recorded_mask(), CpuMask::from_bits(0b101));
        assert!(cpus.halted_mask().is_empty());

        let newly = cpus.commit();
        assert_eq!(newly, vec![(0, reason), (2, HaltReason::Step)]);
        assert_eq!(cpus.halted_mask(), CpuMask::from_bits(0b101));
        assert!(cpus.commit().is_empty());
    }

    #[test]
    fn test_second_record_keeps_informative_reason() {
        let cpus = table(0b1, 0);
        cpus.record(0, HaltReason::Interrupt);
        let bp = HaltReason::Breakpoint { address: 0x40 };
        assert_eq!(cpus.record(0, bp), Some(Recorded::Merged(bp)));
        assert_eq!(
            cpus.record(0, HaltReason::Interrupt),
            Some(Recorded::Merged(bp))
        );
        assert_eq!(cpus.record(0, HaltReason::Step), Some(Recorded::Merged(bp)));
        assert_eq!(cpus.reason(0), Some(bp));
    }

    #[test]
    fn test_record_on_halted_is_ignored() {
        let cpus = table(0b1, 0b1);
        assert_eq!(
            cpus.record(0, HaltReason::Step),
            Some(Recorded::AlreadyHalted)
        );
        assert_eq!(cpus.reason(0), Some(HaltReason::Interrupt));
    }

    #[test]
    fn test_record_outside_mask() {
        let cpus = table(0b1, 0);
        assert_eq!(cpus.record(1, HaltReason::Step), None);
        assert_eq!(cpus.record(99, HaltReason::Step), None);
    }

    #[test]
    fn test_resume_only_from_halted() {
        let cpus = table(0b11, 0b01);
        assert!(!cpus.resume(1, false));
        assert!(cpus.resume(0, true));
        assert_eq!(cpus.state(0), Some(RunState::Stepping));
        assert_eq!(cpus.reason(0), Some(HaltReason::None));
        assert!(!cpus.resume(0, false));
        assert!(!cpus.resume(5, false));
    }

    #[test]
    fn test_report_choice_prefers_non_interrupt() {
        let newly = [
            (0, HaltReason::Interrupt),
            (2, HaltReason::Step),
            (3, HaltReason::Breakpoint { address: 8 }),
        ];
        assert_eq!(report_choice(&newly), Some((2, HaltReason::Step)));

        let interrupts = [(1, HaltReason::Interrupt), (3, HaltReason::Interrupt)];
        assert_eq!(report_choice(&interrupts), Some((1, HaltReason::Interrupt)));
        assert_eq!(report_choice(&[]), None);
    }
}
