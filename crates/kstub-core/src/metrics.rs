//! Engine metrics using metrics-rs.
//!
//! The engine only emits; installing a recorder is up to the embedder. With
//! no recorder installed every call here is a no-op.

use metrics::{Unit, counter, describe_counter, describe_gauge, gauge};

use crate::cpu::HaltReason;

// ============================================================================
// Metric descriptions
// ============================================================================

/// Register metric descriptions. Call once after installing a recorder.
pub fn init() {
    describe_counter!(
        "kstub_packets_received_total",
        Unit::Count,
        "Well-formed packets received from the debugger"
    );
    describe_counter!(
        "kstub_checksum_failures_total",
        Unit::Count,
        "Frames dropped because of a checksum mismatch"
    );
    describe_counter!(
        "kstub_halt_events_total",
        Unit::Count,
        "CPU halts committed by process_halts"
    );
    describe_counter!(
        "kstub_stop_replies_total",
        Unit::Count,
        "Stop replies sent to the debugger"
    );
    describe_counter!(
        "kstub_interrupts_total",
        Unit::Count,
        "Interrupt requests issued to running CPUs"
    );
    describe_gauge!(
        "kstub_halted_cpus",
        Unit::Count,
        "CPUs currently halted"
    );
}

// ============================================================================
// Metric recording functions
// ============================================================================

/// Record a received packet, labelled by its command letter.
pub fn record_packet(payload: &[u8]) {
    let command = payload
        .first()
        .map_or_else(|| "empty".to_string(), |&b| char::from(b).to_string());
    counter!("kstub_packets_received_total", "command" => command).increment(1);
}

pub fn record_checksum_failure() {
    counter!("kstub_checksum_failures_total").increment(1);
}

/// Record committed halts and the resulting halted CPU count.
pub fn record_halts(reasons: impl Iterator<Item = HaltReason>, halted_cpus: usize) {
    for reason in reasons {
        counter!("kstub_halt_events_total", "reason" => reason_label(reason)).increment(1);
    }
    #[allow(clippy::cast_precision_loss)]
    gauge!("kstub_halted_cpus").set(halted_cpus as f64);
}

pub fn record_stop_reply() {
    counter!("kstub_stop_replies_total").increment(1);
}

pub fn record_interrupts(count: usize) {
    counter!("kstub_interrupts_total").increment(count as u64);
}

const fn reason_label(reason: HaltReason) -> &'static str {
    match reason {
        HaltReason::None => "none",
        HaltReason::Breakpoint { .. } => "breakpoint",
        HaltReason::Watchpoint { .. } => "watchpoint",
        HaltReason::Step => "step",
        HaltReason::Interrupt => "interrupt",
    }
}
