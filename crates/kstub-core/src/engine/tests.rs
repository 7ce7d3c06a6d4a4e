use super::*;
use crate::arch::{self, Registers};
use crate::test_support::{FakeHost, HostAction};

fn engine(enabled: u32, halted: u32) -> Engine<FakeHost> {
    Engine::new(
        FakeHost::new().with_memory(0x1000, b"abcdef"),
        StubConfig::default(),
        CpuMask::from_bits(enabled),
        CpuMask::from_bits(halted),
    )
    .unwrap()
}

fn send(engine: &Engine<FakeHost>, payload: &str) -> Vec<String> {
    engine.host().push_packet(payload);
    engine.packet_available().unwrap();
    engine.host().take_replies()
}

fn send_one(engine: &Engine<FakeHost>, payload: &str) -> String {
    let mut replies = send(engine, payload);
    assert_eq!(replies.len(), 1, "expected one reply to {payload}: {replies:?}");
    replies.remove(0)
}

fn mask(bits: u32) -> CpuMask {
    CpuMask::from_bits(bits)
}

// ============================================================================
// Initialization
// ============================================================================

#[test]
fn test_new_rejects_halted_outside_mask() {
    let result = Engine::new(FakeHost::new(), StubConfig::default(), mask(0b01), mask(0b10));
    assert!(matches!(result, Err(EngineError::InvalidHaltedMask { .. })));
}

#[test]
fn test_initial_halted_cpus_report_interrupt() {
    let engine = engine(0b11, 0b10);
    assert_eq!(engine.cpu_state(0), Some(RunState::Running));
    assert_eq!(engine.cpu_state(1), Some(RunState::Halted));
    assert_eq!(engine.halt_reason(1), Some(HaltReason::Interrupt));
    assert_eq!(engine.selected_cpu(), Some(1));
}

#[test]
fn test_configure_once() {
    let engine = engine(0b1, 0);
    engine.set_watchpoint_count(2).unwrap();
    assert_eq!(
        engine.set_watchpoint_count(4),
        Err(EngineError::AlreadyConfigured("watchpoint count"))
    );
    engine
        .set_image(ImageDescriptor::new("kernel", 0x2000, 0x1000))
        .unwrap();
    assert_eq!(
        engine.set_image(ImageDescriptor::new("kernel", 0, 0)),
        Err(EngineError::AlreadyConfigured("image"))
    );
    assert_eq!(engine.image().map(ImageDescriptor::slide), Some(0x1000));
}

// ============================================================================
// Halt recording and processing
// ============================================================================

#[test]
fn test_breakpoint_scenario() {
    let engine = engine(0b11, 0);
    assert_eq!(send_one(&engine, "Z1,1000,4"), "OK");
    assert_eq!(engine.host().breakpoints(), vec![0x1000]);

    engine.host().set_pc(0, 0x1000);
    engine.record_breakpoint(0).unwrap();
    assert_eq!(engine.cpu_state(0), Some(RunState::HaltPending));
    engine.process_halts(mask(0b01)).unwrap();
    assert_eq!(
        engine.host().take_replies(),
        vec!["T05thread:1;20:0010000000000000;hwbreak:;"]
    );
    assert_eq!(engine.selected_cpu(), Some(0));

    // Re-inserting is idempotent and uses no new slot.
    assert_eq!(send_one(&engine, "Z1,1000,4"), "OK");
    assert_eq!(engine.breakpoint_count(), 1);

    assert!(send(&engine, "c").is_empty());
    assert_eq!(engine.host().take_actions(), vec![HostAction::Resume(0)]);
    assert_eq!(engine.cpu_state(0), Some(RunState::Running));
    assert_eq!(engine.halt_reason(0), Some(HaltReason::None));
}

#[test]
fn test_halt_mask_consistent() {
    let engine = engine(0b111, 0);
    engine.record_halt(0).unwrap();
    engine.record_step(2).unwrap();
    engine.process_halts(mask(0b101)).unwrap();
    assert_eq!(engine.halted_mask(), mask(0b101));
    assert!(!engine.is_faulted());
}

#[test]
fn test_halt_mask_mismatch_is_fatal() {
    let engine = engine(0b111, 0);
    engine.record_halt(0).unwrap();
    engine.record_step(2).unwrap();
    assert_eq!(
        engine.process_halts(mask(0b111)),
        Err(EngineError::HaltMaskMismatch {
            asserted: mask(0b111),
            recorded: mask(0b101)
        })
    );
    assert!(engine.is_faulted());
    assert_eq!(engine.host().logs().len(), 1);
    assert!(engine.host().logs()[0].contains("mismatch"));

    // Inert from now on.
    assert_eq!(engine.cpu_state(0), Some(RunState::HaltPending));
    assert_eq!(engine.process_halts(mask(0b101)), Err(EngineError::Faulted));
    assert_eq!(engine.record_halt(1), Err(EngineError::Faulted));
    engine.host().push_packet("?");
    assert_eq!(engine.packet_available(), Err(EngineError::Faulted));
    assert!(engine.host().take_output().is_empty());
}

#[test]
fn test_process_halts_noop_when_nothing_pending() {
    let engine = engine(0b11, 0b01);
    engine.process_halts(mask(0b01)).unwrap();
    assert!(engine.host().take_output().is_empty());
}

#[test]
fn test_stop_reply_prefers_non_interrupt() {
    let engine = engine(0b111, 0);
    engine.record_halt(0).unwrap();
    engine.record_step(2).unwrap();
    engine.record_halt(1).unwrap();
    engine.process_halts(mask(0b111)).unwrap();
    let replies = engine.host().take_replies();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].starts_with("T05thread:3;"));
    assert_eq!(engine.selected_cpu(), Some(2));
}

#[test]
fn test_no_stop_reply_while_debugger_stopped() {
    let engine = engine(0b11, 0b01);
    engine.record_halt(1).unwrap();
    engine.process_halts(mask(0b11)).unwrap();
    assert!(engine.host().take_output().is_empty());
    assert_eq!(engine.cpu_state(1), Some(RunState::Halted));
}

fn stopped_with_deferred_breakpoint() -> Engine<FakeHost> {
    let engine = engine(0b11, 0);
    engine.host().set_pc(0, 0x1000);
    engine.record_breakpoint(0).unwrap();
    engine.process_halts(mask(0b01)).unwrap();
    assert_eq!(
        engine.host().take_replies(),
        vec!["T05thread:1;20:0010000000000000;hwbreak:;"]
    );

    engine.host().set_pc(1, 0x2000);
    engine.record_breakpoint(1).unwrap();
    engine.process_halts(mask(0b11)).unwrap();
    assert!(engine.host().take_output().is_empty());
    engine
}

#[test]
fn test_deferred_breakpoint_reported_on_continue() {
    let engine = stopped_with_deferred_breakpoint();
    assert_eq!(
        send(&engine, "c"),
        vec!["T05thread:2;20:0020000000000000;hwbreak:;"]
    );
    assert!(engine.host().take_actions().is_empty());
    assert_eq!(engine.cpu_state(1), Some(RunState::Halted));
    assert_eq!(engine.selected_cpu(), Some(1));

    // Once reported, the next continue resumes everything.
    assert!(send(&engine, "c").is_empty());
    assert_eq!(
        engine.host().take_actions(),
        vec![HostAction::Resume(0), HostAction::Resume(1)]
    );
}

#[test]
fn test_deferred_breakpoint_reported_on_step_and_vcont() {
    let engine = stopped_with_deferred_breakpoint();
    assert_eq!(
        send(&engine, "s"),
        vec!["T05thread:2;20:0020000000000000;hwbreak:;"]
    );
    assert!(engine.host().take_actions().is_empty());

    let engine = stopped_with_deferred_breakpoint();
    assert_eq!(
        send(&engine, "vCont;s:1;c"),
        vec!["T05thread:2;20:0020000000000000;hwbreak:;"]
    );
    assert!(engine.host().take_actions().is_empty());
}

#[test]
fn test_vcont_on_running_cpu_waits_for_its_stop() {
    let engine = engine(0b11, 0b01);
    assert!(send(&engine, "vCont;s:2").is_empty());
    assert!(engine.host().take_actions().is_empty());

    engine.record_halt(1).unwrap();
    engine.process_halts(mask(0b11)).unwrap();
    let replies = engine.host().take_replies();
    assert_eq!(replies.len(), 1, "{replies:?}");
    assert!(replies[0].starts_with("T02thread:2;"), "{replies:?}");
}

#[test]
fn test_record_on_halted_cpu_is_ignored() {
    let engine = engine(0b1, 0b1);
    engine.record_step(0).unwrap();
    assert_eq!(engine.halt_reason(0), Some(HaltReason::Interrupt));
}

#[test]
fn test_record_outside_mask() {
    let engine = engine(0b1, 0);
    assert_eq!(engine.record_breakpoint(3), Err(EngineError::InvalidCpu(3)));
    assert_eq!(engine.record_halt(40), Err(EngineError::InvalidCpu(40)));
}

#[test]
fn test_watchpoint_hit_names_kind() {
    let engine = engine(0b1, 0);
    engine.set_watchpoint_count(2).unwrap();
    assert_eq!(send_one(&engine, "Z4,2000,8"), "OK");
    engine.record_watchpoint(0, 0x2004).unwrap();
    engine.process_halts(mask(0b1)).unwrap();
    let replies = engine.host().take_replies();
    assert!(replies[0].ends_with(";awatch:0000000000002004;"), "{replies:?}");
}

// ============================================================================
// Transport
// ============================================================================

#[test]
fn test_ack_and_nack() {
    let engine = engine(0b1, 0b1);
    engine.host().push_input(b"$qAttached#00");
    engine.packet_available().unwrap();
    assert_eq!(engine.host().take_output(), b"-");

    engine.host().push_packet("qAttached");
    engine.packet_available().unwrap();
    assert_eq!(engine.host().take_output(), b"+$1#31");

    engine.host().push_input(b"-");
    engine.packet_available().unwrap();
    assert_eq!(engine.host().take_output(), b"$1#31");
}

#[test]
fn test_no_ack_mode() {
    let engine = engine(0b1, 0b1);
    engine.host().push_packet("QStartNoAckMode");
    engine.packet_available().unwrap();
    assert_eq!(engine.host().take_output(), b"+$OK#9a");

    engine.host().push_input(b"+");
    engine.host().push_packet("qAttached");
    engine.packet_available().unwrap();
    assert_eq!(engine.host().take_output(), b"$1#31");

    engine.host().push_input(b"$qAttached#00");
    engine.packet_available().unwrap();
    assert!(engine.host().take_output().is_empty());
}

#[test]
fn test_interrupt_byte_halts_running_cpus() {
    let engine = engine(0b111, 0b010);
    engine.host().push_input(&[0x03]);
    engine.packet_available().unwrap();
    assert_eq!(
        engine.host().take_actions(),
        vec![HostAction::Interrupt(0), HostAction::Interrupt(2)]
    );
    // Initial halt left the debugger stopped; resume first.
    assert!(send(&engine, "c").is_empty());
    engine.host().take_actions();
    engine.host().push_input(&[0x03]);
    engine.packet_available().unwrap();
    assert_eq!(engine.host().take_actions().len(), 3);

    for cpu in 0..3 {
        engine.record_halt(cpu).unwrap();
    }
    engine.process_halts(mask(0b111)).unwrap();
    let replies = engine.host().take_replies();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].starts_with("T02thread:1;"));
}

#[test]
fn test_split_packet_across_reads() {
    let engine = engine(0b1, 0b1);
    let frame = kstub_proto::encode(b"qAttached");
    engine.host().push_input(&frame[..4]);
    engine.packet_available().unwrap();
    assert!(engine.host().take_output().is_empty());
    engine.host().push_input(&frame[4..]);
    engine.packet_available().unwrap();
    assert_eq!(engine.host().take_replies(), vec!["1"]);
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_unsupported_and_malformed() {
    let engine = engine(0b1, 0b1);
    assert_eq!(send_one(&engine, "qTStatus"), "");
    assert_eq!(send_one(&engine, "m1000"), "E01");
    assert_eq!(send_one(&engine, "Z0,1000,4"), "");
}

#[test]
fn test_halt_reason_query() {
    let engine = engine(0b11, 0b10);
    engine.host().set_pc(1, 0x4000);
    assert_eq!(
        send_one(&engine, "?"),
        "T02thread:2;20:0040000000000000;"
    );
}

#[test]
fn test_halt_reason_with_nothing_halted_interrupts() {
    let engine = engine(0b11, 0);
    assert!(send(&engine, "?").is_empty());
    assert_eq!(
        engine.host().take_actions(),
        vec![HostAction::Interrupt(0), HostAction::Interrupt(1)]
    );
    engine.record_halt(0).unwrap();
    engine.record_halt(1).unwrap();
    engine.process_halts(mask(0b11)).unwrap();
    assert!(engine.host().take_replies()[0].starts_with("T02thread:1;"));
}

#[test]
fn test_registers_require_halted_cpu() {
    let engine = engine(0b11, 0b01);
    assert_eq!(send_one(&engine, "Hg2"), "OK");
    assert_eq!(send_one(&engine, "g"), "E06");
    assert_eq!(send_one(&engine, "m1000,4"), "E06");
    assert_eq!(send_one(&engine, "Hg9"), "E02");
    assert_eq!(send_one(&engine, "Hg1"), "OK");
    assert!(!send_one(&engine, "g").starts_with('E'));
}

#[test]
fn test_register_read_write() {
    let engine = engine(0b1, 0b1);
    let mut registers = Registers::default();
    registers.x[1] = 0xdead_beef;
    registers.pc = 0x1000;
    engine.host().set_registers(0, registers.clone());

    let hex_regs = send_one(&engine, "g");
    assert_eq!(hex_regs, arch::encode_registers(&registers));
    assert_eq!(send_one(&engine, "p20"), "0010000000000000");
    assert_eq!(send_one(&engine, "p1"), "efbeadde00000000");
    assert_eq!(send_one(&engine, "p200"), "E01");

    let mut updated = registers;
    updated.sp = 0x8000;
    let payload = format!("G{}", arch::encode_registers(&updated));
    assert_eq!(send_one(&engine, &payload), "OK");
    assert_eq!(engine.host().registers(0).sp, 0x8000);
    assert_eq!(send_one(&engine, "G00"), "E01");
}

#[test]
fn test_memory_commands() {
    let engine = engine(0b1, 0b1);
    assert_eq!(send_one(&engine, "m1000,4"), hex::encode(b"abcd"));
    assert_eq!(send_one(&engine, "m1004,10"), hex::encode(b"ef"));
    assert_eq!(send_one(&engine, "m3000,4"), "E03");
    assert_eq!(send_one(&engine, "M1000,2:7a7a"), "OK");
    assert_eq!(engine.host().memory(0x1000, 2), b"zz");
    assert_eq!(send_one(&engine, "M1005,2:0000"), "E03");
    assert_eq!(send_one(&engine, "mffffffffffffffff,2"), "E01");
}

#[test]
fn test_memory_read_clamped_to_packet_size() {
    let host = FakeHost::new().with_memory(0, &[0x11; 0x2000]);
    let engine = Engine::new(host, StubConfig::default(), mask(0b1), mask(0b1)).unwrap();
    let reply = send_one(&engine, "m0,2000");
    assert_eq!(reply.len(), engine.config().max_memory_read() * 2);
}

#[test]
fn test_register_write_fits_smallest_packet_size() {
    let config = StubConfig::default().with_packet_size(0x100);
    let engine = Engine::new(FakeHost::new(), config, mask(0b1), mask(0b1)).unwrap();
    let mut registers = Registers::default();
    registers.pc = 0x4000_0000;
    let payload = format!("G{}", arch::encode_registers(&registers));
    assert_eq!(send_one(&engine, &payload), "OK");
    assert_eq!(engine.host().registers(0).pc, 0x4000_0000);
}

#[test]
fn test_zero_length_memory_read_rejected() {
    let engine = engine(0b1, 0b1);
    assert_eq!(send_one(&engine, "m1000,0"), "E01");
    assert_eq!(send_one(&engine, "m1000,2"), "6162");
}

#[test]
fn test_watchpoint_slots() {
    let engine = engine(0b1, 0b1);
    assert_eq!(send_one(&engine, "Z2,2000,8"), "E04");
    let engine = self::engine(0b1, 0b1);
    engine.set_watchpoint_count(1).unwrap();
    assert_eq!(send_one(&engine, "Z2,2000,8"), "OK");
    assert_eq!(send_one(&engine, "Z3,3000,8"), "E04");
    assert_eq!(send_one(&engine, "z2,2000,8"), "OK");
    assert_eq!(send_one(&engine, "z2,2000,8"), "OK");
    assert_eq!(send_one(&engine, "Z3,3000,8"), "OK");
    assert_eq!(send_one(&engine, "Z3,3000,0"), "E01");
    assert_eq!(engine.watchpoint_count_in_use(), 1);
}

#[test]
fn test_hardware_rejection() {
    let engine = engine(0b1, 0b1);
    engine.host().set_refuse_hardware(true);
    assert_eq!(send_one(&engine, "Z1,1000,4"), "E05");
    assert_eq!(engine.breakpoint_count(), 0);
}

#[test]
fn test_step_only_moves_selected_cpu() {
    let engine = engine(0b11, 0b11);
    assert_eq!(send_one(&engine, "Hc2"), "OK");
    assert!(send(&engine, "s").is_empty());
    assert_eq!(engine.host().take_actions(), vec![HostAction::Step(1)]);
    assert_eq!(engine.cpu_state(0), Some(RunState::Halted));
    assert_eq!(engine.cpu_state(1), Some(RunState::Stepping));

    engine.record_step(1).unwrap();
    engine.process_halts(mask(0b11)).unwrap();
    assert!(engine.host().take_replies()[0].starts_with("T05thread:2;"));
    assert_eq!(engine.selected_cpu(), Some(1));
}

#[test]
fn test_step_with_address_sets_pc() {
    let engine = engine(0b1, 0b1);
    assert!(send(&engine, "s8000").is_empty());
    assert_eq!(engine.host().registers(0).pc, 0x8000);
    assert_eq!(send_one(&engine, "s"), "E06");
}

#[test]
fn test_continue_resumes_all_halted() {
    let engine = engine(0b111, 0b101);
    assert!(send(&engine, "c4000").is_empty());
    assert_eq!(engine.host().registers(0).pc, 0x4000);
    assert_eq!(
        engine.host().take_actions(),
        vec![HostAction::Resume(0), HostAction::Resume(2)]
    );
    assert!(engine.halted_mask().is_empty());
}

#[test]
fn test_vcont_explicit_actions_first() {
    let engine = engine(0b111, 0b111);
    assert_eq!(send_one(&engine, "vCont?"), "vCont;c;C;s;S;t");
    assert!(send(&engine, "vCont;s:2;c").is_empty());
    assert_eq!(
        engine.host().take_actions(),
        vec![
            HostAction::Step(1),
            HostAction::Resume(0),
            HostAction::Resume(2)
        ]
    );
}

#[test]
fn test_vcont_default_before_explicit() {
    let engine = engine(0b111, 0b111);
    assert!(send(&engine, "vCont;c;s:2").is_empty());
    assert_eq!(
        engine.host().take_actions(),
        vec![
            HostAction::Step(1),
            HostAction::Resume(0),
            HostAction::Resume(2)
        ]
    );
}

#[test]
fn test_vcont_invalid_thread_changes_nothing() {
    let engine = engine(0b11, 0b11);
    assert_eq!(send_one(&engine, "vCont;c:1;s:9"), "E02");
    assert!(engine.host().take_actions().is_empty());
    assert_eq!(engine.halted_mask(), mask(0b11));
}

#[test]
fn test_thread_queries() {
    let engine = engine(0b111, 0b001);
    assert_eq!(send_one(&engine, "qfThreadInfo"), "m1,2,3");
    assert_eq!(send_one(&engine, "qsThreadInfo"), "l");
    assert_eq!(send_one(&engine, "qC"), "QC1");
    assert_eq!(send_one(&engine, "qAttached"), "1");
    assert_eq!(send_one(&engine, "T3"), "OK");
    assert_eq!(send_one(&engine, "T4"), "E02");
    assert_eq!(
        send_one(&engine, "qThreadExtraInfo,2"),
        hex::encode("CPU 1 (running)")
    );
}

#[test]
fn test_supported_features() {
    let engine = engine(0b1, 0b1);
    assert_eq!(
        send_one(&engine, "qSupported:multiprocess+;swbreak+"),
        "PacketSize=1000;qXfer:features:read+;QStartNoAckMode+;vContSupported+;hwbreak+"
    );
    assert_eq!(send_one(&engine, "qOffsets"), "");
    engine
        .set_image(ImageDescriptor::new("kernel", 0x5000, 0x1000))
        .unwrap();
    assert!(send_one(&engine, "qSupported").contains("qXfer:libraries:read+;"));
    assert_eq!(send_one(&engine, "qOffsets"), "Text=4000;Data=4000;Bss=4000");
    let libraries = send_one(&engine, "qXfer:libraries:read::0,1000");
    assert!(libraries.starts_with("l<library-list>"));
}

#[test]
fn test_target_xml_chunks() {
    let engine = engine(0b1, 0b1);
    let xml = arch::target_xml();
    let mut collected = String::new();
    let mut offset = 0;
    loop {
        let reply = send_one(&engine, &format!("qXfer:features:read:target.xml:{offset:x},40"));
        let (marker, data) = reply.split_at(1);
        collected.push_str(data);
        offset += data.len();
        if marker == "l" {
            break;
        }
        assert_eq!(marker, "m");
        assert_eq!(data.len(), 0x40);
    }
    assert_eq!(collected, xml);
    assert_eq!(
        send_one(&engine, &format!("qXfer:features:read:target.xml:{:x},40", xml.len())),
        "l"
    );
    assert_eq!(send_one(&engine, "qXfer:features:read:other.xml:0,40"), "E01");
}

#[test]
fn test_jit_allocation() {
    let engine = engine(0b1, 0b1);
    let reply = send_one(&engine, "_M1000,rwx");
    assert_eq!(reply.len(), 16);
    assert_eq!(engine.host().jit_allocations(), 1);
    assert_eq!(send_one(&engine, &format!("_m{reply}")), "OK");
    assert_eq!(send_one(&engine, &format!("_m{reply}")), "E08");
    engine.host().set_refuse_jit(true);
    assert_eq!(send_one(&engine, "_M1000,rx"), "E07");
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[test]
fn test_detach_releases_and_resumes() {
    let engine = engine(0b11, 0b11);
    engine.set_watchpoint_count(1).unwrap();
    send(&engine, "QStartNoAckMode");
    assert_eq!(send_one(&engine, "Z1,1000,4"), "OK");
    assert_eq!(send_one(&engine, "Z2,2000,4"), "OK");
    send_one(&engine, "_M1000,rw");

    assert_eq!(send_one(&engine, "D"), "OK");
    assert!(engine.host().breakpoints().is_empty());
    assert!(engine.host().watchpoints().is_empty());
    assert_eq!(engine.host().jit_allocations(), 0);
    assert_eq!(
        engine.host().take_actions(),
        vec![HostAction::Resume(0), HostAction::Resume(1)]
    );

    // Acks are back on for the next connection.
    engine.host().push_packet("qAttached");
    engine.packet_available().unwrap();
    assert_eq!(engine.host().take_output(), b"+$1#31");
}

#[test]
fn test_kill_detaches_without_reply() {
    let engine = engine(0b1, 0b1);
    assert!(send(&engine, "k").is_empty());
    assert_eq!(engine.host().take_actions(), vec![HostAction::Resume(0)]);
}

#[test]
fn test_reset_keeps_configuration() {
    let engine = engine(0b1, 0b1);
    engine.set_watchpoint_count(1).unwrap();
    assert_eq!(send_one(&engine, "Z2,2000,4"), "OK");
    send_one(&engine, "_M1000,rw");
    engine.reset().unwrap();
    assert_eq!(engine.watchpoint_count_in_use(), 0);
    assert_eq!(engine.host().jit_allocations(), 0);
    assert_eq!(engine.halted_mask(), mask(0b1));
    assert_eq!(send_one(&engine, "Z2,2000,4"), "OK");
}

#[test]
fn test_reset_can_keep_jit_memory() {
    let config = StubConfig::default()
        .with_reclaim_jit_on_detach(false)
        .with_clear_breakpoints_on_reset(false);
    let engine = Engine::new(FakeHost::new(), config, mask(0b1), mask(0b1)).unwrap();
    send_one(&engine, "_M1000,rw");
    assert_eq!(send_one(&engine, "Z1,1000,4"), "OK");
    engine.reset().unwrap();
    assert_eq!(engine.host().jit_allocations(), 1);
    assert_eq!(engine.breakpoint_count(), 1);
}
