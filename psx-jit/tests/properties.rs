//! Cache, breakpoint and timing behaviour observed through the public API.

mod common;

use common::{assert_equivalent, config, Machine, BASE};
use psx_jit::cpu::asm::{self, *};
use psx_jit::debugger::BreakAction;
use psx_jit::jit::{replacement, TraceEvent};
use psx_jit::{CoreState, EventScheduler, GuestMemory};

fn word_index(addr: u32) -> usize {
    ((addr - BASE) / 4) as usize
}

#[test]
fn test_guest_write_makes_block_unreachable() {
    // Call a leaf at 0x1100, patch its first instruction, call it again.
    let mut program = vec![nop(); word_index(0x110C)];
    let [hi, lo] = asm::li(T3, addiu(V0, V0, 10));
    program[0] = hi;
    program[1] = lo;
    program[2] = jal(0x1100);
    program[4] = sw(T3, ZERO, 0x1100);
    program[5] = jal(0x1100);
    let end = 0x101C;
    program[word_index(end)] = j(end);
    program[word_index(0x1100)] = addiu(V0, V0, 1);
    program[word_index(0x1104)] = jr(RA);

    let m = assert_equivalent(&program, end, |_, _| {});
    assert_eq!(m.cpu.regs.gpr(V0), 11);
    assert!(m
        .jit
        .trace()
        .iter()
        .any(|e| matches!(e, TraceEvent::Invalidate { start: 0x1100, .. })));
}

#[test]
fn test_invalidate_range_drops_covering_blocks_only() {
    let program = [addiu(T0, T0, 1), addiu(T0, T0, 1), jr(RA), nop()];
    let mut m = Machine::new(&program);
    m.mem.load_words(0x1800, &program);

    let a = m.jit.compile(BASE, &m.cpu, &mut m.mem).unwrap();
    m.jit.compile(0x1800, &m.cpu, &mut m.mem).unwrap();
    assert_eq!(m.jit.lookup(BASE), Some(a));

    assert_eq!(m.jit.invalidate(BASE + 8, 4).unwrap(), 1);
    assert_eq!(m.jit.lookup(BASE), None);
    assert!(m.jit.lookup(0x1800).is_some());

    // Outside any block.
    assert_eq!(m.jit.invalidate(0x4000, 0x100).unwrap(), 0);
}

#[test]
fn test_recompile_is_stable() {
    let program = [
        addiu(T0, T0, 1),
        beq(T0, T1, 3),
        sll(T2, T0, 1),
        addu(T3, T2, T0),
        jr(RA),
        nop(),
    ];
    let mut m = Machine::new(&program);

    let first = m.jit.compile(BASE, &m.cpu, &mut m.mem).unwrap();
    let (size, exits) = {
        let b = m.jit.block(first).unwrap();
        (b.original_size, b.exits.len())
    };
    m.jit.invalidate(BASE, size).unwrap();
    assert_eq!(m.jit.lookup(BASE), None);

    let second = m.jit.compile(BASE, &m.cpu, &mut m.mem).unwrap();
    let b = m.jit.block(second).unwrap();
    assert_eq!(b.original_size, size);
    assert_eq!(b.exits.len(), exits);
    assert_eq!(size, 12);
    assert_eq!(exits, 2);
}

#[test]
fn test_jump_block_at_0x10000() {
    let base = 0x0001_0000;
    let program = [
        addiu(T0, T0, 1),
        j(0x0001_0010),
        mov(T1, T0),
        nop(),
        j(0x0001_0010),
        nop(),
    ];
    let mut m = Machine::at(base, &program, config());
    m.cpu.regs.set_gpr(T0, 5);

    let id = m.jit.compile(base, &m.cpu, &mut m.mem).unwrap();
    let block = m.jit.block(id).unwrap();
    assert_eq!(block.exits.len(), 1);
    assert_eq!(block.exits[0].target, 0x0001_0010);
    assert_eq!(block.original_size, 12);

    m.run_to(0x0001_0010);
    assert_eq!(m.cpu.regs.gpr(T0), 6);
    assert_eq!(m.cpu.regs.gpr(T1), 6);
}

#[test]
fn test_delay_slot_does_not_affect_branch_decision() {
    let end = BASE + 0x24;
    let mut program = vec![nop(); word_index(end) + 2];
    // t0 == t1 going in, so the branch is taken even though the delay
    // slot breaks the equality.
    program[0] = beq(T0, T1, 3);
    program[1] = addiu(T0, T0, 1);
    program[2] = addiu(S0, ZERO, 0x55);
    // 0x1010: jr through t2, which the delay slot moves away.
    program[4] = jr(T2);
    program[5] = addiu(T2, T2, 8);
    program[word_index(0x1018)] = addiu(S1, ZERO, 0x66);
    program[word_index(0x101C)] = j(end);
    program[word_index(end)] = j(end);

    let m = assert_equivalent(&program, end, |cpu, _| {
        cpu.regs.set_gpr(T2, 0x1018);
    });
    assert_eq!(m.cpu.regs.gpr(S0), 0, "branch fell through");
    assert_eq!(m.cpu.regs.gpr(S1), 0x66);
    assert_eq!(m.cpu.regs.gpr(T0), 1);
    assert_eq!(m.cpu.regs.gpr(T2), 0x1020);
}

// ═══════════════════════════════════════════════════════════════════════════
// Replacements
// ═══════════════════════════════════════════════════════════════════════════

const MEMSET: u32 = 0x1100;
const MEMSET_END: u32 = BASE + 0x24;

/// `memset(0x2000, 0xAB, 4)` through a `jal`, then `t0 += 1`. The guest
/// body at `MEMSET` only bumps `t5`, so the two paths are told apart.
fn memset_caller() -> Vec<u32> {
    let mut program = vec![nop(); word_index(MEMSET + 12)];
    let [hi, lo] = asm::li(A0, 0x2000);
    program[0] = hi;
    program[1] = lo;
    program[2] = addiu(A1, ZERO, 0xAB);
    program[3] = addiu(A2, ZERO, 4);
    program[4] = jal(MEMSET);
    program[6] = addiu(T0, T0, 1);
    program[7] = j(MEMSET_END);
    program[word_index(MEMSET_END)] = j(MEMSET_END);
    program[word_index(MEMSET)] = addiu(T5, T5, 1);
    program[word_index(MEMSET + 4)] = jr(RA);
    program
}

#[test]
fn test_replacement_runs_at_call_site() {
    let mut m = Machine::new(&memset_caller());
    m.jit.symbols_mut().add_function(MEMSET, 12, "memset");
    m.jit.register_replacement(MEMSET, "memset", replacement::memset);

    m.run_to(MEMSET_END);
    assert_eq!(m.mem.read_u32(0x2000).unwrap(), 0xABAB_ABAB);
    assert_eq!(m.cpu.regs.gpr(V0), 0x2000);
    assert_eq!(m.cpu.regs.gpr(RA), BASE + 0x18);
    assert_eq!(m.cpu.regs.gpr(T0), 1);
    assert_eq!(m.cpu.regs.gpr(T5), 0, "guest body ran");
    assert_eq!(m.jit.stats().replacements_called, 1);
}

#[test]
fn test_symbol_edit_restores_guest_function() {
    let mut m = Machine::new(&memset_caller());
    m.jit.symbols_mut().add_function(MEMSET, 8, "memset");
    m.jit.register_replacement(MEMSET, "memset", replacement::memset);
    // Just past the function as first described, so it does not block the
    // replacement until the symbol grows over it.
    m.jit.add_breakpoint(MEMSET + 8);
    m.jit.set_breakpoint_action(MEMSET + 8, BreakAction::LOG);

    m.run_to(MEMSET_END);
    assert_eq!(m.jit.stats().replacements_called, 1);
    assert_eq!(m.cpu.regs.gpr(T5), 0);

    m.mem.write_u32(0x2000, 0).unwrap();
    m.cpu.regs.set_pc(BASE);
    m.cpu.regs.set_next_pc(BASE + 4);
    m.jit.symbols_mut().add_function(MEMSET, 12, "memset");
    m.jit.resume(&m.cpu);

    m.run_to(MEMSET_END);
    assert_eq!(m.jit.stats().replacements_called, 1);
    assert_eq!(m.cpu.regs.gpr(T5), 1);
    assert_eq!(m.mem.read_u32(0x2000).unwrap(), 0);
    assert!(m
        .jit
        .trace()
        .iter()
        .any(|e| matches!(e, TraceEvent::CacheCleared { reason: "symbols" })));
}

// ═══════════════════════════════════════════════════════════════════════════
// Breakpoints
// ═══════════════════════════════════════════════════════════════════════════

/// `top: addiu t0, t0, 1; addiu t1, t1, 1; j top; nop`
fn counting_loop() -> [u32; 4] {
    [addiu(T0, T0, 1), addiu(T1, T1, 1), j(BASE), nop()]
}

#[test]
fn test_breakpoint_stops_before_instruction_once_per_resume() {
    let mut m = Machine::new(&counting_loop());
    m.jit.add_breakpoint(BASE + 4);

    for round in 1..=3 {
        assert_eq!(m.run_for(10_000), CoreState::Stepping);
        assert_eq!(m.cpu.regs.pc(), BASE + 4);
        assert_eq!(m.cpu.regs.gpr(T0), round);
        // The guarded instruction has not run yet.
        assert_eq!(m.cpu.regs.gpr(T1), round - 1);
        m.jit.resume(&m.cpu);
    }
    assert_eq!(m.jit.stats().breakpoint_hits, 3);
}

#[test]
fn test_conditional_breakpoint() {
    let mut m = Machine::new(&counting_loop());
    m.jit.add_breakpoint(BASE);
    m.jit.set_breakpoint_condition(BASE, Some("t0 == 4")).unwrap();

    assert_eq!(m.run_for(10_000), CoreState::Stepping);
    assert_eq!(m.cpu.regs.pc(), BASE);
    assert_eq!(m.cpu.regs.gpr(T0), 4);
}

#[test]
fn test_temporary_breakpoint_fires_once() {
    let mut m = Machine::new(&counting_loop());
    m.jit.add_temp_breakpoint(BASE + 8);

    assert_eq!(m.run_for(1_000), CoreState::Stepping);
    assert_eq!(m.cpu.regs.gpr(T0), 1);
    m.jit.resume(&m.cpu);
    assert!(m.jit.breakpoints().is_empty());

    assert_eq!(m.run_for(1_000), CoreState::NextFrame);
    assert!(m.cpu.regs.gpr(T0) > 100);
}

#[test]
fn test_disabled_breakpoint_does_not_fire() {
    let mut m = Machine::new(&counting_loop());
    m.jit.add_breakpoint(BASE + 4);
    m.jit.set_breakpoint_enabled(BASE + 4, false);
    assert_eq!(m.run_for(1_000), CoreState::NextFrame);
    assert_eq!(m.jit.stats().breakpoint_hits, 0);
}

#[test]
fn test_single_step_walks_delay_slot() {
    let mut m = Machine::new(&counting_loop());
    for _ in 0..3 {
        m.jit.single_step(&mut m.cpu, &mut m.mem).unwrap();
    }
    assert_eq!(m.cpu.regs.pc(), BASE + 12);
    assert!(m.cpu.regs.in_delay_slot());
    m.jit.single_step(&mut m.cpu, &mut m.mem).unwrap();
    assert_eq!(m.cpu.regs.pc(), BASE);
    assert!(!m.cpu.regs.in_delay_slot());
}

// ═══════════════════════════════════════════════════════════════════════════
// Timing
// ═══════════════════════════════════════════════════════════════════════════

/// Fires every `period` cycles after the last check and records when it
/// was consulted.
struct Recorder {
    period: u64,
    calls: Vec<(u64, u64)>,
}

impl EventScheduler for Recorder {
    fn advance(&mut self, now: u64) -> u64 {
        let next = now + self.period;
        self.calls.push((now, next));
        next
    }
}

#[test]
fn test_negative_downcount_returns_to_outer_loop_at_next_block() {
    // Three-cycle loop: the downcount crosses zero mid-block.
    let program = [addiu(T0, T0, 1), j(BASE), nop()];
    let mut m = Machine::new(&program);
    let mut recorder = Recorder {
        period: 10,
        calls: Vec::new(),
    };

    let state = m
        .jit
        .run_until(200, &mut m.cpu, &mut m.mem, &mut recorder)
        .unwrap();
    assert_eq!(state, CoreState::NextFrame);
    assert!(recorder.calls.len() > 10);

    for pair in recorder.calls.windows(2) {
        let due = pair[0].1.min(200);
        let (seen, _) = pair[1];
        assert!(seen > due, "slice ended early at {} (due {})", seen, due);
        assert!(seen - due <= 3, "ran {} cycles past the event", seen - due);
    }
    assert_eq!(m.jit.stats().slices as usize, recorder.calls.len());
}

#[test]
fn test_periodic_scheduler_sees_every_period() {
    let program = [addiu(T0, T0, 1), j(BASE), nop()];
    let mut m = Machine::new(&program);
    let mut scheduler = psx_jit::PeriodicScheduler::new(50);
    m.jit
        .run_until(1_000, &mut m.cpu, &mut m.mem, &mut scheduler)
        .unwrap();
    assert!(m.cpu.now() >= 1_000);
    assert_eq!(scheduler.fired, m.cpu.now() / 50);
}

#[test]
fn test_io_access_syncs_timestamp() {
    let program = [lui(A0, 0x1F80), lw(T0, A0, 0x1040), j(BASE + 8), nop()];
    let mut m = Machine::new(&program);
    m.run_for(100);
    assert_eq!(m.mem.io_accesses(), 1);
    // lui + lw, with the load's own cycles counted before the access.
    assert_eq!(m.mem.last_sync(), Some(3));
}
