//! Compiled code against the reference interpreter: same registers, same
//! cycle count.

mod common;

use common::{assert_equivalent, assert_equivalent_with, continuing_config, BASE};
use psx_jit::cpu::asm::{self, *};
use psx_jit::cpu::exception::GENERAL_VECTOR;
use psx_jit::cpu::state::cop0;
use psx_jit::jit::TraceEvent;
use psx_jit::GuestMemory;

/// Small program builder tracking guest addresses.
struct Program {
    words: Vec<u32>,
}

impl Program {
    fn new() -> Self {
        Self { words: Vec::new() }
    }

    fn here(&self) -> u32 {
        BASE + 4 * self.words.len() as u32
    }

    fn push(&mut self, word: u32) -> &mut Self {
        self.words.push(word);
        self
    }

    fn li(&mut self, rt: u8, value: u32) -> &mut Self {
        self.words.extend(asm::li(rt, value));
        self
    }

    /// Branch offset from the instruction about to be pushed to `target`.
    fn offset_to(&self, target: u32) -> i16 {
        ((target as i64 - (self.here() as i64 + 4)) / 4) as i16
    }

    /// Park the program in a self loop and return its address.
    fn halt(&mut self) -> u32 {
        let end = self.here();
        self.push(j(end)).push(nop());
        end
    }
}

#[test]
fn test_integer_loop_matches_interpreter() {
    let mut p = Program::new();
    p.li(T0, 5).push(ori(T1, ZERO, 0));
    let top = p.here();
    p.push(addu(T1, T1, T0)).push(addiu(T0, T0, -1));
    let back = p.offset_to(top);
    p.push(bne(T0, ZERO, back)).push(sll(T2, T1, 2));
    p.push(slt(T3, T0, T1))
        .push(sltiu(S0, T1, 100))
        .push(nor(S1, T1, T2))
        .push(srav(V0, S1, T3))
        .push(xori(V1, T2, 0xFFFF));
    let end = p.halt();

    let m = assert_equivalent(&p.words, end, |_, _| {});
    assert_eq!(m.cpu.regs.gpr(T1), 15);
    assert_eq!(m.cpu.regs.gpr(T2), 60);
}

#[test]
fn test_muldiv_stalls_match_interpreter() {
    let mut p = Program::new();
    p.li(T0, 0x1234_5678).li(T1, 0x9ABC);
    p.push(mult(T0, T1)).push(mflo(S0)).push(mfhi(S1));
    p.push(divu(T0, T1)).push(addiu(T2, T2, 1)).push(mflo(V0)).push(mfhi(V1));
    p.push(div(T0, ZERO)).push(mflo(A0)).push(mfhi(A1));
    let end = p.halt();

    let m = assert_equivalent(&p.words, end, |_, _| {});
    assert_eq!(m.cpu.regs.gpr(V0), 0x1234_5678 / 0x9ABC);
    assert_eq!(m.cpu.regs.gpr(V1), 0x1234_5678 % 0x9ABC);
}

#[test]
fn test_memory_widths_match_interpreter() {
    let mut p = Program::new();
    p.li(T0, 0x8765_43F1).li(A0, 0x2000);
    p.push(sw(T0, A0, 0))
        .push(sh(T0, A0, 6))
        .push(sb(T0, A0, 9))
        .push(lb(S0, A0, 0))
        .push(lbu(S1, A0, 0))
        .push(lh(T1, A0, 2))
        .push(lhu(T2, A0, 2))
        .push(lw(T3, A0, 4))
        .push(lwl(V0, A0, 5))
        .push(lwr(V0, A0, 2))
        .push(swl(T0, A0, 13))
        .push(swr(T0, A0, 14))
        .push(lw(V1, A0, 12));
    let end = p.halt();

    let m = assert_equivalent(&p.words, end, |_, _| {});
    assert_eq!(m.cpu.regs.gpr(S0), 0xFFFF_FFF1);
    assert_eq!(m.cpu.regs.gpr(S1), 0xF1);
}

#[test]
fn test_misaligned_load_raises_same_exception() {
    let mut p = Program::new();
    p.li(A0, 0x2001).push(addiu(T0, ZERO, 7)).push(lw(T1, A0, 0)).push(addiu(T0, ZERO, 9));
    p.halt();
    let handler = [j(GENERAL_VECTOR), nop()];

    let m = assert_equivalent(&p.words, GENERAL_VECTOR, |_, mem| {
        mem.load_words(GENERAL_VECTOR, &handler);
    });
    assert_eq!(m.cpu.regs.gpr(T0), 7);
    assert_eq!(m.cpu.regs.cop0(cop0::EPC), BASE + 12);
    assert_eq!(m.jit.stats().exceptions, 1);
}

#[test]
fn test_overflow_in_delay_slot_sets_branch_delay() {
    let mut p = Program::new();
    p.li(T0, 0x7FFF_FFFF);
    let target = p.here() + 16;
    let off = p.offset_to(target);
    p.push(beq(ZERO, ZERO, off)).push(addi(T1, T0, 1));
    p.push(nop()).push(nop());
    p.halt();
    let handler = [j(GENERAL_VECTOR), nop()];

    let m = assert_equivalent(&p.words, GENERAL_VECTOR, |_, mem| {
        mem.load_words(GENERAL_VECTOR, &handler);
    });
    assert_eq!(m.cpu.regs.cop0(cop0::EPC), BASE + 8);
    assert_ne!(m.cpu.regs.cop0(cop0::CAUSE) & 0x8000_0000, 0);
}

#[test]
fn test_rounding_mode_change_rebuilds_once() {
    let mut p = Program::new();
    p.li(T0, 1.0f32.to_bits())
        .push(mtc1(T0, 0))
        .li(T1, 3.0f32.to_bits())
        .push(mtc1(T1, 1))
        .push(div_s(2, 0, 1))
        .push(ori(T2, ZERO, 1))
        .push(ctc1(T2, 31))
        .push(div_s(3, 0, 1))
        .push(cvt_w_s(4, 3));
    let next = p.here() + 8;
    p.push(j(next)).push(nop());
    p.push(div_s(5, 0, 1)).push(mfc1(V0, 5)).push(mfc1(V1, 2)).push(cfc1(A0, 31));
    let end = p.halt();

    let m = assert_equivalent(&p.words, end, |_, _| {});
    let flags = m.jit.flags();
    assert!(flags.has_set_rounding);
    assert!(flags.last_set_rounding);
    assert_eq!(m.jit.stats().adaptive_recompiles, 1);
    // Round toward zero lands below round to nearest for 1/3.
    assert!(f32::from_bits(m.cpu.regs.gpr(V0)) < f32::from_bits(m.cpu.regs.gpr(V1)));
}

#[test]
fn test_prefix_across_blocks_rebuilds_once() {
    let mut p = Program::new();
    p.push(lv_s(4, ZERO, 0x2000)).push(lv_s(8, ZERO, 0x2004));
    p.push(vpfxs(0x1_0000));
    let next = p.here() + 8;
    p.push(j(next)).push(nop());
    p.push(vadd_s(0, 4, 8)).push(sv_s(0, ZERO, 0x2008)).push(vmul_s(1, 4, 8));
    let end = p.halt();

    let data = [1.5f32.to_bits(), 4.0f32.to_bits()];
    let mut m = assert_equivalent(&p.words, end, |_, mem| {
        mem.load_words(0x2000, &data);
    });
    assert!(!m.jit.flags().start_default_prefix);
    assert_eq!(m.jit.stats().adaptive_recompiles, 1);
    // -1.5 + 4.0 with the negating source prefix.
    assert_eq!(m.mem.read_u32(0x2008).unwrap(), 2.5f32.to_bits());
    assert_eq!(m.cpu.regs.vpr(1), 6.0);
}

#[test]
fn test_cop0_moves_match_interpreter() {
    let mut p = Program::new();
    p.push(addiu(T0, ZERO, 3)).push(mtc0(T0, cop0::BDA)).push(mfc0(T1, cop0::BDA));
    p.push(addiu(T1, T1, 1));
    let end = p.halt();

    let m = assert_equivalent(&p.words, end, |_, _| {});
    assert_eq!(m.cpu.regs.gpr(T1), 4);
}

#[test]
fn test_untranslated_instruction_goes_through_interpreter() {
    let mut p = Program::new();
    p.push(addiu(T0, ZERO, 1)).push(0xFC00_0000).push(addiu(T0, ZERO, 2));
    p.halt();
    let handler = [j(GENERAL_VECTOR), nop()];

    let m = assert_equivalent(&p.words, GENERAL_VECTOR, |_, mem| {
        mem.load_words(GENERAL_VECTOR, &handler);
    });
    assert_eq!(m.cpu.regs.gpr(T0), 1);
    assert_eq!(m.cpu.regs.cop0(cop0::EPC), BASE + 4);
    assert_eq!(m.jit.stats().interpreter_fallbacks, 1);
}

#[test]
fn test_continued_jumps_match_interpreter() {
    let mut p = Program::new();
    p.push(addiu(T0, ZERO, 3));
    let top = p.here();
    let first = top + 16;
    p.push(addiu(T1, T1, 2)).push(j(first)).push(sll(T2, T1, 1)).push(nop());
    assert_eq!(p.here(), first);
    let second = first + 16;
    p.push(addu(T3, T3, T2)).push(j(second)).push(addiu(T0, T0, -1)).push(nop());
    assert_eq!(p.here(), second);
    let back = p.offset_to(top);
    p.push(bne(T0, ZERO, back)).push(xor(V0, T3, T1));
    let end = p.halt();

    let m = assert_equivalent_with(continuing_config(), &p.words, end, |_, _| {});
    assert_eq!(m.cpu.regs.gpr(T1), 6);
    assert_eq!(m.cpu.regs.gpr(T3), 4 + 8 + 12);
    assert!(!m.jit.cache().proxies().is_empty());
}

#[test]
fn test_write_into_continued_range_recompiles() {
    let mut p = Program::new();
    p.li(T3, addiu(T1, T1, 0x10)).push(addiu(T2, ZERO, 2));
    let top = p.here();
    let target = top + 16;
    p.push(addiu(T0, T0, 1)).push(j(target)).push(nop()).push(nop());
    assert_eq!(p.here(), target);
    // Patched by the store right after it: the second pass must see the
    // new instruction.
    p.push(addiu(T1, T1, 1)).push(sw(T3, ZERO, target as i16));
    let back = p.offset_to(top);
    p.push(bne(T0, T2, back)).push(nop());
    let end = p.halt();

    let m = assert_equivalent_with(continuing_config(), &p.words, end, |_, _| {});
    assert_eq!(m.cpu.regs.gpr(T1), 0x11);
    assert!(m
        .jit
        .trace()
        .iter()
        .any(|e| matches!(e, TraceEvent::Invalidate { start, .. } if *start == target)));
    assert!(m.jit.stats().blocks_compiled >= 2);
}
