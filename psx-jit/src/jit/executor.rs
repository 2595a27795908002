//! Host code executor.
//!
//! Runs host ops from the code buffer against the guest register file until
//! control leaves for one of the dispatcher entry points. Linked exits are
//! plain jumps inside the buffer, so one call may run through many blocks.
//!
//! ## Cycle accounting
//!
//! A block subtracts its cycle estimate from the downcount once, at its
//! exit. Ops that observe guest time (timing-sensitive memory, the
//! multiply/divide unit, the vector pipeline, breakpoints, exceptions) first
//! commit the cycles accumulated up to their own instruction, so the global
//! time they see matches the interpreter's.
//!
//! ```text
//!   CheckedEntry ─► ... ─► Load (fast path: no commit)
//!                        ─► MulDiv (commit site.cycles, schedule)
//!                        ─► SubDowncount (commit the rest) ─► exit
//! ```

use super::host::{CodeAddr, DispatchTarget, HostOp, Operand, PrefixOperand, Site};
use super::trace::TraceEvent;
use super::Jit;
use crate::cpu::decoder::decode;
use crate::cpu::exception::GuestException;
use crate::cpu::fpu::{self, FpControl};
use crate::cpu::interpreter::{self, MemWrite, Width};
use crate::cpu::state::GuestRegisters;
use crate::cpu::vfpu;
use crate::cpu::{CoreState, CpuContext};
use crate::debugger::BreakAction;
use crate::error::{JitError, JitResult};
use crate::memory::GuestMemory;

/// Point the guest at `pc` outside any delay slot.
pub(crate) fn set_guest_pc(regs: &mut GuestRegisters, pc: u32) {
    regs.set_pc(pc);
    regs.set_next_pc(pc.wrapping_add(4));
    regs.set_in_delay_slot(false);
}

/// Subtract the cycles between the last commit and `upto`.
#[inline]
fn commit(cpu: &mut CpuContext, committed: &mut u32, upto: u32) {
    if upto > *committed {
        cpu.timing.stall(&mut cpu.regs, (upto - *committed) as u64);
        *committed = upto;
    }
}

#[inline]
fn misaligned(addr: u32, width: Width) -> bool {
    addr & (width.bytes() - 1) != 0
}

/// Direct host-memory load for plain RAM, scratchpad and ROM.
fn fast_load(mem: &mut dyn GuestMemory, addr: u32, width: Width) -> Option<u32> {
    if misaligned(addr, width) || mem.is_timing_sensitive(addr) {
        return None;
    }
    let bytes = mem.host_ptr(addr)?;
    match width {
        Width::Byte => bytes.first().map(|b| *b as u32),
        Width::Half => bytes.get(..2).map(|b| u16::from_le_bytes([b[0], b[1]]) as u32),
        Width::Word => bytes
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
    }
}

fn fast_store(
    regs: &GuestRegisters,
    mem: &mut dyn GuestMemory,
    addr: u32,
    width: Width,
    value: u32,
) -> Option<MemWrite> {
    if misaligned(addr, width) || regs.cache_isolated() || mem.is_timing_sensitive(addr) {
        return None;
    }
    let bytes = mem.host_ptr_mut(addr)?;
    let len = width.bytes() as usize;
    let dst = bytes.get_mut(..len)?;
    dst.copy_from_slice(&value.to_le_bytes()[..len]);
    Some(MemWrite {
        addr,
        len: width.bytes(),
    })
}

fn extend(value: u32, width: Width, signed: bool) -> u32 {
    match (width, signed) {
        (Width::Byte, true) => value as u8 as i8 as i32 as u32,
        (Width::Half, true) => value as u16 as i16 as i32 as u32,
        _ => value,
    }
}

impl Jit {
    /// Execute host code from `entry` until it leaves for a dispatcher entry.
    pub(crate) fn execute_from(
        &mut self,
        entry: CodeAddr,
        cpu: &mut CpuContext,
        mem: &mut dyn GuestMemory,
    ) -> JitResult<DispatchTarget> {
        let mut ip = entry;
        let mut committed: u32 = 0;

        loop {
            let op = self
                .cache
                .code()
                .get(ip)
                .ok_or(JitError::InvalidCodeAddress(ip))?;
            ip += 1;

            match op {
                // ── Control ─────────────────────────────────────────────
                HostOp::CheckedEntry { resume_pc } => {
                    committed = 0;
                    if cpu.regs.downcount() < 0 {
                        set_guest_pc(&mut cpu.regs, resume_pc);
                        return Ok(DispatchTarget::OuterLoop);
                    }
                    if cpu.core_state() != CoreState::Running {
                        set_guest_pc(&mut cpu.regs, resume_pc);
                        return Ok(DispatchTarget::DispatcherCheckCoreState);
                    }
                }
                HostOp::Jump(target) => ip = target,
                HostOp::JumpIf { cond, when, target } => {
                    if (cpu.regs.read(cond) != 0) == when {
                        ip = target;
                    }
                }
                HostOp::ExitUnlinked { guest_pc } => {
                    set_guest_pc(&mut cpu.regs, guest_pc);
                    return Ok(DispatchTarget::Dispatcher);
                }
                HostOp::ExitIndirect { src } => {
                    let pc = cpu.regs.read(src);
                    set_guest_pc(&mut cpu.regs, pc);
                    return Ok(DispatchTarget::Dispatcher);
                }
                HostOp::Trampoline(target) => return Ok(target),
                HostOp::SubDowncount { cycles } => commit(cpu, &mut committed, cycles),

                // ── Integer ─────────────────────────────────────────────
                HostOp::Move { dst, src } => {
                    let v = cpu.regs.read(src);
                    cpu.regs.write(dst, v);
                }
                HostOp::LoadImm { dst, value } => cpu.regs.write(dst, value),
                HostOp::Alu { op, dst, a, b } => {
                    let v = op.apply(cpu.regs.read(a), self.operand(cpu, b));
                    cpu.regs.write(dst, v);
                }
                HostOp::AluChecked { sub, dst, a, b, site } => {
                    let (x, y) = (cpu.regs.read(a), self.operand(cpu, b));
                    match interpreter::checked_arith(sub, x, y) {
                        Ok(v) => cpu.regs.write(dst, v),
                        Err(exc) => {
                            commit(cpu, &mut committed, site.cycles);
                            return Ok(self.raise(cpu, exc, site));
                        }
                    }
                }
                HostOp::Compare { cond, dst, a, b } => {
                    let taken = cond.eval(cpu.regs.read(a), cpu.regs.read(b));
                    cpu.regs.write(dst, taken as u32);
                }
                HostOp::MulDiv { op, a, b, site } => {
                    commit(cpu, &mut committed, site.cycles);
                    let (x, y) = (cpu.regs.read(a), cpu.regs.read(b));
                    let latency = interpreter::mul_div(&mut cpu.regs, op, x, y);
                    cpu.timing.schedule_muldiv(&cpu.regs, latency);
                }
                HostOp::SyncMulDiv { site } => {
                    commit(cpu, &mut committed, site.cycles);
                    cpu.timing.sync_muldiv(&mut cpu.regs);
                }

                // ── Memory ──────────────────────────────────────────────
                HostOp::Load { width, signed, dst, base, offset, site } => {
                    let addr = cpu.regs.read(base).wrapping_add(offset as i32 as u32);
                    let value = match fast_load(mem, addr, width) {
                        Some(v) => extend(v, width, signed),
                        None => {
                            commit(cpu, &mut committed, site.cycles);
                            match interpreter::load(cpu, mem, addr, width, signed) {
                                Ok(v) => v,
                                Err(exc) => return Ok(self.raise(cpu, exc, site)),
                            }
                        }
                    };
                    cpu.regs.write(dst, value);
                }
                HostOp::Store { width, src, base, offset, site } => {
                    let addr = cpu.regs.read(base).wrapping_add(offset as i32 as u32);
                    let value = cpu.regs.read(src);
                    let write = match fast_store(&cpu.regs, mem, addr, width, value) {
                        Some(w) => w,
                        None => {
                            commit(cpu, &mut committed, site.cycles);
                            match interpreter::store(cpu, mem, addr, width, value) {
                                Ok(w) => w,
                                Err(exc) => return Ok(self.raise(cpu, exc, site)),
                            }
                        }
                    };
                    self.note_write(write)?;
                }

                // ── Coprocessors ────────────────────────────────────────
                HostOp::CheckCop { cop, site } => {
                    if !cpu.regs.cop_usable(cop) {
                        commit(cpu, &mut committed, site.cycles);
                        return Ok(self.raise(cpu, GuestException::unusable(cop), site));
                    }
                }
                HostOp::Fpu { op, fd, fs, ft } => {
                    let a = f32::from_bits(cpu.regs.read(fs));
                    let b = f32::from_bits(cpu.regs.read(ft));
                    let r = fpu::arith(op, a, b, self.host_fp);
                    cpu.regs.write(fd, r.to_bits());
                }
                HostOp::CvtWS { fd, fs } => {
                    let r = fpu::cvt_w_s(f32::from_bits(cpu.regs.read(fs)), self.host_fp);
                    cpu.regs.write(fd, r);
                }
                HostOp::CvtSW { fd, fs } => {
                    let r = fpu::cvt_s_w(cpu.regs.read(fs), self.host_fp);
                    cpu.regs.write(fd, r.to_bits());
                }
                HostOp::ApplyRoundingMode => self.apply_rounding(cpu),
                HostOp::RestoreRoundingMode => self.host_fp = FpControl::default(),
                HostOp::UpdateRoundingMode => self.note_fcr31(cpu),
                HostOp::Vector { op, vd, vs, vt, prefixes, site } => {
                    commit(cpu, &mut committed, site.cycles);
                    cpu.timing.sync_cop(&mut cpu.regs);
                    match prefixes {
                        PrefixOperand::Known(p) => {
                            vfpu::execute_arith(&mut cpu.regs, op, vd, vs, vt, p);
                        }
                        PrefixOperand::Runtime => {
                            let p = cpu.regs.prefixes();
                            vfpu::execute_arith(&mut cpu.regs, op, vd, vs, vt, p);
                            cpu.regs.reset_prefixes();
                        }
                    }
                    cpu.timing.schedule_cop(&cpu.regs, op.latency());
                }
                HostOp::SyncCop { site } => {
                    commit(cpu, &mut committed, site.cycles);
                    cpu.timing.sync_cop(&mut cpu.regs);
                }

                // ── Helpers ─────────────────────────────────────────────
                HostOp::CallInterpreter { raw, site } => {
                    commit(cpu, &mut committed, site.cycles);
                    match interpreter::execute(decode(raw), site.pc, cpu, mem) {
                        Ok(outcome) => {
                            if let Some(write) = outcome.write {
                                self.note_write(write)?;
                            }
                        }
                        Err(exc) => return Ok(self.raise(cpu, exc, site)),
                    }
                }
                HostOp::InterpretSteps { count, site } => {
                    commit(cpu, &mut committed, site.cycles);
                    set_guest_pc(&mut cpu.regs, site.pc);
                    for _ in 0..count {
                        let pc = cpu.regs.pc();
                        let outcome = interpreter::step(cpu, mem);
                        if let Some(write) = outcome.write {
                            self.note_write(write)?;
                        }
                        if let Some((exc, vector)) = outcome.exception {
                            self.count_exception(pc, exc, vector);
                            break;
                        }
                    }
                    self.note_fcr31(cpu);
                    return Ok(DispatchTarget::Dispatcher);
                }
                HostOp::RaiseException { exc, site } => {
                    commit(cpu, &mut committed, site.cycles);
                    return Ok(self.raise(cpu, exc, site));
                }
                HostOp::CheckBreakpoint { addr, resume_pc, site } => {
                    commit(cpu, &mut committed, site.cycles);
                    if self.breakpoints.check_skip_first(resume_pc, cpu.now()) {
                        continue;
                    }
                    let action = self.breakpoints.exec_breakpoint(addr, &cpu.regs);
                    if action.contains(BreakAction::PAUSE) {
                        set_guest_pc(&mut cpu.regs, resume_pc);
                        cpu.set_core_state(CoreState::Stepping);
                        self.stats.breakpoint_hits += 1;
                        self.trace.push(TraceEvent::BreakpointHit { pc: addr });
                        log::debug!(
                            "[JIT] Breakpoint at {:08x}, paused at {:08x}",
                            addr,
                            resume_pc
                        );
                        ip = self.cache.fixed().breakpoint_bailout;
                    }
                }
                HostOp::CallReplacement { index, site } => {
                    commit(cpu, &mut committed, site.cycles);
                    let func = self
                        .replacements
                        .get(index)
                        .map(|r| r.func)
                        .ok_or_else(|| {
                            JitError::CorruptBookkeeping(format!("no replacement #{}", index))
                        })?;
                    let outcome = func(&mut cpu.regs, mem);
                    cpu.timing.stall(&mut cpu.regs, outcome.cycles as u64);
                    if let Some(write) = outcome.write {
                        self.note_write(write)?;
                    }
                    self.stats.replacements_called += 1;
                }
            }
        }
    }

    fn operand(&self, cpu: &CpuContext, operand: Operand) -> u32 {
        match operand {
            Operand::Slot(s) => cpu.regs.read(s),
            Operand::Imm(v) => v,
        }
    }

    /// Deliver a guest exception raised at `site`. The block is abandoned
    /// and the dispatcher picks up at the handler.
    fn raise(&mut self, cpu: &mut CpuContext, exc: GuestException, site: Site) -> DispatchTarget {
        let vector =
            interpreter::deliver_exception(&mut cpu.regs, exc, site.pc, site.in_delay_slot);
        self.count_exception(site.pc, exc, vector);
        DispatchTarget::Dispatcher
    }

    pub(crate) fn count_exception(&mut self, pc: u32, exc: GuestException, vector: u32) {
        self.stats.exceptions += 1;
        self.trace.push(TraceEvent::Exception {
            pc,
            code: exc.code,
            vector,
        });
        log::debug!(
            "[JIT] {} at {:08x}, vector {:08x}",
            exc.code.mnemonic(),
            pc,
            vector
        );
    }

    /// Guest memory changed: drop any compiled code it covered.
    pub(crate) fn note_write(&mut self, write: MemWrite) -> JitResult<()> {
        if !self.cache.covers(write.addr, write.len) {
            return Ok(());
        }
        let blocks = self.cache.invalidate_range(write.addr, write.len)?;
        if blocks > 0 {
            self.trace.push(TraceEvent::Invalidate {
                start: write.addr,
                len: write.len,
                blocks,
            });
        }
        Ok(())
    }

    /// Load the host rounding control from FCR31.
    pub(crate) fn apply_rounding(&mut self, cpu: &CpuContext) {
        self.host_fp = FpControl::from_fcr31(cpu.regs.fcr31());
    }

    /// Remember that the guest uses a custom rounding mode. The compile
    /// loop turns this into bracketed blocks.
    pub(crate) fn observe_rounding(&mut self, cpu: &CpuContext) {
        if fpu::uses_custom_rounding(cpu.regs.fcr31()) && !self.flags.has_set_rounding {
            log::debug!("[JIT] Guest selected custom rounding: {:08x}", cpu.regs.fcr31());
            self.flags.has_set_rounding = true;
        }
    }

    /// FCR31 may have been written: remember custom rounding and follow it.
    pub(crate) fn note_fcr31(&mut self, cpu: &CpuContext) {
        self.observe_rounding(cpu);
        self.apply_rounding(cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PsxMemory;

    #[test]
    fn test_fast_load_paths() {
        let mut mem = PsxMemory::new();
        mem.load_words(0x100, &[0x8899_AABB]);
        assert_eq!(fast_load(&mut mem, 0x100, Width::Word), Some(0x8899_AABB));
        assert_eq!(fast_load(&mut mem, 0x102, Width::Half), Some(0x8899));
        // Misaligned and I/O accesses take the slow path.
        assert_eq!(fast_load(&mut mem, 0x101, Width::Half), None);
        assert_eq!(fast_load(&mut mem, 0x1F80_1000, Width::Word), None);
        assert_eq!(extend(0xBB, Width::Byte, true), 0xFFFF_FFBB);
        assert_eq!(extend(0xBB, Width::Byte, false), 0xBB);
    }

    #[test]
    fn test_fast_store_respects_isolation() {
        let mut mem = PsxMemory::new();
        let mut regs = GuestRegisters::new();
        assert_eq!(
            fast_store(&regs, &mut mem, 0x200, Width::Half, 0x1234_5678),
            Some(MemWrite { addr: 0x200, len: 2 })
        );
        assert_eq!(mem.read_u32(0x200), Ok(0x5678));

        let sr = regs.cop0(crate::cpu::state::cop0::SR);
        regs.set_cop0(crate::cpu::state::cop0::SR, sr | crate::cpu::state::cop0::SR_ISC);
        assert_eq!(fast_store(&regs, &mut mem, 0x200, Width::Word, 0), None);
    }

    #[test]
    fn test_fast_store_rejects_rom() {
        let mut mem = PsxMemory::new();
        let regs = GuestRegisters::new();
        assert_eq!(fast_store(&regs, &mut mem, 0xBFC0_0000, Width::Word, 1), None);
    }

    #[test]
    fn test_commit_is_monotonic() {
        let mut cpu = CpuContext::new();
        cpu.timing.set_next_event(&mut cpu.regs, 100);
        let mut committed = 0;
        commit(&mut cpu, &mut committed, 3);
        commit(&mut cpu, &mut committed, 2);
        commit(&mut cpu, &mut committed, 5);
        assert_eq!(committed, 5);
        assert_eq!(cpu.now(), 5);
    }
}
