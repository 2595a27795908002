//! Reference interpreter.
//!
//! `execute` carries the semantics of one decoded instruction and is called
//! by compiled code for instructions the block compiler does not translate.
//! `step` adds fetch, delay-slot sequencing, cycle accounting and exception
//! delivery on top, and is the behaviour compiled blocks must reproduce.

use super::decoder::{decode, AluImmOp, AluRegOp, LoadOp, MulDivOp, Op, ShiftOp, StoreOp};
use super::exception::{enter_exception, return_from_exception, ExceptionCode, GuestException};
use super::fpu::{self, FpControl};
use super::state::{cop0, GuestRegisters};
use super::vfpu;
use super::CpuContext;
use crate::memory::GuestMemory;

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }

    fn misaligned(self, addr: u32) -> bool {
        addr & (self.bytes() - 1) != 0
    }
}

/// Guest memory range written by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemWrite {
    pub addr: u32,
    pub len: u32,
}

/// Side information produced by executing one instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Address control continues at after the delay slot (control
    /// transfers only, taken or not).
    pub branch: Option<u32>,
    pub write: Option<MemWrite>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub write: Option<MemWrite>,
    /// Delivered exception and the handler address it vectored to.
    pub exception: Option<(GuestException, u32)>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared memory access paths
// ═══════════════════════════════════════════════════════════════════════════

#[inline]
pub fn effective_address(regs: &GuestRegisters, base: u8, offset: i16) -> u32 {
    regs.gpr(base).wrapping_add(offset as i32 as u32)
}

/// Fetch the instruction word at `pc`.
pub fn fetch(mem: &mut dyn GuestMemory, pc: u32) -> Result<u32, GuestException> {
    if pc & 3 != 0 {
        return Err(GuestException::address(ExceptionCode::AddressLoad, pc));
    }
    mem.read_u32(pc)
        .map_err(|_| GuestException::new(ExceptionCode::InstructionBus))
}

/// Slow-path load. The caller must have brought the cycle count up to date.
pub fn load(
    cpu: &mut CpuContext,
    mem: &mut dyn GuestMemory,
    addr: u32,
    width: Width,
    signed: bool,
) -> Result<u32, GuestException> {
    if width.misaligned(addr) {
        return Err(GuestException::address(ExceptionCode::AddressLoad, addr));
    }
    if mem.is_timing_sensitive(addr) {
        mem.sync_timestamp(cpu.now());
    }
    let bus = |_| GuestException::new(ExceptionCode::DataBus);
    let value = match width {
        Width::Byte => {
            let v = mem.read_u8(addr).map_err(bus)?;
            if signed { v as i8 as i32 as u32 } else { v as u32 }
        }
        Width::Half => {
            let v = mem.read_u16(addr).map_err(bus)?;
            if signed { v as i16 as i32 as u32 } else { v as u32 }
        }
        Width::Word => mem.read_u32(addr).map_err(bus)?,
    };
    Ok(value)
}

/// Slow-path store. Returns the range the store may have changed, which the
/// caller forwards to code invalidation.
pub fn store(
    cpu: &mut CpuContext,
    mem: &mut dyn GuestMemory,
    addr: u32,
    width: Width,
    value: u32,
) -> Result<MemWrite, GuestException> {
    if width.misaligned(addr) {
        return Err(GuestException::address(ExceptionCode::AddressStore, addr));
    }
    if cpu.regs.cache_isolated() {
        // The store lands in the isolated instruction cache and evicts the
        // line; memory is untouched.
        return Ok(MemWrite {
            addr: addr & !0xF,
            len: 16,
        });
    }
    if mem.is_timing_sensitive(addr) {
        mem.sync_timestamp(cpu.now());
    }
    let bus = |_| GuestException::new(ExceptionCode::DataBus);
    match width {
        Width::Byte => mem.write_u8(addr, value as u8).map_err(bus)?,
        Width::Half => mem.write_u16(addr, value as u16).map_err(bus)?,
        Width::Word => mem.write_u32(addr, value).map_err(bus)?,
    }
    Ok(MemWrite {
        addr,
        len: width.bytes(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared arithmetic helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Multiply/divide into HI/LO. Returns the unit latency in cycles.
pub fn mul_div(regs: &mut GuestRegisters, op: MulDivOp, a: u32, b: u32) -> u32 {
    match op {
        MulDivOp::Mult => {
            let r = (a as i32 as i64) * (b as i32 as i64);
            regs.set_lo(r as u32);
            regs.set_hi((r >> 32) as u32);
            let magnitude = if (b as i32) < 0 { !b } else { b };
            mult_latency(magnitude as u64)
        }
        MulDivOp::Multu => {
            let r = (a as u64) * (b as u64);
            regs.set_lo(r as u32);
            regs.set_hi((r >> 32) as u32);
            mult_latency(b as u64)
        }
        MulDivOp::Div => {
            let (n, d) = (a as i32, b as i32);
            if d == 0 {
                regs.set_hi(a);
                regs.set_lo(if n >= 0 { 0xFFFF_FFFF } else { 1 });
            } else if n == i32::MIN && d == -1 {
                regs.set_hi(0);
                regs.set_lo(0x8000_0000);
            } else {
                regs.set_lo((n / d) as u32);
                regs.set_hi((n % d) as u32);
            }
            DIV_LATENCY
        }
        MulDivOp::Divu => {
            if b == 0 {
                regs.set_hi(a);
                regs.set_lo(0xFFFF_FFFF);
            } else {
                regs.set_lo(a / b);
                regs.set_hi(a % b);
            }
            DIV_LATENCY
        }
    }
}

pub const DIV_LATENCY: u32 = 36;

/// Multiplier early-outs on small magnitudes.
fn mult_latency(magnitude: u64) -> u32 {
    if magnitude < 1 << 11 {
        6
    } else if magnitude < 1 << 20 {
        9
    } else {
        13
    }
}

/// Overflow-checked add/sub used by ADD, ADDI and SUB.
pub fn checked_arith(sub: bool, a: u32, b: u32) -> Result<u32, GuestException> {
    let r = if sub {
        (a as i32).checked_sub(b as i32)
    } else {
        (a as i32).checked_add(b as i32)
    };
    r.map(|v| v as u32)
        .ok_or(GuestException::new(ExceptionCode::Overflow))
}

pub fn shift(op: ShiftOp, value: u32, amount: u32) -> u32 {
    let amount = amount & 31;
    match op {
        ShiftOp::Sll => value << amount,
        ShiftOp::Srl => value >> amount,
        ShiftOp::Sra => ((value as i32) >> amount) as u32,
    }
}

/// Register written by MTC0, honouring read-only fields.
pub fn write_cop0(regs: &mut GuestRegisters, reg: u8, value: u32) {
    match reg {
        cop0::PRID => {}
        cop0::CAUSE => {
            let cause = regs.cop0(cop0::CAUSE);
            regs.set_cop0(cop0::CAUSE, (cause & !0x300) | (value & 0x300));
        }
        _ => regs.set_cop0(reg, value),
    }
}

fn require_cop(regs: &GuestRegisters, n: u8) -> Result<(), GuestException> {
    if regs.cop_usable(n) {
        Ok(())
    } else {
        Err(GuestException::unusable(n))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════════════════════

/// Execute `op`, located at `pc`, against the register file. Does not touch
/// PC sequencing or the cycle budget.
pub fn execute(
    op: Op,
    pc: u32,
    cpu: &mut CpuContext,
    mem: &mut dyn GuestMemory,
) -> Result<Outcome, GuestException> {
    let mut out = Outcome::default();
    match op {
        Op::AluImm { op, rt, rs, imm } => {
            let a = cpu.regs.gpr(rs);
            let b = op.extend(imm);
            let value = match op {
                AluImmOp::Addi => checked_arith(false, a, b)?,
                AluImmOp::Addiu => a.wrapping_add(b),
                AluImmOp::Slti => ((a as i32) < (b as i32)) as u32,
                AluImmOp::Sltiu => (a < b) as u32,
                AluImmOp::Andi => a & b,
                AluImmOp::Ori => a | b,
                AluImmOp::Xori => a ^ b,
            };
            cpu.regs.set_gpr(rt, value);
        }
        Op::Lui { rt, imm } => cpu.regs.set_gpr(rt, (imm as u32) << 16),
        Op::AluReg { op, rd, rs, rt } => {
            let a = cpu.regs.gpr(rs);
            let b = cpu.regs.gpr(rt);
            let value = match op {
                AluRegOp::Add => checked_arith(false, a, b)?,
                AluRegOp::Addu => a.wrapping_add(b),
                AluRegOp::Sub => checked_arith(true, a, b)?,
                AluRegOp::Subu => a.wrapping_sub(b),
                AluRegOp::And => a & b,
                AluRegOp::Or => a | b,
                AluRegOp::Xor => a ^ b,
                AluRegOp::Nor => !(a | b),
                AluRegOp::Slt => ((a as i32) < (b as i32)) as u32,
                AluRegOp::Sltu => (a < b) as u32,
            };
            cpu.regs.set_gpr(rd, value);
        }
        Op::Shift { op, rd, rt, sa } => {
            let value = shift(op, cpu.regs.gpr(rt), sa as u32);
            cpu.regs.set_gpr(rd, value);
        }
        Op::ShiftVar { op, rd, rt, rs } => {
            let value = shift(op, cpu.regs.gpr(rt), cpu.regs.gpr(rs));
            cpu.regs.set_gpr(rd, value);
        }
        Op::MulDiv { op, rs, rt } => {
            let (a, b) = (cpu.regs.gpr(rs), cpu.regs.gpr(rt));
            let latency = mul_div(&mut cpu.regs, op, a, b);
            cpu.timing.schedule_muldiv(&cpu.regs, latency);
        }
        Op::Mfhi { rd } => {
            cpu.timing.sync_muldiv(&mut cpu.regs);
            let v = cpu.regs.hi();
            cpu.regs.set_gpr(rd, v);
        }
        Op::Mflo { rd } => {
            cpu.timing.sync_muldiv(&mut cpu.regs);
            let v = cpu.regs.lo();
            cpu.regs.set_gpr(rd, v);
        }
        Op::Mthi { rs } => {
            let v = cpu.regs.gpr(rs);
            cpu.regs.set_hi(v);
        }
        Op::Mtlo { rs } => {
            let v = cpu.regs.gpr(rs);
            cpu.regs.set_lo(v);
        }
        Op::Branch { cond, rs, rt, link, .. } => {
            let taken = cond.eval(cpu.regs.gpr(rs), cpu.regs.gpr(rt));
            if link {
                cpu.regs.set_gpr(31, pc.wrapping_add(8));
            }
            out.branch = if taken {
                op.static_target(pc)
            } else {
                Some(pc.wrapping_add(8))
            };
        }
        Op::J { .. } => out.branch = op.static_target(pc),
        Op::Jal { .. } => {
            cpu.regs.set_gpr(31, pc.wrapping_add(8));
            out.branch = op.static_target(pc);
        }
        Op::Jr { rs } => out.branch = Some(cpu.regs.gpr(rs)),
        Op::Jalr { rd, rs } => {
            let target = cpu.regs.gpr(rs);
            cpu.regs.set_gpr(rd, pc.wrapping_add(8));
            out.branch = Some(target);
        }
        Op::Syscall { .. } => return Err(GuestException::new(ExceptionCode::Syscall)),
        Op::Break { .. } => return Err(GuestException::new(ExceptionCode::Breakpoint)),
        Op::Load { op, rt, base, offset } => {
            let addr = effective_address(&cpu.regs, base, offset);
            let value = match op {
                LoadOp::Lb => load(cpu, mem, addr, Width::Byte, true)?,
                LoadOp::Lbu => load(cpu, mem, addr, Width::Byte, false)?,
                LoadOp::Lh => load(cpu, mem, addr, Width::Half, true)?,
                LoadOp::Lhu => load(cpu, mem, addr, Width::Half, false)?,
                LoadOp::Lw => load(cpu, mem, addr, Width::Word, false)?,
                LoadOp::Lwl | LoadOp::Lwr => {
                    let word = load(cpu, mem, addr & !3, Width::Word, false)?;
                    let shift = (addr & 3) * 8;
                    let old = cpu.regs.gpr(rt);
                    if op == LoadOp::Lwl {
                        (old & (0x00FF_FFFF >> shift)) | (word << (24 - shift))
                    } else {
                        (old & (0xFFFF_FF00 << (24 - shift))) | (word >> shift)
                    }
                }
            };
            cpu.regs.set_gpr(rt, value);
        }
        Op::Store { op, rt, base, offset } => {
            let addr = effective_address(&cpu.regs, base, offset);
            let value = cpu.regs.gpr(rt);
            let write = match op {
                StoreOp::Sb => store(cpu, mem, addr, Width::Byte, value)?,
                StoreOp::Sh => store(cpu, mem, addr, Width::Half, value)?,
                StoreOp::Sw => store(cpu, mem, addr, Width::Word, value)?,
                StoreOp::Swl | StoreOp::Swr => {
                    let aligned = addr & !3;
                    let word = load(cpu, mem, aligned, Width::Word, false)?;
                    let shift = (addr & 3) * 8;
                    let merged = if op == StoreOp::Swl {
                        (word & (0xFFFF_FF00 << shift)) | (value >> (24 - shift))
                    } else {
                        (word & (0x00FF_FFFF >> (24 - shift))) | (value << shift)
                    };
                    store(cpu, mem, aligned, Width::Word, merged)?
                }
            };
            out.write = Some(write);
        }
        Op::Mfc0 { rt, rd } => {
            let v = cpu.regs.cop0(rd);
            cpu.regs.set_gpr(rt, v);
        }
        Op::Mtc0 { rt, rd } => {
            let v = cpu.regs.gpr(rt);
            write_cop0(&mut cpu.regs, rd, v);
        }
        Op::Rfe => return_from_exception(&mut cpu.regs),
        Op::Mfc1 { rt, fs } => {
            require_cop(&cpu.regs, 1)?;
            let v = cpu.regs.fpr(fs).to_bits();
            cpu.regs.set_gpr(rt, v);
        }
        Op::Mtc1 { rt, fs } => {
            require_cop(&cpu.regs, 1)?;
            let v = cpu.regs.gpr(rt);
            cpu.regs.set_fpr(fs, f32::from_bits(v));
        }
        Op::Cfc1 { rt, fs } => {
            require_cop(&cpu.regs, 1)?;
            let v = match fs {
                0 => fpu::FCR0_VALUE,
                31 => cpu.regs.fcr31(),
                _ => 0,
            };
            cpu.regs.set_gpr(rt, v);
        }
        Op::Ctc1 { rt, fs } => {
            require_cop(&cpu.regs, 1)?;
            if fs == 31 {
                let v = cpu.regs.gpr(rt) & fpu::FCR31_WRITE_MASK;
                cpu.regs.set_fcr31(v);
            }
        }
        Op::Fpu { op, fd, fs, ft } => {
            require_cop(&cpu.regs, 1)?;
            let ctl = FpControl::from_fcr31(cpu.regs.fcr31());
            let r = fpu::arith(op, cpu.regs.fpr(fs), cpu.regs.fpr(ft), ctl);
            cpu.regs.set_fpr(fd, r);
        }
        Op::CvtWS { fd, fs } => {
            require_cop(&cpu.regs, 1)?;
            let ctl = FpControl::from_fcr31(cpu.regs.fcr31());
            let r = fpu::cvt_w_s(cpu.regs.fpr(fs), ctl);
            cpu.regs.set_fpr(fd, f32::from_bits(r));
        }
        Op::CvtSW { fd, fs } => {
            require_cop(&cpu.regs, 1)?;
            let ctl = FpControl::from_fcr31(cpu.regs.fcr31());
            let r = fpu::cvt_s_w(cpu.regs.fpr(fs).to_bits(), ctl);
            cpu.regs.set_fpr(fd, r);
        }
        Op::Lwc1 { ft, base, offset } => {
            require_cop(&cpu.regs, 1)?;
            let addr = effective_address(&cpu.regs, base, offset);
            let v = load(cpu, mem, addr, Width::Word, false)?;
            cpu.regs.set_fpr(ft, f32::from_bits(v));
        }
        Op::Swc1 { ft, base, offset } => {
            require_cop(&cpu.regs, 1)?;
            let addr = effective_address(&cpu.regs, base, offset);
            let v = cpu.regs.fpr(ft).to_bits();
            out.write = Some(store(cpu, mem, addr, Width::Word, v)?);
        }
        Op::VPrefix { kind, data } => {
            require_cop(&cpu.regs, 2)?;
            let slot = match kind {
                vfpu::PrefixKind::S => super::state::layout::PREFIX_S,
                vfpu::PrefixKind::T => super::state::layout::PREFIX_T,
                vfpu::PrefixKind::D => super::state::layout::PREFIX_D,
            };
            cpu.regs.write(slot, data);
        }
        Op::Vec { op, vd, vs, vt } => {
            require_cop(&cpu.regs, 2)?;
            cpu.timing.sync_cop(&mut cpu.regs);
            let prefixes = cpu.regs.prefixes();
            vfpu::execute_arith(&mut cpu.regs, op, vd, vs, vt, prefixes);
            cpu.regs.reset_prefixes();
            cpu.timing.schedule_cop(&cpu.regs, op.latency());
        }
        Op::Lvs { vt, base, offset } => {
            require_cop(&cpu.regs, 2)?;
            let addr = effective_address(&cpu.regs, base, offset);
            let v = load(cpu, mem, addr, Width::Word, false)?;
            cpu.regs.set_vpr(vt, f32::from_bits(v));
        }
        Op::Svs { vt, base, offset } => {
            require_cop(&cpu.regs, 2)?;
            cpu.timing.sync_cop(&mut cpu.regs);
            let addr = effective_address(&cpu.regs, base, offset);
            let v = cpu.regs.vpr(vt).to_bits();
            out.write = Some(store(cpu, mem, addr, Width::Word, v)?);
        }
        Op::Unknown(_) => {
            return Err(GuestException::new(ExceptionCode::ReservedInstruction));
        }
    }
    Ok(out)
}

/// Execute the instruction at PC with full sequencing and timing.
pub fn step(cpu: &mut CpuContext, mem: &mut dyn GuestMemory) -> StepOutcome {
    let pc = cpu.regs.pc();
    let delayed = cpu.regs.in_delay_slot();

    let result = fetch(mem, pc).and_then(|raw| {
        let op = decode(raw);
        cpu.timing.stall(&mut cpu.regs, op.cycle_estimate() as u64);
        execute(op, pc, cpu, mem)
    });

    match result {
        Ok(outcome) => {
            if delayed {
                let next = cpu.regs.next_pc();
                cpu.regs.set_pc(next);
                cpu.regs.set_in_delay_slot(false);
            } else if let Some(target) = outcome.branch {
                cpu.regs.set_pc(pc.wrapping_add(4));
                cpu.regs.set_next_pc(target);
                cpu.regs.set_in_delay_slot(true);
                return StepOutcome {
                    write: outcome.write,
                    exception: None,
                };
            } else {
                cpu.regs.set_pc(pc.wrapping_add(4));
            }
            let next = cpu.regs.pc().wrapping_add(4);
            cpu.regs.set_next_pc(next);
            StepOutcome {
                write: outcome.write,
                exception: None,
            }
        }
        Err(exc) => {
            let vector = deliver_exception(&mut cpu.regs, exc, pc, delayed);
            StepOutcome {
                write: None,
                exception: Some((exc, vector)),
            }
        }
    }
}

/// Deliver `exc` and point PC at the handler.
pub fn deliver_exception(
    regs: &mut GuestRegisters,
    exc: GuestException,
    pc: u32,
    in_delay_slot: bool,
) -> u32 {
    let vector = enter_exception(regs, exc, pc, in_delay_slot);
    regs.set_pc(vector);
    regs.set_next_pc(vector.wrapping_add(4));
    vector
}
