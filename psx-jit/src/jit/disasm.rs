//! MIPS and host-op disassembler for debugging JIT output.
//!
//! Produces a side-by-side listing of a compiled block: the guest
//! instructions it translated, followed by the host ops it was lowered to.
//! Also resolves host code addresses back to something readable for crash
//! and backtrace tooling.

use super::cache::{BlockCache, JitBlock};
use super::host::{CodeAddr, HostOp, Operand, PrefixOperand};
use crate::cpu::decoder::{
    decode, AluImmOp, AluRegOp, BranchCond, LoadOp, MulDivOp, Op, ShiftOp, StoreOp,
};
use crate::cpu::state::layout::GPR_NAMES;
use crate::debugger::SymbolMap;
use crate::memory::GuestMemory;

/// Configuration for listings.
#[derive(Debug, Clone)]
pub struct DisasmConfig {
    /// Include the guest MIPS instructions
    pub include_source: bool,
    /// Include the host ops the block was lowered to
    pub include_host_ops: bool,
    /// Prefix every line with its address
    pub include_addresses: bool,
}

impl Default for DisasmConfig {
    fn default() -> Self {
        Self {
            include_source: true,
            include_host_ops: true,
            include_addresses: true,
        }
    }
}

fn reg(r: u8) -> &'static str {
    GPR_NAMES[(r & 31) as usize]
}

/// Format one decoded guest instruction located at `pc`.
pub fn format_op(op: &Op, pc: u32) -> String {
    match *op {
        Op::Shift { op: ShiftOp::Sll, rd: 0, rt: 0, sa: 0 } => "nop".to_string(),
        Op::AluImm { op, rt, rs, imm } => {
            let name = match op {
                AluImmOp::Addi => "addi",
                AluImmOp::Addiu => "addiu",
                AluImmOp::Slti => "slti",
                AluImmOp::Sltiu => "sltiu",
                AluImmOp::Andi => "andi",
                AluImmOp::Ori => "ori",
                AluImmOp::Xori => "xori",
            };
            match op {
                AluImmOp::Andi | AluImmOp::Ori | AluImmOp::Xori => {
                    format!("{} {}, {}, 0x{:x}", name, reg(rt), reg(rs), imm)
                }
                _ => format!("{} {}, {}, {}", name, reg(rt), reg(rs), imm as i16),
            }
        }
        Op::Lui { rt, imm } => format!("lui {}, 0x{:x}", reg(rt), imm),
        Op::AluReg { op: AluRegOp::Addu, rd, rs, rt: 0 } => {
            format!("move {}, {}", reg(rd), reg(rs))
        }
        Op::AluReg { op, rd, rs, rt } => {
            let name = match op {
                AluRegOp::Add => "add",
                AluRegOp::Addu => "addu",
                AluRegOp::Sub => "sub",
                AluRegOp::Subu => "subu",
                AluRegOp::And => "and",
                AluRegOp::Or => "or",
                AluRegOp::Xor => "xor",
                AluRegOp::Nor => "nor",
                AluRegOp::Slt => "slt",
                AluRegOp::Sltu => "sltu",
            };
            format!("{} {}, {}, {}", name, reg(rd), reg(rs), reg(rt))
        }
        Op::Shift { op, rd, rt, sa } => {
            format!("{} {}, {}, {}", shift_name(op, false), reg(rd), reg(rt), sa)
        }
        Op::ShiftVar { op, rd, rt, rs } => {
            format!("{} {}, {}, {}", shift_name(op, true), reg(rd), reg(rt), reg(rs))
        }
        Op::MulDiv { op, rs, rt } => {
            let name = match op {
                MulDivOp::Mult => "mult",
                MulDivOp::Multu => "multu",
                MulDivOp::Div => "div",
                MulDivOp::Divu => "divu",
            };
            format!("{} {}, {}", name, reg(rs), reg(rt))
        }
        Op::Mfhi { rd } => format!("mfhi {}", reg(rd)),
        Op::Mflo { rd } => format!("mflo {}", reg(rd)),
        Op::Mthi { rs } => format!("mthi {}", reg(rs)),
        Op::Mtlo { rs } => format!("mtlo {}", reg(rs)),
        Op::Branch { cond, rs, rt, link, .. } => {
            let target = op.static_target(pc).unwrap_or(0);
            let name = match (cond, link) {
                (BranchCond::Eq, _) => "beq",
                (BranchCond::Ne, _) => "bne",
                (BranchCond::Lez, _) => "blez",
                (BranchCond::Gtz, _) => "bgtz",
                (BranchCond::Ltz, false) => "bltz",
                (BranchCond::Gez, false) => "bgez",
                (BranchCond::Ltz, true) => "bltzal",
                (BranchCond::Gez, true) => "bgezal",
            };
            if cond.uses_rt() {
                format!("{} {}, {}, 0x{:08x}", name, reg(rs), reg(rt), target)
            } else {
                format!("{} {}, 0x{:08x}", name, reg(rs), target)
            }
        }
        Op::J { .. } => format!("j 0x{:08x}", op.static_target(pc).unwrap_or(0)),
        Op::Jal { .. } => format!("jal 0x{:08x}", op.static_target(pc).unwrap_or(0)),
        Op::Jr { rs } => format!("jr {}", reg(rs)),
        Op::Jalr { rd: 31, rs } => format!("jalr {}", reg(rs)),
        Op::Jalr { rd, rs } => format!("jalr {}, {}", reg(rd), reg(rs)),
        Op::Syscall { code } => format!("syscall 0x{:x}", code),
        Op::Break { code } => format!("break 0x{:x}", code),
        Op::Load { op, rt, base, offset } => {
            let name = match op {
                LoadOp::Lb => "lb",
                LoadOp::Lbu => "lbu",
                LoadOp::Lh => "lh",
                LoadOp::Lhu => "lhu",
                LoadOp::Lw => "lw",
                LoadOp::Lwl => "lwl",
                LoadOp::Lwr => "lwr",
            };
            format!("{} {}, {}({})", name, reg(rt), offset, reg(base))
        }
        Op::Store { op, rt, base, offset } => {
            let name = match op {
                StoreOp::Sb => "sb",
                StoreOp::Sh => "sh",
                StoreOp::Sw => "sw",
                StoreOp::Swl => "swl",
                StoreOp::Swr => "swr",
            };
            format!("{} {}, {}({})", name, reg(rt), offset, reg(base))
        }
        Op::Mfc0 { rt, rd } => format!("mfc0 {}, $cop0_{}", reg(rt), rd),
        Op::Mtc0 { rt, rd } => format!("mtc0 {}, $cop0_{}", reg(rt), rd),
        Op::Rfe => "rfe".to_string(),
        Op::Mfc1 { rt, fs } => format!("mfc1 {}, $f{}", reg(rt), fs),
        Op::Mtc1 { rt, fs } => format!("mtc1 {}, $f{}", reg(rt), fs),
        Op::Cfc1 { rt, fs } => format!("cfc1 {}, $fcr{}", reg(rt), fs),
        Op::Ctc1 { rt, fs } => format!("ctc1 {}, $fcr{}", reg(rt), fs),
        Op::Fpu { op, fd, fs, ft } => format!("{} $f{}, $f{}, $f{}", op.mnemonic(), fd, fs, ft),
        Op::CvtWS { fd, fs } => format!("cvt.w.s $f{}, $f{}", fd, fs),
        Op::CvtSW { fd, fs } => format!("cvt.s.w $f{}, $f{}", fd, fs),
        Op::Lwc1 { ft, base, offset } => format!("lwc1 $f{}, {}({})", ft, offset, reg(base)),
        Op::Swc1 { ft, base, offset } => format!("swc1 $f{}, {}({})", ft, offset, reg(base)),
        Op::VPrefix { kind, data } => {
            format!("vpfx{} 0x{:x}", format!("{:?}", kind).to_lowercase(), data)
        }
        Op::Vec { op, vd, vs, vt } => format!("{} v{}, v{}, v{}", op.mnemonic(), vd, vs, vt),
        Op::Lvs { vt, base, offset } => format!("lv.s v{}, {}({})", vt, offset, reg(base)),
        Op::Svs { vt, base, offset } => format!("sv.s v{}, {}({})", vt, offset, reg(base)),
        Op::Unknown(raw) => format!(".word 0x{:08x}", raw),
    }
}

fn shift_name(op: ShiftOp, variable: bool) -> &'static str {
    match (op, variable) {
        (ShiftOp::Sll, false) => "sll",
        (ShiftOp::Srl, false) => "srl",
        (ShiftOp::Sra, false) => "sra",
        (ShiftOp::Sll, true) => "sllv",
        (ShiftOp::Srl, true) => "srlv",
        (ShiftOp::Sra, true) => "srav",
    }
}

/// Short disassembly of a raw instruction word.
pub fn format_instruction_short(raw: u32, pc: u32) -> String {
    format_op(&decode(raw), pc)
}

fn operand(o: Operand) -> String {
    match o {
        Operand::Slot(s) => s.to_string(),
        Operand::Imm(v) => format!("#0x{:x}", v),
    }
}

/// Format one host op.
pub fn format_host_op(op: &HostOp) -> String {
    match *op {
        HostOp::CheckedEntry { resume_pc } => format!("checked_entry resume=0x{:08x}", resume_pc),
        HostOp::Jump(t) => format!("jump @{}", t),
        HostOp::JumpIf { cond, when, target } => format!("jump_if {}=={} @{}", cond, when, target),
        HostOp::ExitUnlinked { guest_pc } => format!("exit 0x{:08x}", guest_pc),
        HostOp::ExitIndirect { src } => format!("exit [{}]", src),
        HostOp::Trampoline(t) => format!("trampoline {}", t.label()),
        HostOp::SubDowncount { cycles } => format!("sub downcount, {}", cycles),
        HostOp::Move { dst, src } => format!("mov {}, {}", dst, src),
        HostOp::LoadImm { dst, value } => format!("li {}, 0x{:x}", dst, value),
        HostOp::Alu { op, dst, a, b } => format!("{} {}, {}, {}", op.name(), dst, a, operand(b)),
        HostOp::AluChecked { sub, dst, a, b, .. } => {
            format!("{}.ov {}, {}, {}", if sub { "sub" } else { "add" }, dst, a, operand(b))
        }
        HostOp::Compare { cond, dst, a, b } => format!("cmp.{:?} {}, {}, {}", cond, dst, a, b),
        HostOp::MulDiv { op, a, b, .. } => format!("{:?} {}, {}", op, a, b).to_lowercase(),
        HostOp::SyncMulDiv { .. } => "sync muldiv".to_string(),
        HostOp::Load { width, signed, dst, base, offset, .. } => format!(
            "load.{:?}{} {}, {}({})",
            width,
            if signed { "s" } else { "" },
            dst,
            offset,
            base
        ),
        HostOp::Store { width, src, base, offset, .. } => {
            format!("store.{:?} {}, {}({})", width, src, offset, base)
        }
        HostOp::CheckCop { cop, .. } => format!("check_cop {}", cop),
        HostOp::Fpu { op, fd, fs, ft } => format!("{} {}, {}, {}", op.mnemonic(), fd, fs, ft),
        HostOp::CvtWS { fd, fs } => format!("cvt.w.s {}, {}", fd, fs),
        HostOp::CvtSW { fd, fs } => format!("cvt.s.w {}, {}", fd, fs),
        HostOp::ApplyRoundingMode => "apply_rounding".to_string(),
        HostOp::RestoreRoundingMode => "restore_rounding".to_string(),
        HostOp::UpdateRoundingMode => "update_rounding".to_string(),
        HostOp::Vector { op, vd, vs, vt, prefixes, .. } => {
            let pfx = match prefixes {
                PrefixOperand::Known([s, t, d]) => format!("[{:x} {:x} {:x}]", s, t, d),
                PrefixOperand::Runtime => "[runtime]".to_string(),
            };
            format!("{} v{}, v{}, v{} {}", op.mnemonic(), vd, vs, vt, pfx)
        }
        HostOp::SyncCop { .. } => "sync cop".to_string(),
        HostOp::CallInterpreter { raw, site } => {
            format!("call interp 0x{:08x} ({})", raw, format_instruction_short(raw, site.pc))
        }
        HostOp::InterpretSteps { count, site } => {
            format!("call interp_steps {} from 0x{:08x}", count, site.pc)
        }
        HostOp::RaiseException { exc, site } => {
            format!("raise {} at 0x{:08x}", exc.code.mnemonic(), site.pc)
        }
        HostOp::CheckBreakpoint { addr, resume_pc, .. } => {
            format!("check_bp 0x{:08x} resume=0x{:08x}", addr, resume_pc)
        }
        HostOp::CallReplacement { index, .. } => format!("call replacement #{}", index),
    }
}

/// Generate a listing of a compiled block.
pub fn disassemble_block(
    block: &JitBlock,
    cache: &BlockCache,
    mem: &mut dyn GuestMemory,
    config: &DisasmConfig,
) -> String {
    let mut output = String::new();

    output.push_str(&format!("; JIT Block @ 0x{:08x}\n", block.original_address));
    output.push_str(&format!(
        "; {} instructions, {} guest bytes, {} host ops, {} exit(s){}\n",
        block.instruction_count,
        block.original_size,
        block.code_end.saturating_sub(block.checked_entry),
        block.exits.len(),
        if block.invalid { ", INVALID" } else { "" }
    ));

    if config.include_source {
        output.push_str("; ═══════ Guest ═══════\n");
        let mut pc = block.original_address;
        let end = block.original_address.wrapping_add(block.original_size);
        while pc != end {
            let text = match mem.read_u32(pc) {
                Ok(raw) => format_instruction_short(raw, pc),
                Err(_) => "<unmapped>".to_string(),
            };
            if config.include_addresses {
                output.push_str(&format!("{:08x}:  {}\n", pc, text));
            } else {
                output.push_str(&format!("  {}\n", text));
            }
            pc = pc.wrapping_add(4);
        }
    }

    if config.include_host_ops {
        output.push_str("; ═══════ Host ═══════\n");
        let ops = cache.code().slice(block.checked_entry, block.code_end);
        for (i, op) in ops.iter().enumerate() {
            let addr = block.checked_entry + i;
            let marker = if addr == block.normal_entry { ">" } else { " " };
            if config.include_addresses {
                output.push_str(&format!("{}{:6}:  {}\n", marker, addr, format_host_op(op)));
            } else {
                output.push_str(&format!("{} {}\n", marker, format_host_op(op)));
            }
        }
    }

    output
}

/// Log a block listing at trace level.
pub fn log_jit_compilation(
    block: &JitBlock,
    cache: &BlockCache,
    mem: &mut dyn GuestMemory,
    config: &DisasmConfig,
) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    let listing = disassemble_block(block, cache, mem, config);
    for line in listing.lines() {
        log::trace!("[JIT] {}", line);
    }
}

/// Name the host code at `addr`, for crash and backtrace reports.
pub fn describe_code_ptr(cache: &BlockCache, symbols: &SymbolMap, addr: CodeAddr) -> String {
    let code = cache.code();
    if !code.is_in_space(addr) {
        return "Unknown".to_string();
    }
    if let Some(target) = cache.fixed().target_at(addr) {
        return target.label().to_string();
    }
    if addr < code.fixed_len() {
        return "PreGenCode".to_string();
    }
    match cache.block_for_code_addr(addr).and_then(|id| cache.block(id)) {
        Some(block) => {
            let start = block.original_address;
            match symbols.description(start) {
                Some(label) => format!("{:08x} ({})", start, label),
                None => format!("{:08x}", start),
            }
        }
        None => "UnknownOrDeletedBlock".to_string(),
    }
}
