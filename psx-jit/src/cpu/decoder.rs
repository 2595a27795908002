//! Instruction decoding.
//!
//! Every 32-bit word decodes once into a closed [`Op`] enumeration. Both the
//! interpreter and the block compiler dispatch on the variant, so there is
//! no per-opcode function table anywhere.

use super::fpu::FpuArith;
use super::vfpu::{PrefixKind, VecArith};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluImmOp {
    Addi,
    Addiu,
    Slti,
    Sltiu,
    Andi,
    Ori,
    Xori,
}

impl AluImmOp {
    /// Logical immediates are zero extended, the rest sign extended.
    pub fn extend(self, imm: u16) -> u32 {
        match self {
            AluImmOp::Andi | AluImmOp::Ori | AluImmOp::Xori => imm as u32,
            _ => imm as i16 as i32 as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluRegOp {
    Add,
    Addu,
    Sub,
    Subu,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Sll,
    Srl,
    Sra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulDivOp {
    Mult,
    Multu,
    Div,
    Divu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    Eq,
    Ne,
    Lez,
    Gtz,
    Ltz,
    Gez,
}

impl BranchCond {
    pub fn eval(self, a: u32, b: u32) -> bool {
        let s = a as i32;
        match self {
            BranchCond::Eq => a == b,
            BranchCond::Ne => a != b,
            BranchCond::Lez => s <= 0,
            BranchCond::Gtz => s > 0,
            BranchCond::Ltz => s < 0,
            BranchCond::Gez => s >= 0,
        }
    }

    /// Whether the condition compares two registers.
    pub fn uses_rt(self) -> bool {
        matches!(self, BranchCond::Eq | BranchCond::Ne)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    Lb,
    Lbu,
    Lh,
    Lhu,
    Lw,
    Lwl,
    Lwr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Sb,
    Sh,
    Sw,
    Swl,
    Swr,
}

/// Decoded guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    AluImm { op: AluImmOp, rt: u8, rs: u8, imm: u16 },
    Lui { rt: u8, imm: u16 },
    AluReg { op: AluRegOp, rd: u8, rs: u8, rt: u8 },
    Shift { op: ShiftOp, rd: u8, rt: u8, sa: u8 },
    ShiftVar { op: ShiftOp, rd: u8, rt: u8, rs: u8 },
    MulDiv { op: MulDivOp, rs: u8, rt: u8 },
    Mfhi { rd: u8 },
    Mflo { rd: u8 },
    Mthi { rs: u8 },
    Mtlo { rs: u8 },
    Branch { cond: BranchCond, rs: u8, rt: u8, offset: i16, link: bool },
    J { index: u32 },
    Jal { index: u32 },
    Jr { rs: u8 },
    Jalr { rd: u8, rs: u8 },
    Syscall { code: u32 },
    Break { code: u32 },
    Load { op: LoadOp, rt: u8, base: u8, offset: i16 },
    Store { op: StoreOp, rt: u8, base: u8, offset: i16 },
    Mfc0 { rt: u8, rd: u8 },
    Mtc0 { rt: u8, rd: u8 },
    Rfe,
    Mfc1 { rt: u8, fs: u8 },
    Mtc1 { rt: u8, fs: u8 },
    Cfc1 { rt: u8, fs: u8 },
    Ctc1 { rt: u8, fs: u8 },
    Fpu { op: FpuArith, fd: u8, fs: u8, ft: u8 },
    CvtWS { fd: u8, fs: u8 },
    CvtSW { fd: u8, fs: u8 },
    Lwc1 { ft: u8, base: u8, offset: i16 },
    Swc1 { ft: u8, base: u8, offset: i16 },
    VPrefix { kind: PrefixKind, data: u32 },
    Vec { op: VecArith, vd: u8, vs: u8, vt: u8 },
    Lvs { vt: u8, base: u8, offset: i16 },
    Svs { vt: u8, base: u8, offset: i16 },
    Unknown(u32),
}

pub const NOP: u32 = 0;

/// Major opcodes of the vector unit.
const VFPU_MAJOR: [u32; 5] = [0x18, 0x19, 0x32, 0x37, 0x3A];

/// True when `raw` lives in vector unit opcode space, decodable or not.
pub fn is_vfpu_opcode(raw: u32) -> bool {
    VFPU_MAJOR.contains(&(raw >> 26))
}

pub fn decode(raw: u32) -> Op {
    let opcode = raw >> 26;
    let rs = ((raw >> 21) & 31) as u8;
    let rt = ((raw >> 16) & 31) as u8;
    let rd = ((raw >> 11) & 31) as u8;
    let sa = ((raw >> 6) & 31) as u8;
    let funct = raw & 63;
    let imm = raw as u16;
    let offset = raw as i16;

    match opcode {
        0x00 => decode_special(raw, rs, rt, rd, sa, funct),
        0x01 => {
            let (cond, link) = match rt {
                0x00 => (BranchCond::Ltz, false),
                0x01 => (BranchCond::Gez, false),
                0x10 => (BranchCond::Ltz, true),
                0x11 => (BranchCond::Gez, true),
                _ => return Op::Unknown(raw),
            };
            Op::Branch { cond, rs, rt: 0, offset, link }
        }
        0x02 => Op::J { index: raw & 0x03FF_FFFF },
        0x03 => Op::Jal { index: raw & 0x03FF_FFFF },
        0x04 => Op::Branch { cond: BranchCond::Eq, rs, rt, offset, link: false },
        0x05 => Op::Branch { cond: BranchCond::Ne, rs, rt, offset, link: false },
        0x06 => Op::Branch { cond: BranchCond::Lez, rs, rt: 0, offset, link: false },
        0x07 => Op::Branch { cond: BranchCond::Gtz, rs, rt: 0, offset, link: false },
        0x08..=0x0E => {
            let op = match opcode {
                0x08 => AluImmOp::Addi,
                0x09 => AluImmOp::Addiu,
                0x0A => AluImmOp::Slti,
                0x0B => AluImmOp::Sltiu,
                0x0C => AluImmOp::Andi,
                0x0D => AluImmOp::Ori,
                _ => AluImmOp::Xori,
            };
            Op::AluImm { op, rt, rs, imm }
        }
        0x0F => Op::Lui { rt, imm },
        0x10 => match rs {
            0x00 => Op::Mfc0 { rt, rd },
            0x04 => Op::Mtc0 { rt, rd },
            0x10 if funct == 0x10 => Op::Rfe,
            _ => Op::Unknown(raw),
        },
        0x11 => decode_cop1(raw, rs, rt, rd, sa, funct),
        0x18 => {
            let (vd, vs, vt) = vector_regs(raw);
            if vector_size(raw) != 0 {
                return Op::Unknown(raw);
            }
            match (raw >> 23) & 7 {
                0 => Op::Vec { op: VecArith::Add, vd, vs, vt },
                1 => Op::Vec { op: VecArith::Sub, vd, vs, vt },
                7 => Op::Vec { op: VecArith::Div, vd, vs, vt },
                _ => Op::Unknown(raw),
            }
        }
        0x19 => {
            let (vd, vs, vt) = vector_regs(raw);
            if vector_size(raw) != 0 || (raw >> 23) & 7 != 0 {
                return Op::Unknown(raw);
            }
            Op::Vec { op: VecArith::Mul, vd, vs, vt }
        }
        0x20 => Op::Load { op: LoadOp::Lb, rt, base: rs, offset },
        0x21 => Op::Load { op: LoadOp::Lh, rt, base: rs, offset },
        0x22 => Op::Load { op: LoadOp::Lwl, rt, base: rs, offset },
        0x23 => Op::Load { op: LoadOp::Lw, rt, base: rs, offset },
        0x24 => Op::Load { op: LoadOp::Lbu, rt, base: rs, offset },
        0x25 => Op::Load { op: LoadOp::Lhu, rt, base: rs, offset },
        0x26 => Op::Load { op: LoadOp::Lwr, rt, base: rs, offset },
        0x28 => Op::Store { op: StoreOp::Sb, rt, base: rs, offset },
        0x29 => Op::Store { op: StoreOp::Sh, rt, base: rs, offset },
        0x2A => Op::Store { op: StoreOp::Swl, rt, base: rs, offset },
        0x2B => Op::Store { op: StoreOp::Sw, rt, base: rs, offset },
        0x2E => Op::Store { op: StoreOp::Swr, rt, base: rs, offset },
        0x31 => Op::Lwc1 { ft: rt, base: rs, offset },
        0x39 => Op::Swc1 { ft: rt, base: rs, offset },
        0x32 => Op::Lvs { vt: lvs_reg(raw), base: rs, offset: (raw & 0xFFFC) as u16 as i16 },
        0x3A => Op::Svs { vt: lvs_reg(raw), base: rs, offset: (raw & 0xFFFC) as u16 as i16 },
        0x37 => {
            let kind = match (raw >> 24) & 3 {
                0 => PrefixKind::S,
                1 => PrefixKind::T,
                2 => PrefixKind::D,
                _ => return Op::Unknown(raw),
            };
            Op::VPrefix { kind, data: raw & kind.mask() }
        }
        _ => Op::Unknown(raw),
    }
}

fn decode_special(raw: u32, rs: u8, rt: u8, rd: u8, sa: u8, funct: u32) -> Op {
    let alu = |op| Op::AluReg { op, rd, rs, rt };
    match funct {
        0x00 => Op::Shift { op: ShiftOp::Sll, rd, rt, sa },
        0x02 => Op::Shift { op: ShiftOp::Srl, rd, rt, sa },
        0x03 => Op::Shift { op: ShiftOp::Sra, rd, rt, sa },
        0x04 => Op::ShiftVar { op: ShiftOp::Sll, rd, rt, rs },
        0x06 => Op::ShiftVar { op: ShiftOp::Srl, rd, rt, rs },
        0x07 => Op::ShiftVar { op: ShiftOp::Sra, rd, rt, rs },
        0x08 => Op::Jr { rs },
        0x09 => Op::Jalr { rd, rs },
        0x0C => Op::Syscall { code: (raw >> 6) & 0xF_FFFF },
        0x0D => Op::Break { code: (raw >> 6) & 0xF_FFFF },
        0x10 => Op::Mfhi { rd },
        0x11 => Op::Mthi { rs },
        0x12 => Op::Mflo { rd },
        0x13 => Op::Mtlo { rs },
        0x18 => Op::MulDiv { op: MulDivOp::Mult, rs, rt },
        0x19 => Op::MulDiv { op: MulDivOp::Multu, rs, rt },
        0x1A => Op::MulDiv { op: MulDivOp::Div, rs, rt },
        0x1B => Op::MulDiv { op: MulDivOp::Divu, rs, rt },
        0x20 => alu(AluRegOp::Add),
        0x21 => alu(AluRegOp::Addu),
        0x22 => alu(AluRegOp::Sub),
        0x23 => alu(AluRegOp::Subu),
        0x24 => alu(AluRegOp::And),
        0x25 => alu(AluRegOp::Or),
        0x26 => alu(AluRegOp::Xor),
        0x27 => alu(AluRegOp::Nor),
        0x2A => alu(AluRegOp::Slt),
        0x2B => alu(AluRegOp::Sltu),
        _ => Op::Unknown(raw),
    }
}

fn decode_cop1(raw: u32, rs: u8, rt: u8, rd: u8, sa: u8, funct: u32) -> Op {
    let fs = rd;
    let fd = sa;
    let ft = rt;
    match rs {
        0x00 => Op::Mfc1 { rt, fs },
        0x02 => Op::Cfc1 { rt, fs },
        0x04 => Op::Mtc1 { rt, fs },
        0x06 => Op::Ctc1 { rt, fs },
        0x10 => {
            let op = match funct {
                0x00 => FpuArith::Add,
                0x01 => FpuArith::Sub,
                0x02 => FpuArith::Mul,
                0x03 => FpuArith::Div,
                0x05 => FpuArith::Abs,
                0x06 => FpuArith::Mov,
                0x07 => FpuArith::Neg,
                0x24 => return Op::CvtWS { fd, fs },
                _ => return Op::Unknown(raw),
            };
            Op::Fpu { op, fd, fs, ft }
        }
        0x14 if funct == 0x20 => Op::CvtSW { fd, fs },
        _ => Op::Unknown(raw),
    }
}

fn vector_regs(raw: u32) -> (u8, u8, u8) {
    (
        (raw & 0x7F) as u8,
        ((raw >> 8) & 0x7F) as u8,
        ((raw >> 16) & 0x7F) as u8,
    )
}

fn vector_size(raw: u32) -> u32 {
    ((raw >> 7) & 1) | ((raw >> 14) & 2)
}

fn lvs_reg(raw: u32) -> u8 {
    (((raw >> 16) & 0x1F) | ((raw & 3) << 5)) as u8
}

impl Op {
    /// Branches and jumps, all of which own a delay slot.
    pub fn is_control_transfer(&self) -> bool {
        matches!(
            self,
            Op::Branch { .. } | Op::J { .. } | Op::Jal { .. } | Op::Jr { .. } | Op::Jalr { .. }
        )
    }

    /// Static cycle estimate charged before the instruction executes.
    pub fn cycle_estimate(&self) -> u32 {
        match self {
            Op::Load { .. } | Op::Lwc1 { .. } | Op::Lvs { .. } => 2,
            _ => 1,
        }
    }

    /// Whether executing this instruction may change GPR `reg`.
    /// Unknown instructions conservatively write everything.
    pub fn writes_gpr(&self, reg: u8) -> bool {
        if reg == 0 {
            return false;
        }
        let written = match *self {
            Op::AluImm { rt, .. } | Op::Lui { rt, .. } => rt,
            Op::AluReg { rd, .. } | Op::Shift { rd, .. } | Op::ShiftVar { rd, .. } => rd,
            Op::Mfhi { rd } | Op::Mflo { rd } => rd,
            Op::Load { rt, .. } => rt,
            Op::Mfc0 { rt, .. } | Op::Mfc1 { rt, .. } | Op::Cfc1 { rt, .. } => rt,
            Op::Branch { link: true, .. } | Op::Jal { .. } => 31,
            Op::Jalr { rd, .. } => rd,
            Op::Unknown(_) => return true,
            _ => return false,
        };
        written == reg
    }

    pub fn is_vfpu(&self) -> bool {
        matches!(
            self,
            Op::VPrefix { .. } | Op::Vec { .. } | Op::Lvs { .. } | Op::Svs { .. }
        )
    }

    /// Destination of a PC-relative branch or absolute jump at `pc`.
    pub fn static_target(&self, pc: u32) -> Option<u32> {
        match *self {
            Op::Branch { offset, .. } => {
                Some(pc.wrapping_add(4).wrapping_add(((offset as i32) << 2) as u32))
            }
            Op::J { index } | Op::Jal { index } => {
                Some((pc.wrapping_add(4) & 0xF000_0000) | (index << 2))
            }
            _ => None,
        }
    }
}
