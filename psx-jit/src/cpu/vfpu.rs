//! Vector unit operand prefixes.
//!
//! Prefix directives modify the operands of the next vector arithmetic
//! instruction and are then consumed ("eaten"). Only lane 0 is modelled,
//! since every supported vector op is a single-lane form.
//!
//! Source prefix (S and T), lane 0 fields:
//!
//! ```text
//! bits 0-1   swizzle: read register vs + n
//! bit  8     abs (or constant bank select)
//! bit  12    constant: use CONSTANTS[swizzle + 4*abs]
//! bit  16    negate
//! ```
//!
//! Destination prefix (D), lane 0 fields: bits 0-1 saturate (1 = [0,1],
//! 3 = [-1,1]) and bit 8 write mask.

use super::state::{GuestRegisters, DEFAULT_PREFIX_D, DEFAULT_PREFIX_ST};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixKind {
    S,
    T,
    D,
}

impl PrefixKind {
    pub fn index(self) -> usize {
        match self {
            PrefixKind::S => 0,
            PrefixKind::T => 1,
            PrefixKind::D => 2,
        }
    }

    pub fn default_value(self) -> u32 {
        match self {
            PrefixKind::S | PrefixKind::T => DEFAULT_PREFIX_ST,
            PrefixKind::D => DEFAULT_PREFIX_D,
        }
    }

    /// Significant bits of the directive payload.
    pub fn mask(self) -> u32 {
        match self {
            PrefixKind::S | PrefixKind::T => 0x000F_FFFF,
            PrefixKind::D => 0x0000_0FFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecArith {
    Add,
    Sub,
    Mul,
    Div,
}

impl VecArith {
    pub fn mnemonic(self) -> &'static str {
        match self {
            VecArith::Add => "vadd.s",
            VecArith::Sub => "vsub.s",
            VecArith::Mul => "vmul.s",
            VecArith::Div => "vdiv.s",
        }
    }

    /// Cycles until the result leaves the pipeline.
    pub fn latency(self) -> u32 {
        match self {
            VecArith::Add | VecArith::Sub => 2,
            VecArith::Mul => 3,
            VecArith::Div => 12,
        }
    }
}

pub const DEFAULT_PREFIXES: [u32; 3] = [DEFAULT_PREFIX_ST, DEFAULT_PREFIX_ST, DEFAULT_PREFIX_D];

const CONSTANTS: [f32; 8] = [
    0.0,
    1.0,
    2.0,
    0.5,
    3.0,
    1.0 / 3.0,
    0.25,
    1.0 / 6.0,
];

/// Read source operand `reg` through an S or T prefix.
pub fn source_operand(regs: &GuestRegisters, reg: u8, prefix: u32) -> f32 {
    let swizzle = prefix & 3;
    let abs = (prefix >> 8) & 1 != 0;
    let constant = (prefix >> 12) & 1 != 0;
    let negate = (prefix >> 16) & 1 != 0;

    let mut value = if constant {
        CONSTANTS[(swizzle + if abs { 4 } else { 0 }) as usize]
    } else {
        let v = regs.vpr(reg.wrapping_add(swizzle as u8) & 127);
        if abs { v.abs() } else { v }
    };
    if negate {
        value = -value;
    }
    value
}

/// Apply a D prefix to a result. `None` means the write is masked.
pub fn dest_operand(value: f32, prefix: u32) -> Option<f32> {
    if (prefix >> 8) & 1 != 0 {
        return None;
    }
    Some(match prefix & 3 {
        1 => value.clamp(0.0, 1.0),
        3 => value.clamp(-1.0, 1.0),
        _ => value,
    })
}

pub fn compute(op: VecArith, a: f32, b: f32) -> f32 {
    match op {
        VecArith::Add => a + b,
        VecArith::Sub => a - b,
        VecArith::Mul => a * b,
        VecArith::Div => a / b,
    }
}

/// Run one single-lane vector op with explicit prefixes. Does not touch the
/// prefix registers; callers decide how prefixes are consumed.
pub fn execute_arith(
    regs: &mut GuestRegisters,
    op: VecArith,
    vd: u8,
    vs: u8,
    vt: u8,
    prefixes: [u32; 3],
) {
    let a = source_operand(regs, vs, prefixes[0]);
    let b = source_operand(regs, vt, prefixes[1]);
    if let Some(result) = dest_operand(compute(op, a, b), prefixes[2]) {
        regs.set_vpr(vd, result);
    }
}
