//! Single precision FPU helpers shared by the interpreter and host code.

/// FCR0 (implementation/revision) as read by CFC1.
pub const FCR0_VALUE: u32 = 0x0000_3351;
/// Writable FCR31 bits.
pub const FCR31_WRITE_MASK: u32 = 0x0181_FFFF;
/// FCR31 bits that make the guest's rounding behaviour differ from the
/// host default: the rounding mode field and flush-to-zero.
pub const FCR31_ROUNDING_BITS: u32 = 0x0100_0003;
pub const FCR31_FLUSH_TO_ZERO: u32 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundingMode {
    #[default]
    Nearest,
    Zero,
    PosInf,
    NegInf,
}

impl RoundingMode {
    pub fn from_fcr31(fcr31: u32) -> Self {
        match fcr31 & 3 {
            0 => RoundingMode::Nearest,
            1 => RoundingMode::Zero,
            2 => RoundingMode::PosInf,
            _ => RoundingMode::NegInf,
        }
    }
}

/// Host floating point control, as applied by the rounding-mode bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FpControl {
    pub rounding: RoundingMode,
    pub flush_to_zero: bool,
}

impl FpControl {
    pub fn from_fcr31(fcr31: u32) -> Self {
        Self {
            rounding: RoundingMode::from_fcr31(fcr31),
            flush_to_zero: fcr31 & FCR31_FLUSH_TO_ZERO != 0,
        }
    }
}

/// True when the guest has requested non-default rounding.
pub fn uses_custom_rounding(fcr31: u32) -> bool {
    fcr31 & FCR31_ROUNDING_BITS != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuArith {
    Add,
    Sub,
    Mul,
    Div,
    Abs,
    Mov,
    Neg,
}

impl FpuArith {
    pub fn mnemonic(self) -> &'static str {
        match self {
            FpuArith::Add => "add.s",
            FpuArith::Sub => "sub.s",
            FpuArith::Mul => "mul.s",
            FpuArith::Div => "div.s",
            FpuArith::Abs => "abs.s",
            FpuArith::Mov => "mov.s",
            FpuArith::Neg => "neg.s",
        }
    }
}

fn flush_denormal(value: f32, ctl: FpControl) -> f32 {
    if ctl.flush_to_zero && value.is_subnormal() {
        0.0f32.copysign(value)
    } else {
        value
    }
}

pub fn arith(op: FpuArith, a: f32, b: f32, ctl: FpControl) -> f32 {
    let mode = ctl.rounding;
    // Infinite operands and division by zero give exact results.
    let inexact = a.is_finite() && b.is_finite();
    let result = match op {
        FpuArith::Add if inexact => directed(a + b, add_error(a, b), mode),
        FpuArith::Sub if inexact => directed(a - b, add_error(a, -b), mode),
        FpuArith::Mul if inexact => {
            let r = a * b;
            directed(r, sign(a as f64 * b as f64 - r as f64), mode)
        }
        FpuArith::Div if inexact && b != 0.0 => {
            let r = a / b;
            let rem = a as f64 - r as f64 * b as f64;
            directed(r, sign(rem) * sign(b as f64), mode)
        }
        FpuArith::Add => a + b,
        FpuArith::Sub => a - b,
        FpuArith::Mul => a * b,
        FpuArith::Div => a / b,
        FpuArith::Abs => a.abs(),
        FpuArith::Mov => a,
        FpuArith::Neg => -a,
    };
    // An exact zero sum is -0 when rounding down.
    let result = match op {
        FpuArith::Add | FpuArith::Sub
            if mode == RoundingMode::NegInf && result == 0.0 && a != 0.0 && b != 0.0 =>
        {
            -0.0
        }
        _ => result,
    };
    flush_denormal(result, ctl)
}

fn sign(x: f64) -> f64 {
    if x == 0.0 || x.is_nan() { 0.0 } else { x.signum() }
}

/// Sign of `exact - (a + b)` for the round-to-nearest sum (two-sum).
fn add_error(a: f32, b: f32) -> f64 {
    let s = a + b;
    if !s.is_finite() {
        return 0.0;
    }
    let bb = s - a;
    let err = (a - (s - bb)) + (b - bb);
    sign(err as f64)
}

/// Step a round-to-nearest result one ulp when the exact value lies on the
/// wrong side of it for `mode`. `err` is the sign of `exact - nearest`.
fn directed(nearest: f32, err: f64, mode: RoundingMode) -> f32 {
    if nearest.is_nan() {
        return nearest;
    }
    if nearest.is_infinite() {
        // Overflow saturates unless the mode rounds outward.
        return match mode {
            RoundingMode::Zero => f32::MAX.copysign(nearest),
            RoundingMode::PosInf if nearest < 0.0 => f32::MIN,
            RoundingMode::NegInf if nearest > 0.0 => f32::MAX,
            _ => nearest,
        };
    }
    match mode {
        RoundingMode::PosInf if err > 0.0 => next_up(nearest),
        RoundingMode::NegInf if err < 0.0 => next_down(nearest),
        RoundingMode::Zero if nearest > 0.0 && err < 0.0 => next_down(nearest),
        RoundingMode::Zero if nearest < 0.0 && err > 0.0 => next_up(nearest),
        _ => nearest,
    }
}

fn next_up(x: f32) -> f32 {
    if x.is_nan() || x == f32::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f32::from_bits(1);
    }
    let bits = x.to_bits();
    f32::from_bits(if x > 0.0 { bits + 1 } else { bits - 1 })
}

fn next_down(x: f32) -> f32 {
    -next_up(-x)
}

/// CVT.W.S: convert with the given rounding. Out of range and NaN inputs
/// produce the invalid-operation result 0x7FFFFFFF.
pub fn cvt_w_s(value: f32, ctl: FpControl) -> u32 {
    if value.is_nan() {
        return 0x7FFF_FFFF;
    }
    let rounded = match ctl.rounding {
        RoundingMode::Nearest => value.round_ties_even(),
        RoundingMode::Zero => value.trunc(),
        RoundingMode::PosInf => value.ceil(),
        RoundingMode::NegInf => value.floor(),
    };
    if rounded >= 2_147_483_648.0 || rounded < -2_147_483_648.0 {
        0x7FFF_FFFF
    } else {
        rounded as i32 as u32
    }
}

pub fn cvt_s_w(value: u32, ctl: FpControl) -> f32 {
    flush_denormal(value as i32 as f32, ctl)
}
