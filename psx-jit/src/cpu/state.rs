//! Guest Register File Layout
//!
//! The register file is one owned array of 32-bit words. Compiled host code
//! addresses it exclusively through the slot numbers in [`layout`]; nothing
//! else is allowed to compute positions inside it.
//!
//! ## Layout (version 1, word slots)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Slot      │ Count │ Region                                          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ 0         │ 32    │ General purpose registers (r0 hardwired to 0)   │
//! │ 32        │ 2     │ HI, LO                                          │
//! │ 34        │ 4     │ PC, NEXT_PC, IN_DELAY_SLOT, DOWNCOUNT (i32)     │
//! │ 38        │ 1     │ FCR31                                           │
//! │ 40        │ 4     │ Compiler scratch (branch flag, jump target)     │
//! │ 48        │ 32    │ COP0 registers                                  │
//! │ 80        │ 32    │ FPU registers (f32 bit patterns)                │
//! │ 112       │ 128   │ Vector registers (f32 bit patterns)             │
//! │ 240       │ 3     │ Vector prefixes S, T, D                         │
//! │ 243       │ 13    │ Reserved                                        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bump [`LAYOUT_VERSION`] whenever a slot moves; save states carry it.

use std::fmt;

/// Version of the slot layout below.
pub const LAYOUT_VERSION: u32 = 1;

/// Total number of 32-bit words in the register file.
pub const STATE_WORDS: usize = 256;

/// Index of one 32-bit word inside the register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(pub u16);

impl Slot {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match layout::name(*self) {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "slot{}", self.0),
        }
    }
}

/// Slot assignments. All host code generation goes through these.
pub mod layout {
    use super::Slot;

    pub const GPR_BASE: u16 = 0;
    pub const HI: Slot = Slot(32);
    pub const LO: Slot = Slot(33);
    pub const PC: Slot = Slot(34);
    pub const NEXT_PC: Slot = Slot(35);
    pub const IN_DELAY_SLOT: Slot = Slot(36);
    /// Signed cycle budget, stored as `i32` bits.
    pub const DOWNCOUNT: Slot = Slot(37);
    pub const FCR31: Slot = Slot(38);

    /// Compiler scratch words. Never guest visible.
    pub const SCRATCH_BASE: u16 = 40;
    pub const SCRATCH_COUNT: u16 = 4;
    /// Branch condition captured before a delay slot runs.
    pub const BRANCH_FLAG: Slot = Slot(SCRATCH_BASE);
    /// Indirect jump target captured before a delay slot runs.
    pub const JUMP_TARGET: Slot = Slot(SCRATCH_BASE + 1);

    pub const COP0_BASE: u16 = 48;
    pub const FPR_BASE: u16 = 80;
    pub const VPR_BASE: u16 = 112;
    pub const VPR_COUNT: u16 = 128;
    pub const VFPU_CTRL_BASE: u16 = 240;
    pub const PREFIX_S: Slot = Slot(VFPU_CTRL_BASE);
    pub const PREFIX_T: Slot = Slot(VFPU_CTRL_BASE + 1);
    pub const PREFIX_D: Slot = Slot(VFPU_CTRL_BASE + 2);

    /// The hardwired zero register.
    pub const ZERO: Slot = Slot(GPR_BASE);

    #[inline]
    pub const fn gpr(idx: u8) -> Slot {
        Slot(GPR_BASE + (idx & 31) as u16)
    }

    #[inline]
    pub const fn cop0(idx: u8) -> Slot {
        Slot(COP0_BASE + (idx & 31) as u16)
    }

    #[inline]
    pub const fn fpr(idx: u8) -> Slot {
        Slot(FPR_BASE + (idx & 31) as u16)
    }

    #[inline]
    pub const fn vpr(idx: u8) -> Slot {
        Slot(VPR_BASE + (idx & 127) as u16)
    }

    /// Conventional ABI names of the general purpose registers.
    pub const GPR_NAMES: [&str; 32] = [
        "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5",
        "t6", "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp",
        "sp", "fp", "ra",
    ];

    /// Human readable name used by disassembly dumps.
    pub fn name(slot: Slot) -> Option<&'static str> {
        match slot {
            Slot(n) if n < 32 => Some(GPR_NAMES[n as usize]),
            HI => Some("hi"),
            LO => Some("lo"),
            PC => Some("pc"),
            NEXT_PC => Some("next_pc"),
            IN_DELAY_SLOT => Some("in_delay_slot"),
            DOWNCOUNT => Some("downcount"),
            FCR31 => Some("fcr31"),
            BRANCH_FLAG => Some("branch_flag"),
            JUMP_TARGET => Some("jump_target"),
            PREFIX_S => Some("pfx_s"),
            PREFIX_T => Some("pfx_t"),
            PREFIX_D => Some("pfx_d"),
            _ => None,
        }
    }
}

/// COP0 register numbers.
pub mod cop0 {
    pub const BPC: u8 = 3;
    pub const BDA: u8 = 5;
    /// Target address of the branch whose delay slot faulted.
    pub const TAR: u8 = 6;
    pub const DCIC: u8 = 7;
    pub const BADA: u8 = 8;
    pub const SR: u8 = 12;
    pub const CAUSE: u8 = 13;
    pub const EPC: u8 = 14;
    pub const PRID: u8 = 15;

    /// SR bit: boot exception vectors.
    pub const SR_BEV: u32 = 1 << 22;
    /// SR bit: cache isolation.
    pub const SR_ISC: u32 = 1 << 16;
    /// SR bit for coprocessor `n` usable.
    pub const fn sr_cu(n: u8) -> u32 {
        1 << (28 + n as u32)
    }

    /// Processor id reported by MFC0 $15.
    pub const PRID_VALUE: u32 = 0x0000_0002;
}

/// Default vector source prefix (identity swizzle).
pub const DEFAULT_PREFIX_ST: u32 = 0xE4;
/// Default vector destination prefix.
pub const DEFAULT_PREFIX_D: u32 = 0;

/// Reset vector of the boot ROM.
pub const RESET_VECTOR: u32 = 0xBFC0_0000;

/// Guest register file.
#[derive(Clone, PartialEq, Eq)]
pub struct GuestRegisters {
    words: [u32; STATE_WORDS],
}

impl Default for GuestRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GuestRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestRegisters")
            .field("pc", &format_args!("{:#010x}", self.pc()))
            .field("gpr", &&self.words[..32])
            .field("hi", &self.hi())
            .field("lo", &self.lo())
            .field("downcount", &self.downcount())
            .finish()
    }
}

impl GuestRegisters {
    /// Power-on state: PC at the boot vector, BEV set.
    pub fn new() -> Self {
        let mut regs = Self {
            words: [0; STATE_WORDS],
        };
        regs.reset();
        regs
    }

    pub fn reset(&mut self) {
        self.words = [0; STATE_WORDS];
        self.set_pc(RESET_VECTOR);
        self.set_next_pc(RESET_VECTOR.wrapping_add(4));
        self.set_cop0(cop0::SR, cop0::SR_BEV);
        self.set_cop0(cop0::PRID, cop0::PRID_VALUE);
        self.reset_prefixes();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Raw slot access (host code path)
    // ═══════════════════════════════════════════════════════════════════════

    #[inline]
    pub fn read(&self, slot: Slot) -> u32 {
        self.words[slot.index() % STATE_WORDS]
    }

    /// Writes to `$zero` are discarded.
    #[inline]
    pub fn write(&mut self, slot: Slot, value: u32) {
        let idx = slot.index() % STATE_WORDS;
        if idx != layout::ZERO.index() {
            self.words[idx] = value;
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Replace the whole file. `words` must be exactly [`STATE_WORDS`] long.
    pub fn load_words(&mut self, words: &[u32]) -> bool {
        if words.len() != STATE_WORDS {
            return false;
        }
        self.words.copy_from_slice(words);
        self.words[0] = 0;
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Named accessors
    // ═══════════════════════════════════════════════════════════════════════

    #[inline]
    pub fn gpr(&self, idx: u8) -> u32 {
        self.read(layout::gpr(idx))
    }

    #[inline]
    pub fn set_gpr(&mut self, idx: u8, value: u32) {
        self.write(layout::gpr(idx), value);
    }

    pub fn hi(&self) -> u32 {
        self.read(layout::HI)
    }

    pub fn lo(&self) -> u32 {
        self.read(layout::LO)
    }

    pub fn set_hi(&mut self, value: u32) {
        self.write(layout::HI, value);
    }

    pub fn set_lo(&mut self, value: u32) {
        self.write(layout::LO, value);
    }

    pub fn pc(&self) -> u32 {
        self.read(layout::PC)
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.write(layout::PC, pc);
    }

    pub fn next_pc(&self) -> u32 {
        self.read(layout::NEXT_PC)
    }

    pub fn set_next_pc(&mut self, pc: u32) {
        self.write(layout::NEXT_PC, pc);
    }

    pub fn in_delay_slot(&self) -> bool {
        self.read(layout::IN_DELAY_SLOT) != 0
    }

    pub fn set_in_delay_slot(&mut self, flag: bool) {
        self.write(layout::IN_DELAY_SLOT, flag as u32);
    }

    pub fn downcount(&self) -> i32 {
        self.read(layout::DOWNCOUNT) as i32
    }

    pub fn set_downcount(&mut self, value: i32) {
        self.write(layout::DOWNCOUNT, value as u32);
    }

    pub fn fcr31(&self) -> u32 {
        self.read(layout::FCR31)
    }

    pub fn set_fcr31(&mut self, value: u32) {
        self.write(layout::FCR31, value);
    }

    pub fn cop0(&self, idx: u8) -> u32 {
        self.read(layout::cop0(idx))
    }

    pub fn set_cop0(&mut self, idx: u8, value: u32) {
        self.write(layout::cop0(idx), value);
    }

    pub fn fpr(&self, idx: u8) -> f32 {
        f32::from_bits(self.read(layout::fpr(idx)))
    }

    pub fn set_fpr(&mut self, idx: u8, value: f32) {
        self.write(layout::fpr(idx), value.to_bits());
    }

    pub fn vpr(&self, idx: u8) -> f32 {
        f32::from_bits(self.read(layout::vpr(idx)))
    }

    pub fn set_vpr(&mut self, idx: u8, value: f32) {
        self.write(layout::vpr(idx), value.to_bits());
    }

    pub fn prefixes(&self) -> [u32; 3] {
        [
            self.read(layout::PREFIX_S),
            self.read(layout::PREFIX_T),
            self.read(layout::PREFIX_D),
        ]
    }

    pub fn reset_prefixes(&mut self) {
        self.write(layout::PREFIX_S, DEFAULT_PREFIX_ST);
        self.write(layout::PREFIX_T, DEFAULT_PREFIX_ST);
        self.write(layout::PREFIX_D, DEFAULT_PREFIX_D);
    }

    pub fn has_default_prefix(&self) -> bool {
        self.prefixes() == [DEFAULT_PREFIX_ST, DEFAULT_PREFIX_ST, DEFAULT_PREFIX_D]
    }

    /// True when the SR usable bit for coprocessor `n` is set.
    pub fn cop_usable(&self, n: u8) -> bool {
        self.cop0(cop0::SR) & cop0::sr_cu(n) != 0
    }

    /// Stores go to the isolated cache instead of memory.
    pub fn cache_isolated(&self) -> bool {
        self.cop0(cop0::SR) & cop0::SR_ISC != 0
    }

    /// Compare architecturally visible state, ignoring the compiler scratch
    /// words and the cycle budget.
    pub fn guest_visible_eq(&self, other: &Self) -> bool {
        let scratch = layout::SCRATCH_BASE as usize
            ..(layout::SCRATCH_BASE + layout::SCRATCH_COUNT) as usize;
        self.words.iter().zip(other.words.iter()).enumerate().all(|(i, (a, b))| {
            scratch.contains(&i)
                || i == layout::DOWNCOUNT.index()
                || i == layout::NEXT_PC.index()
                || a == b
        })
    }

    /// First differing slot, for test diagnostics.
    pub fn first_difference(&self, other: &Self) -> Option<(Slot, u32, u32)> {
        let scratch = layout::SCRATCH_BASE as usize
            ..(layout::SCRATCH_BASE + layout::SCRATCH_COUNT) as usize;
        (0..STATE_WORDS)
            .filter(|i| {
                !scratch.contains(i)
                    && *i != layout::DOWNCOUNT.index()
                    && *i != layout::NEXT_PC.index()
            })
            .find(|&i| self.words[i] != other.words[i])
            .map(|i| (Slot(i as u16), self.words[i], other.words[i]))
    }
}
