//! Host code representation.
//!
//! Compiled blocks are sequences of [`HostOp`]s in one flat [`CodeBuffer`].
//! A [`CodeAddr`] is an index into that buffer, which plays the role of a
//! native code pointer: exits are patched in place, entries are jumped to
//! and the buffer can be described back to a block for tooling.
//!
//! Host ops touch guest state only through [`Slot`]s of the versioned
//! register layout.
//!
//! ## Buffer layout
//!
//! ```text
//! 0                  fixed_len                          len        capacity
//! ├── trampolines ───┼── block 0 ──┼── block 1 ──┼ ... ─┤   free    ┤
//! ```
//!
//! The trampolines are generated once and survive cache clears; clearing
//! truncates the buffer back to `fixed_len`.

use crate::cpu::decoder::{BranchCond, MulDivOp};
use crate::cpu::exception::GuestException;
use crate::cpu::fpu::FpuArith;
use crate::cpu::interpreter::Width;
use crate::cpu::state::Slot;
use crate::cpu::vfpu::VecArith;
use crate::error::{JitError, JitResult};

/// Index of a host op in the code buffer.
pub type CodeAddr = usize;

/// Fixed dispatcher entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchTarget {
    OuterLoop,
    Dispatcher,
    DispatcherNoCheck,
    DispatcherCheckCoreState,
    BreakpointBailout,
}

impl DispatchTarget {
    pub fn label(self) -> &'static str {
        match self {
            DispatchTarget::OuterLoop => "outerLoop",
            DispatchTarget::Dispatcher => "dispatcher",
            DispatchTarget::DispatcherNoCheck => "dispatcherNoCheck",
            DispatchTarget::DispatcherCheckCoreState => "dispatcherCheckCoreState",
            DispatchTarget::BreakpointBailout => "breakpointBailout",
        }
    }
}

/// Guest context of an op that may observe time or raise an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Site {
    pub pc: u32,
    pub in_delay_slot: bool,
    /// Block cycles accumulated up to and including this instruction.
    pub cycles: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Slot(Slot),
    Imm(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,
    Sll,
    Srl,
    Sra,
}

impl AluOp {
    pub fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Nor => !(a | b),
            AluOp::Slt => ((a as i32) < (b as i32)) as u32,
            AluOp::Sltu => (a < b) as u32,
            AluOp::Sll => a << (b & 31),
            AluOp::Srl => a >> (b & 31),
            AluOp::Sra => ((a as i32) >> (b & 31)) as u32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Nor => "nor",
            AluOp::Slt => "slt",
            AluOp::Sltu => "sltu",
            AluOp::Sll => "sll",
            AluOp::Srl => "srl",
            AluOp::Sra => "sra",
        }
    }
}

/// Vector prefixes as seen by one vector op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOperand {
    /// Known at compile time; the prefix registers are left alone.
    Known([u32; 3]),
    /// Read from the prefix registers, which are then reset to defaults.
    Runtime,
}

/// One host instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostOp {
    // ── Control ─────────────────────────────────────────────────────────
    /// Block preamble. Exits to the outer loop with PC = `resume_pc` when
    /// the cycle budget is spent.
    CheckedEntry { resume_pc: u32 },
    Jump(CodeAddr),
    JumpIf { cond: Slot, when: bool, target: CodeAddr },
    /// Set PC and leave through the dispatcher.
    ExitUnlinked { guest_pc: u32 },
    /// Set PC from a slot and leave through the dispatcher.
    ExitIndirect { src: Slot },
    /// Leave the executor for a fixed dispatcher entry.
    Trampoline(DispatchTarget),
    /// Commit the block's remaining cycles to the downcount.
    SubDowncount { cycles: u32 },

    // ── Integer ─────────────────────────────────────────────────────────
    Move { dst: Slot, src: Slot },
    LoadImm { dst: Slot, value: u32 },
    Alu { op: AluOp, dst: Slot, a: Slot, b: Operand },
    /// ADD/SUB with overflow trap.
    AluChecked { sub: bool, dst: Slot, a: Slot, b: Operand, site: Site },
    Compare { cond: BranchCond, dst: Slot, a: Slot, b: Slot },
    MulDiv { op: MulDivOp, a: Slot, b: Slot, site: Site },
    SyncMulDiv { site: Site },

    // ── Memory ──────────────────────────────────────────────────────────
    Load { width: Width, signed: bool, dst: Slot, base: Slot, offset: i16, site: Site },
    Store { width: Width, src: Slot, base: Slot, offset: i16, site: Site },

    // ── Coprocessors ────────────────────────────────────────────────────
    CheckCop { cop: u8, site: Site },
    Fpu { op: FpuArith, fd: Slot, fs: Slot, ft: Slot },
    CvtWS { fd: Slot, fs: Slot },
    CvtSW { fd: Slot, fs: Slot },
    /// Load the host rounding control from FCR31.
    ApplyRoundingMode,
    /// Put the host rounding control back to its default.
    RestoreRoundingMode,
    /// After an FCR31 write: note custom rounding and reload the host
    /// control.
    UpdateRoundingMode,
    Vector { op: VecArith, vd: u8, vs: u8, vt: u8, prefixes: PrefixOperand, site: Site },
    SyncCop { site: Site },

    // ── Helpers ─────────────────────────────────────────────────────────
    CallInterpreter { raw: u32, site: Site },
    /// Run `count` whole instructions through the interpreter from PC.
    InterpretSteps { count: u32, site: Site },
    RaiseException { exc: GuestException, site: Site },
    CheckBreakpoint { addr: u32, resume_pc: u32, site: Site },
    CallReplacement { index: usize, site: Site },
}

impl HostOp {
    /// Whether the op may leave the executor or raise a guest exception.
    pub fn may_exit(&self) -> bool {
        matches!(
            self,
            HostOp::CheckedEntry { .. }
                | HostOp::ExitUnlinked { .. }
                | HostOp::ExitIndirect { .. }
                | HostOp::Trampoline(_)
                | HostOp::AluChecked { .. }
                | HostOp::Load { .. }
                | HostOp::Store { .. }
                | HostOp::CheckCop { .. }
                | HostOp::CallInterpreter { .. }
                | HostOp::InterpretSteps { .. }
                | HostOp::RaiseException { .. }
                | HostOp::CheckBreakpoint { .. }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Code buffer
// ═══════════════════════════════════════════════════════════════════════════

/// Flat, append-only store of host ops with in-place patching.
#[derive(Debug)]
pub struct CodeBuffer {
    ops: Vec<HostOp>,
    capacity: usize,
    fixed_len: usize,
}

impl CodeBuffer {
    /// Reserve `capacity` ops up front. The compile loop clears the cache
    /// before the buffer fills, so emitting past `capacity` only happens
    /// when a single block overruns the thresholds; the buffer then grows.
    pub fn new(capacity: usize) -> JitResult<Self> {
        let mut ops = Vec::new();
        ops.try_reserve_exact(capacity)
            .map_err(|_| JitError::CodeSpaceAllocation { ops: capacity })?;
        Ok(Self {
            ops,
            capacity,
            fixed_len: 0,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn space_left(&self) -> usize {
        self.capacity.saturating_sub(self.ops.len())
    }

    pub fn fixed_len(&self) -> usize {
        self.fixed_len
    }

    /// Mark everything emitted so far as permanent.
    pub fn seal_fixed(&mut self) {
        self.fixed_len = self.ops.len();
    }

    /// Drop all block code, keeping the trampolines.
    pub fn reset_to_fixed(&mut self) {
        self.ops.truncate(self.fixed_len);
    }

    /// Drop everything from `addr` on. Used to discard an aborted block.
    pub fn truncate(&mut self, addr: CodeAddr) {
        if addr >= self.fixed_len {
            self.ops.truncate(addr);
        }
    }

    pub fn emit(&mut self, op: HostOp) -> CodeAddr {
        let addr = self.ops.len();
        self.ops.push(op);
        addr
    }

    #[inline]
    pub fn get(&self, addr: CodeAddr) -> Option<HostOp> {
        self.ops.get(addr).copied()
    }

    pub fn patch(&mut self, addr: CodeAddr, op: HostOp) -> JitResult<()> {
        match self.ops.get_mut(addr) {
            Some(slot) => {
                *slot = op;
                Ok(())
            }
            None => Err(JitError::InvalidCodeAddress(addr)),
        }
    }

    /// Retarget a previously emitted jump.
    pub fn patch_jump_target(&mut self, addr: CodeAddr, target: CodeAddr) -> JitResult<()> {
        match self.ops.get_mut(addr) {
            Some(HostOp::JumpIf { target: t, .. }) | Some(HostOp::Jump(t)) => {
                *t = target;
                Ok(())
            }
            _ => Err(JitError::InvalidCodeAddress(addr)),
        }
    }

    pub fn slice(&self, start: CodeAddr, end: CodeAddr) -> &[HostOp] {
        let end = end.min(self.ops.len());
        let start = start.min(end);
        &self.ops[start..end]
    }

    /// True for any address inside the reserved buffer or emitted code.
    pub fn is_in_space(&self, addr: CodeAddr) -> bool {
        addr < self.capacity.max(self.ops.len())
    }
}

/// Addresses of the pregenerated dispatcher trampolines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedCode {
    pub outer_loop: CodeAddr,
    pub dispatcher: CodeAddr,
    pub dispatcher_no_check: CodeAddr,
    pub dispatcher_check_core_state: CodeAddr,
    pub breakpoint_bailout: CodeAddr,
}

impl FixedCode {
    /// Emit the trampolines at the start of an empty buffer and seal them.
    pub fn generate(code: &mut CodeBuffer) -> Self {
        let outer_loop = code.emit(HostOp::Trampoline(DispatchTarget::OuterLoop));
        let dispatcher = code.emit(HostOp::Trampoline(DispatchTarget::Dispatcher));
        let dispatcher_no_check = code.emit(HostOp::Trampoline(DispatchTarget::DispatcherNoCheck));
        let dispatcher_check_core_state =
            code.emit(HostOp::Trampoline(DispatchTarget::DispatcherCheckCoreState));
        // Breakpoint pauses leave with the host rounding mode restored.
        let breakpoint_bailout = code.emit(HostOp::RestoreRoundingMode);
        code.emit(HostOp::Jump(dispatcher_check_core_state));
        code.seal_fixed();
        Self {
            outer_loop,
            dispatcher,
            dispatcher_no_check,
            dispatcher_check_core_state,
            breakpoint_bailout,
        }
    }

    pub fn addr_of(&self, target: DispatchTarget) -> CodeAddr {
        match target {
            DispatchTarget::OuterLoop => self.outer_loop,
            DispatchTarget::Dispatcher => self.dispatcher,
            DispatchTarget::DispatcherNoCheck => self.dispatcher_no_check,
            DispatchTarget::DispatcherCheckCoreState => self.dispatcher_check_core_state,
            DispatchTarget::BreakpointBailout => self.breakpoint_bailout,
        }
    }

    /// Trampoline whose entry is exactly `addr`.
    pub fn target_at(&self, addr: CodeAddr) -> Option<DispatchTarget> {
        [
            DispatchTarget::OuterLoop,
            DispatchTarget::Dispatcher,
            DispatchTarget::DispatcherNoCheck,
            DispatchTarget::DispatcherCheckCoreState,
            DispatchTarget::BreakpointBailout,
        ]
        .into_iter()
        .find(|t| self.addr_of(*t) == addr)
    }
}
