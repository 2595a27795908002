//! Block Compiler: guest MIPS to host ops.
//!
//! Translates one guest basic block starting at a given address into host
//! ops appended to the code buffer. Executing the result has the same
//! effect on registers, memory, time and exceptions as stepping the
//! interpreter over the same instructions.
//!
//! ## Block shape
//!
//! ```text
//!   CheckedEntry        budget spent → outer loop, PC = block start
//!   [ApplyRoundingMode] only once the guest uses custom rounding
//!   ... body ...        one group of ops per guest instruction
//!   exit sequence       flush prefixes, SubDowncount, [RestoreRoundingMode]
//!   exit stubs          ExitUnlinked (patched to Jump when linked)
//! ```
//!
//! A block ends after a control transfer and its delay slot, when the
//! instruction limit is reached, or when the code buffer runs low.
//!
//! ## Delay slots
//!
//! The delay slot is translated after the branch but must see the
//! registers as they were before it. When the slot overwrites a register
//! the branch reads, the condition (or the jump target) is captured into a
//! scratch slot first.

use sha2::{Digest, Sha256};

use super::cache::{BlockCache, BlockExit, BlockFinish, BlockId};
use super::host::{AluOp, CodeAddr, HostOp, Operand, PrefixOperand, Site};
use super::prefix::PrefixTracker;
use super::replacement::ReplacementTable;
use super::trace::{TraceBuffer, TraceEvent};
use super::types::{JitConfig, JitFlags};
use crate::cpu::asm::RA;
use crate::cpu::decoder::{
    decode, is_vfpu_opcode, AluImmOp, AluRegOp, LoadOp, Op, ShiftOp, StoreOp,
};
use crate::cpu::exception::{ExceptionCode, GuestException};
use crate::cpu::interpreter::{fetch, Width};
use crate::cpu::state::{layout, Slot};
use crate::cpu::vfpu::PrefixKind;
use crate::debugger::{BreakpointTable, SymbolMap};
use crate::error::{JitError, JitResult};
use crate::memory::GuestMemory;

/// Result of compiling one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOutcome {
    pub id: BlockId,
    /// The block left a prefix directive unconsumed while assuming default
    /// prefixes on entry.
    pub uneaten_prefix: bool,
    /// Instructions that went through the interpreter because they have no
    /// translation.
    pub fallbacks: u32,
    pub instructions: u32,
    pub host_ops: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The instruction always leaves the block (trap).
    End,
}

/// SHA-256 over the guest words of `[start, start + size)`. Unreadable
/// words hash as zero.
pub(crate) fn hash_guest_range(mem: &mut dyn GuestMemory, start: u32, size: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for i in 0..size.div_ceil(4) {
        let word = mem.read_u32(start.wrapping_add(i * 4)).unwrap_or(0);
        hasher.update(word.to_le_bytes());
    }
    hasher.finalize().into()
}

fn prefix_slot(kind: PrefixKind) -> Slot {
    match kind {
        PrefixKind::S => layout::PREFIX_S,
        PrefixKind::T => layout::PREFIX_T,
        PrefixKind::D => layout::PREFIX_D,
    }
}

/// One block translation. Borrows the engine parts it reads and the cache
/// it writes to.
pub(crate) struct BlockCompiler<'a> {
    cache: &'a mut BlockCache,
    config: &'a JitConfig,
    flags: JitFlags,
    breakpoints: &'a BreakpointTable,
    symbols: &'a SymbolMap,
    replacements: &'a ReplacementTable,
    trace: &'a mut TraceBuffer,

    id: BlockId,
    start: u32,
    /// Next guest address to translate.
    pc: u32,
    /// End of the last translated guest word.
    end: u32,
    /// Cycle estimate accumulated so far.
    cycles: u32,
    count: u32,
    prefixes: PrefixTracker,
    uneaten: bool,
    fallbacks: u32,
    /// Guest bytes of the main range, fixed once a jump is continued.
    main_size: Option<u32>,
    segment_start: u32,
    continuing: bool,
    proxies: Vec<(u32, u32)>,
}

impl<'a> BlockCompiler<'a> {
    pub(crate) fn new(
        cache: &'a mut BlockCache,
        config: &'a JitConfig,
        flags: JitFlags,
        breakpoints: &'a BreakpointTable,
        symbols: &'a SymbolMap,
        replacements: &'a ReplacementTable,
        trace: &'a mut TraceBuffer,
    ) -> Self {
        Self {
            cache,
            config,
            flags,
            breakpoints,
            symbols,
            replacements,
            trace,
            id: 0,
            start: 0,
            pc: 0,
            end: 0,
            cycles: 0,
            count: 0,
            prefixes: PrefixTracker::start(flags.start_default_prefix),
            uneaten: false,
            fallbacks: 0,
            main_size: None,
            segment_start: 0,
            continuing: false,
            proxies: Vec::new(),
        }
    }

    /// Compile the block at `start`. A failed compile leaves no trace in the
    /// cache.
    pub(crate) fn compile(
        mut self,
        mem: &mut dyn GuestMemory,
        start: u32,
    ) -> JitResult<CompileOutcome> {
        let id = self.cache.allocate_block(start)?;
        self.id = id;
        self.start = start;
        self.pc = start;
        self.end = start;
        self.segment_start = start;
        match self.compile_body(mem) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                log::error!("[JIT] Compile of {:08x} failed: {}", start, e);
                self.cache.abort_block(id);
                Err(e)
            }
        }
    }

    fn compile_body(&mut self, mem: &mut dyn GuestMemory) -> JitResult<CompileOutcome> {
        let entry = self.cache.code().len();
        self.cache
            .code_mut()
            .emit(HostOp::CheckedEntry { resume_pc: self.start });
        self.cache.set_normal_entry(self.id, entry + 1)?;
        if self.flags.last_set_rounding {
            self.emit(HostOp::ApplyRoundingMode);
        }

        loop {
            let pc = self.pc;
            let limit = self.config.instruction_limit(self.continuing);
            // A block always holds at least one instruction.
            let out_of_space = self.count > 0
                && self.cache.code().space_left() < self.config.block_end_threshold;
            if self.count >= limit || out_of_space {
                self.exit_sequence();
                self.emit_exit(pc)?;
                break;
            }

            if self.breakpoints.is_address_breakpoint(pc) {
                self.emit(HostOp::CheckBreakpoint {
                    addr: pc,
                    resume_pc: pc,
                    site: self.site_before(pc),
                });
            } else if let Some(index) = self.entry_replacement(pc) {
                // The whole function runs natively and returns through $ra.
                self.emit(HostOp::CallReplacement {
                    index,
                    site: self.site_before(pc),
                });
                if let Some(size) = self.symbols.function_size(pc) {
                    self.proxies.push((pc, size));
                }
                self.end = pc.wrapping_add(4);
                self.exit_sequence();
                self.emit(HostOp::ExitIndirect { src: layout::gpr(RA) });
                break;
            }

            let raw = match fetch(mem, pc) {
                Ok(raw) => raw,
                Err(exc) => {
                    self.emit(HostOp::RaiseException {
                        exc,
                        site: self.site_before(pc),
                    });
                    self.end = pc.wrapping_add(4);
                    break;
                }
            };
            let op = decode(raw);

            if op.is_control_transfer() {
                if self.compile_control(mem, op, pc)? {
                    break;
                }
                continue;
            }

            self.cycles += op.cycle_estimate();
            self.count += 1;
            self.pc = pc.wrapping_add(4);
            self.end = self.pc;
            if self.translate(op, raw, pc, false) == Flow::End {
                break;
            }
        }

        self.finish(mem)
    }

    fn finish(&mut self, mem: &mut dyn GuestMemory) -> JitResult<CompileOutcome> {
        let main_size = match self.main_size {
            Some(size) => {
                let tail = self.end.wrapping_sub(self.segment_start);
                self.proxies.push((self.segment_start, tail));
                size
            }
            None => self.end.wrapping_sub(self.start),
        };
        let content_hash = hash_guest_range(mem, self.start, main_size.max(4));
        self.cache.finalize_block(
            self.id,
            BlockFinish {
                original_size: main_size,
                instruction_count: self.count,
                content_hash,
                link: self.config.enable_linking,
            },
        )?;
        for (start, size) in std::mem::take(&mut self.proxies) {
            self.cache.proxy_block(self.id, start, size);
        }

        let (size, host_ops) = match self.cache.block(self.id) {
            Some(b) => (b.original_size, b.code_end - b.checked_entry),
            None => (main_size, 0),
        };
        self.trace.push(TraceEvent::BlockCompiled {
            pc: self.start,
            size,
            instructions: self.count,
            host_ops,
        });
        log::debug!(
            "[JIT] Compiled {:08x}: {} instructions, {} bytes, {} host ops",
            self.start,
            self.count,
            size,
            host_ops
        );

        Ok(CompileOutcome {
            id: self.id,
            uneaten_prefix: self.flags.start_default_prefix && self.uneaten,
            fallbacks: self.fallbacks,
            instructions: self.count,
            host_ops,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Emission helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Append `op`. Anything that may leave the block first sees the guest
    /// prefix registers brought up to date.
    fn emit(&mut self, op: HostOp) -> CodeAddr {
        if op.may_exit() {
            self.flush_prefixes();
        }
        self.cache.code_mut().emit(op)
    }

    fn flush_prefixes(&mut self) {
        for (kind, value) in self.prefixes.take_dirty() {
            self.cache.code_mut().emit(HostOp::LoadImm {
                dst: prefix_slot(kind),
                value,
            });
        }
    }

    /// Site whose time excludes the instruction at `pc`.
    fn site_before(&self, pc: u32) -> Site {
        Site {
            pc,
            in_delay_slot: false,
            cycles: self.cycles,
        }
    }

    /// Site of the instruction at `pc`, whose estimate is already counted.
    fn site(&self, pc: u32, in_delay_slot: bool) -> Site {
        Site {
            pc,
            in_delay_slot,
            cycles: self.cycles,
        }
    }

    /// Everything a block does before leaving through any exit.
    fn exit_sequence(&mut self) {
        if self.prefixes.may_have_prefix() {
            self.uneaten = true;
        }
        self.flush_prefixes();
        self.emit(HostOp::SubDowncount {
            cycles: self.cycles,
        });
        if self.flags.last_set_rounding {
            self.emit(HostOp::RestoreRoundingMode);
        }
    }

    /// Linkable exit stub to `target`.
    fn emit_exit(&mut self, target: u32) -> JitResult<()> {
        let ptr = self.emit(HostOp::ExitUnlinked { guest_pc: target });
        self.cache.add_exit(
            self.id,
            BlockExit {
                target,
                ptr,
                linked: false,
            },
        )
    }

    /// Replacement for a function entered at `pc`. A breakpoint in the
    /// body past the entry keeps the guest code.
    fn entry_replacement(&self, pc: u32) -> Option<usize> {
        if !self.config.enable_replacements {
            return None;
        }
        let index = self.replacements.lookup(pc)?;
        match self.symbols.function_size(pc) {
            Some(size) if size > 4 => {
                let body = pc.wrapping_add(4);
                (!self.breakpoints.range_contains_breakpoint(body, size - 4)).then_some(index)
            }
            _ => Some(index),
        }
    }

    /// Replacement usable at a `JAL` to `target`: the function's extent must
    /// be known and free of breakpoints.
    fn call_replacement(&self, target: u32) -> Option<(usize, u32)> {
        if !self.config.enable_replacements {
            return None;
        }
        let index = self.replacements.lookup(target)?;
        let size = self.symbols.function_size(target)?;
        if self.breakpoints.range_contains_breakpoint(target, size) {
            return None;
        }
        Some((index, size))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control transfers
    // ═══════════════════════════════════════════════════════════════════════

    /// Translate a branch or jump at `pc` together with its delay slot.
    /// Returns true when the block ends here.
    fn compile_control(&mut self, mem: &mut dyn GuestMemory, op: Op, pc: u32) -> JitResult<bool> {
        let delay_pc = pc.wrapping_add(4);
        let after = pc.wrapping_add(8);

        // A guard on the delay slot has to stop before the branch: resuming
        // in the middle of the pair would lose the branch.
        if self.breakpoints.is_address_breakpoint(delay_pc) {
            self.emit(HostOp::CheckBreakpoint {
                addr: delay_pc,
                resume_pc: pc,
                site: self.site_before(pc),
            });
        }

        let delay = fetch(mem, delay_pc).map(|raw| (raw, decode(raw)));
        let (delay_raw, delay_op) = match delay {
            Ok((raw, d)) if !d.is_control_transfer() => (raw, d),
            _ => {
                // Control transfer in the delay slot, or a slot that cannot
                // be fetched: let the interpreter sequence the pair.
                self.emit(HostOp::InterpretSteps {
                    count: 2,
                    site: self.site_before(pc),
                });
                self.count += 2;
                self.pc = after;
                self.end = after;
                return Ok(true);
            }
        };

        self.cycles += op.cycle_estimate();
        self.count += 1;
        self.pc = after;
        self.end = after;

        match op {
            Op::Branch {
                cond, rs, rt, link, ..
            } => {
                let target = op.static_target(pc).unwrap_or(after);
                let b = if cond.uses_rt() { layout::gpr(rt) } else { layout::ZERO };
                let compare = HostOp::Compare {
                    cond,
                    dst: layout::BRANCH_FLAG,
                    a: layout::gpr(rs),
                    b,
                };
                let reads_rt = cond.uses_rt();
                let early = delay_op.writes_gpr(rs)
                    || (reads_rt && delay_op.writes_gpr(rt))
                    || (link && (rs == RA || (reads_rt && rt == RA)));
                if early {
                    self.emit(compare);
                }
                if link {
                    self.emit(HostOp::LoadImm {
                        dst: layout::gpr(RA),
                        value: after,
                    });
                }
                if self.delay_slot(delay_op, delay_raw, delay_pc) == Flow::End {
                    return Ok(true);
                }
                if !early {
                    self.emit(compare);
                }
                self.exit_sequence();
                let skip = self.emit(HostOp::JumpIf {
                    cond: layout::BRANCH_FLAG,
                    when: false,
                    target: 0,
                });
                self.emit_exit(target)?;
                let not_taken = self.cache.code().len();
                self.cache.code_mut().patch_jump_target(skip, not_taken)?;
                self.emit_exit(after)?;
                Ok(true)
            }

            Op::J { .. } | Op::Jal { .. } => {
                let target = op.static_target(pc).unwrap_or(after);
                let is_call = matches!(op, Op::Jal { .. });

                if is_call {
                    self.emit(HostOp::LoadImm {
                        dst: layout::gpr(RA),
                        value: after,
                    });
                }
                if self.delay_slot(delay_op, delay_raw, delay_pc) == Flow::End {
                    return Ok(true);
                }

                if is_call {
                    if let Some((index, size)) = self.call_replacement(target) {
                        // Run the callee natively and carry on after the call.
                        self.emit(HostOp::CallReplacement {
                            index,
                            site: self.site(pc, false),
                        });
                        self.proxies.push((target, size));
                        return Ok(false);
                    }
                }

                let limit = self.config.instruction_limit(true);
                if !is_call
                    && self.config.continue_jumps
                    && target > pc
                    && self.count < limit
                {
                    // Follow the jump inline; the rest of the block is a
                    // separate guest range owned by this block.
                    match self.main_size {
                        None => self.main_size = Some(after.wrapping_sub(self.start)),
                        Some(_) => self
                            .proxies
                            .push((self.segment_start, after.wrapping_sub(self.segment_start))),
                    }
                    self.segment_start = target;
                    self.continuing = true;
                    self.pc = target;
                    self.end = target;
                    return Ok(false);
                }

                self.exit_sequence();
                self.emit_exit(target)?;
                Ok(true)
            }

            Op::Jr { rs } => {
                let src = if delay_op.writes_gpr(rs) {
                    self.emit(HostOp::Move {
                        dst: layout::JUMP_TARGET,
                        src: layout::gpr(rs),
                    });
                    layout::JUMP_TARGET
                } else {
                    layout::gpr(rs)
                };
                if self.delay_slot(delay_op, delay_raw, delay_pc) == Flow::End {
                    return Ok(true);
                }
                self.exit_sequence();
                self.emit(HostOp::ExitIndirect { src });
                Ok(true)
            }

            Op::Jalr { rd, rs } => {
                let src = if rd == rs || delay_op.writes_gpr(rs) {
                    self.emit(HostOp::Move {
                        dst: layout::JUMP_TARGET,
                        src: layout::gpr(rs),
                    });
                    layout::JUMP_TARGET
                } else {
                    layout::gpr(rs)
                };
                self.emit(HostOp::LoadImm {
                    dst: layout::gpr(rd),
                    value: after,
                });
                if self.delay_slot(delay_op, delay_raw, delay_pc) == Flow::End {
                    return Ok(true);
                }
                self.exit_sequence();
                self.emit(HostOp::ExitIndirect { src });
                Ok(true)
            }

            other => Err(JitError::CorruptBookkeeping(format!(
                "{:?} at {:08x} is not a control transfer",
                other, pc
            ))),
        }
    }

    fn delay_slot(&mut self, op: Op, raw: u32, pc: u32) -> Flow {
        self.cycles += op.cycle_estimate();
        self.count += 1;
        self.translate(op, raw, pc, true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Straight-line instructions
    // ═══════════════════════════════════════════════════════════════════════

    /// Translate one non-control instruction at `pc`. Its cycle estimate
    /// must already be counted.
    fn translate(&mut self, op: Op, raw: u32, pc: u32, in_delay: bool) -> Flow {
        let site = self.site(pc, in_delay);
        let gpr = layout::gpr;

        match op {
            // ═══════════════════════════════════════════════════════════════
            // ALU
            // ═══════════════════════════════════════════════════════════════
            Op::AluImm { op: alu, rt, rs, imm } => {
                let b = Operand::Imm(alu.extend(imm));
                let host = match alu {
                    AluImmOp::Addi => HostOp::AluChecked {
                        sub: false,
                        dst: gpr(rt),
                        a: gpr(rs),
                        b,
                        site,
                    },
                    AluImmOp::Addiu => alu_op(AluOp::Add, rt, rs, b),
                    AluImmOp::Slti => alu_op(AluOp::Slt, rt, rs, b),
                    AluImmOp::Sltiu => alu_op(AluOp::Sltu, rt, rs, b),
                    AluImmOp::Andi => alu_op(AluOp::And, rt, rs, b),
                    AluImmOp::Ori => alu_op(AluOp::Or, rt, rs, b),
                    AluImmOp::Xori => alu_op(AluOp::Xor, rt, rs, b),
                };
                self.emit(host);
            }
            Op::Lui { rt, imm } => {
                self.emit(HostOp::LoadImm {
                    dst: gpr(rt),
                    value: (imm as u32) << 16,
                });
            }
            Op::AluReg { op: alu, rd, rs, rt } => {
                let b = Operand::Slot(gpr(rt));
                let host = match alu {
                    AluRegOp::Add | AluRegOp::Sub => HostOp::AluChecked {
                        sub: alu == AluRegOp::Sub,
                        dst: gpr(rd),
                        a: gpr(rs),
                        b,
                        site,
                    },
                    AluRegOp::Addu => alu_op(AluOp::Add, rd, rs, b),
                    AluRegOp::Subu => alu_op(AluOp::Sub, rd, rs, b),
                    AluRegOp::And => alu_op(AluOp::And, rd, rs, b),
                    AluRegOp::Or => alu_op(AluOp::Or, rd, rs, b),
                    AluRegOp::Xor => alu_op(AluOp::Xor, rd, rs, b),
                    AluRegOp::Nor => alu_op(AluOp::Nor, rd, rs, b),
                    AluRegOp::Slt => alu_op(AluOp::Slt, rd, rs, b),
                    AluRegOp::Sltu => alu_op(AluOp::Sltu, rd, rs, b),
                };
                self.emit(host);
            }
            Op::Shift { op: sh, rd, rt, sa } => {
                self.emit(alu_op(shift_op(sh), rd, rt, Operand::Imm(sa as u32)));
            }
            Op::ShiftVar { op: sh, rd, rt, rs } => {
                self.emit(alu_op(shift_op(sh), rd, rt, Operand::Slot(gpr(rs))));
            }

            // ═══════════════════════════════════════════════════════════════
            // Multiply / divide
            // ═══════════════════════════════════════════════════════════════
            Op::MulDiv { op: md, rs, rt } => {
                self.emit(HostOp::MulDiv {
                    op: md,
                    a: gpr(rs),
                    b: gpr(rt),
                    site,
                });
            }
            Op::Mfhi { rd } => {
                self.emit(HostOp::SyncMulDiv { site });
                self.emit(HostOp::Move {
                    dst: gpr(rd),
                    src: layout::HI,
                });
            }
            Op::Mflo { rd } => {
                self.emit(HostOp::SyncMulDiv { site });
                self.emit(HostOp::Move {
                    dst: gpr(rd),
                    src: layout::LO,
                });
            }
            Op::Mthi { rs } => {
                self.emit(HostOp::Move {
                    dst: layout::HI,
                    src: gpr(rs),
                });
            }
            Op::Mtlo { rs } => {
                self.emit(HostOp::Move {
                    dst: layout::LO,
                    src: gpr(rs),
                });
            }

            // ═══════════════════════════════════════════════════════════════
            // Memory
            // ═══════════════════════════════════════════════════════════════
            Op::Load {
                op: LoadOp::Lwl | LoadOp::Lwr,
                ..
            }
            | Op::Store {
                op: StoreOp::Swl | StoreOp::Swr,
                ..
            } => {
                // Unaligned merges are rare enough to stay in the interpreter.
                self.emit(HostOp::CallInterpreter { raw, site });
            }
            Op::Load {
                op: ld,
                rt,
                base,
                offset,
            } => {
                let (width, signed) = match ld {
                    LoadOp::Lb => (Width::Byte, true),
                    LoadOp::Lbu => (Width::Byte, false),
                    LoadOp::Lh => (Width::Half, true),
                    LoadOp::Lhu => (Width::Half, false),
                    _ => (Width::Word, false),
                };
                self.emit(HostOp::Load {
                    width,
                    signed,
                    dst: gpr(rt),
                    base: gpr(base),
                    offset,
                    site,
                });
            }
            Op::Store {
                op: st,
                rt,
                base,
                offset,
            } => {
                let width = match st {
                    StoreOp::Sb => Width::Byte,
                    StoreOp::Sh => Width::Half,
                    _ => Width::Word,
                };
                self.emit(HostOp::Store {
                    width,
                    src: gpr(rt),
                    base: gpr(base),
                    offset,
                    site,
                });
            }

            // ═══════════════════════════════════════════════════════════════
            // COP0
            // ═══════════════════════════════════════════════════════════════
            Op::Mfc0 { rt, rd } => {
                self.emit(HostOp::Move {
                    dst: gpr(rt),
                    src: layout::cop0(rd),
                });
            }
            Op::Mtc0 { .. } | Op::Rfe => {
                self.emit(HostOp::CallInterpreter { raw, site });
            }

            // ═══════════════════════════════════════════════════════════════
            // COP1
            // ═══════════════════════════════════════════════════════════════
            Op::Mfc1 { rt, fs } => {
                self.emit(HostOp::CheckCop { cop: 1, site });
                self.emit(HostOp::Move {
                    dst: gpr(rt),
                    src: layout::fpr(fs),
                });
            }
            Op::Mtc1 { rt, fs } => {
                self.emit(HostOp::CheckCop { cop: 1, site });
                self.emit(HostOp::Move {
                    dst: layout::fpr(fs),
                    src: gpr(rt),
                });
            }
            Op::Cfc1 { .. } => {
                self.emit(HostOp::CallInterpreter { raw, site });
            }
            Op::Ctc1 { fs, .. } => {
                self.emit(HostOp::CallInterpreter { raw, site });
                if fs == 31 {
                    self.emit(HostOp::UpdateRoundingMode);
                }
            }
            Op::Fpu { op: arith, fd, fs, ft } => {
                self.emit(HostOp::CheckCop { cop: 1, site });
                self.emit(HostOp::Fpu {
                    op: arith,
                    fd: layout::fpr(fd),
                    fs: layout::fpr(fs),
                    ft: layout::fpr(ft),
                });
            }
            Op::CvtWS { fd, fs } => {
                self.emit(HostOp::CheckCop { cop: 1, site });
                self.emit(HostOp::CvtWS {
                    fd: layout::fpr(fd),
                    fs: layout::fpr(fs),
                });
            }
            Op::CvtSW { fd, fs } => {
                self.emit(HostOp::CheckCop { cop: 1, site });
                self.emit(HostOp::CvtSW {
                    fd: layout::fpr(fd),
                    fs: layout::fpr(fs),
                });
            }
            Op::Lwc1 { ft, base, offset } => {
                self.emit(HostOp::CheckCop { cop: 1, site });
                self.emit(HostOp::Load {
                    width: Width::Word,
                    signed: false,
                    dst: layout::fpr(ft),
                    base: gpr(base),
                    offset,
                    site,
                });
            }
            Op::Swc1 { ft, base, offset } => {
                self.emit(HostOp::CheckCop { cop: 1, site });
                self.emit(HostOp::Store {
                    width: Width::Word,
                    src: layout::fpr(ft),
                    base: gpr(base),
                    offset,
                    site,
                });
            }

            // ═══════════════════════════════════════════════════════════════
            // Vector unit
            // ═══════════════════════════════════════════════════════════════
            Op::VPrefix { kind, data } => {
                self.emit(HostOp::CheckCop { cop: 2, site });
                self.prefixes.set(kind, data);
            }
            Op::Vec { op: arith, vd, vs, vt } => {
                self.emit(HostOp::CheckCop { cop: 2, site });
                let prefixes = match self.prefixes.known() {
                    Some(p) => {
                        self.prefixes.eat();
                        PrefixOperand::Known(p)
                    }
                    None => {
                        self.flush_prefixes();
                        self.prefixes.eat_runtime();
                        PrefixOperand::Runtime
                    }
                };
                self.emit(HostOp::Vector {
                    op: arith,
                    vd,
                    vs,
                    vt,
                    prefixes,
                    site,
                });
            }
            Op::Lvs { vt, base, offset } => {
                self.emit(HostOp::CheckCop { cop: 2, site });
                self.emit(HostOp::Load {
                    width: Width::Word,
                    signed: false,
                    dst: layout::vpr(vt),
                    base: gpr(base),
                    offset,
                    site,
                });
            }
            Op::Svs { vt, base, offset } => {
                self.emit(HostOp::CheckCop { cop: 2, site });
                self.emit(HostOp::SyncCop { site });
                self.emit(HostOp::Store {
                    width: Width::Word,
                    src: layout::vpr(vt),
                    base: gpr(base),
                    offset,
                    site,
                });
            }

            // ═══════════════════════════════════════════════════════════════
            // Traps
            // ═══════════════════════════════════════════════════════════════
            Op::Syscall { .. } => {
                self.emit(HostOp::RaiseException {
                    exc: GuestException::new(ExceptionCode::Syscall),
                    site,
                });
                return Flow::End;
            }
            Op::Break { .. } => {
                self.emit(HostOp::RaiseException {
                    exc: GuestException::new(ExceptionCode::Breakpoint),
                    site,
                });
                return Flow::End;
            }

            Op::Unknown(_) => {
                self.fallbacks += 1;
                self.trace.push(TraceEvent::InterpreterFallback { pc, raw });
                log::debug!(
                    "[JIT] No translation for {:08x} at {:08x}{}, using interpreter",
                    raw,
                    pc,
                    if is_vfpu_opcode(raw) { " (vfpu)" } else { "" }
                );
                self.emit(HostOp::CallInterpreter { raw, site });
            }

            Op::Branch { .. } | Op::J { .. } | Op::Jal { .. } | Op::Jr { .. } | Op::Jalr { .. } => {
                // Only reachable for a branch in a delay slot, which the
                // caller routes through the interpreter.
                self.emit(HostOp::CallInterpreter { raw, site });
            }
        }
        Flow::Continue
    }
}

fn alu_op(op: AluOp, dst: u8, a: u8, b: Operand) -> HostOp {
    HostOp::Alu {
        op,
        dst: layout::gpr(dst),
        a: layout::gpr(a),
        b,
    }
}

fn shift_op(op: ShiftOp) -> AluOp {
    match op {
        ShiftOp::Sll => AluOp::Sll,
        ShiftOp::Srl => AluOp::Srl,
        ShiftOp::Sra => AluOp::Sra,
    }
}
