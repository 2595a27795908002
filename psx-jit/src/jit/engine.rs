//! JIT engine facade.
//!
//! [`Jit`] owns everything translation needs: the block cache with its code
//! buffer, the breakpoint and symbol tables, the replacement table, the
//! adaptive flags and the trace ring. Guest state lives in a separate
//! [`CpuContext`] so one engine can drive any machine instance handed to it.
//!
//! ## Adaptive recompilation
//!
//! Two assumptions are made optimistically and withdrawn at most once:
//!
//! | Flag                   | Assumption                 | Withdrawn when                 |
//! |------------------------|----------------------------|--------------------------------|
//! | `last_set_rounding`    | no rounding brackets       | guest selects custom rounding  |
//! | `start_default_prefix` | prefixes default on entry  | a block leaves one unconsumed  |
//!
//! Withdrawing clears the whole cache so no block built on the old
//! assumption survives.

use super::cache::{BlockCache, BlockId, JitBlock};
use super::compiler::{BlockCompiler, CompileOutcome};
use super::disasm::{self, DisasmConfig};
use super::host::CodeAddr;
use super::replacement::{ReplaceFn, ReplacementTable};
use super::snapshot::JitSnapshot;
use super::trace::{RecompileReason, TraceBuffer, TraceEvent};
use super::types::{hash_summary, BlockSummary, JitConfig, JitDiagnostics, JitFlags, JitStats};
use crate::cpu::fpu::FpControl;
use crate::cpu::interpreter;
use crate::cpu::{CoreState, CpuContext};
use crate::debugger::{BreakAction, BreakpointTable, ExpressionError, SymbolMap};
use crate::error::JitResult;
use crate::memory::GuestMemory;

/// The dynamic recompiler.
pub struct Jit {
    pub(crate) config: JitConfig,
    pub(crate) cache: BlockCache,
    pub(crate) breakpoints: BreakpointTable,
    pub(crate) symbols: SymbolMap,
    pub(crate) replacements: ReplacementTable,
    pub(crate) trace: TraceBuffer,
    pub(crate) stats: JitStats,
    pub(crate) flags: JitFlags,
    /// Host floating-point control in effect for compiled FPU ops.
    pub(crate) host_fp: FpControl,
    /// Symbols were handed out for editing since the last compile or run.
    symbols_dirty: bool,
}

impl Jit {
    /// Reserve the code buffer and generate the dispatcher trampolines.
    ///
    /// Failing to reserve the buffer is fatal for the session.
    pub fn new(config: JitConfig) -> JitResult<Self> {
        let cache = BlockCache::new(config.code_capacity, config.max_blocks).inspect_err(|e| {
            log::error!("[JIT] {}", e);
        })?;
        config.validate(cache.code().fixed_len()).inspect_err(|e| {
            log::error!("[JIT] {}", e);
        })?;
        let mut trace = TraceBuffer::new(config.trace_capacity);
        if config.trace_enabled {
            trace.enable();
        }
        log::info!(
            "[JIT] Code buffer: {} host ops, {} blocks max, linking {}",
            config.code_capacity,
            config.max_blocks,
            if config.enable_linking { "on" } else { "off" }
        );
        Ok(Self {
            config,
            cache,
            breakpoints: BreakpointTable::new(),
            symbols: SymbolMap::new(),
            replacements: ReplacementTable::new(),
            trace,
            stats: JitStats::default(),
            flags: JitFlags::default(),
            host_fp: FpControl::default(),
            symbols_dirty: false,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn flags(&self) -> JitFlags {
        self.flags
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Emulator reset: drop all code and forget the adaptive decisions.
    pub fn reset(&mut self, cpu: &CpuContext) {
        self.clear_cache_for("reset");
        self.flags = JitFlags::default();
        self.host_fp = FpControl::default();
        self.breakpoints.clear_skip_first();
        self.breakpoints.drain_changes();
        self.observe_rounding(cpu);
    }

    pub fn clear_cache(&mut self) {
        self.clear_cache_for("requested");
    }

    fn clear_cache_for(&mut self, reason: &'static str) {
        self.cache.clear();
        self.stats.cache_clears += 1;
        self.trace.push(TraceEvent::CacheCleared { reason });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Compilation
    // ═══════════════════════════════════════════════════════════════════════

    /// Compile the block at `addr`, replacing any block already there.
    ///
    /// Runs the adaptive checks: a compile that reveals a wrong assumption
    /// flips the matching flag, clears the cache and compiles again.
    pub fn compile(
        &mut self,
        addr: u32,
        cpu: &CpuContext,
        mem: &mut dyn GuestMemory,
    ) -> JitResult<BlockId> {
        self.observe_rounding(cpu);
        self.apply_symbol_changes();
        loop {
            if self.cache.code().space_left() < self.config.clear_threshold
                || self.cache.is_full()
            {
                log::warn!(
                    "[JIT] Code cache full ({} ops, {} blocks), clearing",
                    self.cache.code().len(),
                    self.cache.block_count()
                );
                self.clear_cache_for("full");
            }

            if self.adapt_rounding(addr) {
                continue;
            }

            let outcome = self.compile_once(addr, mem)?;

            if self.adapt_rounding(addr) {
                continue;
            }
            if outcome.uneaten_prefix && self.flags.start_default_prefix {
                self.adapt_prefix(addr, "left a prefix unconsumed");
                continue;
            }
            return Ok(outcome.id);
        }
    }

    fn compile_once(&mut self, addr: u32, mem: &mut dyn GuestMemory) -> JitResult<CompileOutcome> {
        let outcome = BlockCompiler::new(
            &mut self.cache,
            &self.config,
            self.flags,
            &self.breakpoints,
            &self.symbols,
            &self.replacements,
            &mut self.trace,
        )
        .compile(mem, addr)?;

        self.stats.blocks_compiled += 1;
        self.stats.instructions_compiled += outcome.instructions as u64;
        self.stats.interpreter_fallbacks += outcome.fallbacks as u64;

        if self.config.debug_dump {
            if let Some(block) = self.cache.block(outcome.id) {
                disasm::log_jit_compilation(block, &self.cache, mem, &DisasmConfig::default());
            }
        }
        Ok(outcome)
    }

    /// Switch to bracketed rounding once the guest has used custom
    /// rounding. Returns true when the cache was cleared.
    pub(crate) fn adapt_rounding(&mut self, pc: u32) -> bool {
        if !self.flags.has_set_rounding || self.flags.last_set_rounding {
            return false;
        }
        log::warn!("[JIT] Detected rounding mode usage, rebuilding JIT with checks");
        self.flags.last_set_rounding = true;
        self.recompile_all(pc, RecompileReason::RoundingMode);
        true
    }

    /// Stop assuming default prefixes on block entry.
    pub(crate) fn adapt_prefix(&mut self, pc: u32, why: &str) {
        log::warn!(
            "[JIT] Block at {:08x} {}, rebuilding JIT without default prefix assumption",
            pc,
            why
        );
        self.flags.start_default_prefix = false;
        self.recompile_all(pc, RecompileReason::UneatenPrefix);
    }

    fn recompile_all(&mut self, pc: u32, reason: RecompileReason) {
        self.stats.adaptive_recompiles += 1;
        self.trace.push(TraceEvent::AdaptiveRecompile { pc, reason });
        self.clear_cache_for(reason.name());
    }

    /// Guest memory in `[start, start + len)` changed outside the CPU.
    /// Returns the number of blocks destroyed.
    pub fn invalidate(&mut self, start: u32, len: u32) -> JitResult<usize> {
        let blocks = self.cache.invalidate_range(start, len)?;
        if blocks > 0 {
            self.trace.push(TraceEvent::Invalidate { start, len, blocks });
        }
        Ok(blocks)
    }

    pub fn lookup(&self, addr: u32) -> Option<BlockId> {
        self.cache.lookup(addr)
    }

    pub fn block(&self, id: BlockId) -> Option<&JitBlock> {
        self.cache.block(id)
    }

    /// Forward breakpoint edits to the code that guards them.
    pub(crate) fn apply_breakpoint_changes(&mut self) -> JitResult<()> {
        for addr in self.breakpoints.drain_changes() {
            self.invalidate(addr, 4)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Debugger
    // ═══════════════════════════════════════════════════════════════════════

    /// Execute exactly one instruction through the interpreter.
    pub fn single_step(
        &mut self,
        cpu: &mut CpuContext,
        mem: &mut dyn GuestMemory,
    ) -> JitResult<()> {
        let pc = cpu.regs.pc();
        let outcome = interpreter::step(cpu, mem);
        if let Some(write) = outcome.write {
            self.note_write(write)?;
        }
        if let Some((exc, vector)) = outcome.exception {
            self.count_exception(pc, exc, vector);
        }
        self.note_fcr31(cpu);
        Ok(())
    }

    /// Continue after a pause. The breakpoint at the paused PC does not fire
    /// again until time has moved on.
    pub fn resume(&mut self, cpu: &CpuContext) {
        self.breakpoints.set_skip_first(cpu.regs.pc(), cpu.now());
        cpu.set_core_state(CoreState::Running);
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    pub fn add_breakpoint(&mut self, addr: u32) {
        self.breakpoints.add(addr);
    }

    pub fn add_temp_breakpoint(&mut self, addr: u32) {
        self.breakpoints.add_temp(addr);
    }

    pub fn remove_breakpoint(&mut self, addr: u32) -> bool {
        self.breakpoints.remove(addr)
    }

    pub fn set_breakpoint_condition(
        &mut self,
        addr: u32,
        condition: Option<&str>,
    ) -> Result<bool, ExpressionError> {
        self.breakpoints.set_condition(addr, condition)
    }

    pub fn set_breakpoint_log_format(&mut self, addr: u32, format: Option<&str>) -> bool {
        self.breakpoints.set_log_format(addr, format)
    }

    pub fn set_breakpoint_action(&mut self, addr: u32, action: BreakAction) -> bool {
        self.breakpoints.set_action(addr, action)
    }

    pub fn set_breakpoint_enabled(&mut self, addr: u32, enabled: bool) -> bool {
        self.breakpoints.set_enabled(addr, enabled)
    }

    pub fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }

    /// Symbol edits change which call sites may use replacements, so the
    /// cache is dropped at the next compile or `run_until`.
    pub fn symbols_mut(&mut self) -> &mut SymbolMap {
        self.symbols_dirty = true;
        &mut self.symbols
    }

    /// Drop code compiled against an older symbol map.
    pub(crate) fn apply_symbol_changes(&mut self) {
        if !std::mem::take(&mut self.symbols_dirty) {
            return;
        }
        if self.cache.block_count() > 0 {
            log::debug!("[JIT] Symbol map changed, clearing cache");
            self.clear_cache_for("symbols");
        }
    }

    /// Register a host replacement for the guest function at `addr`.
    /// Code already compiled keeps calling the guest function until the
    /// cache is cleared.
    pub fn register_replacement(&mut self, addr: u32, name: &str, func: ReplaceFn) -> usize {
        let index = self.replacements.register(addr, name, func);
        log::debug!("[JIT] Replacement #{} {} at {:08x}", index, name, addr);
        index
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Introspection
    // ═══════════════════════════════════════════════════════════════════════

    pub fn describe_code_ptr(&self, addr: CodeAddr) -> String {
        disasm::describe_code_ptr(&self.cache, &self.symbols, addr)
    }

    /// Listing of the live block at `addr`, if any.
    pub fn disassemble_block(
        &self,
        addr: u32,
        mem: &mut dyn GuestMemory,
        config: &DisasmConfig,
    ) -> Option<String> {
        let block = self.cache.block(self.cache.lookup(addr)?)?;
        Some(disasm::disassemble_block(block, &self.cache, mem, config))
    }

    /// Save-state blob: the register file and the adaptive flags.
    pub fn save_state(&self, cpu: &CpuContext) -> JitResult<Vec<u8>> {
        JitSnapshot::capture(&cpu.regs, self.flags).encode()
    }

    /// Restore a blob from [`Jit::save_state`]. All compiled code is dropped.
    pub fn load_state(&mut self, cpu: &mut CpuContext, blob: &[u8]) -> JitResult<()> {
        let snapshot = JitSnapshot::decode(blob)?;
        snapshot.restore(&mut cpu.regs)?;
        self.flags = snapshot.flags;
        self.clear_cache_for("load state");
        self.breakpoints.clear_skip_first();
        self.observe_rounding(cpu);
        Ok(())
    }

    pub fn diagnostics(&self) -> JitDiagnostics {
        let blocks = self
            .cache
            .live_blocks()
            .map(|(_, b)| BlockSummary {
                address: format!("{:08x}", b.original_address),
                size: b.original_size,
                exits: b.exits.len(),
                hash: hash_summary(&b.content_hash),
            })
            .collect();
        JitDiagnostics {
            flags: self.flags,
            stats: self.stats.clone(),
            cache_stats: self.cache.stats().clone(),
            trace_stats: self.trace.stats(),
            live_blocks: self.cache.live_block_count(),
            code_used: self.cache.code().len(),
            code_capacity: self.cache.code().capacity(),
            blocks,
        }
    }

    pub fn trace(&self) -> &TraceBuffer {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut TraceBuffer {
        &mut self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm;
    use crate::cpu::state::cop0;
    use crate::error::JitError;
    use crate::memory::PsxMemory;

    fn setup(program: &[u32]) -> (Jit, CpuContext, PsxMemory) {
        let mut mem = PsxMemory::new();
        mem.load_words(0x1000, program);
        let mut cpu = CpuContext::new();
        cpu.regs.set_pc(0x1000);
        cpu.regs.set_next_pc(0x1004);
        cpu.regs.set_cop0(cop0::SR, cop0::sr_cu(1) | cop0::sr_cu(2));
        let config = JitConfig {
            code_capacity: 1 << 14,
            ..JitConfig::default()
        };
        (Jit::new(config).unwrap(), cpu, mem)
    }

    #[test]
    fn test_compile_and_lookup() {
        let (mut jit, cpu, mut mem) = setup(&[asm::jr(asm::RA), asm::nop()]);
        let id = jit.compile(0x1000, &cpu, &mut mem).unwrap();
        assert_eq!(jit.lookup(0x1000), Some(id));
        assert_eq!(jit.stats().blocks_compiled, 1);
    }

    #[test]
    fn test_uneaten_prefix_flips_flag_once() {
        let (mut jit, cpu, mut mem) = setup(&[asm::vpfxs(0x1B), asm::jr(asm::RA), asm::nop()]);
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        assert!(!jit.flags().start_default_prefix);
        assert_eq!(jit.stats().adaptive_recompiles, 1);
        assert_eq!(jit.stats().blocks_compiled, 2);

        // The stricter assumption holds from then on.
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        assert_eq!(jit.stats().adaptive_recompiles, 1);
    }

    #[test]
    fn test_custom_rounding_rebuilds_with_brackets() {
        let (mut jit, mut cpu, mut mem) = setup(&[asm::jr(asm::RA), asm::nop()]);
        cpu.regs.set_fcr31(1);
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        let flags = jit.flags();
        assert!(flags.has_set_rounding);
        assert!(flags.last_set_rounding);
        assert_eq!(jit.stats().adaptive_recompiles, 1);
    }

    #[test]
    fn test_full_cache_clears_before_compile() {
        let (_, cpu, mut mem) = setup(&[asm::jr(asm::RA), asm::nop()]);
        let config = JitConfig {
            code_capacity: 1 << 14,
            max_blocks: 1,
            ..JitConfig::default()
        };
        let mut jit = Jit::new(config).unwrap();
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        assert_eq!(jit.stats().cache_clears, 1);
        assert!(jit.lookup(0x1000).is_some());
    }

    #[test]
    fn test_breakpoint_change_invalidates_block() {
        let (mut jit, cpu, mut mem) = setup(&[asm::nop(), asm::jr(asm::RA), asm::nop()]);
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        jit.add_breakpoint(0x1004);
        jit.apply_breakpoint_changes().unwrap();
        assert_eq!(jit.lookup(0x1000), None);
    }

    #[test]
    fn test_describe_code_ptr_through_engine() {
        let (mut jit, cpu, mut mem) = setup(&[asm::jr(asm::RA), asm::nop()]);
        jit.symbols_mut().add_label(0x1000, "entry");
        let id = jit.compile(0x1000, &cpu, &mut mem).unwrap();
        let entry = jit.block(id).unwrap().normal_entry;
        assert_eq!(jit.describe_code_ptr(entry), "00001000 (entry)");
        assert_eq!(jit.describe_code_ptr(usize::MAX), "Unknown");
    }

    #[test]
    fn test_new_rejects_code_buffer_too_small() {
        let config = JitConfig {
            code_capacity: 256,
            ..JitConfig::default()
        };
        assert!(matches!(Jit::new(config), Err(JitError::InvalidConfig(_))));
    }

    #[test]
    fn test_symbol_edit_clears_cache_before_next_compile() {
        let (mut jit, cpu, mut mem) = setup(&[asm::jr(asm::RA), asm::nop()]);
        // Nothing compiled yet: no clear.
        jit.symbols_mut().add_function(0x1000, 8, "leaf");
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        assert_eq!(jit.stats().cache_clears, 0);

        jit.symbols_mut().remove(0x1000);
        jit.compile(0x2000, &cpu, &mut mem).unwrap();
        assert_eq!(jit.stats().cache_clears, 1);
        assert_eq!(jit.lookup(0x1000), None);

        // Consumed once.
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        assert_eq!(jit.stats().cache_clears, 1);
    }

    #[test]
    fn test_save_load_state_clears_cache() {
        let (mut jit, mut cpu, mut mem) = setup(&[asm::jr(asm::RA), asm::nop()]);
        cpu.regs.set_gpr(asm::T0, 0xDEAD_BEEF);
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        let blob = jit.save_state(&cpu).unwrap();

        let mut other = CpuContext::new();
        jit.load_state(&mut other, &blob).unwrap();
        assert_eq!(other.regs.gpr(asm::T0), 0xDEAD_BEEF);
        assert_eq!(jit.lookup(0x1000), None);
    }

    #[test]
    fn test_diagnostics_lists_live_blocks() {
        let (mut jit, cpu, mut mem) = setup(&[asm::jr(asm::RA), asm::nop()]);
        jit.compile(0x1000, &cpu, &mut mem).unwrap();
        let diag = jit.diagnostics();
        assert_eq!(diag.live_blocks, 1);
        assert_eq!(diag.blocks[0].address, "00001000");
        assert!(diag.to_json().unwrap().contains("\"blocksCompiled\":1"));
    }
}
