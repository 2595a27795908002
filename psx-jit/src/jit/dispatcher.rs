//! Dispatcher run loop.
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   ┌─── outer loop ───┐  advance scheduler, open a slice   │
//!   │  state != Running ├──────────────────────► return     │
//!   └────────┬─────────┘                                    │
//!            ▼                                              │
//!   ┌─── dispatcher ───┐  downcount < 0 ───────────────────┘
//!   └────────┬─────────┘
//!            ▼
//!   ┌ dispatcher no-check ┐  lookup, compile on miss, enter block
//!   └────────┬────────────┘
//!            ▼
//!      compiled block ── exits back to one of the entries above
//! ```
//!
//! Blocks jump straight to each other through linked exits; the executor
//! only comes back here through the fixed trampolines.

use super::cache::BlockId;
use super::compiler::hash_guest_range;
use super::host::DispatchTarget;
use super::trace::TraceEvent;
use super::Jit;
use crate::cpu::fpu::FpControl;
use crate::cpu::{CoreState, CpuContext};
use crate::error::JitResult;
use crate::memory::GuestMemory;
use crate::timing::EventScheduler;

impl Jit {
    /// Run guest code until global time reaches `target` or the core state
    /// leaves `Running`. Returns the state the core stopped in.
    ///
    /// `NextFrame` counts as a request to run another slice and is turned
    /// back into `Running` on entry; every other non-running state returns
    /// immediately.
    pub fn run_until(
        &mut self,
        target: u64,
        cpu: &mut CpuContext,
        mem: &mut dyn GuestMemory,
        scheduler: &mut dyn EventScheduler,
    ) -> JitResult<CoreState> {
        match cpu.core_state() {
            CoreState::Running => {}
            CoreState::NextFrame => cpu.set_core_state(CoreState::Running),
            other => return Ok(other),
        }

        // Held for the whole run: writers of guest memory outside the CPU
        // wait until run_until returns.
        let gate = cpu.memory_gate().clone();
        let _held = gate.shared();

        self.apply_symbol_changes();
        self.apply_breakpoint_changes()?;
        let mut next = DispatchTarget::OuterLoop;

        loop {
            next = match next {
                // ═══════════════════════════════════════════════════════════
                // Outer loop: timing sync
                // ═══════════════════════════════════════════════════════════
                DispatchTarget::OuterLoop => {
                    self.host_fp = FpControl::default();
                    self.observe_rounding(cpu);

                    cpu.timing.update_from_downcount(&mut cpu.regs);
                    let now = cpu.now();
                    let event = scheduler.advance(now).min(target);
                    let downcount = cpu.timing.set_next_event(&mut cpu.regs, event);
                    self.stats.slices += 1;
                    self.trace.push(TraceEvent::SliceRecompute {
                        now,
                        next_event: event,
                        downcount,
                    });

                    if now >= target && cpu.core_state() == CoreState::Running {
                        cpu.set_core_state(CoreState::NextFrame);
                    }
                    if cpu.core_state() != CoreState::Running {
                        break;
                    }
                    DispatchTarget::DispatcherNoCheck
                }

                DispatchTarget::Dispatcher => {
                    if cpu.regs.downcount() < 0 {
                        DispatchTarget::OuterLoop
                    } else {
                        DispatchTarget::DispatcherCheckCoreState
                    }
                }

                DispatchTarget::DispatcherCheckCoreState | DispatchTarget::BreakpointBailout => {
                    if cpu.core_state() != CoreState::Running {
                        break;
                    }
                    DispatchTarget::DispatcherNoCheck
                }

                // ═══════════════════════════════════════════════════════════
                // Block lookup and entry
                // ═══════════════════════════════════════════════════════════
                DispatchTarget::DispatcherNoCheck => {
                    let target = self.enter_block(cpu, mem)?;
                    self.apply_breakpoint_changes()?;
                    target
                }
            };
        }

        self.host_fp = FpControl::default();
        Ok(cpu.core_state())
    }

    /// Find or compile the block at PC and run it.
    fn enter_block(
        &mut self,
        cpu: &mut CpuContext,
        mem: &mut dyn GuestMemory,
    ) -> JitResult<DispatchTarget> {
        // An exception or pause can leave us between a branch and its delay
        // slot. Blocks never start there, so finish the pair in the
        // interpreter.
        if cpu.regs.in_delay_slot() {
            self.single_step(cpu, mem)?;
            return Ok(DispatchTarget::Dispatcher);
        }

        let pc = cpu.regs.pc();
        if self.adapt_rounding(pc) {
            log::debug!("[JIT] Rebuilding from {:08x} with rounding brackets", pc);
        }
        if self.flags.start_default_prefix && !cpu.regs.has_default_prefix() {
            self.adapt_prefix(pc, "entered with live prefixes");
        }

        let mut found = self.cache.lookup_counted(pc);
        if let Some(id) = found {
            if self.config.verify_block_hashes && !self.block_hash_matches(id, mem) {
                log::warn!("[JIT] Block at {:08x} changed behind our back, recompiling", pc);
                self.stats.hash_mismatches += 1;
                self.cache.destroy_block(id)?;
                found = None;
            }
        }

        let id = match found {
            Some(id) => id,
            None => self.compile(pc, cpu, mem)?,
        };
        let entry = match self.cache.block(id) {
            Some(block) => block.normal_entry,
            None => return Ok(DispatchTarget::Dispatcher),
        };

        self.trace.push(TraceEvent::BlockEntered { pc });
        self.execute_from(entry, cpu, mem)
    }

    fn block_hash_matches(&self, id: BlockId, mem: &mut dyn GuestMemory) -> bool {
        self.cache.block(id).is_some_and(|block| {
            hash_guest_range(mem, block.original_address, block.original_size)
                == block.content_hash
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm;
    use crate::cpu::state::cop0;
    use crate::jit::{BlockCache, JitConfig};
    use crate::memory::PsxMemory;
    use crate::timing::NullScheduler;

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

    /// `loop: addiu t0, t0, 1; j loop; nop`
    fn counting_loop() -> Vec<u32> {
        vec![asm::addiu(asm::T0, asm::T0, 1), asm::j(0x1000), asm::nop()]
    }

    #[test]
    fn test_runs_until_target() {
        let (mut jit, mut cpu, mut mem) = setup(&counting_loop());
        let state = jit.run_until(300, &mut cpu, &mut mem, &mut NullScheduler).unwrap();
        assert_eq!(state, CoreState::NextFrame);
        assert!(cpu.now() >= 300);
        assert!(cpu.regs.gpr(asm::T0) >= 100);
        assert_eq!(jit.stats().blocks_compiled, 1);
    }

    #[test]
    fn test_smallest_code_buffer_makes_progress() {
        let fixed_len = BlockCache::new(64, 1).unwrap().code().fixed_len();
        let config = JitConfig {
            code_capacity: fixed_len + 64,
            clear_threshold: 64,
            block_end_threshold: 32,
            ..JitConfig::default()
        };
        let mut jit = Jit::new(config).unwrap();
        let (_, mut cpu, mut mem) = setup(&counting_loop());
        let state = jit.run_until(1_000, &mut cpu, &mut mem, &mut NullScheduler).unwrap();
        assert_eq!(state, CoreState::NextFrame);
        assert!(cpu.regs.gpr(asm::T0) >= 300);
    }

    #[test]
    fn test_next_frame_resumes() {
        let (mut jit, mut cpu, mut mem) = setup(&counting_loop());
        jit.run_until(300, &mut cpu, &mut mem, &mut NullScheduler).unwrap();
        let first = cpu.regs.gpr(asm::T0);
        jit.run_until(600, &mut cpu, &mut mem, &mut NullScheduler).unwrap();
        assert!(cpu.regs.gpr(asm::T0) > first);
        assert_eq!(jit.stats().blocks_compiled, 1);
    }

    #[test]
    fn test_stopped_core_returns_immediately() {
        let (mut jit, mut cpu, mut mem) = setup(&counting_loop());
        cpu.set_core_state(CoreState::PowerDown);
        let state = jit.run_until(300, &mut cpu, &mut mem, &mut NullScheduler).unwrap();
        assert_eq!(state, CoreState::PowerDown);
        assert_eq!(cpu.regs.gpr(asm::T0), 0);
    }

    #[test]
    fn test_breakpoint_pauses() {
        let (mut jit, mut cpu, mut mem) = setup(&counting_loop());
        jit.add_breakpoint(0x1004);
        let state = jit.run_until(300, &mut cpu, &mut mem, &mut NullScheduler).unwrap();
        assert_eq!(state, CoreState::Stepping);
        assert_eq!(cpu.regs.pc(), 0x1004);
        assert_eq!(cpu.regs.gpr(asm::T0), 1);
        assert_eq!(jit.stats().breakpoint_hits, 1);
    }

    #[test]
    fn test_hash_verification_catches_silent_write() {
        let (_, mut cpu, mut mem) = setup(&counting_loop());
        let config = JitConfig {
            code_capacity: 1 << 14,
            verify_block_hashes: true,
            ..JitConfig::default()
        };
        let mut jit = Jit::new(config).unwrap();
        jit.run_until(100, &mut cpu, &mut mem, &mut NullScheduler).unwrap();

        // Bypass invalidation entirely.
        mem.load_words(0x1000, &[asm::addiu(asm::T0, asm::T0, 2)]);
        jit.run_until(200, &mut cpu, &mut mem, &mut NullScheduler).unwrap();
        assert_eq!(jit.stats().hash_mismatches, 1);
        assert_eq!(jit.stats().blocks_compiled, 2);
    }
}
