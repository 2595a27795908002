//! Shared machinery for the JIT integration tests.
//!
//! Every test builds a small guest program with `cpu::asm`, then runs it
//! both through the reference interpreter and through the recompiler and
//! compares what the guest can observe.

#![allow(dead_code)]

use psx_jit::cpu::interpreter;
use psx_jit::cpu::state::cop0;
use psx_jit::{CoreState, CpuContext, GuestMemory, Jit, JitConfig, NullScheduler, PsxMemory};

/// Load address of test programs.
pub const BASE: u32 = 0x1000;

/// Far enough that no test reaches it.
pub const FOREVER: u64 = 10_000_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config() -> JitConfig {
    JitConfig {
        code_capacity: 1 << 16,
        trace_enabled: true,
        ..JitConfig::default()
    }
}

/// `config()` with forward jumps followed inline.
pub fn continuing_config() -> JitConfig {
    JitConfig {
        continue_jumps: true,
        ..config()
    }
}

pub struct Machine {
    pub jit: Jit,
    pub cpu: CpuContext,
    pub mem: PsxMemory,
}

impl Machine {
    pub fn new(program: &[u32]) -> Self {
        Self::at(BASE, program, config())
    }

    pub fn at(base: u32, program: &[u32], config: JitConfig) -> Self {
        init_logging();
        let mut mem = PsxMemory::new();
        assert!(mem.load_words(base, program));
        Self {
            jit: Jit::new(config).unwrap(),
            cpu: guest_cpu(base),
            mem,
        }
    }

    /// Run compiled code until PC reaches `stop`, using a breakpoint there.
    pub fn run_to(&mut self, stop: u32) {
        self.jit.add_breakpoint(stop);
        let state = self
            .jit
            .run_until(FOREVER, &mut self.cpu, &mut self.mem, &mut NullScheduler)
            .unwrap();
        assert_eq!(state, CoreState::Stepping, "never reached {:08x}", stop);
        assert_eq!(self.cpu.regs.pc(), stop);
        self.jit.remove_breakpoint(stop);
    }

    pub fn run_for(&mut self, cycles: u64) -> CoreState {
        let target = self.cpu.now() + cycles;
        self.jit
            .run_until(target, &mut self.cpu, &mut self.mem, &mut NullScheduler)
            .unwrap()
    }
}

/// A CPU with the coprocessors enabled and PC at `base`.
pub fn guest_cpu(base: u32) -> CpuContext {
    let mut cpu = CpuContext::new();
    cpu.regs.set_pc(base);
    cpu.regs.set_next_pc(base.wrapping_add(4));
    cpu.regs.set_cop0(cop0::SR, cop0::sr_cu(1) | cop0::sr_cu(2));
    cpu
}

/// Step the interpreter until PC reaches `stop` outside a delay slot.
pub fn interpret_to(cpu: &mut CpuContext, mem: &mut dyn GuestMemory, stop: u32) -> usize {
    for steps in 0..100_000 {
        if cpu.regs.pc() == stop && !cpu.regs.in_delay_slot() {
            return steps;
        }
        interpreter::step(cpu, mem);
    }
    panic!("interpreter never reached {:08x}", stop);
}

/// Run `program` both ways up to `stop` and require identical guest state
/// and cycle counts. Returns the recompiled machine for further checks.
pub fn assert_equivalent(
    program: &[u32],
    stop: u32,
    setup: impl Fn(&mut CpuContext, &mut PsxMemory),
) -> Machine {
    assert_equivalent_with(config(), program, stop, setup)
}

pub fn assert_equivalent_with(
    config: JitConfig,
    program: &[u32],
    stop: u32,
    setup: impl Fn(&mut CpuContext, &mut PsxMemory),
) -> Machine {
    let mut reference = guest_cpu(BASE);
    let mut reference_mem = PsxMemory::new();
    reference_mem.load_words(BASE, program);
    setup(&mut reference, &mut reference_mem);
    interpret_to(&mut reference, &mut reference_mem, stop);

    let mut m = Machine::at(BASE, program, config);
    setup(&mut m.cpu, &mut m.mem);
    m.run_to(stop);

    if let Some((slot, expected, found)) = reference.regs.first_difference(&m.cpu.regs) {
        panic!(
            "slot {:?} differs: interpreter {:08x}, compiled {:08x}",
            slot, expected, found
        );
    }
    assert_eq!(reference.now(), m.cpu.now(), "cycle count differs");
    m
}
