//! Guest CPU model.
//!
//! [`CpuContext`] is the execution context for one emulated machine: the
//! register file, the timing counter, the run state polled at every block
//! boundary and the gate taken around memory teardown. The dispatcher,
//! the block compiler and the exception bridge all receive it by reference.

pub mod asm;
pub mod decoder;
pub mod exception;
pub mod fpu;
pub mod interpreter;
pub mod state;
pub mod vfpu;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::timing::TimingState;
use state::GuestRegisters;

/// Global run state observed by the dispatcher.
///
/// | State       | Dispatcher behaviour                       |
/// |-------------|--------------------------------------------|
/// | `Running`   | keep executing blocks                      |
/// | `NextFrame` | the slice target was reached, return       |
/// | `Stepping`  | paused by the debugger, return             |
/// | `PowerUp`   | machine not yet started, return            |
/// | `PowerDown` | shutdown requested, return                 |
/// | `Error`     | fatal host condition, return               |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreState {
    Running = 0,
    NextFrame = 1,
    Stepping = 2,
    PowerUp = 3,
    PowerDown = 4,
    Error = 5,
}

impl CoreState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoreState::Running,
            1 => CoreState::NextFrame,
            2 => CoreState::Stepping,
            3 => CoreState::PowerUp,
            4 => CoreState::PowerDown,
            _ => CoreState::Error,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CoreState::Running => "running",
            CoreState::NextFrame => "next-frame",
            CoreState::Stepping => "stepping",
            CoreState::PowerUp => "power-up",
            CoreState::PowerDown => "power-down",
            CoreState::Error => "error",
        }
    }
}

/// Shareable run-state flag. Another thread may flip it at any time; the
/// dispatcher notices at the next block boundary.
#[derive(Debug, Clone)]
pub struct CoreStateHandle(Arc<AtomicU8>);

impl CoreStateHandle {
    pub fn new(state: CoreState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    #[inline]
    pub fn get(&self) -> CoreState {
        CoreState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: CoreState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Shared/exclusive lock around guest memory. The dispatcher holds the
/// shared side while compiled code runs; teardown or remapping takes the
/// exclusive side.
#[derive(Debug, Clone, Default)]
pub struct MemoryGate(Arc<RwLock<()>>);

impl MemoryGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        // A poisoned gate only means another holder panicked; the unit
        // payload carries no state to repair.
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// One emulated CPU instance.
#[derive(Debug, Clone)]
pub struct CpuContext {
    pub regs: GuestRegisters,
    pub timing: TimingState,
    core_state: CoreStateHandle,
    memory_gate: MemoryGate,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuContext {
    pub fn new() -> Self {
        Self {
            regs: GuestRegisters::new(),
            timing: TimingState::new(),
            core_state: CoreStateHandle::new(CoreState::Running),
            memory_gate: MemoryGate::new(),
        }
    }

    /// Power-on reset. Shared handles stay attached.
    pub fn reset(&mut self) {
        self.regs.reset();
        self.timing = TimingState::new();
        self.core_state.set(CoreState::Running);
    }

    /// Current global time in cycles.
    #[inline]
    pub fn now(&self) -> u64 {
        self.timing.now(&self.regs)
    }

    #[inline]
    pub fn core_state(&self) -> CoreState {
        self.core_state.get()
    }

    #[inline]
    pub fn set_core_state(&self, state: CoreState) {
        self.core_state.set(state);
    }

    /// Handle for toggling the run state from another thread.
    pub fn core_state_handle(&self) -> CoreStateHandle {
        self.core_state.clone()
    }

    pub fn memory_gate(&self) -> &MemoryGate {
        &self.memory_gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_state_handle_shared() {
        let cpu = CpuContext::new();
        let handle = cpu.core_state_handle();
        assert_eq!(cpu.core_state(), CoreState::Running);

        let remote = handle.clone();
        std::thread::spawn(move || remote.set(CoreState::PowerDown))
            .join()
            .unwrap();
        assert_eq!(cpu.core_state(), CoreState::PowerDown);
    }

    #[test]
    fn test_memory_gate_exclusive_after_shared() {
        let gate = MemoryGate::new();
        {
            let _a = gate.shared();
            let _b = gate.shared();
        }
        let _w = gate.exclusive();
    }

    #[test]
    fn test_reset_keeps_handle() {
        let mut cpu = CpuContext::new();
        let handle = cpu.core_state_handle();
        cpu.set_core_state(CoreState::Stepping);
        cpu.regs.set_gpr(4, 99);
        cpu.reset();
        assert_eq!(handle.get(), CoreState::Running);
        assert_eq!(cpu.regs.gpr(4), 0);
    }
}
