pub mod cpu;
pub mod debugger;
pub mod error;
pub mod jit;
pub mod memory;
pub mod timing;

pub use cpu::{CoreState, CoreStateHandle, CpuContext, MemoryGate};
pub use error::{JitError, JitResult};
pub use memory::{GuestMemory, MemoryError, PsxMemory};
pub use timing::{EventScheduler, NullScheduler, PeriodicScheduler, TimingState};

// ═══════════════════════════════════════════════════════════════════════════
// JIT Module Exports
// ═══════════════════════════════════════════════════════════════════════════

/// Dynamic recompiler
pub use jit::{Jit, JitConfig, JitDiagnostics, JitFlags, JitStats};
pub use jit::{DisasmConfig, TraceBuffer, TraceEvent};
