//! Dynamic recompiler for the guest MIPS core.
//!
//! Guest code is translated one block at a time into [`host::HostOp`]
//! sequences held in a single code buffer, then run by the executor until
//! control returns to the dispatcher.
//!
//! ## Pipeline
//!
//! ```text
//!   guest PC ──► dispatcher ──lookup──► block cache ──hit──► executor
//!                    │                       ▲                   │
//!                    └──miss──► compiler ────┘                   │
//!                    ▲                                           │
//!                    └───────── exit stubs / trampolines ◄───────┘
//! ```
//!
//! - **Compiler:** walks guest instructions from a start PC, emitting host
//!   ops and up to two exits per block. Breakpoint guards, replacements and
//!   vector prefix tracking are resolved at compile time.
//! - **Block cache:** owns the code buffer, maps guest addresses to blocks,
//!   links exits to their targets and unlinks them on invalidation.
//! - **Dispatcher:** outer timing loop, block lookup and compile-on-miss.
//! - **Executor:** interprets host ops against the register file and the
//!   guest memory, delivering guest exceptions and breakpoint pauses.
//!
//! ## Register file
//!
//! Compiled code sees guest state only through the versioned slot layout
//! in [`crate::cpu::state::layout`], so save states and the interpreter
//! share one representation.

pub mod cache;
pub mod compiler;
pub mod disasm;
mod dispatcher;
mod engine;
mod executor;
pub mod host;
pub mod prefix;
pub mod replacement;
pub mod snapshot;
pub mod trace;
pub mod types;

pub use cache::{BlockCache, BlockId, CacheStats, JitBlock};
pub use compiler::CompileOutcome;
pub use disasm::{describe_code_ptr, disassemble_block, format_instruction_short, DisasmConfig};
pub use engine::Jit;
pub use host::{CodeAddr, DispatchTarget, HostOp};
pub use replacement::{ReplaceFn, ReplaceOutcome};
pub use snapshot::JitSnapshot;
pub use trace::{RecompileReason, TraceBuffer, TraceEvent, TraceStats};
pub use types::{BlockSummary, JitConfig, JitDiagnostics, JitFlags, JitStats};
