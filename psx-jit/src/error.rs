//! Host-level error types.
//!
//! Guest faults (address errors, reserved instructions, ...) are *not* Rust
//! errors: they become guest CPU exceptions (see `cpu::exception`). The
//! types here cover conditions the emulator itself cannot recover from.

use thiserror::Error;

use crate::jit::host::CodeAddr;

/// Fatal JIT conditions. Any of these terminates the emulation session.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("failed to reserve code buffer of {ops} host ops")]
    CodeSpaceAllocation { ops: usize },

    #[error("block allocation already in flight for {0:#010x}")]
    AllocationInFlight(u32),

    #[error("block {addr:#010x} emitted more than {max} exits")]
    TooManyExits { addr: u32, max: usize },

    #[error("corrupt block cache bookkeeping: {0}")]
    CorruptBookkeeping(String),

    #[error("host code address {0} is outside the code buffer")]
    InvalidCodeAddress(CodeAddr),

    #[error("register layout version mismatch: expected {expected}, found {found}")]
    LayoutMismatch { expected: u32, found: u32 },

    #[error("snapshot has {found} register words, expected {expected}")]
    SnapshotSize { expected: usize, found: usize },

    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] bincode::Error),

    #[error("invalid JIT config: {0}")]
    InvalidConfig(String),

    #[error("config parse failed: {0}")]
    Config(#[from] serde_json::Error),
}

pub type JitResult<T> = Result<T, JitError>;
