//! Save-state blob for the CPU side of the JIT.
//!
//! Compiled code is never saved; loading a state drops the cache and the
//! blocks are rebuilt on demand. What survives is the register file, tagged
//! with its layout version, and the adaptive flags so a restored session
//! does not repeat the rebuilds it already went through.

use serde::{Deserialize, Serialize};

use super::types::JitFlags;
use crate::cpu::state::{GuestRegisters, LAYOUT_VERSION, STATE_WORDS};
use crate::error::{JitError, JitResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitSnapshot {
    pub layout_version: u32,
    pub words: Vec<u32>,
    pub flags: JitFlags,
}

impl JitSnapshot {
    pub fn capture(regs: &GuestRegisters, flags: JitFlags) -> Self {
        Self {
            layout_version: LAYOUT_VERSION,
            words: regs.words().to_vec(),
            flags,
        }
    }

    pub fn encode(&self) -> JitResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(blob: &[u8]) -> JitResult<Self> {
        Ok(bincode::deserialize(blob)?)
    }

    /// Copy the saved registers into `regs`.
    ///
    /// A blob from another layout version is rejected rather than
    /// reinterpreted.
    pub fn restore(&self, regs: &mut GuestRegisters) -> JitResult<()> {
        if self.layout_version != LAYOUT_VERSION {
            return Err(JitError::LayoutMismatch {
                expected: LAYOUT_VERSION,
                found: self.layout_version,
            });
        }
        if !regs.load_words(&self.words) {
            return Err(JitError::SnapshotSize {
                expected: STATE_WORDS,
                found: self.words.len(),
            });
        }
        Ok(())
    }
}
