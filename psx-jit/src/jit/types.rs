//! Core types for the JIT compilation engine.

use serde::{Deserialize, Serialize};

use super::cache::CacheStats;
use super::trace::TraceStats;
use crate::error::{JitError, JitResult};

/// JIT configuration.
///
/// Sizes are in host ops; one guest instruction compiles to a handful of
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JitConfig {
    /// Host ops reserved for the code buffer at startup.
    pub code_capacity: usize,

    /// Clear the whole cache before compiling when less space is left.
    pub clear_threshold: usize,

    /// End the block being compiled when less space is left.
    pub block_end_threshold: usize,

    /// Maximum block descriptors before the cache counts as full.
    pub max_blocks: usize,

    /// Maximum guest instructions per block.
    pub max_block_instructions: u32,

    /// Patch exits to jump straight into their target block.
    pub enable_linking: bool,

    /// Follow forward `J` targets inline instead of exiting.
    pub continue_jumps: bool,

    /// Instruction limit for a block that continues through jumps.
    pub continue_max_instructions: u32,

    /// Call host replacements for registered guest functions.
    pub enable_replacements: bool,

    /// Recheck each block's digest on every dispatcher hit.
    ///
    /// Catches writes that bypassed invalidation (DMA straight into RAM, an
    /// embedder poking memory directly). Costs a hash per block entry.
    pub verify_block_hashes: bool,

    /// Events kept by the trace ring buffer.
    pub trace_capacity: usize,

    /// Record trace events.
    pub trace_enabled: bool,

    /// Log a disassembly of each compiled block at trace level.
    pub debug_dump: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            code_capacity: 1 << 20,         // 1M host ops
            clear_threshold: 4096,          // room for one maximal block
            block_end_threshold: 512,       // room for the block epilogue
            max_blocks: 16 * 1024,
            max_block_instructions: 128,
            enable_linking: true,
            continue_jumps: false,
            continue_max_instructions: 300,
            enable_replacements: true,
            verify_block_hashes: false,
            trace_capacity: 1024,
            trace_enabled: false,
            debug_dump: false,
        }
    }
}

impl JitConfig {
    /// Parse a JSON config. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> JitResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults with `PSXJIT_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup. Unparsable values are logged and
    /// ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

        fn num<T: std::str::FromStr>(lookup: Lookup, key: &str, dst: &mut T) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(v) => *dst = v,
                    Err(_) => log::warn!("[JIT] Ignoring {}={:?}: not a valid value", key, raw),
                }
            }
        }
        fn flag(lookup: Lookup, key: &str, dst: &mut bool) {
            if let Some(raw) = lookup(key) {
                match raw.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "on" | "yes" => *dst = true,
                    "0" | "false" | "off" | "no" => *dst = false,
                    _ => log::warn!("[JIT] Ignoring {}={:?}: not a boolean", key, raw),
                }
            }
        }

        let l: Lookup = &lookup;
        num(l, "PSXJIT_CODE_CAPACITY", &mut self.code_capacity);
        num(l, "PSXJIT_CLEAR_THRESHOLD", &mut self.clear_threshold);
        num(l, "PSXJIT_BLOCK_END_THRESHOLD", &mut self.block_end_threshold);
        num(l, "PSXJIT_MAX_BLOCKS", &mut self.max_blocks);
        num(l, "PSXJIT_MAX_BLOCK_INSTRUCTIONS", &mut self.max_block_instructions);
        flag(l, "PSXJIT_LINKING", &mut self.enable_linking);
        flag(l, "PSXJIT_CONTINUE_JUMPS", &mut self.continue_jumps);
        num(l, "PSXJIT_CONTINUE_MAX_INSTRUCTIONS", &mut self.continue_max_instructions);
        flag(l, "PSXJIT_REPLACEMENTS", &mut self.enable_replacements);
        flag(l, "PSXJIT_VERIFY_HASHES", &mut self.verify_block_hashes);
        num(l, "PSXJIT_TRACE_CAPACITY", &mut self.trace_capacity);
        flag(l, "PSXJIT_TRACE", &mut self.trace_enabled);
        flag(l, "PSXJIT_DEBUG_DUMP", &mut self.debug_dump);
        self
    }

    /// Check that a block always fits: after the trampolines there must be
    /// room for a clear threshold, which itself must leave room past the
    /// block end threshold.
    pub fn validate(&self, fixed_len: usize) -> JitResult<()> {
        let invalid = |msg: String| Err(JitError::InvalidConfig(msg));
        if self.max_block_instructions == 0 {
            return invalid("maxBlockInstructions must be at least 1".into());
        }
        if self.clear_threshold <= self.block_end_threshold {
            return invalid(format!(
                "clearThreshold {} must exceed blockEndThreshold {}",
                self.clear_threshold, self.block_end_threshold
            ));
        }
        if self.code_capacity < fixed_len + self.clear_threshold {
            return invalid(format!(
                "codeCapacity {} cannot hold the trampolines ({}) plus clearThreshold {}",
                self.code_capacity, fixed_len, self.clear_threshold
            ));
        }
        if self.max_blocks == 0 {
            return invalid("maxBlocks must be at least 1".into());
        }
        Ok(())
    }

    /// Instruction limit for the block currently being compiled.
    pub fn instruction_limit(&self, continuing: bool) -> u32 {
        if continuing {
            self.continue_max_instructions.max(self.max_block_instructions)
        } else {
            self.max_block_instructions
        }
    }
}

/// One-way adaptive switches.
///
/// Each is flipped at most once per toggle by the compile loop after it
/// caught a block built on a wrong assumption. These are the only JIT state
/// carried in save states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JitFlags {
    /// The guest has configured a non-default rounding mode at some point.
    pub has_set_rounding: bool,
    /// Blocks are compiled with rounding mode brackets.
    pub last_set_rounding: bool,
    /// Blocks assume default vector prefixes on entry.
    pub start_default_prefix: bool,
}

impl Default for JitFlags {
    fn default() -> Self {
        Self {
            has_set_rounding: false,
            last_set_rounding: false,
            start_default_prefix: true,
        }
    }
}

/// Engine-level counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub instructions_compiled: u64,
    pub interpreter_fallbacks: u64,
    pub adaptive_recompiles: u64,
    pub cache_clears: u64,
    pub exceptions: u64,
    pub breakpoint_hits: u64,
    pub slices: u64,
    pub replacements_called: u64,
    pub hash_mismatches: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// JIT Diagnostics
// ═══════════════════════════════════════════════════════════════════════════

/// Summary of one live block for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub address: String,
    pub size: u32,
    pub exits: usize,
    /// Leading bytes of the content digest, hex encoded.
    pub hash: String,
}

/// JIT diagnostic information.
#[derive(Debug, Clone)]
pub struct JitDiagnostics {
    pub flags: JitFlags,
    pub stats: JitStats,
    pub cache_stats: CacheStats,
    pub trace_stats: TraceStats,
    pub live_blocks: usize,
    pub code_used: usize,
    pub code_capacity: usize,
    pub blocks: Vec<BlockSummary>,
}

impl serde::Serialize for JitDiagnostics {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("JitDiagnostics", 8)?;
        state.serialize_field("flags", &self.flags)?;
        state.serialize_field("stats", &self.stats)?;
        state.serialize_field("cacheStats", &self.cache_stats)?;
        state.serialize_field("traceStats", &self.trace_stats)?;
        state.serialize_field("liveBlocks", &self.live_blocks)?;
        state.serialize_field("codeUsed", &self.code_used)?;
        state.serialize_field("codeCapacity", &self.code_capacity)?;
        state.serialize_field("blocks", &self.blocks)?;
        state.end()
    }
}

impl JitDiagnostics {
    pub fn to_json(&self) -> JitResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Short hex form of a block digest.
pub fn hash_summary(hash: &[u8; 32]) -> String {
    hex::encode(&hash[..8])
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_jit_config_defaults() {
        let config = JitConfig::default();
        assert_eq!(config.max_block_instructions, 128);
        assert!(config.enable_linking);
        assert!(!config.continue_jumps);
        assert!(!config.verify_block_hashes);
        assert!(!config.trace_enabled);
        assert!(config.clear_threshold > config.block_end_threshold);
    }

    #[test]
    fn test_config_validation() {
        assert!(JitConfig::default().validate(16).is_ok());

        let tiny = JitConfig {
            code_capacity: 256,
            ..JitConfig::default()
        };
        assert!(matches!(tiny.validate(16), Err(JitError::InvalidConfig(_))));

        let inverted = JitConfig {
            clear_threshold: 64,
            block_end_threshold: 64,
            ..JitConfig::default()
        };
        assert!(inverted.validate(16).is_err());

        let empty = JitConfig {
            max_block_instructions: 0,
            ..JitConfig::default()
        };
        assert!(empty.validate(16).is_err());
    }

    #[test]
    fn test_config_from_json_partial() {
        let config =
            JitConfig::from_json(r#"{"enableLinking": false, "maxBlockInstructions": 16}"#)
                .unwrap();
        assert!(!config.enable_linking);
        assert_eq!(config.max_block_instructions, 16);
        assert_eq!(config.code_capacity, JitConfig::default().code_capacity);
    }

    #[test]
    fn test_config_from_json_error() {
        assert!(JitConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_config_overrides() {
        let env: HashMap<&str, &str> = [
            ("PSXJIT_LINKING", "off"),
            ("PSXJIT_MAX_BLOCKS", "64"),
            ("PSXJIT_TRACE", "1"),
            ("PSXJIT_CODE_CAPACITY", "lots"),
        ]
        .into_iter()
        .collect();
        let config = JitConfig::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert!(!config.enable_linking);
        assert_eq!(config.max_blocks, 64);
        assert!(config.trace_enabled);
        // Garbage leaves the default in place.
        assert_eq!(config.code_capacity, JitConfig::default().code_capacity);
    }

    #[test]
    fn test_instruction_limit() {
        let config = JitConfig::default();
        assert_eq!(config.instruction_limit(false), 128);
        assert_eq!(config.instruction_limit(true), 300);
    }

    #[test]
    fn test_flags_default() {
        let flags = JitFlags::default();
        assert!(!flags.has_set_rounding);
        assert!(!flags.last_set_rounding);
        assert!(flags.start_default_prefix);
    }

    #[test]
    fn test_diagnostics_json() {
        let diag = JitDiagnostics {
            flags: JitFlags::default(),
            stats: JitStats::default(),
            cache_stats: CacheStats::default(),
            trace_stats: TraceStats::default(),
            live_blocks: 1,
            code_used: 10,
            code_capacity: 100,
            blocks: vec![BlockSummary {
                address: "00001000".into(),
                size: 8,
                exits: 1,
                hash: hash_summary(&[0xAB; 32]),
            }],
        };
        let json = diag.to_json().unwrap();
        assert!(json.contains("\"startDefaultPrefix\":true"));
        assert!(json.contains("\"liveBlocks\":1"));
        assert!(json.contains("\"hash\":\"abababababababab\""));
    }
}
