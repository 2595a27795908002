//! Execution tracing for JIT debugging.
//!
//! A bounded ring of [`TraceEvent`]s recorded by the engine and the
//! dispatcher when tracing is enabled. Nothing is recorded otherwise, so the
//! buffer costs one branch per event site.

use std::collections::VecDeque;

use crate::cpu::exception::ExceptionCode;

/// Why a compiled block was thrown away and rebuilt from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecompileReason {
    RoundingMode,
    UneatenPrefix,
}

impl RecompileReason {
    pub fn name(self) -> &'static str {
        match self {
            RecompileReason::RoundingMode => "rounding mode",
            RecompileReason::UneatenPrefix => "uneaten prefix",
        }
    }
}

/// Trace event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// Block finalized
    BlockCompiled {
        pc: u32,
        size: u32,
        instructions: u32,
        host_ops: usize,
    },
    /// Dispatcher entered a block
    BlockEntered { pc: u32 },
    /// Guest writes made blocks unreachable
    Invalidate { start: u32, len: u32, blocks: usize },
    /// Whole code cache dropped
    CacheCleared { reason: &'static str },
    /// Outer loop started a new time slice
    SliceRecompute { now: u64, next_event: u64, downcount: i32 },
    /// Guest CPU exception delivered
    Exception {
        pc: u32,
        code: ExceptionCode,
        vector: u32,
    },
    /// Address breakpoint paused execution
    BreakpointHit { pc: u32 },
    /// Instruction executed through the interpreter
    InterpreterFallback { pc: u32, raw: u32 },
    /// Cache cleared and block rebuilt with corrected assumptions
    AdaptiveRecompile { pc: u32, reason: RecompileReason },
}

impl TraceEvent {
    /// Guest address the event is about, if any.
    pub fn pc(&self) -> Option<u32> {
        match self {
            TraceEvent::BlockCompiled { pc, .. }
            | TraceEvent::BlockEntered { pc }
            | TraceEvent::Exception { pc, .. }
            | TraceEvent::BreakpointHit { pc }
            | TraceEvent::InterpreterFallback { pc, .. }
            | TraceEvent::AdaptiveRecompile { pc, .. } => Some(*pc),
            TraceEvent::Invalidate { start, .. } => Some(*start),
            TraceEvent::CacheCleared { .. } | TraceEvent::SliceRecompute { .. } => None,
        }
    }
}

/// Trace buffer with ring-buffer semantics.
#[derive(Debug)]
pub struct TraceBuffer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
    enabled: bool,
    /// Sequence number for ordering
    sequence: u64,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            enabled: false,
            sequence: 0,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn push(&mut self, event: TraceEvent) {
        if !self.enabled {
            return;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.sequence += 1;
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.sequence = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total events pushed since the last clear, including evicted ones.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Log the most recent `count` events at debug level.
    pub fn dump_recent(&self, count: usize) {
        let start = self.events.len().saturating_sub(count);
        log::debug!("[JIT] ═══ Recent {} JIT Events ═══", count);
        for (i, event) in self.events.iter().skip(start).enumerate() {
            log::debug!("[JIT] {}", format_event(i, event));
        }
    }

    /// Formatted lines for the most recent `count` events.
    pub fn recent_lines(&self, count: usize) -> Vec<String> {
        let start = self.events.len().saturating_sub(count);
        self.events
            .iter()
            .skip(start)
            .enumerate()
            .map(|(i, e)| format_event(i, e))
            .collect()
    }

    /// Get statistics from trace buffer.
    pub fn stats(&self) -> TraceStats {
        let mut stats = TraceStats::default();
        for event in &self.events {
            match event {
                TraceEvent::BlockCompiled { host_ops, instructions, .. } => {
                    stats.compilations += 1;
                    stats.total_host_ops += *host_ops as u64;
                    stats.total_instructions += *instructions as u64;
                }
                TraceEvent::BlockEntered { .. } => stats.block_entries += 1,
                TraceEvent::Invalidate { .. } => stats.invalidations += 1,
                TraceEvent::CacheCleared { .. } => stats.cache_clears += 1,
                TraceEvent::SliceRecompute { .. } => stats.slices += 1,
                TraceEvent::Exception { .. } => stats.exceptions += 1,
                TraceEvent::BreakpointHit { .. } => stats.breakpoint_hits += 1,
                TraceEvent::InterpreterFallback { .. } => stats.interpreter_fallbacks += 1,
                TraceEvent::AdaptiveRecompile { .. } => stats.adaptive_recompiles += 1,
            }
        }
        stats
    }

    /// Find events matching a predicate.
    pub fn filter<F>(&self, predicate: F) -> Vec<&TraceEvent>
    where
        F: Fn(&TraceEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).collect()
    }

    /// Find all events about a specific guest address.
    pub fn events_for_pc(&self, pc: u32) -> Vec<&TraceEvent> {
        self.filter(|e| e.pc() == Some(pc))
    }
}

/// Format a trace event for display.
fn format_event(index: usize, event: &TraceEvent) -> String {
    match event {
        TraceEvent::BlockCompiled {
            pc,
            size,
            instructions,
            host_ops,
        } => format!(
            "[{:4}] COMPILE {:08x} ({} insns, {} bytes, {} ops)",
            index, pc, instructions, size, host_ops
        ),
        TraceEvent::BlockEntered { pc } => format!("[{:4}] ENTER {:08x}", index, pc),
        TraceEvent::Invalidate { start, len, blocks } => format!(
            "[{:4}] INVALIDATE {:08x}+{:x} ({} blocks)",
            index, start, len, blocks
        ),
        TraceEvent::CacheCleared { reason } => {
            format!("[{:4}] CLEAR_ALL ({})", index, reason)
        }
        TraceEvent::SliceRecompute {
            now,
            next_event,
            downcount,
        } => format!(
            "[{:4}] SLICE now={} next={} downcount={}",
            index, now, next_event, downcount
        ),
        TraceEvent::Exception { pc, code, vector } => format!(
            "[{:4}] EXCEPTION {:08x} {} → {:08x}",
            index,
            pc,
            code.mnemonic(),
            vector
        ),
        TraceEvent::BreakpointHit { pc } => format!("[{:4}] BREAK {:08x}", index, pc),
        TraceEvent::InterpreterFallback { pc, raw } => {
            format!("[{:4}] INTERP {:08x} ({:08x})", index, pc, raw)
        }
        TraceEvent::AdaptiveRecompile { pc, reason } => {
            format!("[{:4}] RECOMPILE {:08x} ({})", index, pc, reason.name())
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    pub compilations: u64,
    pub total_host_ops: u64,
    pub total_instructions: u64,
    pub block_entries: u64,
    pub invalidations: u64,
    pub cache_clears: u64,
    pub slices: u64,
    pub exceptions: u64,
    pub breakpoint_hits: u64,
    pub interpreter_fallbacks: u64,
    pub adaptive_recompiles: u64,
}

impl TraceStats {
    /// Average host ops emitted per guest instruction.
    pub fn ops_per_instruction(&self) -> f64 {
        if self.total_instructions == 0 {
            0.0
        } else {
            self.total_host_ops as f64 / self.total_instructions as f64
        }
    }

    /// Share of traced instructions that went through the interpreter.
    pub fn fallback_ratio(&self) -> f64 {
        if self.total_instructions == 0 {
            0.0
        } else {
            self.interpreter_fallbacks as f64 / self.total_instructions as f64
        }
    }

    /// Format stats as a string for display.
    pub fn format(&self) -> String {
        format!(
            "JIT Trace:\n\
             ├─ Compilations: {} ({:.2} ops/insn)\n\
             ├─ Block entries: {}\n\
             ├─ Invalidations: {} / clears: {}\n\
             ├─ Slices: {}\n\
             ├─ Exceptions: {} / breakpoints: {}\n\
             ├─ Interpreter fallbacks: {}\n\
             └─ Adaptive recompiles: {}",
            self.compilations,
            self.ops_per_instruction(),
            self.block_entries,
            self.invalidations,
            self.cache_clears,
            self.slices,
            self.exceptions,
            self.breakpoint_hits,
            self.interpreter_fallbacks,
            self.adaptive_recompiles,
        )
    }
}
