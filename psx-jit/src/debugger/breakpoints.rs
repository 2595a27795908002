//! Address breakpoints.
//!
//! The table is read by the block compiler (to plant guards) and by the
//! executor when a guard fires. Any change to a breakpoint is queued in
//! `changed` so the engine can invalidate the compiled code at that address
//! before execution resumes.

use std::collections::BTreeMap;

use super::expression::{format_log, Expression, ExpressionError};
use crate::cpu::state::GuestRegisters;

/// What a breakpoint does when hit. Actions combine as bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BreakAction(u8);

impl BreakAction {
    pub const IGNORE: BreakAction = BreakAction(0);
    pub const LOG: BreakAction = BreakAction(1);
    pub const PAUSE: BreakAction = BreakAction(2);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        BreakAction(bits & 3)
    }

    pub const fn contains(self, other: BreakAction) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn union(self, other: BreakAction) -> Self {
        BreakAction(self.0 | other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: u32,
    pub enabled: bool,
    /// Removed the first time it fires.
    pub temporary: bool,
    pub condition: Option<Expression>,
    pub log_format: Option<String>,
    pub action: BreakAction,
}

impl Breakpoint {
    fn new(addr: u32, temporary: bool) -> Self {
        Self {
            addr,
            enabled: true,
            temporary,
            condition: None,
            log_format: None,
            action: BreakAction::PAUSE,
        }
    }
}

#[derive(Debug, Default)]
pub struct BreakpointTable {
    breakpoints: BTreeMap<u32, Breakpoint>,
    /// Address and global time at which the next check is skipped once.
    skip_first: Option<(u32, u64)>,
    changed: Vec<u32>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: u32) {
        match self.breakpoints.get_mut(&addr) {
            // Re-adding a temporary one makes it permanent.
            Some(bp) => {
                bp.temporary = false;
                bp.enabled = true;
            }
            None => {
                self.breakpoints.insert(addr, Breakpoint::new(addr, false));
            }
        }
        self.changed.push(addr);
    }

    pub fn add_temp(&mut self, addr: u32) {
        if !self.breakpoints.contains_key(&addr) {
            self.breakpoints.insert(addr, Breakpoint::new(addr, true));
            self.changed.push(addr);
        }
    }

    pub fn remove(&mut self, addr: u32) -> bool {
        let removed = self.breakpoints.remove(&addr).is_some();
        if removed {
            self.changed.push(addr);
        }
        removed
    }

    /// Attach a condition, or clear it with `None`. Returns false when no
    /// breakpoint exists at `addr`.
    pub fn set_condition(
        &mut self,
        addr: u32,
        condition: Option<&str>,
    ) -> Result<bool, ExpressionError> {
        let parsed = condition.map(Expression::parse).transpose()?;
        match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                bp.condition = parsed;
                self.changed.push(addr);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Set the hit log format. A format turns logging on, `None` turns it
    /// off.
    pub fn set_log_format(&mut self, addr: u32, format: Option<&str>) -> bool {
        match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                bp.log_format = format.map(str::to_string);
                bp.action = if format.is_some() {
                    bp.action.union(BreakAction::LOG)
                } else {
                    BreakAction::from_bits(bp.action.bits() & !BreakAction::LOG.bits())
                };
                self.changed.push(addr);
                true
            }
            None => false,
        }
    }

    pub fn set_action(&mut self, addr: u32, action: BreakAction) -> bool {
        match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                bp.action = action;
                self.changed.push(addr);
                true
            }
            None => false,
        }
    }

    pub fn set_enabled(&mut self, addr: u32, enabled: bool) -> bool {
        match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                bp.enabled = enabled;
                self.changed.push(addr);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, addr: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// An enabled breakpoint sits at `addr`.
    pub fn is_address_breakpoint(&self, addr: u32) -> bool {
        self.breakpoints.get(&addr).is_some_and(|bp| bp.enabled)
    }

    /// Any enabled breakpoint in `[start, start + size)`.
    pub fn range_contains_breakpoint(&self, start: u32, size: u32) -> bool {
        if size == 0 {
            return false;
        }
        let end = start as u64 + size as u64;
        self.breakpoints
            .range(start..)
            .take_while(|(a, _)| (**a as u64) < end)
            .any(|(_, bp)| bp.enabled)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Skip-first token
    // ═══════════════════════════════════════════════════════════════════════

    /// The next check at `addr` at global time `now` passes without firing.
    pub fn set_skip_first(&mut self, addr: u32, now: u64) {
        self.skip_first = Some((addr, now));
    }

    pub fn skip_first(&self) -> Option<(u32, u64)> {
        self.skip_first
    }

    /// Whether a check at `addr` at global time `now` is covered by the
    /// skip token. The token holds for every check made at its own time and
    /// is dropped by the first check made later.
    pub fn check_skip_first(&mut self, addr: u32, now: u64) -> bool {
        match self.skip_first {
            Some((at, time)) if time == now => at == addr,
            Some(_) => {
                self.skip_first = None;
                false
            }
            None => false,
        }
    }

    pub fn clear_skip_first(&mut self) {
        self.skip_first = None;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Hit evaluation
    // ═══════════════════════════════════════════════════════════════════════

    /// Evaluate the breakpoint at `addr` against the current registers.
    /// Temporary breakpoints are removed when they fire.
    pub fn exec_breakpoint(&mut self, addr: u32, regs: &GuestRegisters) -> BreakAction {
        let Some(bp) = self.breakpoints.get(&addr) else {
            return BreakAction::IGNORE;
        };
        if !bp.enabled {
            return BreakAction::IGNORE;
        }
        if let Some(cond) = &bp.condition {
            if !cond.is_true(regs) {
                return BreakAction::IGNORE;
            }
        }
        let action = bp.action;
        if action.contains(BreakAction::LOG) {
            let message = match &bp.log_format {
                Some(fmt) => format_log(fmt, regs),
                None => format!("pc={:08x}", regs.pc()),
            };
            log::info!("[JIT] BP {:08x}: {}", addr, message);
        }
        if bp.temporary {
            self.breakpoints.remove(&addr);
            self.changed.push(addr);
        }
        action
    }

    /// Addresses whose breakpoint state changed since the last drain.
    pub fn drain_changes(&mut self) -> Vec<u32> {
        let mut out = std::mem::take(&mut self.changed);
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn clear(&mut self) {
        let addrs: Vec<u32> = self.breakpoints.keys().copied().collect();
        self.breakpoints.clear();
        self.changed.extend(addrs);
        self.skip_first = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let mut t = BreakpointTable::new();
        t.add(0x1000);
        assert!(t.is_address_breakpoint(0x1000));
        assert!(!t.is_address_breakpoint(0x1004));
        assert!(t.remove(0x1000));
        assert!(!t.remove(0x1000));
        assert_eq!(t.drain_changes(), vec![0x1000]);
        assert!(t.drain_changes().is_empty());
    }

    #[test]
    fn test_disabled_is_not_address_breakpoint() {
        let mut t = BreakpointTable::new();
        t.add(0x1000);
        t.set_enabled(0x1000, false);
        assert!(!t.is_address_breakpoint(0x1000));
        assert!(!t.range_contains_breakpoint(0x1000, 4));
        let regs = GuestRegisters::new();
        assert_eq!(t.exec_breakpoint(0x1000, &regs), BreakAction::IGNORE);
    }

    #[test]
    fn test_range_contains() {
        let mut t = BreakpointTable::new();
        t.add(0x1010);
        assert!(t.range_contains_breakpoint(0x1000, 0x14));
        assert!(!t.range_contains_breakpoint(0x1000, 0x10));
        assert!(!t.range_contains_breakpoint(0x1014, 0x100));
        assert!(!t.range_contains_breakpoint(0x1010, 0));
    }

    #[test]
    fn test_temporary_removed_on_hit() {
        let mut t = BreakpointTable::new();
        t.add_temp(0x2000);
        t.drain_changes();
        let regs = GuestRegisters::new();
        assert_eq!(t.exec_breakpoint(0x2000, &regs), BreakAction::PAUSE);
        assert!(t.get(0x2000).is_none());
        assert_eq!(t.drain_changes(), vec![0x2000]);
    }

    #[test]
    fn test_condition() {
        let mut t = BreakpointTable::new();
        t.add(0x1000);
        assert_eq!(t.set_condition(0x1000, Some("a0 == 5")), Ok(true));
        assert_eq!(t.set_condition(0x2000, Some("a0 == 5")), Ok(false));
        assert!(t.set_condition(0x1000, Some("a0 ==")).is_err());

        let mut regs = GuestRegisters::new();
        assert_eq!(t.exec_breakpoint(0x1000, &regs), BreakAction::IGNORE);
        regs.set_gpr(4, 5);
        assert_eq!(t.exec_breakpoint(0x1000, &regs), BreakAction::PAUSE);
    }

    #[test]
    fn test_log_format_action() {
        let mut t = BreakpointTable::new();
        t.add(0x1000);
        assert!(t.set_log_format(0x1000, Some("v0={v0}")));
        let action = t.get(0x1000).unwrap().action;
        assert!(action.contains(BreakAction::LOG));
        assert!(action.contains(BreakAction::PAUSE));

        t.set_action(0x1000, BreakAction::LOG);
        let regs = GuestRegisters::new();
        let hit = t.exec_breakpoint(0x1000, &regs);
        assert!(!hit.contains(BreakAction::PAUSE));

        t.set_log_format(0x1000, None);
        assert_eq!(t.get(0x1000).unwrap().action, BreakAction::IGNORE);
    }

    #[test]
    fn test_skip_first_cleared_once_time_moves() {
        let mut t = BreakpointTable::new();
        t.set_skip_first(0x1000, 50);
        assert!(!t.check_skip_first(0x1004, 50));
        assert!(t.check_skip_first(0x1000, 50));
        // Several guards at the same instant share the token.
        assert!(t.check_skip_first(0x1000, 50));
        assert!(!t.check_skip_first(0x1000, 51));
        assert_eq!(t.skip_first(), None);
        assert!(!t.check_skip_first(0x1000, 50));
    }

    #[test]
    fn test_action_bits() {
        let both = BreakAction::LOG.union(BreakAction::PAUSE);
        assert_eq!(both.bits(), 3);
        assert!(both.contains(BreakAction::LOG));
        assert!(!BreakAction::IGNORE.contains(BreakAction::IGNORE));
        assert_eq!(BreakAction::from_bits(0xFF).bits(), 3);
    }
}
