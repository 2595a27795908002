//! Compile-time tracking of the vector prefix registers.
//!
//! Prefix directives are folded into the next vector op when their values
//! are known while compiling. Known values that differ from what the guest
//! registers hold are "dirty" and must be written back before anything that
//! can leave the block or observe guest state.

use crate::cpu::vfpu::{PrefixKind, DEFAULT_PREFIXES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrefixState {
    Unknown,
    Known,
    KnownDirty,
}

const KINDS: [PrefixKind; 3] = [PrefixKind::S, PrefixKind::T, PrefixKind::D];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixTracker {
    values: [u32; 3],
    states: [PrefixState; 3],
}

impl PrefixTracker {
    /// State at block entry: defaults assumed, or nothing known.
    pub fn start(assume_default: bool) -> Self {
        let state = if assume_default {
            PrefixState::Known
        } else {
            PrefixState::Unknown
        };
        Self {
            values: DEFAULT_PREFIXES,
            states: [state; 3],
        }
    }

    /// A prefix directive with a constant payload.
    pub fn set(&mut self, kind: PrefixKind, value: u32) {
        let i = kind.index();
        self.values[i] = value & kind.mask();
        self.states[i] = PrefixState::KnownDirty;
    }

    /// A vector op consumed compile-time prefixes. The guest registers still
    /// hold the old values, so the defaults are dirty.
    pub fn eat(&mut self) {
        self.values = DEFAULT_PREFIXES;
        self.states = [PrefixState::KnownDirty; 3];
    }

    /// A vector op consumed the registers at runtime and reset them.
    pub fn eat_runtime(&mut self) {
        self.values = DEFAULT_PREFIXES;
        self.states = [PrefixState::Known; 3];
    }

    /// Something outside the compiler's view may have changed the prefixes.
    pub fn unknown(&mut self) {
        self.states = [PrefixState::Unknown; 3];
    }

    pub fn has_unknown(&self) -> bool {
        self.states.contains(&PrefixState::Unknown)
    }

    /// True unless all three prefixes are known to hold their defaults.
    pub fn may_have_prefix(&self) -> bool {
        self.has_unknown() || self.values != DEFAULT_PREFIXES
    }

    /// Compile-time prefixes for the next vector op, if all are known.
    pub fn known(&self) -> Option<[u32; 3]> {
        if self.has_unknown() {
            None
        } else {
            Some(self.values)
        }
    }

    /// Dirty prefixes to write back; they become clean.
    pub fn take_dirty(&mut self) -> Vec<(PrefixKind, u32)> {
        let mut out = Vec::new();
        for (i, kind) in KINDS.iter().enumerate() {
            if self.states[i] == PrefixState::KnownDirty {
                out.push((*kind, self.values[i]));
                self.states[i] = PrefixState::Known;
            }
        }
        out
    }

    pub fn describe(&self) -> String {
        KINDS
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let state = match self.states[i] {
                    PrefixState::Unknown => "?".to_string(),
                    PrefixState::Known => format!("{:x}", self.values[i]),
                    PrefixState::KnownDirty => format!("{:x}*", self.values[i]),
                };
                format!("{:?}={}", kind, state)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_start_has_no_prefix() {
        let mut t = PrefixTracker::start(true);
        assert!(!t.may_have_prefix());
        assert!(t.take_dirty().is_empty());
        assert_eq!(t.known(), Some(DEFAULT_PREFIXES));
    }

    #[test]
    fn test_unknown_start() {
        let t = PrefixTracker::start(false);
        assert!(t.may_have_prefix());
        assert_eq!(t.known(), None);
    }

    #[test]
    fn test_set_then_eat() {
        let mut t = PrefixTracker::start(true);
        t.set(PrefixKind::S, 0x1_00E4);
        assert!(t.may_have_prefix());
        assert_eq!(t.known().unwrap()[0], 0x1_00E4);
        t.eat();
        assert!(!t.may_have_prefix());
        // All three defaults must be written back.
        assert_eq!(t.take_dirty().len(), 3);
        assert!(t.take_dirty().is_empty());
    }

    #[test]
    fn test_uneaten_prefix_is_dirty() {
        let mut t = PrefixTracker::start(true);
        t.set(PrefixKind::D, 0xFFFF_FFFF);
        assert_eq!(t.take_dirty(), vec![(PrefixKind::D, 0xFFF)]);
        // Flushing does not make it eaten.
        assert!(t.may_have_prefix());
    }

    #[test]
    fn test_runtime_eat_is_clean() {
        let mut t = PrefixTracker::start(false);
        t.eat_runtime();
        assert!(!t.may_have_prefix());
        assert!(t.take_dirty().is_empty());
    }

    #[test]
    fn test_describe() {
        let mut t = PrefixTracker::start(true);
        t.set(PrefixKind::T, 0x12);
        t.unknown();
        assert_eq!(t.describe(), "S=? T=? D=?");
    }
}
