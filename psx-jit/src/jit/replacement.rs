//! Host replacements for guest functions.
//!
//! A replacement runs natively in place of a whole guest function. The
//! block compiler calls it at `JAL` sites whose callee is registered (when
//! the function's size is known and no breakpoint lies inside it) and at
//! the function's own entry, which then returns through `$ra`.

use std::collections::HashMap;

use crate::cpu::asm::{A0, A1, A2, V0};
use crate::cpu::interpreter::MemWrite;
use crate::cpu::state::GuestRegisters;
use crate::memory::GuestMemory;

/// Result of a replacement call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    /// Guest cycles the call accounts for.
    pub cycles: u32,
    /// Memory the call wrote, forwarded to code invalidation.
    pub write: Option<MemWrite>,
}

pub type ReplaceFn = fn(&mut GuestRegisters, &mut dyn GuestMemory) -> ReplaceOutcome;

#[derive(Debug, Clone)]
pub struct Replacement {
    pub addr: u32,
    pub name: String,
    pub func: ReplaceFn,
}

#[derive(Debug, Default)]
pub struct ReplacementTable {
    entries: Vec<Replacement>,
    by_addr: HashMap<u32, usize>,
}

impl ReplacementTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` for the guest function at `addr`, replacing any
    /// earlier registration. Returns the table index.
    pub fn register(&mut self, addr: u32, name: &str, func: ReplaceFn) -> usize {
        if let Some(&index) = self.by_addr.get(&addr) {
            self.entries[index] = Replacement {
                addr,
                name: name.to_string(),
                func,
            };
            return index;
        }
        let index = self.entries.len();
        self.entries.push(Replacement {
            addr,
            name: name.to_string(),
            func,
        });
        self.by_addr.insert(addr, index);
        index
    }

    pub fn lookup(&self, addr: u32) -> Option<usize> {
        self.by_addr.get(&addr).copied()
    }

    pub fn get(&self, index: usize) -> Option<&Replacement> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Built-in replacements
// ═══════════════════════════════════════════════════════════════════════════

/// `memcpy(a0 = dst, a1 = src, a2 = len) -> v0 = dst`
pub fn memcpy(regs: &mut GuestRegisters, mem: &mut dyn GuestMemory) -> ReplaceOutcome {
    let (dst, src, len) = (regs.gpr(A0), regs.gpr(A1), regs.gpr(A2));
    let mut copied = 0;
    while copied < len {
        let byte = match mem.read_u8(src.wrapping_add(copied)) {
            Ok(b) => b,
            Err(_) => break,
        };
        if mem.write_u8(dst.wrapping_add(copied), byte).is_err() {
            break;
        }
        copied += 1;
    }
    regs.set_gpr(V0, dst);
    ReplaceOutcome {
        cycles: 10 + copied,
        write: (copied > 0).then_some(MemWrite { addr: dst, len: copied }),
    }
}

/// `memset(a0 = dst, a1 = byte, a2 = len) -> v0 = dst`
pub fn memset(regs: &mut GuestRegisters, mem: &mut dyn GuestMemory) -> ReplaceOutcome {
    let (dst, value, len) = (regs.gpr(A0), regs.gpr(A1) as u8, regs.gpr(A2));
    let mut written = 0;
    while written < len {
        if mem.write_u8(dst.wrapping_add(written), value).is_err() {
            break;
        }
        written += 1;
    }
    regs.set_gpr(V0, dst);
    ReplaceOutcome {
        cycles: 10 + written,
        write: (written > 0).then_some(MemWrite { addr: dst, len: written }),
    }
}

/// `strlen(a0 = s) -> v0`
pub fn strlen(regs: &mut GuestRegisters, mem: &mut dyn GuestMemory) -> ReplaceOutcome {
    let s = regs.gpr(A0);
    let mut n = 0u32;
    while let Ok(b) = mem.read_u8(s.wrapping_add(n)) {
        if b == 0 {
            break;
        }
        n += 1;
    }
    regs.set_gpr(V0, n);
    ReplaceOutcome {
        cycles: 10 + n,
        write: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PsxMemory;

    #[test]
    fn test_register_and_lookup() {
        let mut table = ReplacementTable::new();
        let a = table.register(0x1000, "memcpy", memcpy);
        let b = table.register(0x2000, "strlen", strlen);
        assert_ne!(a, b);
        assert_eq!(table.lookup(0x1000), Some(a));
        assert_eq!(table.lookup(0x3000), None);
        // Re-registering keeps the index.
        assert_eq!(table.register(0x1000, "memcpy2", memset), a);
        assert_eq!(table.get(a).unwrap().name, "memcpy2");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_memcpy() {
        let mut mem = PsxMemory::new();
        mem.load(0x3000, b"hello");
        let mut regs = GuestRegisters::new();
        regs.set_gpr(A0, 0x4000);
        regs.set_gpr(A1, 0x3000);
        regs.set_gpr(A2, 5);
        let out = memcpy(&mut regs, &mut mem);
        assert_eq!(out.cycles, 15);
        assert_eq!(out.write, Some(MemWrite { addr: 0x4000, len: 5 }));
        assert_eq!(regs.gpr(V0), 0x4000);
        assert_eq!(mem.read_u8(0x4004), Ok(b'o'));
    }

    #[test]
    fn test_memset_and_strlen() {
        let mut mem = PsxMemory::new();
        let mut regs = GuestRegisters::new();
        regs.set_gpr(A0, 0x5000);
        regs.set_gpr(A1, b'x' as u32);
        regs.set_gpr(A2, 3);
        memset(&mut regs, &mut mem);
        regs.set_gpr(A0, 0x5000);
        let out = strlen(&mut regs, &mut mem);
        assert_eq!(regs.gpr(V0), 3);
        assert_eq!(out.write, None);
    }
}
