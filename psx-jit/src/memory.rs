//! Guest memory collaborator.
//!
//! The JIT only needs the narrow [`GuestMemory`] interface: sized reads and
//! writes, a direct-access resolver for fast paths, validity predicates and
//! a hint for timing-sensitive I/O. [`PsxMemory`] is a reference map of a
//! PlayStation-class bus used by tests and embedders without their own bus.

use thiserror::Error;

/// Memory access errors reported by the collaborator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unmapped address {0:#010x}")]
    Unmapped(u32),
    #[error("write to read-only address {0:#010x}")]
    ReadOnly(u32),
}

/// Guest address space as seen by the CPU.
pub trait GuestMemory {
    fn read_u8(&mut self, addr: u32) -> Result<u8, MemoryError>;
    fn read_u16(&mut self, addr: u32) -> Result<u16, MemoryError>;
    fn read_u32(&mut self, addr: u32) -> Result<u32, MemoryError>;

    fn read_u64(&mut self, addr: u32) -> Result<u64, MemoryError> {
        let lo = self.read_u32(addr)? as u64;
        let hi = self.read_u32(addr.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError>;
    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError>;
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError>;

    fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), MemoryError> {
        self.write_u32(addr, value as u32)?;
        self.write_u32(addr.wrapping_add(4), (value >> 32) as u32)
    }

    /// Host bytes backing `addr` onwards, when the address is plain memory.
    fn host_ptr(&mut self, _addr: u32) -> Option<&[u8]> {
        None
    }

    /// Writable host bytes backing `addr` onwards.
    fn host_ptr_mut(&mut self, _addr: u32) -> Option<&mut [u8]> {
        None
    }

    fn is_valid_address(&self, addr: u32) -> bool;

    /// True when `[addr, addr + len)` is entirely mapped.
    fn is_valid_range(&self, addr: u32, len: u32) -> bool {
        len == 0
            || (self.is_valid_address(addr)
                && self.is_valid_address(addr.wrapping_add(len - 1)))
    }

    /// Accesses here observe guest time; callers must flush their cycle
    /// count before touching them.
    fn is_timing_sensitive(&self, _addr: u32) -> bool {
        false
    }

    /// Current global time, delivered right before a timing-sensitive access.
    fn sync_timestamp(&mut self, _now: u64) {}
}

// ═══════════════════════════════════════════════════════════════════════════
// Reference PlayStation-class memory map
// ═══════════════════════════════════════════════════════════════════════════

pub const RAM_SIZE: usize = 2 * 1024 * 1024;
pub const RAM_MIRROR_SPAN: u32 = 0x0080_0000;
pub const SCRATCHPAD_BASE: u32 = 0x1F80_0000;
pub const SCRATCHPAD_SIZE: usize = 1024;
pub const IO_BASE: u32 = 0x1F80_1000;
pub const IO_SIZE: usize = 0x2000;
pub const BIOS_BASE: u32 = 0x1FC0_0000;
pub const BIOS_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Ram(usize),
    Scratchpad(usize),
    Io(usize),
    Bios(usize),
}

/// RAM, scratchpad, I/O registers and boot ROM.
pub struct PsxMemory {
    ram: Vec<u8>,
    scratchpad: Vec<u8>,
    io: Vec<u8>,
    bios: Vec<u8>,
    /// Writes into the boot ROM are honoured only while this is set. The
    /// compiled code never relies on it; it exists for guest software that
    /// patches the ROM image in place.
    bios_writable: bool,
    last_sync: Option<u64>,
    io_accesses: u64,
}

impl Default for PsxMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PsxMemory {
    pub fn new() -> Self {
        Self {
            ram: vec![0; RAM_SIZE],
            scratchpad: vec![0; SCRATCHPAD_SIZE],
            io: vec![0; IO_SIZE],
            bios: vec![0; BIOS_SIZE],
            bios_writable: true,
            last_sync: None,
            io_accesses: 0,
        }
    }

    pub fn with_writable_bios(mut self, writable: bool) -> Self {
        self.bios_writable = writable;
        self
    }

    pub fn bios_writable(&self) -> bool {
        self.bios_writable
    }

    /// Copy a boot ROM image into place.
    pub fn load_bios(&mut self, image: &[u8]) {
        let len = image.len().min(BIOS_SIZE);
        self.bios[..len].copy_from_slice(&image[..len]);
    }

    /// Copy raw bytes to `addr`, bypassing permissions. Returns false when
    /// part of the range is unmapped.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> bool {
        for (i, b) in bytes.iter().enumerate() {
            let a = addr.wrapping_add(i as u32);
            match self.region(a) {
                Some(Region::Ram(off)) => self.ram[off] = *b,
                Some(Region::Scratchpad(off)) => self.scratchpad[off] = *b,
                Some(Region::Io(off)) => self.io[off] = *b,
                Some(Region::Bios(off)) => self.bios[off] = *b,
                None => return false,
            }
        }
        true
    }

    /// Convenience for tests and loaders: store little-endian words.
    pub fn load_words(&mut self, addr: u32, words: &[u32]) -> bool {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.load(addr, &bytes)
    }

    /// Last global time handed to [`GuestMemory::sync_timestamp`].
    pub fn last_sync(&self) -> Option<u64> {
        self.last_sync
    }

    pub fn io_accesses(&self) -> u64 {
        self.io_accesses
    }

    fn region(&self, addr: u32) -> Option<Region> {
        // KSEG2 holds only the cache control register.
        if addr >= 0xC000_0000 {
            return None;
        }
        let phys = addr & 0x1FFF_FFFF;
        let kseg1 = (0xA000_0000..0xC000_0000).contains(&addr);
        if phys < RAM_MIRROR_SPAN {
            return Some(Region::Ram(phys as usize & (RAM_SIZE - 1)));
        }
        if !kseg1 && (SCRATCHPAD_BASE..SCRATCHPAD_BASE + SCRATCHPAD_SIZE as u32).contains(&phys)
        {
            return Some(Region::Scratchpad((phys - SCRATCHPAD_BASE) as usize));
        }
        if (IO_BASE..IO_BASE + IO_SIZE as u32).contains(&phys) {
            return Some(Region::Io((phys - IO_BASE) as usize));
        }
        if (BIOS_BASE..BIOS_BASE + BIOS_SIZE as u32).contains(&phys) {
            return Some(Region::Bios((phys - BIOS_BASE) as usize));
        }
        None
    }

    fn bytes(&mut self, addr: u32, len: usize) -> Result<&[u8], MemoryError> {
        let region = self.region(addr).ok_or(MemoryError::Unmapped(addr))?;
        if let Region::Io(_) = region {
            self.io_accesses += 1;
        }
        let (buf, off) = match region {
            Region::Ram(off) => (&self.ram, off),
            Region::Scratchpad(off) => (&self.scratchpad, off),
            Region::Io(off) => (&self.io, off),
            Region::Bios(off) => (&self.bios, off),
        };
        buf.get(off..off + len).ok_or(MemoryError::Unmapped(addr))
    }

    fn bytes_mut(&mut self, addr: u32, len: usize) -> Result<&mut [u8], MemoryError> {
        let region = self.region(addr).ok_or(MemoryError::Unmapped(addr))?;
        let (buf, off) = match region {
            Region::Ram(off) => (&mut self.ram, off),
            Region::Scratchpad(off) => (&mut self.scratchpad, off),
            Region::Io(off) => {
                self.io_accesses += 1;
                (&mut self.io, off)
            }
            Region::Bios(off) => {
                if !self.bios_writable {
                    return Err(MemoryError::ReadOnly(addr));
                }
                log::debug!("[Memory] boot ROM write at {:#010x}", addr);
                (&mut self.bios, off)
            }
        };
        buf.get_mut(off..off + len).ok_or(MemoryError::Unmapped(addr))
    }
}

impl GuestMemory for PsxMemory {
    fn read_u8(&mut self, addr: u32) -> Result<u8, MemoryError> {
        Ok(self.bytes(addr, 1)?[0])
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, MemoryError> {
        let b = self.bytes(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, MemoryError> {
        let b = self.bytes(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.bytes_mut(addr, 1)?[0] = value;
        Ok(())
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.bytes_mut(addr, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.bytes_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn host_ptr(&mut self, addr: u32) -> Option<&[u8]> {
        match self.region(addr)? {
            Region::Ram(off) => Some(&self.ram[off..]),
            Region::Scratchpad(off) => Some(&self.scratchpad[off..]),
            Region::Bios(off) => Some(&self.bios[off..]),
            Region::Io(_) => None,
        }
    }

    fn host_ptr_mut(&mut self, addr: u32) -> Option<&mut [u8]> {
        match self.region(addr)? {
            Region::Ram(off) => Some(&mut self.ram[off..]),
            Region::Scratchpad(off) => Some(&mut self.scratchpad[off..]),
            Region::Bios(_) | Region::Io(_) => None,
        }
    }

    fn is_valid_address(&self, addr: u32) -> bool {
        self.region(addr).is_some()
    }

    fn is_timing_sensitive(&self, addr: u32) -> bool {
        matches!(self.region(addr), Some(Region::Io(_)))
    }

    fn sync_timestamp(&mut self, now: u64) {
        self.last_sync = Some(now);
    }
}
