//! Block cache with linking, unlinking and proxy ranges.
//!
//! Owns the code buffer and every compiled block, keyed by guest start PC.
//!
//! ## Features
//!
//! - **Lookup**: guest address to live block through a hash map
//! - **Linking**: exits whose target is compiled jump straight to the
//!   target's checked entry
//! - **Invalidation**: range-based, for self-modifying code. Destroyed blocks
//!   are never freed while code may still jump into them; their checked
//!   entry is rewritten to exit to the dispatcher instead
//! - **Proxies**: ranges translated into another block (continued jumps,
//!   inlined replacements) that must invalidate their root
//! - **Statistics**: hit/miss ratios, links, invalidations, clears
//!
//! ## Block lifecycle
//!
//! ```text
//!   allocate_block ──► (compiler emits code and exits) ──► finalize_block
//!                                                              │
//!             ┌────────────────────────────────────────────────┘
//!             ▼
//!        ┌──────────┐  invalidate_range / destroy   ┌───────────────┐
//!        │   Live   │ ────────────────────────────► │   Invalid     │
//!        │ (linked) │                               │ entry unlinked│
//!        └──────────┘                               └───────────────┘
//!             │ clear
//!             ▼
//!          (gone)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use super::host::{CodeAddr, CodeBuffer, FixedCode, HostOp};
use crate::error::{JitError, JitResult};

/// Index of a block in the cache. Only valid until the next clear.
pub type BlockId = u32;

/// Maximum exits a single block may record.
pub const MAX_BLOCK_EXITS: usize = 2;

const PAGE_SHIFT: u32 = 12;

/// Address used for range bookkeeping. Mirrors in KUSEG/KSEG0/KSEG1 share
/// physical memory and must invalidate each other.
#[inline]
fn phys(addr: u32) -> u32 {
    addr & 0x1FFF_FFFF
}

fn ranges_overlap(a_start: u32, a_len: u32, b_start: u32, b_len: u32) -> bool {
    let a_end = a_start as u64 + a_len as u64;
    let b_end = b_start as u64 + b_len as u64;
    (a_start as u64) < b_end && (b_start as u64) < a_end
}

/// One exit stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExit {
    /// Guest address execution continues at.
    pub target: u32,
    /// The patchable jump op.
    pub ptr: CodeAddr,
    pub linked: bool,
}

/// A compiled block.
#[derive(Debug, Clone)]
pub struct JitBlock {
    pub original_address: u32,
    /// Guest bytes covered by the main range.
    pub original_size: u32,
    pub checked_entry: CodeAddr,
    pub normal_entry: CodeAddr,
    pub code_end: CodeAddr,
    pub exits: Vec<BlockExit>,
    pub instruction_count: u32,
    pub invalid: bool,
    /// SHA-256 of the guest words in the main range at compile time.
    pub content_hash: [u8; 32],
}

impl JitBlock {
    pub fn contains_guest(&self, addr: u32, len: u32) -> bool {
        ranges_overlap(
            phys(self.original_address),
            self.original_size,
            phys(addr),
            len,
        )
    }

    pub fn contains_code(&self, addr: CodeAddr) -> bool {
        addr >= self.checked_entry && addr < self.code_end
    }
}

/// A guest range translated as part of another block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyBlock {
    pub root: BlockId,
    pub start: u32,
    pub size: u32,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Dispatcher lookups that found a live block
    pub hits: u64,
    /// Dispatcher lookups that had to compile
    pub misses: u64,
    /// Blocks finalized
    pub blocks_compiled: u64,
    /// Blocks destroyed by invalidation
    pub invalidations: u64,
    /// Exits patched to jump directly into another block
    pub links: u64,
    /// Exits reverted to the dispatcher
    pub unlinks: u64,
    /// Full cache clears
    pub clears: u64,
    /// Proxy ranges recorded
    pub proxies: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Everything the compiler hands over when a block is complete.
#[derive(Debug, Clone, Copy)]
pub struct BlockFinish {
    pub original_size: u32,
    pub instruction_count: u32,
    pub content_hash: [u8; 32],
    pub link: bool,
}

pub struct BlockCache {
    code: CodeBuffer,
    fixed: FixedCode,
    blocks: Vec<JitBlock>,
    /// Guest start PC to live block.
    start_map: HashMap<u32, BlockId>,
    /// Physical start address to live blocks, for range queries.
    range_index: BTreeMap<u32, Vec<BlockId>>,
    /// Exit target to blocks holding an exit to it.
    links_to: HashMap<u32, Vec<BlockId>>,
    proxies: Vec<ProxyBlock>,
    /// Physical pages holding translated guest code.
    code_pages: HashSet<u32>,
    max_blocks: usize,
    /// Largest main range seen, bounds the backwards range scan.
    max_block_size: u32,
    allocating: Option<BlockId>,
    stats: CacheStats,
}

impl BlockCache {
    /// Reserve the code buffer and emit the fixed trampolines.
    pub fn new(code_capacity: usize, max_blocks: usize) -> JitResult<Self> {
        let mut code = CodeBuffer::new(code_capacity)?;
        let fixed = FixedCode::generate(&mut code);
        Ok(Self {
            code,
            fixed,
            blocks: Vec::new(),
            start_map: HashMap::new(),
            range_index: BTreeMap::new(),
            links_to: HashMap::new(),
            proxies: Vec::new(),
            code_pages: HashSet::new(),
            max_blocks,
            max_block_size: 0,
            allocating: None,
            stats: CacheStats::default(),
        })
    }

    pub fn code(&self) -> &CodeBuffer {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut CodeBuffer {
        &mut self.code
    }

    pub fn fixed(&self) -> &FixedCode {
        &self.fixed
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Allocation
    // ═══════════════════════════════════════════════════════════════════════

    /// Reserve a block for `addr`. Its checked entry is the next op emitted.
    /// A live block already at `addr` is destroyed first.
    pub fn allocate_block(&mut self, addr: u32) -> JitResult<BlockId> {
        if let Some(pending) = self.allocating {
            let pending_addr = self
                .blocks
                .get(pending as usize)
                .map(|b| b.original_address)
                .unwrap_or(addr);
            return Err(JitError::AllocationInFlight(pending_addr));
        }
        if let Some(old) = self.start_map.get(&addr).copied() {
            self.destroy_block(old)?;
        }
        let id = self.blocks.len() as BlockId;
        let entry = self.code.len();
        self.blocks.push(JitBlock {
            original_address: addr,
            original_size: 0,
            checked_entry: entry,
            normal_entry: entry,
            code_end: entry,
            exits: Vec::with_capacity(MAX_BLOCK_EXITS),
            instruction_count: 0,
            invalid: false,
            content_hash: [0; 32],
        });
        self.allocating = Some(id);
        Ok(id)
    }

    /// Throw away a block that failed mid-compile.
    pub fn abort_block(&mut self, id: BlockId) {
        if self.allocating == Some(id) {
            self.allocating = None;
            if let Some(block) = self.blocks.get_mut(id as usize) {
                block.invalid = true;
                let entry = block.checked_entry;
                self.code.truncate(entry);
            }
        }
    }

    pub fn set_normal_entry(&mut self, id: BlockId, entry: CodeAddr) -> JitResult<()> {
        self.block_mut(id)?.normal_entry = entry;
        Ok(())
    }

    /// Record an exit stub of the block under construction.
    pub fn add_exit(&mut self, id: BlockId, exit: BlockExit) -> JitResult<()> {
        let block = self.block_mut(id)?;
        if block.exits.len() >= MAX_BLOCK_EXITS {
            return Err(JitError::TooManyExits {
                addr: block.original_address,
                max: MAX_BLOCK_EXITS,
            });
        }
        block.exits.push(exit);
        self.links_to.entry(exit.target).or_default().push(id);
        if exit.linked {
            self.stats.links += 1;
        }
        Ok(())
    }

    /// Publish the block: index it, link its exits and link every exit
    /// elsewhere that was waiting for this address.
    pub fn finalize_block(&mut self, id: BlockId, finish: BlockFinish) -> JitResult<()> {
        if self.allocating != Some(id) {
            log::error!("[JIT] finalize of block {} which is not being allocated", id);
            return Err(JitError::CorruptBookkeeping(format!(
                "finalize of block {} without allocation",
                id
            )));
        }
        let code_end = self.code.len();
        let block = self.block_mut(id)?;
        block.original_size = finish.original_size.max(4);
        block.instruction_count = finish.instruction_count;
        block.content_hash = finish.content_hash;
        block.code_end = code_end;
        let start = block.original_address;
        let size = block.original_size;

        self.allocating = None;
        self.start_map.insert(start, id);
        self.range_index.entry(phys(start)).or_default().push(id);
        self.max_block_size = self.max_block_size.max(size);
        self.mark_pages(start, size);
        self.stats.blocks_compiled += 1;

        if finish.link {
            self.link_block(id)?;
        }
        Ok(())
    }

    fn link_block(&mut self, id: BlockId) -> JitResult<()> {
        // Own exits, including a loop back to itself.
        let exits = self.block(id).map(|b| b.exits.clone()).unwrap_or_default();
        for (i, exit) in exits.iter().enumerate() {
            if exit.linked {
                continue;
            }
            if let Some(target) = self.lookup(exit.target) {
                let entry = self.block(target).map(|b| b.checked_entry);
                if let Some(entry) = entry {
                    self.code.patch(exit.ptr, HostOp::Jump(entry))?;
                    self.block_mut(id)?.exits[i].linked = true;
                    self.stats.links += 1;
                }
            }
        }

        // Exits elsewhere waiting for this block.
        let (start, entry) = match self.block(id) {
            Some(b) => (b.original_address, b.checked_entry),
            None => return Ok(()),
        };
        let sources = self.links_to.get(&start).cloned().unwrap_or_default();
        for src in sources {
            if src == id {
                continue;
            }
            let patches: Vec<(usize, CodeAddr)> = match self.block(src) {
                Some(b) if !b.invalid => b
                    .exits
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.target == start && !e.linked)
                    .map(|(i, e)| (i, e.ptr))
                    .collect(),
                _ => continue,
            };
            for (i, ptr) in patches {
                self.code.patch(ptr, HostOp::Jump(entry))?;
                self.block_mut(src)?.exits[i].linked = true;
                self.stats.links += 1;
            }
        }
        Ok(())
    }

    /// Record that `[start, start + size)` was translated into `root`.
    pub fn proxy_block(&mut self, root: BlockId, start: u32, size: u32) {
        if size == 0 {
            return;
        }
        self.proxies.push(ProxyBlock { root, start, size });
        self.mark_pages(start, size);
        self.stats.proxies += 1;
    }

    fn mark_pages(&mut self, start: u32, size: u32) {
        let first = phys(start) >> PAGE_SHIFT;
        let last = phys(start).saturating_add(size.saturating_sub(1)) >> PAGE_SHIFT;
        for page in first..=last {
            self.code_pages.insert(page);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookup
    // ═══════════════════════════════════════════════════════════════════════

    /// Live block starting at `addr`.
    #[inline]
    pub fn lookup(&self, addr: u32) -> Option<BlockId> {
        self.start_map.get(&addr).copied()
    }

    /// Lookup that feeds the hit/miss statistics.
    pub fn lookup_counted(&mut self, addr: u32) -> Option<BlockId> {
        let found = self.lookup(addr);
        if found.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        found
    }

    pub fn block(&self, id: BlockId) -> Option<&JitBlock> {
        self.blocks.get(id as usize)
    }

    fn block_mut(&mut self, id: BlockId) -> JitResult<&mut JitBlock> {
        self.blocks
            .get_mut(id as usize)
            .ok_or_else(|| JitError::CorruptBookkeeping(format!("no block {}", id)))
    }

    /// Live block whose code contains `addr`.
    pub fn block_for_code_addr(&self, addr: CodeAddr) -> Option<BlockId> {
        if addr < self.code.fixed_len() || addr >= self.code.len() {
            return None;
        }
        // Blocks are laid out in allocation order.
        let idx = self.blocks.partition_point(|b| b.checked_entry <= addr);
        let candidate = idx.checked_sub(1)?;
        let block = &self.blocks[candidate];
        if !block.invalid && block.contains_code(addr) {
            Some(candidate as BlockId)
        } else {
            None
        }
    }

    /// Whether a write to `[addr, addr + len)` may hit translated code.
    pub fn covers(&self, addr: u32, len: u32) -> bool {
        if len == 0 {
            return false;
        }
        let first = phys(addr) >> PAGE_SHIFT;
        let last = phys(addr).saturating_add(len - 1) >> PAGE_SHIFT;
        (first..=last).any(|p| self.code_pages.contains(&p))
    }

    pub fn live_blocks(&self) -> impl Iterator<Item = (BlockId, &JitBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.invalid && b.code_end > b.checked_entry)
            .map(|(i, b)| (i as BlockId, b))
    }

    pub fn proxies(&self) -> &[ProxyBlock] {
        &self.proxies
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn live_block_count(&self) -> usize {
        self.start_map.len()
    }

    /// Descriptor table exhausted.
    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.max_blocks
    }

    pub fn is_allocating(&self) -> bool {
        self.allocating.is_some()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Invalidation
    // ═══════════════════════════════════════════════════════════════════════

    /// Destroy every block whose translated guest code intersects
    /// `[addr, addr + len)`. Returns the number of blocks destroyed.
    pub fn invalidate_range(&mut self, addr: u32, len: u32) -> JitResult<usize> {
        if !self.covers(addr, len) {
            return Ok(0);
        }
        let start = phys(addr);
        let low = start.saturating_sub(self.max_block_size);
        let high = start.saturating_add(len);

        let mut doomed: Vec<BlockId> = self
            .range_index
            .range(low..high)
            .flat_map(|(_, ids)| ids.iter().copied())
            .filter(|id| {
                self.block(*id)
                    .is_some_and(|b| !b.invalid && b.contains_guest(addr, len))
            })
            .collect();
        doomed.extend(
            self.proxies
                .iter()
                .filter(|p| ranges_overlap(phys(p.start), p.size, start, len))
                .map(|p| p.root),
        );
        doomed.sort_unstable();
        doomed.dedup();

        let mut destroyed = 0;
        for id in doomed {
            if self.block(id).is_some_and(|b| !b.invalid) {
                self.destroy_block(id)?;
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            log::debug!(
                "[JIT] Invalidated {} block(s) for {:08x}+{:x}",
                destroyed,
                addr,
                len
            );
        }
        Ok(destroyed)
    }

    /// Unlink and retire one block. Its code stays in the buffer, but the
    /// checked entry now exits to the dispatcher with the block's start
    /// address and every linked exit into it is reverted.
    pub fn destroy_block(&mut self, id: BlockId) -> JitResult<()> {
        let (start, entry, exits) = {
            let block = self.block_mut(id)?;
            if block.invalid {
                return Ok(());
            }
            block.invalid = true;
            (block.original_address, block.checked_entry, block.exits.clone())
        };

        if self.start_map.get(&start) == Some(&id) {
            self.start_map.remove(&start);
        }
        if let Some(ids) = self.range_index.get_mut(&phys(start)) {
            ids.retain(|b| *b != id);
            if ids.is_empty() {
                self.range_index.remove(&phys(start));
            }
        }
        for exit in &exits {
            if let Some(ids) = self.links_to.get_mut(&exit.target) {
                ids.retain(|b| *b != id);
            }
        }
        self.proxies.retain(|p| p.root != id);

        if self.allocating != Some(id) {
            self.code
                .patch(entry, HostOp::ExitUnlinked { guest_pc: start })?;
        }

        // Revert incoming links.
        let sources = self.links_to.get(&start).cloned().unwrap_or_default();
        for src in sources {
            let patches: Vec<(usize, CodeAddr)> = match self.block(src) {
                Some(b) => b
                    .exits
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.target == start && e.linked)
                    .map(|(i, e)| (i, e.ptr))
                    .collect(),
                None => continue,
            };
            for (i, ptr) in patches {
                self.code
                    .patch(ptr, HostOp::ExitUnlinked { guest_pc: start })?;
                self.block_mut(src)?.exits[i].linked = false;
                self.stats.unlinks += 1;
            }
        }
        self.stats.invalidations += 1;
        Ok(())
    }

    /// Drop every block and all block code. The trampolines survive.
    pub fn clear(&mut self) {
        self.code.reset_to_fixed();
        self.blocks.clear();
        self.start_map.clear();
        self.range_index.clear();
        self.links_to.clear();
        self.proxies.clear();
        self.code_pages.clear();
        self.max_block_size = 0;
        self.allocating = None;
        self.stats.clears += 1;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Statistics
    // ═══════════════════════════════════════════════════════════════════════

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::state::layout;

    fn finish(size: u32) -> BlockFinish {
        BlockFinish {
            original_size: size,
            instruction_count: size / 4,
            content_hash: [0; 32],
            link: true,
        }
    }

    /// Block with a body op and one exit to `target`.
    fn make_block(cache: &mut BlockCache, addr: u32, size: u32, target: u32) -> BlockId {
        let id = cache.allocate_block(addr).unwrap();
        cache.code_mut().emit(HostOp::CheckedEntry { resume_pc: addr });
        let normal = cache.code().len();
        cache.set_normal_entry(id, normal).unwrap();
        cache.code_mut().emit(HostOp::LoadImm { dst: layout::gpr(1), value: 1 });
        cache.code_mut().emit(HostOp::SubDowncount { cycles: size / 4 });
        let ptr = cache.code_mut().emit(HostOp::ExitUnlinked { guest_pc: target });
        cache
            .add_exit(id, BlockExit { target, ptr, linked: false })
            .unwrap();
        cache.finalize_block(id, finish(size)).unwrap();
        id
    }

    #[test]
    fn test_allocate_finalize_lookup() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        let id = make_block(&mut cache, 0x1000, 8, 0x2000);
        assert_eq!(cache.lookup(0x1000), Some(id));
        assert_eq!(cache.lookup(0x1004), None);
        assert!(cache.covers(0x1004, 4));
        assert!(!cache.covers(0x5000, 4));
        assert_eq!(cache.stats().blocks_compiled, 1);
    }

    #[test]
    fn test_second_allocation_in_flight_fails() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        cache.allocate_block(0x1000).unwrap();
        assert!(matches!(
            cache.allocate_block(0x2000),
            Err(JitError::AllocationInFlight(0x1000))
        ));
    }

    #[test]
    fn test_linking_both_directions() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        // a -> b compiled before b exists: unlinked until b is finalized.
        let a = make_block(&mut cache, 0x1000, 8, 0x2000);
        assert!(!cache.block(a).unwrap().exits[0].linked);
        let b = make_block(&mut cache, 0x2000, 8, 0x1000);
        let b_entry = cache.block(b).unwrap().checked_entry;
        let a_entry = cache.block(a).unwrap().checked_entry;

        let a_exit = cache.block(a).unwrap().exits[0];
        assert!(a_exit.linked);
        assert_eq!(cache.code().get(a_exit.ptr), Some(HostOp::Jump(b_entry)));
        let b_exit = cache.block(b).unwrap().exits[0];
        assert!(b_exit.linked);
        assert_eq!(cache.code().get(b_exit.ptr), Some(HostOp::Jump(a_entry)));
    }

    #[test]
    fn test_self_loop_links() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        let id = make_block(&mut cache, 0x1000, 8, 0x1000);
        let block = cache.block(id).unwrap();
        assert!(block.exits[0].linked);
        assert_eq!(
            cache.code().get(block.exits[0].ptr),
            Some(HostOp::Jump(block.checked_entry))
        );
    }

    #[test]
    fn test_invalidate_unlinks_and_redirects_entry() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        let a = make_block(&mut cache, 0x1000, 8, 0x2000);
        let b = make_block(&mut cache, 0x2000, 12, 0x3000);

        let destroyed = cache.invalidate_range(0x2008, 4).unwrap();
        assert_eq!(destroyed, 1);
        assert_eq!(cache.lookup(0x2000), None);

        let b_block = cache.block(b).unwrap();
        assert!(b_block.invalid);
        assert_eq!(
            cache.code().get(b_block.checked_entry),
            Some(HostOp::ExitUnlinked { guest_pc: 0x2000 })
        );
        let a_exit = cache.block(a).unwrap().exits[0];
        assert!(!a_exit.linked);
        assert_eq!(
            cache.code().get(a_exit.ptr),
            Some(HostOp::ExitUnlinked { guest_pc: 0x2000 })
        );
        assert_eq!(cache.stats().unlinks, 1);
    }

    #[test]
    fn test_invalidate_through_mirror() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        make_block(&mut cache, 0x8000_1000, 8, 0x8000_2000);
        assert_eq!(cache.invalidate_range(0xA000_1004, 4).unwrap(), 1);
        assert_eq!(cache.lookup(0x8000_1000), None);
    }

    #[test]
    fn test_invalidate_outside_range_keeps_block() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        make_block(&mut cache, 0x1000, 8, 0x2000);
        assert_eq!(cache.invalidate_range(0x1008, 4).unwrap(), 0);
        assert_eq!(cache.invalidate_range(0x0FFC, 4).unwrap(), 0);
        assert!(cache.lookup(0x1000).is_some());
    }

    #[test]
    fn test_proxy_invalidates_root() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        let id = make_block(&mut cache, 0x1000, 8, 0x2000);
        cache.proxy_block(id, 0x4000, 0x20);
        assert!(cache.covers(0x4010, 4));
        assert_eq!(cache.invalidate_range(0x4010, 4).unwrap(), 1);
        assert_eq!(cache.lookup(0x1000), None);
        assert!(cache.proxies().is_empty());
    }

    #[test]
    fn test_reallocate_same_address_replaces_block() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        let first = make_block(&mut cache, 0x1000, 8, 0x2000);
        let second = make_block(&mut cache, 0x1000, 8, 0x2000);
        assert_ne!(first, second);
        assert!(cache.block(first).unwrap().invalid);
        assert_eq!(cache.lookup(0x1000), Some(second));
        assert_eq!(cache.live_block_count(), 1);
    }

    #[test]
    fn test_block_for_code_addr() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        let a = make_block(&mut cache, 0x1000, 8, 0x2000);
        let b = make_block(&mut cache, 0x2000, 8, 0x3000);
        let a_entry = cache.block(a).unwrap().checked_entry;
        let b_end = cache.block(b).unwrap().code_end;
        assert_eq!(cache.block_for_code_addr(a_entry + 1), Some(a));
        assert_eq!(cache.block_for_code_addr(b_end - 1), Some(b));
        assert_eq!(cache.block_for_code_addr(b_end), None);
        assert_eq!(cache.block_for_code_addr(cache.fixed().dispatcher), None);
        cache.destroy_block(a).unwrap();
        assert_eq!(cache.block_for_code_addr(a_entry + 1), None);
    }

    #[test]
    fn test_clear_and_full() {
        let mut cache = BlockCache::new(256, 2).unwrap();
        make_block(&mut cache, 0x1000, 8, 0x2000);
        make_block(&mut cache, 0x2000, 8, 0x3000);
        assert!(cache.is_full());
        let fixed_len = cache.code().fixed_len();
        cache.clear();
        assert!(!cache.is_full());
        assert_eq!(cache.code().len(), fixed_len);
        assert_eq!(cache.lookup(0x1000), None);
        assert!(!cache.covers(0x1000, 4));
        assert_eq!(cache.stats().clears, 1);
    }

    #[test]
    fn test_too_many_exits() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        let id = cache.allocate_block(0x1000).unwrap();
        for i in 0..MAX_BLOCK_EXITS {
            let ptr = cache.code_mut().emit(HostOp::ExitUnlinked { guest_pc: i as u32 });
            cache
                .add_exit(id, BlockExit { target: i as u32, ptr, linked: false })
                .unwrap();
        }
        let ptr = cache.code_mut().emit(HostOp::ExitUnlinked { guest_pc: 9 });
        assert!(matches!(
            cache.add_exit(id, BlockExit { target: 9, ptr, linked: false }),
            Err(JitError::TooManyExits { .. })
        ));
    }

    #[test]
    fn test_hit_ratio() {
        let mut cache = BlockCache::new(256, 16).unwrap();
        make_block(&mut cache, 0x1000, 8, 0x2000);
        cache.lookup_counted(0x1000);
        cache.lookup_counted(0x1000);
        cache.lookup_counted(0x1000);
        cache.lookup_counted(0x3000);
        assert!((cache.stats().hit_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
