//! Block cache: a direct-mapped hash table in front of a tree ordered by
//! physical address.
//!
//! Blocks are never invalidated eagerly. A write into a code chunk only bumps
//! the page version (see [`super::dirty`]); the next lookup of an affected
//! block compares its stored bytes with memory and either revalidates it or
//! sends it back to be recompiled.

use std::collections::BTreeMap;

use retro86_mmu::{AccessType, MemoryBus, PAGE_OFFSET_MASK};

use crate::config::JitConfig;
use crate::state::SegReg;
use crate::CpuCore;

use super::block::{BlockBuilder, BlockId, BlockKey, BlockState, CodeBlock};
use super::emitter::BlockHandle;
use super::CpuStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compiled: u64,
    /// Blocks whose bytes changed and went back to be recompiled.
    pub invalidated: u64,
    /// Dirty blocks whose bytes turned out unchanged.
    pub revalidated: u64,
    pub flushes: u64,
}

/// What the scheduler should do with the current PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Not cached: mark it and interpret.
    Mark,
    /// Marked or stale: interpret while emitting.
    Compile(BlockId),
    Execute(BlockId, BlockHandle),
}

#[derive(Debug)]
pub struct CodeCache {
    blocks: Vec<Option<CodeBlock>>,
    free: Vec<BlockId>,
    hash: Vec<Option<BlockId>>,
    tree: BTreeMap<BlockKey, BlockId>,
    /// Compiled blocks per physical frame.
    page_refs: BTreeMap<u32, u32>,
    /// Backend handles no longer referenced, waiting to be released.
    retired: Vec<BlockHandle>,
    stats: CacheStats,
}

impl CodeCache {
    pub fn new(config: &JitConfig) -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
            hash: vec![None; config.hash_entries.max(1)],
            tree: BTreeMap::new(),
            page_refs: BTreeMap::new(),
            retired: Vec::new(),
            stats: CacheStats::default(),
        }
    }

    #[inline]
    fn slot(&self, key: &BlockKey) -> usize {
        let h = key.phys ^ (key.phys >> 11) ^ key.status.bits().wrapping_mul(0x9E37_79B9);
        (h as usize) & (self.hash.len() - 1)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn block(&self, id: BlockId) -> Option<&CodeBlock> {
        self.blocks.get(id as usize)?.as_ref()
    }

    /// Blocks starting on physical `frame`.
    pub fn blocks_on_page(&self, frame: u32) -> impl Iterator<Item = BlockId> + '_ {
        self.tree
            .range(BlockKey::page_start(frame)..)
            .take_while(move |(k, _)| k.frame() == frame)
            .map(|(_, &id)| id)
    }

    pub fn find(&mut self, key: &BlockKey) -> Option<BlockId> {
        let slot = self.slot(key);
        if let Some(id) = self.hash[slot] {
            if self.block(id).is_some_and(|b| b.key() == *key) {
                return Some(id);
            }
        }
        let id = *self.tree.get(key)?;
        self.hash[slot] = Some(id);
        Some(id)
    }

    /// Look up the block for `key` and check it is still good to run.
    pub fn probe<B: MemoryBus + ?Sized>(
        &mut self,
        core: &mut CpuCore,
        bus: &mut B,
        key: BlockKey,
    ) -> Probe {
        let Some(id) = self.find(&key) else {
            self.stats.misses += 1;
            return Probe::Mark;
        };
        let Some(block) = self.block(id) else {
            return Probe::Mark;
        };
        let handle = match block.state {
            BlockState::Marked => return Probe::Compile(id),
            BlockState::Compiled(handle) => handle,
        };
        if !self.revalidate(core, bus, id) {
            tracing::trace!(
                pc = format_args!("{:#010x}", key.pc),
                phys = format_args!("{:#010x}", key.phys),
                "block modified, recompiling"
            );
            self.stats.invalidated += 1;
            self.demote(core, id, false);
            return Probe::Compile(id);
        }
        let top = core.state.fpu.top;
        if self.block(id).and_then(|b| b.fpu_top).is_some_and(|t| t != top) {
            self.demote(core, id, true);
            return Probe::Compile(id);
        }
        self.stats.hits += 1;
        Probe::Execute(id, handle)
    }

    fn revalidate<B: MemoryBus + ?Sized>(
        &mut self,
        core: &mut CpuCore,
        bus: &mut B,
        id: BlockId,
    ) -> bool {
        let Some(block) = self.blocks.get_mut(id as usize).and_then(Option::as_mut) else {
            return false;
        };
        let pages = core.code_pages();
        let mut compare = false;
        for span in block.spans_mut() {
            let bits = pages.page(span.frame()).copied().unwrap_or_default();
            if bits.version == span.seen_version {
                continue;
            }
            if bits.dirty & span.mask != 0 || bits.code & span.mask != span.mask {
                compare = true;
            } else {
                span.seen_version = bits.version;
            }
        }
        if compare {
            let same = block
                .byte_addrs()
                .zip(block.bytes.iter())
                .all(|(p, &b)| bus.read_u8(u64::from(p)) == b);
            if !same {
                return false;
            }
            for span in block.spans_mut() {
                span.seen_version = pages.version(span.frame());
            }
            self.stats.revalidated += 1;
        }

        // The second page is found through the page tables, which may have
        // been changed without a CR3 load.
        if let Some(second) = block.second {
            if block.status.contains(CpuStatus::PAGING) {
                let linear = block
                    .cs_base
                    .wrapping_add(block.pc)
                    .wrapping_add(block.first.len);
                let who = core.requester();
                let mapped = core
                    .mmu
                    .translate_probe(bus, linear & !PAGE_OFFSET_MASK, AccessType::Execute, who);
                if mapped != Some(second.paddr & !PAGE_OFFSET_MASK) {
                    return false;
                }
            }
        }
        true
    }

    /// Insert a marked block for `key`.
    pub fn mark(&mut self, key: BlockKey) -> BlockId {
        if let Some(id) = self.find(&key) {
            return id;
        }
        let block = CodeBlock::marked(key);
        let id = match self.free.pop() {
            Some(id) => {
                self.blocks[id as usize] = Some(block);
                id
            }
            None => {
                self.blocks.push(Some(block));
                (self.blocks.len() - 1) as BlockId
            }
        };
        self.tree.insert(key, id);
        let slot = self.slot(&key);
        self.hash[slot] = Some(id);
        id
    }

    /// Register a finished translation for the marked block `id`. Returns
    /// `false`, dropping the block, if its bytes changed while it was being
    /// compiled.
    pub fn install<B: MemoryBus + ?Sized>(
        &mut self,
        core: &mut CpuCore,
        bus: &mut B,
        id: BlockId,
        builder: BlockBuilder,
        handle: BlockHandle,
        fpu_top: Option<u8>,
    ) -> bool {
        let mut block = builder.finish(handle, fpu_top);
        let intact = block
            .byte_addrs()
            .zip(block.bytes.iter())
            .all(|(p, &b)| bus.read_u8(u64::from(p)) == b);
        if !intact || !matches!(self.block(id), Some(b) if b.key() == block.key()) {
            self.retired.push(handle);
            self.discard(core, id);
            return false;
        }
        for span in block.spans_mut() {
            core.register_code(span.paddr, span.len);
            *self.page_refs.entry(span.frame()).or_insert(0) += 1;
            span.seen_version = core.code_pages().version(span.frame());
        }
        tracing::trace!(
            pc = format_args!("{:#010x}", block.pc),
            phys = format_args!("{:#010x}", block.phys),
            phys2 = ?block.phys2(),
            instructions = block.instructions,
            bytes = block.bytes.len(),
            "block compiled"
        );
        self.stats.compiled += 1;
        self.blocks[id as usize] = Some(block);
        true
    }

    fn release_pages(&mut self, core: &mut CpuCore, block: &CodeBlock) {
        for span in block.spans() {
            let frame = span.frame();
            if let Some(refs) = self.page_refs.get_mut(&frame) {
                *refs -= 1;
                if *refs == 0 {
                    self.page_refs.remove(&frame);
                    core.release_code_page(frame);
                }
            }
        }
    }

    /// Send a compiled block back to the marked state.
    fn demote(&mut self, core: &mut CpuCore, id: BlockId, still_valid: bool) {
        let Some(block) = self.blocks.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        if let BlockState::Compiled(handle) = block.state {
            self.retired.push(handle);
            self.release_pages(core, &block);
        }
        let mut marked = CodeBlock::marked(block.key());
        marked.valid = still_valid;
        self.blocks[id as usize] = Some(marked);
    }

    /// Remove block `id` altogether.
    pub fn discard(&mut self, core: &mut CpuCore, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        let key = block.key();
        self.tree.remove(&key);
        let slot = self.slot(&key);
        if self.hash[slot] == Some(id) {
            self.hash[slot] = None;
        }
        if let BlockState::Compiled(handle) = block.state {
            self.retired.push(handle);
            self.release_pages(core, &block);
        }
        self.free.push(id);
    }

    /// Forget everything. The core's page bitmaps are cleared separately by
    /// [`CpuCore::flush_code_cache`].
    pub fn flush(&mut self) {
        for block in self.blocks.drain(..).flatten() {
            if let BlockState::Compiled(handle) = block.state {
                self.retired.push(handle);
            }
        }
        self.free.clear();
        self.hash.iter_mut().for_each(|slot| *slot = None);
        self.tree.clear();
        self.page_refs.clear();
        self.stats.flushes += 1;
    }

    /// Handles the backend can free.
    pub fn take_retired(&mut self) -> Vec<BlockHandle> {
        std::mem::take(&mut self.retired)
    }
}

/// Lookup key for the instruction at CS:EIP once its physical address is
/// known.
pub fn current_key(core: &CpuCore, phys: u32) -> BlockKey {
    BlockKey {
        phys,
        status: CpuStatus::current(&core.state),
        pc: core.state.eip,
        cs_base: core.state.seg(SegReg::Cs).base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::protected_core;

    fn compiled(
        cache: &mut CodeCache,
        core: &mut CpuCore,
        bus: &mut crate::mem::FlatTestBus,
        code: &[u8],
        handle: u32,
    ) -> (BlockKey, BlockId) {
        let phys = core.state.eip;
        bus.load(phys, code);
        let key = current_key(core, phys);
        assert_eq!(cache.probe(core, bus, key), Probe::Mark);
        let id = cache.mark(key);
        assert_eq!(cache.probe(core, bus, key), Probe::Compile(id));
        let mut builder = BlockBuilder::new(key, &JitConfig::default());
        assert!(builder.push(code, phys, phys + code.len() as u32 - 1));
        assert!(cache.install(core, bus, id, builder, BlockHandle(handle), None));
        (key, id)
    }

    #[test]
    fn mark_compile_execute() {
        let (mut core, mut bus) = protected_core("486DX");
        let mut cache = CodeCache::new(&JitConfig::default());
        let (key, id) = compiled(&mut cache, &mut core, &mut bus, &[0x40, 0x40], 7);
        assert_eq!(cache.probe(&mut core, &mut bus, key), Probe::Execute(id, BlockHandle(7)));
        assert!(core.mmu.is_code_frame(0));
        assert_eq!(cache.blocks_on_page(0).collect::<Vec<_>>(), vec![id]);
        assert_eq!(cache.stats().compiled, 1);
    }

    #[test]
    fn modified_bytes_force_recompilation() {
        let (mut core, mut bus) = protected_core("486DX");
        let mut cache = CodeCache::new(&JitConfig::default());
        let (key, id) = compiled(&mut cache, &mut core, &mut bus, &[0x40, 0x40], 1);

        // Same value: revalidated without recompiling.
        core.notify_phys_write(key.phys, 1);
        assert_eq!(cache.probe(&mut core, &mut bus, key), Probe::Execute(id, BlockHandle(1)));
        assert_eq!(cache.stats().revalidated, 1);

        bus.load(key.phys + 1, &[0x48]);
        core.notify_phys_write(key.phys + 1, 1);
        assert_eq!(cache.probe(&mut core, &mut bus, key), Probe::Compile(id));
        assert!(!cache.block(id).unwrap().valid);
        assert_eq!(cache.take_retired(), vec![BlockHandle(1)]);
        // The page is no longer code once its only block is gone.
        assert!(!core.mmu.is_code_frame(0));
    }

    #[test]
    fn status_is_part_of_the_key() {
        let (mut core, mut bus) = protected_core("486DX");
        let mut cache = CodeCache::new(&JitConfig::default());
        let (mut key, _) = compiled(&mut cache, &mut core, &mut bus, &[0x90], 1);
        key.status.remove(CpuStatus::CODE32);
        assert_eq!(cache.probe(&mut core, &mut bus, key), Probe::Mark);
    }

    #[test]
    fn fpu_top_change_recompiles() {
        let (mut core, mut bus) = protected_core("486DX");
        let mut cache = CodeCache::new(&JitConfig::default());
        let phys = core.state.eip;
        let key = current_key(&core, phys);
        let id = cache.mark(key);
        let mut builder = BlockBuilder::new(key, &JitConfig::default());
        assert!(builder.push(&[0xD9, 0xC9], phys, phys + 1));
        bus.load(phys, &[0xD9, 0xC9]);
        assert!(cache.install(&mut core, &mut bus, id, builder, BlockHandle(0), Some(0)));
        assert!(matches!(cache.probe(&mut core, &mut bus, key), Probe::Execute(..)));
        core.state.fpu.top = 7;
        assert_eq!(cache.probe(&mut core, &mut bus, key), Probe::Compile(id));
        assert!(cache.block(id).unwrap().valid);
    }

    #[test]
    fn bytes_changed_during_compile_are_not_installed() {
        let (mut core, mut bus) = protected_core("486DX");
        let mut cache = CodeCache::new(&JitConfig::default());
        let phys = core.state.eip;
        bus.load(phys, &[0x90]);
        let key = current_key(&core, phys);
        let id = cache.mark(key);
        let mut builder = BlockBuilder::new(key, &JitConfig::default());
        assert!(builder.push(&[0x40], phys, phys));
        assert!(!cache.install(&mut core, &mut bus, id, builder, BlockHandle(4), None));
        assert!(cache.is_empty());
        assert_eq!(cache.take_retired(), vec![BlockHandle(4)]);
    }

    #[test]
    fn flush_retires_everything() {
        let (mut core, mut bus) = protected_core("486DX");
        let mut cache = CodeCache::new(&JitConfig::default());
        let (key, _) = compiled(&mut cache, &mut core, &mut bus, &[0x90], 9);
        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.take_retired(), vec![BlockHandle(9)]);
        assert_eq!(cache.probe(&mut core, &mut bus, key), Probe::Mark);
    }
}
