//! Code blocks and the builder that collects one during the compile pass.

use retro86_mmu::{PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};

use crate::config::JitConfig;

use super::dirty::chunk_mask;
use super::emitter::BlockHandle;
use super::CpuStatus;

pub type BlockId = u32;

/// Cache key. Ordered by physical address first so a page's blocks are one
/// contiguous range of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    pub phys: u32,
    pub status: CpuStatus,
    pub pc: u32,
    pub cs_base: u32,
}

impl BlockKey {
    /// Smallest key on `frame`.
    pub fn page_start(frame: u32) -> Self {
        Self {
            phys: frame << PAGE_SHIFT,
            status: CpuStatus::empty(),
            pc: 0,
            cs_base: 0,
        }
    }

    #[inline]
    pub fn frame(&self) -> u32 {
        self.phys >> PAGE_SHIFT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Seen once; the next visit compiles it.
    Marked,
    Compiled(BlockHandle),
}

/// The part of a block on one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub paddr: u32,
    pub len: u32,
    /// Chunks covered, in the page's dirty bitmap.
    pub mask: u64,
    /// Page version the block was last validated against.
    pub seen_version: u32,
}

impl PageSpan {
    fn new(paddr: u32, len: u32) -> Self {
        Self {
            paddr,
            len,
            mask: 0,
            seen_version: 0,
        }
    }

    #[inline]
    pub fn frame(&self) -> u32 {
        self.paddr >> PAGE_SHIFT
    }

    #[inline]
    fn end(&self) -> u32 {
        self.paddr.wrapping_add(self.len)
    }
}

#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub pc: u32,
    pub cs_base: u32,
    pub phys: u32,
    pub status: CpuStatus,
    pub state: BlockState,
    /// Cleared when the backing bytes changed; the block is recompiled on its
    /// next visit.
    pub valid: bool,
    pub first: PageSpan,
    pub second: Option<PageSpan>,
    /// Guest bytes as translated, first page then second.
    pub bytes: Vec<u8>,
    /// FPU TOP baked into the translation.
    pub fpu_top: Option<u8>,
    pub instructions: u32,
}

impl CodeBlock {
    pub fn marked(key: BlockKey) -> Self {
        Self {
            pc: key.pc,
            cs_base: key.cs_base,
            phys: key.phys,
            status: key.status,
            state: BlockState::Marked,
            valid: true,
            first: PageSpan::new(key.phys, 0),
            second: None,
            bytes: Vec::new(),
            fpu_top: None,
            instructions: 0,
        }
    }

    #[inline]
    pub fn key(&self) -> BlockKey {
        BlockKey {
            phys: self.phys,
            status: self.status,
            pc: self.pc,
            cs_base: self.cs_base,
        }
    }

    #[inline]
    pub fn phys2(&self) -> Option<u32> {
        self.second.map(|s| s.paddr)
    }

    pub fn spans(&self) -> impl Iterator<Item = &PageSpan> {
        std::iter::once(&self.first).chain(self.second.as_ref())
    }

    pub fn spans_mut(&mut self) -> impl Iterator<Item = &mut PageSpan> {
        std::iter::once(&mut self.first).chain(self.second.as_mut())
    }

    /// Physical address of every stored byte, in order.
    pub fn byte_addrs(&self) -> impl Iterator<Item = u32> + '_ {
        self.spans()
            .flat_map(|s| (0..s.len).map(move |i| s.paddr.wrapping_add(i)))
    }
}

/// Accumulates the instructions of a block on the compile pass.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    key: BlockKey,
    first: PageSpan,
    second: Option<PageSpan>,
    bytes: Vec<u8>,
    instructions: u32,
    max_instructions: u32,
    max_bytes: u32,
}

impl BlockBuilder {
    pub fn new(key: BlockKey, config: &JitConfig) -> Self {
        Self {
            key,
            first: PageSpan::new(key.phys, 0),
            second: None,
            bytes: Vec::new(),
            instructions: 0,
            max_instructions: config.max_block_instructions,
            max_bytes: config.max_block_bytes,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions == 0
    }

    #[inline]
    pub fn instructions(&self) -> u32 {
        self.instructions
    }

    /// No further instruction may be added.
    #[inline]
    pub fn full(&self) -> bool {
        self.instructions >= self.max_instructions || self.bytes.len() as u32 >= self.max_bytes
    }

    /// Append an instruction occupying physical `first_phys..=last_phys`.
    /// Returns `false`, leaving the block unchanged, if the instruction does
    /// not follow on from the previous one or would cross into a third page.
    pub fn push(&mut self, bytes: &[u8], first_phys: u32, last_phys: u32) -> bool {
        let len = bytes.len() as u32;
        if len == 0 || self.bytes.len() as u32 + len > self.max_bytes {
            return false;
        }
        let first_frame = first_phys >> PAGE_SHIFT;
        let last_frame = last_phys >> PAGE_SHIFT;
        let home = self.first.frame();
        match self.second {
            Some(ref mut second) => {
                if first_phys != second.end()
                    || last_frame != second.frame()
                    || last_phys.wrapping_sub(first_phys) + 1 != len
                {
                    return false;
                }
                second.len += len;
            }
            None if first_phys == self.first.end() && first_frame == home => {
                if last_frame == home {
                    if last_phys.wrapping_sub(first_phys) + 1 != len {
                        return false;
                    }
                    self.first.len += len;
                } else {
                    // Straddles the page boundary.
                    let head = PAGE_SIZE - (first_phys & PAGE_OFFSET_MASK);
                    if head >= len || (last_phys & PAGE_OFFSET_MASK) + 1 != len - head {
                        return false;
                    }
                    self.first.len += head;
                    self.second = Some(PageSpan::new(last_phys & !PAGE_OFFSET_MASK, len - head));
                }
            }
            None => {
                // Starts exactly on the next page, which may live anywhere
                // physically.
                let page_full = self.first.len != 0 && self.first.end() & PAGE_OFFSET_MASK == 0;
                if !page_full
                    || first_phys & PAGE_OFFSET_MASK != 0
                    || last_frame != first_frame
                    || last_phys.wrapping_sub(first_phys) + 1 != len
                {
                    return false;
                }
                self.second = Some(PageSpan::new(first_phys, len));
            }
        }
        self.bytes.extend_from_slice(bytes);
        self.instructions += 1;
        true
    }

    /// Turn the collected instructions into a compiled block.
    pub fn finish(self, handle: BlockHandle, fpu_top: Option<u8>) -> CodeBlock {
        let mut first = self.first;
        first.mask = chunk_mask(first.paddr, first.len);
        let second = self.second.map(|mut s| {
            s.mask = chunk_mask(s.paddr, s.len);
            s
        });
        CodeBlock {
            pc: self.key.pc,
            cs_base: self.key.cs_base,
            phys: self.key.phys,
            status: self.key.status,
            state: BlockState::Compiled(handle),
            valid: true,
            first,
            second,
            bytes: self.bytes,
            fpu_top,
            instructions: self.instructions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(phys: u32) -> BlockKey {
        BlockKey {
            phys,
            status: CpuStatus::CODE32,
            pc: phys,
            cs_base: 0,
        }
    }

    #[test]
    fn contiguous_instructions_on_one_page() {
        let mut b = BlockBuilder::new(key(0x2000), &JitConfig::default());
        assert!(b.push(&[0x90], 0x2000, 0x2000));
        assert!(b.push(&[0xB8, 1, 0, 0, 0], 0x2001, 0x2005));
        // A gap is not a continuation.
        assert!(!b.push(&[0x90], 0x2007, 0x2007));
        let block = b.finish(BlockHandle(3), None);
        assert_eq!(block.first.len, 6);
        assert_eq!(block.first.mask, 1);
        assert_eq!(block.instructions, 2);
        assert!(block.second.is_none());
        assert_eq!(block.byte_addrs().collect::<Vec<_>>(), (0x2000..0x2006).collect::<Vec<_>>());
    }

    #[test]
    fn straddling_instruction_opens_second_page() {
        let mut b = BlockBuilder::new(key(0x2FFE), &JitConfig::default());
        // Three bytes: two at the end of frame 2, one at the start of frame 9.
        assert!(b.push(&[0x05, 0x01, 0x00], 0x2FFE, 0x9000));
        assert!(b.push(&[0x90], 0x9001, 0x9001));
        let block = b.finish(BlockHandle(0), None);
        assert_eq!(block.first.len, 2);
        assert_eq!(block.first.mask, 1 << 63);
        assert_eq!(block.phys2(), Some(0x9000));
        assert_eq!(block.second.unwrap().len, 2);
        assert_eq!(block.byte_addrs().collect::<Vec<_>>(), vec![0x2FFE, 0x2FFF, 0x9000, 0x9001]);
    }

    #[test]
    fn instruction_at_next_page_start() {
        let mut b = BlockBuilder::new(key(0x2FFF), &JitConfig::default());
        assert!(b.push(&[0x90], 0x2FFF, 0x2FFF));
        assert!(b.push(&[0x40], 0x7000, 0x7000));
        assert!(!b.push(&[0x40], 0x8000, 0x8000));
    }

    #[test]
    fn byte_and_instruction_caps() {
        let config = JitConfig {
            max_block_instructions: 2,
            max_block_bytes: 16,
            ..JitConfig::default()
        };
        let mut b = BlockBuilder::new(key(0x1000), &config);
        assert!(b.push(&[0x90; 10], 0x1000, 0x1009));
        assert!(!b.push(&[0x90; 7], 0x100A, 0x1010));
        assert!(!b.full());
        assert!(b.push(&[0x90], 0x100A, 0x100A));
        assert!(b.full());
    }
}
