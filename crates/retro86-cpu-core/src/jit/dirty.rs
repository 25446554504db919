//! Per-physical-page code and dirty bitmaps.
//!
//! Each 4 KB frame that hosts translated code is split into 64 chunks of 64
//! bytes. `code` has a bit per chunk covered by a live block; writes that land
//! on a code chunk set the matching `dirty` bit and bump the page version, which
//! is what blocks compare against when they are next looked up.

use retro86_mmu::{PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};

pub const CHUNK_SHIFT: u32 = 6;
pub const CHUNK_SIZE: u32 = 1 << CHUNK_SHIFT;

/// Frames per second-level table.
const LEAF_FRAMES: usize = 1024;
const LEAF_SHIFT: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageBits {
    pub code: u64,
    pub dirty: u64,
    /// Bumped on every write that hits a code chunk.
    pub version: u32,
}

/// Chunk bits covered by `len` bytes at page offset `offset`, clipped to the
/// end of the page.
#[inline]
pub fn chunk_mask(offset: u32, len: u32) -> u64 {
    let offset = offset & PAGE_OFFSET_MASK;
    if len == 0 {
        return 0;
    }
    let end = (offset + len).min(PAGE_SIZE) - 1;
    let first = offset >> CHUNK_SHIFT;
    let last = end >> CHUNK_SHIFT;
    let span = last - first + 1;
    let ones = if span >= 64 { u64::MAX } else { (1u64 << span) - 1 };
    ones << first
}

/// Arena of [`PageBits`] indexed by physical frame number. Leaves are
/// allocated on first use, so sparse high frames (the BIOS alias at the top of
/// the address space) do not cost a full-size table.
#[derive(Debug, Clone, Default)]
pub struct CodePageMap {
    leaves: Vec<Option<Box<[PageBits; LEAF_FRAMES]>>>,
    code_pages: usize,
    writes: u64,
}

impl CodePageMap {
    #[inline]
    fn split(frame: u32) -> (usize, usize) {
        (
            (frame >> LEAF_SHIFT) as usize,
            (frame as usize) & (LEAF_FRAMES - 1),
        )
    }

    #[inline]
    pub fn page(&self, frame: u32) -> Option<&PageBits> {
        let (hi, lo) = Self::split(frame);
        self.leaves.get(hi)?.as_ref().map(|leaf| &leaf[lo])
    }

    fn page_mut(&mut self, frame: u32) -> Option<&mut PageBits> {
        let (hi, lo) = Self::split(frame);
        self.leaves.get_mut(hi)?.as_mut().map(|leaf| &mut leaf[lo])
    }

    fn page_or_insert(&mut self, frame: u32) -> &mut PageBits {
        let (hi, lo) = Self::split(frame);
        if hi >= self.leaves.len() {
            self.leaves.resize_with(hi + 1, || None);
        }
        let leaf = self.leaves[hi].get_or_insert_with(|| Box::new([PageBits::default(); LEAF_FRAMES]));
        &mut leaf[lo]
    }

    /// Version of `frame`, 0 if it never held code.
    #[inline]
    pub fn version(&self, frame: u32) -> u32 {
        self.page(frame).map_or(0, |p| p.version)
    }

    #[inline]
    pub fn is_code(&self, frame: u32) -> bool {
        self.page(frame).is_some_and(|p| p.code != 0)
    }

    /// Mark `len` bytes at `paddr` (within one page) as translated code.
    /// Returns `true` if the page did not hold code before.
    pub fn add_code(&mut self, paddr: u32, len: u32) -> bool {
        let mask = chunk_mask(paddr, len);
        let page = self.page_or_insert(paddr >> PAGE_SHIFT);
        let fresh = page.code == 0;
        page.code |= mask;
        if fresh {
            self.code_pages += 1;
        }
        fresh
    }

    /// Record a write of `len` bytes at `paddr`. Returns `true` if it touched a
    /// code chunk.
    #[inline]
    pub fn mark_dirty(&mut self, paddr: u32, len: u32) -> bool {
        let mask = chunk_mask(paddr, len);
        let Some(page) = self.page_mut(paddr >> PAGE_SHIFT) else {
            return false;
        };
        let hit = page.code & mask;
        if hit == 0 {
            return false;
        }
        page.dirty |= hit;
        page.version = page.version.wrapping_add(1);
        self.writes += 1;
        true
    }

    /// Forget a page once no block covers it. The version survives so a block
    /// recompiled later never matches a stale one.
    pub fn drop_page(&mut self, frame: u32) {
        let mut dropped = false;
        if let Some(page) = self.page_mut(frame) {
            dropped = page.code != 0;
            page.code = 0;
            page.dirty = 0;
            page.version = page.version.wrapping_add(1);
        }
        if dropped {
            self.code_pages -= 1;
        }
    }

    pub fn clear(&mut self) {
        for leaf in self.leaves.iter_mut().flatten() {
            for page in leaf.iter_mut() {
                page.code = 0;
                page.dirty = 0;
                page.version = page.version.wrapping_add(1);
            }
        }
        self.code_pages = 0;
    }

    /// Pages currently holding code.
    #[inline]
    pub fn code_pages(&self) -> usize {
        self.code_pages
    }

    /// Writes that have hit code so far.
    #[inline]
    pub fn writes(&self) -> u64 {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_masks() {
        assert_eq!(chunk_mask(0, 1), 1);
        assert_eq!(chunk_mask(63, 2), 0b11);
        assert_eq!(chunk_mask(0x40, 0x40), 0b10);
        assert_eq!(chunk_mask(0xFFF, 4), 1 << 63);
        assert_eq!(chunk_mask(0, PAGE_SIZE), u64::MAX);
        assert_eq!(chunk_mask(0x100, 0), 0);
    }

    #[test]
    fn writes_outside_code_chunks_are_ignored() {
        let mut map = CodePageMap::default();
        assert!(map.add_code(0x5010, 0x20));
        assert!(!map.add_code(0x5030, 1));
        assert_eq!(map.code_pages(), 1);

        assert!(!map.mark_dirty(0x5100, 4));
        assert!(!map.mark_dirty(0x9000, 4));
        assert_eq!(map.version(0x5), 0);

        assert!(map.mark_dirty(0x5012, 1));
        let page = *map.page(0x5).unwrap();
        assert_eq!(page.dirty, 1);
        assert_eq!(page.version, 1);
        assert_eq!(map.writes(), 1);
    }

    #[test]
    fn high_frames_allocate_one_leaf() {
        let mut map = CodePageMap::default();
        map.add_code(0xFFFF_FFF0, 16);
        assert!(map.is_code(0xFFFFF));
        assert_eq!(map.leaves.iter().flatten().count(), 1);
    }

    #[test]
    fn drop_and_clear_bump_versions() {
        let mut map = CodePageMap::default();
        map.add_code(0x1000, 16);
        map.drop_page(1);
        assert!(!map.is_code(1));
        assert_eq!(map.code_pages(), 0);
        assert_eq!(map.version(1), 1);

        map.add_code(0x1000, 16);
        map.clear();
        assert_eq!(map.version(1), 2);
        assert!(!map.mark_dirty(0x1000, 1));
    }
}
