//! Memory Access Cache: the small fully-associative set of recently resolved page
//! translations that lets repeat accesses skip the page walk.
//!
//! Read and write translations live on independent sides. A write entry is only
//! inserted after a walk that performed the write permission check and set the
//! dirty bit, so a write hit needs no further bookkeeping. Entries are tagged with
//! the privilege class they were resolved for; a supervisor entry never satisfies a
//! user lookup and vice versa.

/// Default number of entries per side.
pub const DEFAULT_MAC_ENTRIES: usize = 64;

/// One cached page translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacEntry {
    /// Linear page number (`linear >> 12`).
    pub vpage: u32,
    /// Physical frame number (`paddr >> 12`).
    pub frame: u32,
    /// Resolved for a CPL3 requester.
    pub user: bool,
    /// Write entries only: the frame hosts translated code, so writes must be
    /// reported to the code cache's dirty bitmap.
    pub code_page: bool,
    /// Frame of the page table (or page directory for 4 MB pages) that produced
    /// this translation.
    pub table_frame: u32,
}

#[derive(Debug, Clone)]
struct Side {
    entries: Vec<MacEntry>,
    capacity: usize,
    next: usize,
}

impl Side {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    #[inline]
    fn lookup(&self, vpage: u32, user: bool) -> Option<&MacEntry> {
        self.entries
            .iter()
            .find(|e| e.vpage == vpage && e.user == user)
    }

    fn insert(&mut self, entry: MacEntry) {
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|e| e.vpage == entry.vpage && e.user == entry.user)
        {
            *slot = entry;
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return;
        }
        // Round-robin eviction.
        self.entries[self.next] = entry;
        self.next = (self.next + 1) % self.capacity;
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.next = 0;
    }
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MacStats {
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
    pub self_reference_flushes: u64,
}

#[derive(Debug, Clone)]
pub struct MemoryAccessCache {
    read: Side,
    write: Side,
    /// Frames of page directories/tables referenced by live entries.
    table_frames: Vec<u32>,
    stats: MacStats,
}

impl Default for MemoryAccessCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAC_ENTRIES)
    }
}

impl MemoryAccessCache {
    #[track_caller]
    pub fn new(entries_per_side: usize) -> Self {
        assert!(entries_per_side > 0, "MAC needs at least one entry per side");
        Self {
            read: Side::new(entries_per_side),
            write: Side::new(entries_per_side),
            table_frames: Vec::new(),
            stats: MacStats::default(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.read.capacity
    }

    #[inline]
    pub fn stats(&self) -> MacStats {
        self.stats
    }

    /// Read-side entries in insertion order.
    pub fn read_entries(&self) -> &[MacEntry] {
        &self.read.entries
    }

    /// Write-side entries in insertion order.
    pub fn write_entries(&self) -> &[MacEntry] {
        &self.write.entries
    }

    #[inline]
    pub(crate) fn lookup(&mut self, vpage: u32, user: bool, write: bool) -> Option<MacEntry> {
        let side = if write { &self.write } else { &self.read };
        match side.lookup(vpage, user) {
            Some(e) => {
                self.stats.hits += 1;
                Some(*e)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub(crate) fn insert(&mut self, write: bool, entry: MacEntry, dir_frame: u32) {
        for frame in [dir_frame, entry.table_frame] {
            if !self.table_frames.contains(&frame) {
                self.table_frames.push(frame);
            }
        }
        if write {
            self.write.insert(entry);
        } else {
            self.read.insert(entry);
        }
    }

    pub fn flush(&mut self) {
        if self.read.entries.is_empty() && self.write.entries.is_empty() {
            return;
        }
        self.read.clear();
        self.write.clear();
        self.table_frames.clear();
        self.stats.flushes += 1;
    }

    /// Drop both sides' entries for one linear page (`INVLPG`).
    ///
    /// The MAC has no partial invalidation; like every other invalidating event this
    /// flushes everything once the page is known to be cached.
    pub fn invalidate_page(&mut self, vpage: u32) {
        let cached = self.read.entries.iter().any(|e| e.vpage == vpage)
            || self.write.entries.iter().any(|e| e.vpage == vpage);
        if cached {
            self.flush();
        }
    }

    /// Physical write notification. Writing a page-table page that backs a live
    /// entry invalidates the whole cache.
    pub fn on_phys_write(&mut self, frame: u32) -> bool {
        if self.table_frames.contains(&frame) {
            self.flush();
            self.stats.self_reference_flushes += 1;
            return true;
        }
        false
    }

    /// Refresh the code-page marker on live write entries for `frame`.
    pub(crate) fn set_code_page(&mut self, frame: u32, code: bool) {
        for e in self.write.entries.iter_mut().filter(|e| e.frame == frame) {
            e.code_page = code;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vpage: u32, frame: u32) -> MacEntry {
        MacEntry {
            vpage,
            frame,
            user: false,
            code_page: false,
            table_frame: 0x10,
        }
    }

    #[test]
    fn round_robin_eviction_replaces_oldest_slot_first() {
        let mut mac = MemoryAccessCache::new(2);
        mac.insert(false, entry(1, 11), 0x20);
        mac.insert(false, entry(2, 12), 0x20);
        mac.insert(false, entry(3, 13), 0x20);
        let pages: Vec<u32> = mac.read_entries().iter().map(|e| e.vpage).collect();
        assert_eq!(pages, vec![3, 2]);

        mac.insert(false, entry(4, 14), 0x20);
        let pages: Vec<u32> = mac.read_entries().iter().map(|e| e.vpage).collect();
        assert_eq!(pages, vec![3, 4]);
    }

    #[test]
    fn privilege_class_is_part_of_the_key() {
        let mut mac = MemoryAccessCache::new(4);
        mac.insert(false, entry(1, 11), 0x20);
        assert!(mac.lookup(1, true, false).is_none());
        assert_eq!(mac.lookup(1, false, false).map(|e| e.frame), Some(11));
        assert!(mac.lookup(1, false, true).is_none());
    }

    #[test]
    fn write_to_page_table_frame_flushes() {
        let mut mac = MemoryAccessCache::new(4);
        mac.insert(true, entry(1, 11), 0x20);
        assert!(!mac.on_phys_write(0x30));
        assert_eq!(mac.write_entries().len(), 1);
        assert!(mac.on_phys_write(0x10));
        assert!(mac.write_entries().is_empty());
        assert_eq!(mac.stats().self_reference_flushes, 1);
    }
}
