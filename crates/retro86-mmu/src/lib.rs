#![forbid(unsafe_code)]

//! x86 paging unit: linear → physical translation for 386-class 32-bit paging
//! (4 KB pages through a two-level directory/table walk, 4 MB pages with CR4.PSE),
//! fronted by the [`MemoryAccessCache`].
//!
//! Permission checks combine the directory and table entry bits with the
//! requesting privilege class and CR0.WP. CPU-internal accesses to system tables
//! (GDT/LDT/IDT/TSS) are made with [`Requester::System`], which is checked as a
//! supervisor access regardless of the current CPL.

pub mod mac;

pub use mac::{MacEntry, MacStats, MemoryAccessCache, DEFAULT_MAC_ENTRIES};

#[cfg(test)]
mod tests;

/// Physical memory access used for page-table walking and by the CPU core.
///
/// The CPU treats the physical address space as an opaque byte space; RAM, ROM and
/// MMIO routing is the implementor's business.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn read_u16(&mut self, paddr: u64) -> u16;
    fn read_u32(&mut self, paddr: u64) -> u32;
    fn read_u64(&mut self, paddr: u64) -> u64;

    fn write_u8(&mut self, paddr: u64, value: u8);
    fn write_u16(&mut self, paddr: u64, value: u16);
    fn write_u32(&mut self, paddr: u64, value: u32);
    fn write_u64(&mut self, paddr: u64, value: u64);

    /// Read a byte slice from physical memory.
    ///
    /// The default implementation falls back to byte-at-a-time reads via
    /// [`MemoryBus::read_u8`].
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    /// Write a byte slice to physical memory.
    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), byte);
        }
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        <T as MemoryBus>::read_u8(&mut **self, paddr)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        <T as MemoryBus>::read_u16(&mut **self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        <T as MemoryBus>::read_u64(&mut **self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <T as MemoryBus>::write_u8(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <T as MemoryBus>::write_u16(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <T as MemoryBus>::write_u64(&mut **self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }
}

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_PG: u32 = 1 << 31;
pub const CR4_PSE: u32 = 1 << 4;

pub const PTE_P: u32 = 1 << 0;
pub const PTE_RW: u32 = 1 << 1;
pub const PTE_US: u32 = 1 << 2;
pub const PTE_A: u32 = 1 << 5;
pub const PTE_D: u32 = 1 << 6;
pub const PTE_PS: u32 = 1 << 7;

/// Bits 13..=21 of a 4 MB PDE must be zero (the frame must be 4 MB aligned).
const PDE_4MB_RESERVED_MASK: u32 = 0x003F_E000;

pub const PF_PRESENT: u16 = 1 << 0;
pub const PF_WRITE: u16 = 1 << 1;
pub const PF_USER: u16 = 1 << 2;
pub const PF_RSVD: u16 = 1 << 3;

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }
}

/// Who is asking for the translation.
///
/// `System` is the CPU's own access to descriptor tables, the IDT and TSSs. It is
/// checked as a supervisor access even while CPL is 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Cpl(u8),
    System,
}

impl Requester {
    #[inline]
    pub fn is_user(self) -> bool {
        matches!(self, Requester::Cpl(3))
    }
}

/// #PF details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub addr: u32,
    pub error_code: u16,
}

/// Result of a successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub paddr: u32,
    /// The target frame hosts translated code (only meaningful for writes).
    pub code_page: bool,
}

/// Set of physical frames, one bit per 4 KB frame, grown on demand.
#[derive(Debug, Clone, Default)]
pub struct FrameSet {
    words: Vec<u64>,
}

impl FrameSet {
    #[inline]
    pub fn contains(&self, frame: u32) -> bool {
        let word = (frame >> 6) as usize;
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << (frame & 63)) != 0)
    }

    pub fn set(&mut self, frame: u32, present: bool) {
        let word = (frame >> 6) as usize;
        if word >= self.words.len() {
            if !present {
                return;
            }
            self.words.resize(word + 1, 0);
        }
        let bit = 1u64 << (frame & 63);
        if present {
            self.words[word] |= bit;
        } else {
            self.words[word] &= !bit;
        }
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }
}

/// Walk/flush counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    pub walks: u64,
    pub page_faults: u64,
}

/// x86 paging unit with a Memory Access Cache.
#[derive(Debug, Clone)]
pub struct Mmu {
    cr0: u32,
    cr3: u32,
    cr4: u32,
    /// CR0.WP is only honoured by 486 and later cores.
    wp_supported: bool,
    pse_supported: bool,
    mac: MemoryAccessCache,
    code_frames: FrameSet,
    /// Physical addresses of paging entries the last walk wrote back.
    table_writes: Vec<u32>,
    stats: MmuStats,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new(DEFAULT_MAC_ENTRIES)
    }
}

impl Mmu {
    pub fn new(mac_entries: usize) -> Self {
        Self {
            cr0: 0,
            cr3: 0,
            cr4: 0,
            wp_supported: true,
            pse_supported: true,
            mac: MemoryAccessCache::new(mac_entries),
            code_frames: FrameSet::default(),
            table_writes: Vec::new(),
            stats: MmuStats::default(),
        }
    }

    /// Restrict the paging features to what a given core implements.
    pub fn set_capabilities(&mut self, wp_supported: bool, pse_supported: bool) {
        if self.wp_supported != wp_supported || self.pse_supported != pse_supported {
            self.wp_supported = wp_supported;
            self.pse_supported = pse_supported;
            self.mac.flush();
        }
    }

    #[inline]
    pub fn mac(&self) -> &MemoryAccessCache {
        &self.mac
    }

    #[inline]
    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    #[inline]
    fn wp_enabled(&self) -> bool {
        self.wp_supported && self.cr0 & CR0_WP != 0
    }

    #[inline]
    fn pse_enabled(&self) -> bool {
        self.pse_supported && self.cr4 & CR4_PSE != 0
    }

    pub fn set_cr0(&mut self, value: u32) {
        let relevant = CR0_PG | CR0_WP | CR0_PE;
        if (self.cr0 ^ value) & relevant != 0 {
            self.mac.flush();
        }
        self.cr0 = value;
    }

    /// Any CR3 load flushes the cache, even when the value is unchanged.
    pub fn set_cr3(&mut self, value: u32) {
        self.cr3 = value;
        self.mac.flush();
    }

    pub fn set_cr4(&mut self, value: u32) {
        if (self.cr4 ^ value) & CR4_PSE != 0 {
            self.mac.flush();
        }
        self.cr4 = value;
    }

    pub fn invlpg(&mut self, linear: u32) {
        self.mac.invalidate_page(linear >> PAGE_SHIFT);
    }

    pub fn flush(&mut self) {
        self.mac.flush();
    }

    /// Mark or unmark a physical frame as hosting translated code.
    pub fn set_code_frame(&mut self, frame: u32, code: bool) {
        self.code_frames.set(frame, code);
        self.mac.set_code_page(frame, code);
    }

    #[inline]
    pub fn is_code_frame(&self, frame: u32) -> bool {
        self.code_frames.contains(frame)
    }

    pub fn clear_code_frames(&mut self) {
        self.code_frames.clear();
        for e in self.mac.write_entries().to_vec() {
            self.mac.set_code_page(e.frame, false);
        }
    }

    /// Physical write notification (CPU or DMA). Returns `true` if it forced a MAC
    /// flush because the frame holds a live page table.
    pub fn on_phys_write(&mut self, paddr: u32) -> bool {
        self.mac.on_phys_write(paddr >> PAGE_SHIFT)
    }

    /// Accessed/dirty write-backs made by page walks since the last drain. The
    /// caller owns code-page dirty tracking for these; they do not flush the MAC.
    pub fn drain_table_writes(&mut self) -> std::vec::Drain<'_, u32> {
        self.table_writes.drain(..)
    }

    /// Translate a linear address.
    pub fn translate<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        access: AccessType,
        who: Requester,
    ) -> Result<Translation, PageFault> {
        if !self.paging_enabled() {
            return Ok(Translation {
                paddr: linear,
                code_page: access.is_write() && self.code_frames.contains(linear >> PAGE_SHIFT),
            });
        }

        let user = who.is_user();
        let write = access.is_write();
        let vpage = linear >> PAGE_SHIFT;
        if let Some(hit) = self.mac.lookup(vpage, user, write) {
            return Ok(Translation {
                paddr: (hit.frame << PAGE_SHIFT) | (linear & PAGE_OFFSET_MASK),
                code_page: write && hit.code_page,
            });
        }

        self.stats.walks += 1;
        match self.walk(bus, linear, access, user) {
            Ok((paddr, table_frame)) => {
                let frame = paddr >> PAGE_SHIFT;
                let code_page = write && self.code_frames.contains(frame);
                let dir_frame = self.cr3 >> PAGE_SHIFT;
                self.mac.insert(
                    write,
                    MacEntry {
                        vpage,
                        frame,
                        user,
                        code_page,
                        table_frame,
                    },
                    dir_frame,
                );
                Ok(Translation { paddr, code_page })
            }
            Err(pf) => {
                tracing::trace!(
                    linear = format_args!("{linear:#010x}"),
                    error_code = pf.error_code,
                    "page fault"
                );
                self.stats.page_faults += 1;
                self.mac.flush();
                Err(pf)
            }
        }
    }

    /// Translate without setting accessed/dirty bits or touching the cache.
    pub fn translate_probe<B: MemoryBus + ?Sized>(
        &self,
        bus: &mut B,
        linear: u32,
        access: AccessType,
        who: Requester,
    ) -> Option<u32> {
        if !self.paging_enabled() {
            return Some(linear);
        }
        let user = who.is_user();
        let pde_addr = self.pde_addr(linear);
        let pde = bus.read_u32(pde_addr as u64);
        if pde & PTE_P == 0 {
            return None;
        }
        if pde & PTE_PS != 0 && self.pse_enabled() {
            if pde & PDE_4MB_RESERVED_MASK != 0 {
                return None;
            }
            self.check_perms(linear, pde & PTE_US != 0, pde & PTE_RW != 0, access, user)
                .ok()?;
            return Some((pde & 0xFFC0_0000) | (linear & 0x003F_FFFF));
        }
        let pte_addr = (pde & 0xFFFF_F000) + ((linear >> 12) & 0x3FF) * 4;
        let pte = bus.read_u32(pte_addr as u64);
        if pte & PTE_P == 0 {
            return None;
        }
        let user_ok = pde & PTE_US != 0 && pte & PTE_US != 0;
        let rw_ok = pde & PTE_RW != 0 && pte & PTE_RW != 0;
        self.check_perms(linear, user_ok, rw_ok, access, user).ok()?;
        Some((pte & 0xFFFF_F000) | (linear & PAGE_OFFSET_MASK))
    }

    #[inline]
    fn pde_addr(&self, linear: u32) -> u32 {
        (self.cr3 & 0xFFFF_F000) + (linear >> 22) * 4
    }

    #[inline]
    fn fault_code(access: AccessType, user: bool, present: bool) -> u16 {
        let mut code = 0;
        if present {
            code |= PF_PRESENT;
        }
        if access.is_write() {
            code |= PF_WRITE;
        }
        if user {
            code |= PF_USER;
        }
        code
    }

    fn check_perms(
        &self,
        linear: u32,
        user_ok: bool,
        rw_ok: bool,
        access: AccessType,
        user: bool,
    ) -> Result<(), PageFault> {
        let denied = (user && !user_ok) || (access.is_write() && !rw_ok && (user || self.wp_enabled()));
        if denied {
            return Err(PageFault {
                addr: linear,
                error_code: Self::fault_code(access, user, true),
            });
        }
        Ok(())
    }

    /// Returns the physical address and the frame of the leaf paging structure.
    fn walk<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        access: AccessType,
        user: bool,
    ) -> Result<(u32, u32), PageFault> {
        let pde_addr = self.pde_addr(linear);
        let pde = bus.read_u32(pde_addr as u64);
        if pde & PTE_P == 0 {
            return Err(PageFault {
                addr: linear,
                error_code: Self::fault_code(access, user, false),
            });
        }

        if pde & PTE_PS != 0 && self.pse_enabled() {
            if pde & PDE_4MB_RESERVED_MASK != 0 {
                return Err(PageFault {
                    addr: linear,
                    error_code: Self::fault_code(access, user, true) | PF_RSVD,
                });
            }
            self.check_perms(linear, pde & PTE_US != 0, pde & PTE_RW != 0, access, user)?;

            let mut new_pde = pde | PTE_A;
            if access.is_write() {
                new_pde |= PTE_D;
            }
            if new_pde != pde {
                bus.write_u32(pde_addr as u64, new_pde);
                self.table_writes.push(pde_addr);
            }
            let paddr = (pde & 0xFFC0_0000) | (linear & 0x003F_FFFF);
            return Ok((paddr, pde_addr >> PAGE_SHIFT));
        }

        let pte_addr = (pde & 0xFFFF_F000) + ((linear >> 12) & 0x3FF) * 4;
        let pte = bus.read_u32(pte_addr as u64);
        if pte & PTE_P == 0 {
            return Err(PageFault {
                addr: linear,
                error_code: Self::fault_code(access, user, false),
            });
        }

        let user_ok = pde & PTE_US != 0 && pte & PTE_US != 0;
        let rw_ok = pde & PTE_RW != 0 && pte & PTE_RW != 0;
        self.check_perms(linear, user_ok, rw_ok, access, user)?;

        if pde & PTE_A == 0 {
            bus.write_u32(pde_addr as u64, pde | PTE_A);
            self.table_writes.push(pde_addr);
        }
        let mut new_pte = pte | PTE_A;
        if access.is_write() {
            new_pte |= PTE_D;
        }
        if new_pte != pte {
            bus.write_u32(pte_addr as u64, new_pte);
            self.table_writes.push(pte_addr);
        }

        let paddr = (pte & 0xFFFF_F000) | (linear & PAGE_OFFSET_MASK);
        Ok((paddr, pte_addr >> PAGE_SHIFT))
    }
}
