use super::*;

use core::convert::TryInto;

#[derive(Clone)]
struct TestMemory {
    data: Vec<u8>,
    reads: usize,
}

impl TestMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            reads: 0,
        }
    }

    fn write_u32_raw(&mut self, paddr: u32, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u32_raw(&self, paddr: u32) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }
}

impl MemoryBus for TestMemory {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.reads += 1;
        self.data[paddr as usize]
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        self.reads += 1;
        let off = paddr as usize;
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.reads += 1;
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        self.reads += 1;
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.data[paddr as usize] = value;
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        let off = paddr as usize;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

const PD: u32 = 0x1000;
const PT: u32 = 0x2000;
const PAGE: u32 = 0x5000;

/// Maps linear page 0 → `PAGE` with the given PDE/PTE flag bits.
fn setup(pde_flags: u32, pte_flags: u32) -> (Mmu, TestMemory) {
    let mut mem = TestMemory::new(0x10_000);
    mem.write_u32_raw(PD, PT | pde_flags);
    mem.write_u32_raw(PT, PAGE | pte_flags);
    let mut mmu = Mmu::new(8);
    mmu.set_cr3(PD);
    mmu.set_cr0(CR0_PE | CR0_PG);
    (mmu, mem)
}

fn read_u8_through_generic<B: MemoryBus>(mut bus: B, paddr: u64) -> u8 {
    bus.read_u8(paddr)
}

#[test]
fn memory_bus_is_implemented_for_mut_refs() {
    let mut mem = TestMemory::new(0x10);
    mem.write_u8(3, 0xAB);
    assert_eq!(read_u8_through_generic(&mut mem, 3), 0xAB);
}

#[test]
fn no_paging_is_identity() {
    let mut mem = TestMemory::new(0x10);
    let mut mmu = Mmu::default();
    let t = mmu
        .translate(&mut mem, 0xDEAD_BEEF, AccessType::Write, Requester::Cpl(3))
        .unwrap();
    assert_eq!(t.paddr, 0xDEAD_BEEF);
    assert_eq!(mem.reads, 0);
}

#[test]
fn walk_4kb_sets_accessed_and_dirty() {
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);

    let t = mmu
        .translate(&mut mem, 0x123, AccessType::Read, Requester::Cpl(3))
        .unwrap();
    assert_eq!(t.paddr, PAGE + 0x123);
    assert_ne!(mem.read_u32_raw(PD) & PTE_A, 0);
    assert_ne!(mem.read_u32_raw(PT) & PTE_A, 0);
    assert_eq!(mem.read_u32_raw(PT) & PTE_D, 0);

    mmu.translate(&mut mem, 0x123, AccessType::Write, Requester::Cpl(3))
        .unwrap();
    assert_ne!(mem.read_u32_raw(PT) & PTE_D, 0);
}

#[test]
fn mac_hit_avoids_page_walk_and_invlpg_forces_miss() {
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);

    mmu.translate(&mut mem, 0x10, AccessType::Read, Requester::Cpl(0))
        .unwrap();
    let reads = mem.reads;
    mmu.translate(&mut mem, 0x20, AccessType::Read, Requester::Cpl(0))
        .unwrap();
    assert_eq!(mem.reads, reads);
    assert_eq!(mmu.stats().walks, 1);

    mmu.invlpg(0x0);
    mmu.translate(&mut mem, 0x20, AccessType::Read, Requester::Cpl(0))
        .unwrap();
    assert_eq!(mmu.stats().walks, 2);
}

#[test]
fn read_entry_does_not_satisfy_write() {
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);
    mmu.translate(&mut mem, 0x10, AccessType::Read, Requester::Cpl(0))
        .unwrap();
    mmu.translate(&mut mem, 0x10, AccessType::Write, Requester::Cpl(0))
        .unwrap();
    assert_eq!(mmu.stats().walks, 2);
    assert_eq!(mmu.mac().write_entries().len(), 1);
}

#[test]
fn not_present_faults_and_flushes_cache() {
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);
    mem.write_u32_raw(PT + 4, 0);
    mmu.translate(&mut mem, 0x10, AccessType::Read, Requester::Cpl(0))
        .unwrap();
    assert_eq!(mmu.mac().read_entries().len(), 1);

    let err = mmu
        .translate(&mut mem, 0x1004, AccessType::Write, Requester::Cpl(3))
        .unwrap_err();
    assert_eq!(
        err,
        PageFault {
            addr: 0x1004,
            error_code: PF_WRITE | PF_USER,
        }
    );
    assert!(mmu.mac().read_entries().is_empty());
}

#[test]
fn permission_faults_and_wp_semantics() {
    // Supervisor-only page: user read faults with P=1 U=1.
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);
    let err = mmu
        .translate(&mut mem, 0, AccessType::Read, Requester::Cpl(3))
        .unwrap_err();
    assert_eq!(err.error_code, PF_PRESENT | PF_USER);

    // System requests behave as supervisor accesses while CPL is 3.
    mmu.translate(&mut mem, 0, AccessType::Read, Requester::System)
        .unwrap();

    // Read-only page: supervisor write succeeds without WP, faults with WP.
    let (mut mmu, mut mem) = setup(PTE_P | PTE_US, PTE_P | PTE_US);
    mmu.translate(&mut mem, 0, AccessType::Write, Requester::Cpl(0))
        .unwrap();
    mmu.set_cr0(CR0_PE | CR0_PG | CR0_WP);
    let err = mmu
        .translate(&mut mem, 0, AccessType::Write, Requester::Cpl(0))
        .unwrap_err();
    assert_eq!(err.error_code, PF_PRESENT | PF_WRITE);

    // A core without WP support ignores the bit.
    mmu.set_capabilities(false, false);
    mmu.translate(&mut mem, 0, AccessType::Write, Requester::Cpl(0))
        .unwrap();

    // User write to read-only page always faults.
    let err = mmu
        .translate(&mut mem, 0, AccessType::Write, Requester::Cpl(3))
        .unwrap_err();
    assert_eq!(err.error_code, PF_PRESENT | PF_WRITE | PF_USER);
}

#[test]
fn pse_4mb_page_and_misaligned_frame() {
    let mut mem = TestMemory::new(0x10_000);
    mem.write_u32_raw(PD + 4, 0x0080_0000 | PTE_P | PTE_RW | PTE_PS);
    mem.write_u32_raw(PD + 8, 0x00C0_2000 | PTE_P | PTE_RW | PTE_PS);
    let mut mmu = Mmu::new(8);
    mmu.set_cr3(PD);
    mmu.set_cr4(CR4_PSE);
    mmu.set_cr0(CR0_PE | CR0_PG);

    let t = mmu
        .translate(&mut mem, 0x0041_2345, AccessType::Write, Requester::Cpl(0))
        .unwrap();
    assert_eq!(t.paddr, 0x0081_2345);
    assert_ne!(mem.read_u32_raw(PD + 4) & PTE_D, 0);

    let err = mmu
        .translate(&mut mem, 0x0080_0000, AccessType::Read, Requester::Cpl(0))
        .unwrap_err();
    assert_eq!(err.error_code, PF_PRESENT | PF_RSVD);
}

#[test]
fn page_table_write_triggers_self_reference_flush() {
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);
    mmu.translate(&mut mem, 0x10, AccessType::Read, Requester::Cpl(0))
        .unwrap();
    assert!(!mmu.on_phys_write(PAGE));
    assert!(mmu.on_phys_write(PT + 8));
    assert!(mmu.mac().read_entries().is_empty());
    assert_eq!(mmu.mac().stats().self_reference_flushes, 1);
}

#[test]
fn code_frame_marker_flows_into_write_translations() {
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);
    let t = mmu
        .translate(&mut mem, 0x10, AccessType::Write, Requester::Cpl(0))
        .unwrap();
    assert!(!t.code_page);

    mmu.set_code_frame(PAGE >> PAGE_SHIFT, true);
    let t = mmu
        .translate(&mut mem, 0x10, AccessType::Write, Requester::Cpl(0))
        .unwrap();
    assert!(t.code_page);
    // Served from the cache entry that was updated in place.
    assert_eq!(mmu.stats().walks, 1);

    mmu.clear_code_frames();
    let t = mmu
        .translate(&mut mem, 0x10, AccessType::Write, Requester::Cpl(0))
        .unwrap();
    assert!(!t.code_page);
}

#[test]
fn cr3_reload_flushes_even_when_unchanged() {
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);
    mmu.translate(&mut mem, 0x10, AccessType::Read, Requester::Cpl(0))
        .unwrap();
    mmu.set_cr3(PD);
    assert!(mmu.mac().read_entries().is_empty());
}

#[test]
fn probe_has_no_side_effects() {
    let (mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);
    assert_eq!(
        mmu.translate_probe(&mut mem, 0x44, AccessType::Write, Requester::Cpl(0)),
        Some(PAGE + 0x44)
    );
    assert_eq!(mem.read_u32_raw(PT) & (PTE_A | PTE_D), 0);
    assert!(mmu.mac().write_entries().is_empty());
    assert_eq!(
        mmu.translate_probe(&mut mem, 0x44, AccessType::Read, Requester::Cpl(3)),
        None
    );
}

#[test]
fn walk_reports_its_entry_write_backs() {
    let (mut mmu, mut mem) = setup(PTE_P | PTE_RW, PTE_P | PTE_RW);
    mmu.translate(&mut mem, 0x10, AccessType::Write, Requester::Cpl(0))
        .unwrap();
    assert_eq!(mmu.drain_table_writes().collect::<Vec<_>>(), vec![PD, PT]);

    // A/D already set: a fresh walk writes nothing back.
    mmu.flush();
    mmu.translate(&mut mem, 0x10, AccessType::Write, Requester::Cpl(0))
        .unwrap();
    assert_eq!(mmu.drain_table_writes().count(), 0);
}
