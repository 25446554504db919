use proptest::prelude::*;
use retro86_mmu::{
    AccessType, MemoryBus, Mmu, Requester, CR0_PE, CR0_PG, CR0_WP, PTE_P, PTE_RW, PTE_US,
};

struct Ram(Vec<u8>);

impl MemoryBus for Ram {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.0[paddr as usize]
    }
    fn read_u16(&mut self, paddr: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr + 1)])
    }
    fn read_u32(&mut self, paddr: u64) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes(self.0[off..off + 4].try_into().unwrap())
    }
    fn read_u64(&mut self, paddr: u64) -> u64 {
        u64::from(self.read_u32(paddr)) | (u64::from(self.read_u32(paddr + 4)) << 32)
    }
    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.0[paddr as usize] = value;
    }
    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }
    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }
    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }
}

const PD: u32 = 0x1000;
const PT: u32 = 0x2000;
const PAGES: usize = 16;

fn access_strategy() -> impl Strategy<Value = (u32, AccessType, Requester)> {
    (
        0u32..(PAGES as u32 * 0x1000),
        prop_oneof![
            Just(AccessType::Read),
            Just(AccessType::Write),
            Just(AccessType::Execute)
        ],
        prop_oneof![
            Just(Requester::Cpl(0)),
            Just(Requester::Cpl(3)),
            Just(Requester::System)
        ],
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]
    #[test]
    fn cached_translation_matches_fresh_walk(
        pte_flags in prop::collection::vec(0u32..8, PAGES),
        wp in any::<bool>(),
        accesses in prop::collection::vec(access_strategy(), 1..64),
    ) {
        let mut ram = Ram(vec![0; 0x40_000]);
        ram.write_u32(PD as u64, PT | PTE_P | PTE_RW | PTE_US);
        for (i, flags) in pte_flags.iter().enumerate() {
            let frame = 0x10_000 + (i as u32) * 0x1000;
            ram.write_u32(PT as u64 + i as u64 * 4, frame | (flags & (PTE_P | PTE_RW | PTE_US)));
        }

        let cr0 = CR0_PE | CR0_PG | if wp { CR0_WP } else { 0 };
        let mut cached = Mmu::new(4);
        cached.set_cr3(PD);
        cached.set_cr0(cr0);

        for (linear, access, who) in accesses {
            let mut fresh = Mmu::new(4);
            fresh.set_cr3(PD);
            fresh.set_cr0(cr0);

            let expected = fresh.translate(&mut ram, linear, access, who).map(|t| t.paddr);
            let first = cached.translate(&mut ram, linear, access, who).map(|t| t.paddr);
            let second = cached.translate(&mut ram, linear, access, who).map(|t| t.paddr);
            prop_assert_eq!(first, expected);
            prop_assert_eq!(second, expected);
        }
    }
}
