#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use retro86_mmu::{AccessType, MemoryBus, Mmu, Requester};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("RETRO86_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30),
    }
}

#[cfg(not(target_arch = "wasm32"))]
struct BenchMemory {
    data: Vec<u8>,
}

#[cfg(not(target_arch = "wasm32"))]
impl MemoryBus for BenchMemory {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.data[paddr as usize]
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        let off = paddr as usize;
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        let off = paddr as usize;
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[off..off + 4]);
        u32::from_le_bytes(b)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        u64::from(self.read_u32(paddr)) | (u64::from(self.read_u32(paddr + 4)) << 32)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.data[paddr as usize] = value;
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        let off = paddr as usize;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_mac_hit(c: &mut Criterion) {
    const PTE_P: u32 = 1 << 0;
    const PTE_RW: u32 = 1 << 1;
    const CR0_PG: u32 = 1 << 31;

    let mut mem = BenchMemory {
        data: vec![0; 0x20_000],
    };
    mem.write_u32(0x1000, 0x2000 | PTE_P | PTE_RW);
    for i in 0..64u64 {
        mem.write_u32(0x2000 + i * 4, (0x8000 + i as u32 * 0x1000) | PTE_P | PTE_RW);
    }

    let mut mmu = Mmu::default();
    mmu.set_cr3(0x1000);
    mmu.set_cr0(CR0_PG | 1);

    let vaddr = 0x234u32;
    black_box(mmu.translate(&mut mem, vaddr, AccessType::Read, Requester::Cpl(0)));

    let mut group = c.benchmark_group("mac_lookup");
    group.throughput(Throughput::Elements(1));
    group.bench_function("hit_4k_read", |b| {
        b.iter(|| {
            black_box(mmu.translate(
                &mut mem,
                black_box(vaddr),
                AccessType::Read,
                Requester::Cpl(0),
            ))
        })
    });
    group.bench_function("sweep_64_pages", |b| {
        b.iter(|| {
            for page in 0..64u32 {
                black_box(mmu.translate(
                    &mut mem,
                    page << 12,
                    AccessType::Read,
                    Requester::Cpl(0),
                ));
            }
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_mac_hit
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
