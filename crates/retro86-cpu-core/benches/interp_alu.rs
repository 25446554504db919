#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use retro86_cpu_core::flags::{FlagState, Width};
#[cfg(not(target_arch = "wasm32"))]
use retro86_cpu_core::interp::{alu, ADD, SUB, XOR};
#[cfg(not(target_arch = "wasm32"))]
use retro86_cpu_core::state::{SegReg, SegmentCache, ECX};
#[cfg(not(target_arch = "wasm32"))]
use retro86_cpu_core::{CpuCore, FlatTestBus, Scheduler};

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

/// SplitMix64, so operand streams are identical between runs.
#[cfg(not(target_arch = "wasm32"))]
struct Rng(u64);

#[cfg(not(target_arch = "wasm32"))]
impl Rng {
    fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        (z ^ (z >> 31)) as u32
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_flags(c: &mut Criterion) {
    const OPS: usize = 4096;
    let mut rng = Rng(0x5EED);
    let operands: Vec<(u32, u32)> = (0..OPS).map(|_| (rng.next_u32(), rng.next_u32())).collect();

    let mut group = c.benchmark_group("flags");
    group.throughput(Throughput::Elements(OPS as u64));
    // Deferred only: nothing reads the flags.
    group.bench_function("deferred", |b| {
        b.iter(|| {
            let mut flags = FlagState::new(0x2);
            let mut acc = 0u32;
            for (i, &(a, x)) in operands.iter().enumerate() {
                let op = [ADD, SUB, XOR][i % 3];
                acc ^= alu(&mut flags, op, Width::Dword, a, x);
            }
            black_box((acc, flags))
        })
    });
    // Every result is followed by a full EFLAGS read.
    group.bench_function("materialized", |b| {
        b.iter(|| {
            let mut flags = FlagState::new(0x2);
            let mut acc = 0u32;
            for (i, &(a, x)) in operands.iter().enumerate() {
                let op = [ADD, SUB, XOR][i % 3];
                alu(&mut flags, op, Width::Dword, a, x);
                acc ^= flags.value();
            }
            black_box(acc)
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn real_mode_loop(model: &str) -> (CpuCore, FlatTestBus) {
    let mut core = CpuCore::with_model(model).expect("model");
    for seg in SegReg::ALL {
        *core.state.seg_mut(seg) = SegmentCache::real_mode(0, seg == SegReg::Cs);
    }
    let mut bus = FlatTestBus::new(0x1_0000);
    // 0100: add ax, bx ; sub dx, ax ; xor bx, dx ; inc si ; loop 0100 ; hlt
    bus.load(0x100, &[0x01, 0xD8, 0x29, 0xC2, 0x31, 0xD3, 0x46, 0xE2, 0xF7, 0xF4]);
    core.state.eip = 0x100;
    (core, bus)
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_loop(c: &mut Criterion) {
    const ITERATIONS: u32 = 10_000;
    let mut group = c.benchmark_group("alu_loop");
    group.throughput(Throughput::Elements(u64::from(ITERATIONS) * 5));
    for model in ["8088", "486DX", "PentiumII"] {
        group.bench_with_input(BenchmarkId::new("interpreter", model), model, |b, model| {
            b.iter(|| {
                let (mut core, mut bus) = real_mode_loop(model);
                core.state.gpr[ECX] = ITERATIONS;
                core.run(&mut bus, i64::MAX / 2);
                black_box(core.state.gpr)
            })
        });
    }
    for model in ["486DX", "PentiumII"] {
        group.bench_with_input(BenchmarkId::new("scheduler", model), model, |b, model| {
            b.iter(|| {
                let (mut core, mut bus) = real_mode_loop(model);
                let mut sched = Scheduler::for_core(&core);
                core.state.gpr[ECX] = ITERATIONS;
                sched.run(&mut core, &mut bus, i64::MAX / 2);
                black_box(core.state.gpr)
            })
        });
    }
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_flags, bench_loop
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
