use retro86_cpu_core::exec::{StepOutcome, Tick};
use retro86_cpu_core::segmentation::descriptor::Descriptor;
use retro86_cpu_core::state::{SegReg, SegmentCache, TableReg, CR0_PE, EAX, EBX, ECX, ESP};
use retro86_cpu_core::{CpuConfig, CpuCore, CpuSnapshot, FlatTestBus, Scheduler};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn flat(access: u8) -> Descriptor {
    Descriptor::segment(0, 0xFFFFF, access, 0xC)
}

fn machine(model: &str, code: &[u8]) -> (CpuCore, FlatTestBus) {
    let mut core = CpuCore::with_model(model).unwrap();
    let mut bus = FlatTestBus::new(0x20_0000);
    bus.load(0x808, &flat(0x9B).raw.to_le_bytes());
    bus.load(0x810, &flat(0x93).raw.to_le_bytes());
    core.state.gdtr = TableReg {
        base: 0x800,
        limit: 0x17,
    };
    core.set_cr0(core.state.cr0 | CR0_PE);
    for seg in SegReg::ALL {
        *core.state.seg_mut(seg) = if seg == SegReg::Cs {
            SegmentCache::from_descriptor(0x08, &flat(0x9B))
        } else {
            SegmentCache::from_descriptor(0x10, &flat(0x93))
        };
    }
    core.state.eip = 0x100;
    core.state.gpr[ESP] = 0x8000;
    bus.load(0x100, code);
    (core, bus)
}

// Sums a 64-entry table, calling a helper that stores a running total back
// into it.
//
// 0100: mov ecx, 64
// 0105: xor eax, eax
// 0107: mov esi, 0x3000
// 010C: add eax, [esi]
// 010E: call 0180
// 0113: add esi, 4
// 0116: loop 010C
// 0118: hlt
// 0180: add ebx, eax
// 0182: mov [esi], ebx
// 0184: ret
fn table_sum(model: &str) -> (CpuCore, FlatTestBus) {
    let (core, mut bus) = machine(
        model,
        &[
            0xB9, 64, 0, 0, 0, 0x31, 0xC0, 0xBE, 0x00, 0x30, 0, 0, 0x03, 0x06, 0xE8, 0x6D, 0, 0,
            0, 0x83, 0xC6, 0x04, 0xE2, 0xF4, 0xF4,
        ],
    );
    bus.load(0x180, &[0x01, 0xC3, 0x89, 0x1E, 0xC3]);
    for i in 0..64u32 {
        bus.load(0x3000 + 4 * i, &(i * 7 + 3).to_le_bytes());
    }
    (core, bus)
}

fn assert_same(a: &CpuCore, b: &CpuCore) {
    assert_eq!(a.state.gpr, b.state.gpr);
    assert_eq!(a.state.eip, b.state.eip);
    assert_eq!(a.state.flags.value(), b.state.flags.value());
    assert_eq!(a.state.halted, b.state.halted);
    assert_eq!(a.stats.instructions, b.stats.instructions);
}

#[test]
fn scheduler_matches_interpreter() {
    init_tracing();
    for model in ["386DX", "486DX", "Pentium", "PentiumII"] {
        let (mut reference, mut ref_bus) = table_sum(model);
        reference.run(&mut ref_bus, 1_000_000);

        let (mut core, mut bus) = table_sum(model);
        let mut sched = Scheduler::for_core(&core);
        sched.run(&mut core, &mut bus, 1_000_000);

        assert!(core.state.halted, "{model}");
        assert_same(&core, &reference);
        assert_eq!(bus.slice(0x3000, 256), ref_bus.slice(0x3000, 256));
        assert!(sched.cache().stats().hits > 50, "{model}");
    }
}

#[test]
fn dynarec_off_uses_interpreter_only() {
    let config = CpuConfig {
        model: "Pentium".to_owned(),
        dynarec: false,
        ..CpuConfig::default()
    };
    let (_, mut bus) = table_sum("Pentium");
    let (template, _) = table_sum("Pentium");
    let mut core = CpuCore::new(config).unwrap();
    core.restore(&template.snapshot()).unwrap();
    let mut sched = Scheduler::for_core(&core);
    sched.run(&mut core, &mut bus, 1_000_000);
    assert!(core.state.halted);
    assert!(sched.cache().is_empty());
}

#[test]
fn self_modifying_loop() {
    init_tracing();
    // 0100: mov eax, imm32        (imm at 0101)
    // 0105: inc dword [0x101]
    // 010B: add ebx, eax
    // 010D: loop 0100
    // 010F: hlt
    let code = [
        0xB8, 0, 0, 0, 0, 0xFF, 0x05, 0x01, 0x01, 0, 0, 0x01, 0xC3, 0xE2, 0xF1, 0xF4,
    ];
    let (mut core, mut bus) = machine("486DX", &code);
    core.state.gpr[ECX] = 10;
    let mut sched = Scheduler::for_core(&core);
    sched.run(&mut core, &mut bus, 1_000_000);

    assert!(core.state.halted);
    assert_eq!(core.state.gpr[EBX], 45);
    assert_eq!(core.state.gpr[EAX], 9);
}

#[test]
fn patched_block_runs_new_code() {
    // 0100: mov eax, 1 ; jmp 0100
    let (mut core, mut bus) = machine("486DX", &[0xB8, 1, 0, 0, 0, 0xEB, 0xF9]);
    let mut sched = Scheduler::for_core(&core);
    core.state.cycles = 1_000_000;
    for _ in 0..4 {
        sched.step(&mut core, &mut bus);
    }
    assert_eq!(core.state.gpr[EAX], 1);

    // Rewrite the immediate through a guest store: mov byte [0x101], 2 ; jmp 0100
    bus.load(0x200, &[0xC6, 0x05, 0x01, 0x01, 0, 0, 2, 0xE9, 0xF4, 0xFE, 0xFF, 0xFF]);
    core.state.eip = 0x200;
    sched.step(&mut core, &mut bus);
    assert_eq!(core.state.eip, 0x100);

    let outcome = sched.step(&mut core, &mut bus);
    assert!(matches!(outcome, StepOutcome::Block { tick: Tick::Compile, .. }));
    assert_eq!(core.state.gpr[EAX], 2);
    let outcome = sched.step(&mut core, &mut bus);
    assert!(matches!(outcome, StepOutcome::Block { tick: Tick::Execute, .. }));
    assert_eq!(core.state.gpr[EAX], 2);
    assert_eq!(sched.cache().stats().invalidated, 1);
}

#[test]
fn snapshot_survives_json_and_resumes() {
    let (mut reference, mut ref_bus) = table_sum("486DX");
    reference.run(&mut ref_bus, 1_000_000);

    let (mut core, mut bus) = table_sum("486DX");
    let mut sched = Scheduler::for_core(&core);
    sched.run(&mut core, &mut bus, 200);
    assert!(!core.state.halted);

    let json = serde_json::to_string(&core.snapshot()).unwrap();
    let snap: CpuSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(snap, core.snapshot());

    let mut resumed = CpuCore::with_model("486DX").unwrap();
    resumed.restore(&snap).unwrap();
    resumed.stats = core.stats;
    let mut resumed_bus = bus.clone();
    let mut resumed_sched = Scheduler::for_core(&resumed);
    resumed_sched.run(&mut resumed, &mut resumed_bus, 1_000_000);

    assert_same(&resumed, &reference);
    assert_eq!(resumed_bus.slice(0x3000, 256), ref_bus.slice(0x3000, 256));
}
