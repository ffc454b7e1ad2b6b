use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hearth::abi::{Capability, CapabilityId};
use hearth::manifest::Manifest;

trait Counter: Send {
    fn bump(&mut self) -> u64;
}

struct Tally(u64);

impl Counter for Tally {
    fn bump(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

struct CounterCapability;

impl Capability for CounterCapability {
    const ID: CapabilityId = CapabilityId::new(0x636f_756e_7400_0001, 1);
    const NAME: &'static str = "counter";
    const BUILDER_SYMBOL: &'static str = "hearth_manifest_counter";
    type Object = dyn Counter;
}

fn create_tally() -> Option<Box<dyn Counter>> {
    Some(Box::new(Tally(0)))
}

/// Benchmark the create/destroy cycle through a manifest
fn bench_manifest_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest");

    group.bench_function("create_destroy", |b| {
        let mut manifest = Manifest::<CounterCapability>::new();
        manifest.register_factory("Tally", create_tally).unwrap();

        b.iter(|| {
            let instance = manifest.create(black_box("Tally")).unwrap();
            manifest.destroy("Tally", instance).unwrap();
        });
    });

    for live in &[10usize, 1000] {
        group.bench_with_input(BenchmarkId::new("get_mut", live), live, |b, &live| {
            let mut manifest = Manifest::<CounterCapability>::new();
            manifest.register_factory("Tally", create_tally).unwrap();
            let instances: Vec<_> = (0..live)
                .map(|_| manifest.create("Tally").unwrap())
                .collect();
            let target = instances[live / 2];

            b.iter(|| manifest.get_mut(black_box(target)).unwrap().bump());
        });
    }

    group.finish();
}

/// Benchmark command frame encoding
#[cfg(unix)]
fn bench_frames(c: &mut Criterion) {
    use hearth::instance::{decode_args, decode_frame, encode_args, encode_frame};

    let mut group = c.benchmark_group("frames");

    for argc in &[1usize, 8, 32] {
        let argv: Vec<String> = (0..*argc).map(|i| format!("--option-{i}")).collect();
        group.bench_with_input(BenchmarkId::new("encode", argc), &argv, |b, argv| {
            b.iter(|| encode_frame("run", &encode_args(black_box(argv))).unwrap());
        });

        let frame = encode_frame("run", &encode_args(&argv)).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", argc), &frame, |b, frame| {
            b.iter(|| decode_args(decode_frame(black_box(frame)).unwrap().payload));
        });
    }

    group.finish();
}

#[cfg(not(unix))]
fn bench_frames(_c: &mut Criterion) {}

criterion_group!(benches, bench_manifest_lifecycle, bench_frames);
criterion_main!(benches);
