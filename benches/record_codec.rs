//! Benchmarks for record encoding, decoding, medium scans and key patterns

use cfstore::core::record;
use cfstore::core::recovery;
use cfstore::{Acl, Ddsp, KeyName, KeyPattern, Permissions, Record};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn sample(len: usize) -> Record {
    Record::new(
        KeyName::new("com.arm.mbed.wifi.accesspoint[5].essid").unwrap(),
        vec![0xA5; len],
        1,
        Permissions::new(Acl::OWNER_RW, Ddsp::empty()),
    )
}

fn benchmark_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_encode");

    for size in [16, 512, 4096].iter() {
        let rec = sample(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(rec.encode()));
        });
    }

    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_decode");

    for size in [16, 512, 4096].iter() {
        let bytes = sample(*size).encode();
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(record::decode(black_box(&bytes))));
        });
    }

    group.finish();
}

fn benchmark_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery_scan");

    for count in [16, 256].iter() {
        // Back-to-back records followed by erased space
        let mut image = Vec::new();
        for i in 0..*count {
            let rec = Record::new(
                KeyName::new(format!("app.key{}", i)).unwrap(),
                vec![i as u8; 40],
                1,
                Permissions::new(Acl::OWNER_RW, Ddsp::empty()),
            );
            image.extend_from_slice(&rec.encode());
        }
        image.resize(image.len() * 2, 0xFF);

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let report = recovery::scan(black_box(&image));
                black_box(recovery::plan(&report))
            });
        });
    }

    group.finish();
}

fn benchmark_pattern_match(c: &mut Criterion) {
    let keys: Vec<String> = (0..1000)
        .map(|i| format!("com.arm.dev{}.wifi[{}].essid", i % 37, i))
        .collect();
    let patterns = ["com.arm.*", "com.*.essid", "com.arm.dev3.wifi[*]"];

    c.bench_function("pattern_match", |b| {
        let parsed: Vec<KeyPattern> = patterns.iter().map(|p| KeyPattern::parse(p).unwrap()).collect();
        b.iter(|| {
            let mut hits = 0;
            for pattern in &parsed {
                hits += keys.iter().filter(|k| pattern.matches(k)).count();
            }
            black_box(hits)
        });
    });
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_decode,
    benchmark_scan,
    benchmark_pattern_match
);
criterion_main!(benches);
