use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use batchforge_core::{Args, Inputs, assemble, content_hash};

fn rows(len: usize) -> Vec<Args> {
    (0..len)
        .map(|i| {
            let mut row = Args::new();
            row.insert("city".to_string(), json!(format!("city-{i}")));
            row.insert("population".to_string(), json!(i * 1_000));
            row
        })
        .collect()
}

fn bench_assemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("assemble");
    for len in [100usize, 1_000, 10_000] {
        let inputs = Inputs::new()
            .data(rows(len))
            .parallel("region", (0..len).map(|i| format!("r{}", i % 7)))
            .arg("n", 3)
            .arg("model", "small");

        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &inputs, |b, inputs| {
            b.iter(|| assemble(black_box(inputs)).unwrap())
        });
    }
    group.finish();
}

fn bench_content_hash(c: &mut Criterion) {
    let records = assemble(&Inputs::new().data(rows(1_000)).arg("n", 3)).unwrap();
    c.bench_function("content_hash/1000", |b| {
        b.iter(|| {
            for record in &records {
                black_box(content_hash(record));
            }
        })
    });
}

criterion_group!(benches, bench_assemble, bench_content_hash);
criterion_main!(benches);
