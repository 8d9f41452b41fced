use criterion::{black_box, criterion_group, criterion_main, Criterion};
use telemetron::codec;
use telemetron::metric::wire::{decode_batch, encode_batch};
use telemetron::metric::{Metric, MetricBatch};
use telemetron::storage::memory::MemStorage;
use telemetron::storage::Storage;

/// One report's worth of metrics: gauges for a 16-core host plus PollCount.
fn report_batch() -> MetricBatch {
    let mut batch: MetricBatch = [
        "VmRSS",
        "VmSize",
        "VmHWM",
        "Threads",
        "VoluntaryCtxSwitches",
        "TotalMemory",
        "FreeMemory",
        "RandomValue",
    ]
    .iter()
    .enumerate()
    .map(|(i, name)| Metric::gauge(*name, 1_048_576.0 * i as f64))
    .collect();

    for core in 1..=16 {
        batch.push(Metric::gauge(format!("CPUutilization{core}"), 12.5));
    }
    batch.push(Metric::counter("PollCount", 5));

    batch
}

fn bench_wire(c: &mut Criterion) {
    let batch = report_batch();
    let json = encode_batch(&batch).expect("encode");
    let gz = codec::gzip_compress(&json).expect("gzip");

    c.bench_function("wire/encode_batch", |b| {
        b.iter(|| encode_batch(black_box(&batch)).expect("encode"))
    });

    c.bench_function("wire/decode_batch", |b| {
        b.iter(|| decode_batch(black_box(&json)).expect("decode"))
    });

    c.bench_function("codec/gunzip_batch", |b| {
        b.iter(|| codec::gzip_decompress(black_box(&gz)).expect("gunzip"))
    });

    c.bench_function("codec/sign_batch", |b| {
        b.iter(|| codec::sign("bench-key", black_box(&json)).expect("sign"))
    });
}

fn bench_memory_store(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let store = MemStorage::new();
    let batch = report_batch();

    c.bench_function("memory/add_batch", |b| {
        b.iter(|| {
            rt.block_on(store.add_batch(black_box(&batch)))
                .expect("add_batch")
        })
    });

    c.bench_function("memory/list", |b| {
        b.iter(|| black_box(rt.block_on(store.list()).expect("list").len()))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_wire(c);
    bench_memory_store(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
