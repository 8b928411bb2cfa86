//! Transfer cost of the three channel kinds.
//!
//! Measures one store plus one read of the same value for payload sizes
//! from a small telemetry record up to a full 4K RGB frame.
//!
//! Run with:
//! ```bash
//! cargo bench --bench transfer
//! ```

#![allow(clippy::expect_used)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use flatshm::{FlatPayload, HandoffChannel, Image4kRgb, MutexChannel, SeqLockChannel};
use std::hint::black_box;

fn bench_name(kind: &str) -> String {
    format!("flatshm_bench_{kind}_{}", std::process::id())
}

fn bench_kind<T: FlatPayload>(c: &mut Criterion, label: &str) {
    let mut group = c.benchmark_group("transfer");
    group.throughput(Throughput::Bytes(T::SIZE as u64));
    if T::SIZE > 1 << 20 {
        group.sample_size(10);
    }

    let value = flatshm::payload::zeroed_box::<T>();
    let mut out = flatshm::payload::zeroed_box::<T>();

    {
        let mut channel =
            MutexChannel::<T>::create(&bench_name(&format!("mutex_{label}"))).expect("create mutex");
        group.bench_function(BenchmarkId::new("mutex_snapshot", label), |b| {
            b.iter(|| {
                channel.store(&value).expect("store");
                let handle = channel.load();
                assert!(handle.wait_snapshot());
                handle.copy_into(&mut out);
            });
        });
        channel.close().expect("close mutex");
    }

    {
        let channel =
            HandoffChannel::<T>::create(&bench_name(&format!("handoff_{label}"))).expect("create handoff");
        group.bench_function(BenchmarkId::new("handoff", label), |b| {
            b.iter(|| {
                channel.produce(&value).expect("produce");
                channel.consume_into(&mut out).expect("consume");
            });
        });
        channel.close().expect("close handoff");
    }

    {
        let channel =
            SeqLockChannel::<T>::create(&bench_name(&format!("seqlock_{label}"))).expect("create seqlock");
        group.bench_function(BenchmarkId::new("seqlock", label), |b| {
            b.iter(|| {
                channel.store(&value);
                channel.load_into(&mut out);
            });
        });
        channel.close().expect("close seqlock");
    }

    black_box(&out);
    group.finish();
}

fn bench_transfer(c: &mut Criterion) {
    bench_kind::<[u64; 8]>(c, "64B");
    bench_kind::<[u64; 8192]>(c, "64KiB");
    bench_kind::<Image4kRgb>(c, "4K_RGB");
}

criterion_group!(benches, bench_transfer);
criterion_main!(benches);
