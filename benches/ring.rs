use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use logring::{Field, Level, Record, RingCore, RingStore, Sink};
use std::{thread, time::Duration};

// Capacity of rings used in benchmarks.
const CAPACITY: usize = 16 * 1024 * 1024;

// Size of a single write, roughly one log line.
const PAYLOAD_SIZE: usize = 128;

// Number of writes per benchmark iteration.
const BATCH_SIZE: usize = 1024;

criterion_main!(benches);
criterion_group! {
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(3))
        .measurement_time(Duration::from_secs(15));
    targets = write_bench, contended_bench, drain_bench, core_bench
}

fn write_bench(c: &mut Criterion) {
    let ring = RingStore::with_capacity(CAPACITY).expect("Capacity is > 0");
    let payload = [b'x'; PAYLOAD_SIZE];

    let mut group = c.benchmark_group("Write");
    group.throughput(Throughput::Bytes((PAYLOAD_SIZE * BATCH_SIZE) as u64));
    group.bench_function("single_writer", |b| {
        b.iter(|| {
            for _ in 0..BATCH_SIZE {
                ring.write(&payload).expect("Ring is open");
            }
        })
    });
    group.finish();
}

fn contended_bench(c: &mut Criterion) {
    let ring = RingStore::with_capacity(CAPACITY).expect("Capacity is > 0");
    let threads = 4;

    let mut group = c.benchmark_group("Write");
    group.throughput(Throughput::Bytes((PAYLOAD_SIZE * BATCH_SIZE * threads) as u64));
    group.bench_function("four_writers", |b| {
        b.iter(|| {
            thread::scope(|scope| {
                for _ in 0..threads {
                    scope.spawn(|| {
                        let payload = [b'y'; PAYLOAD_SIZE];
                        for _ in 0..BATCH_SIZE {
                            ring.write(&payload).expect("Ring is open");
                        }
                    });
                }
            })
        })
    });
    group.finish();
}

fn drain_bench(c: &mut Criterion) {
    let ring = RingStore::with_capacity(CAPACITY).expect("Capacity is > 0");
    let payload = [b'z'; PAYLOAD_SIZE];
    for _ in 0..(CAPACITY / PAYLOAD_SIZE) {
        ring.write(&payload).expect("Ring is open");
    }

    let mut out = Vec::with_capacity(CAPACITY);
    let mut group = c.benchmark_group("Drain");
    group.throughput(Throughput::Bytes(CAPACITY as u64));
    group.bench_function("full_ring", |b| {
        b.iter_batched(
            || ring.register_reader(),
            |mut reader| {
                out.clear();
                ring.drain(&mut reader, &mut out).expect("Nothing is written");
                ring.unregister_reader(reader);
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn core_bench(c: &mut Criterion) {
    let core = RingCore::new(CAPACITY).expect("Capacity is > 0");
    let core = core.with(&[Field::new("service", "bench")]);
    let fields = [Field::new("attempt", 3u64), Field::new("path", "/index")];

    let mut group = c.benchmark_group("Core");
    group.throughput(Throughput::Elements(BATCH_SIZE as u64));
    group.bench_function("json_records", |b| {
        b.iter(|| {
            for _ in 0..BATCH_SIZE {
                let record = Record::new(Level::INFO, "bench", "request served");
                core.write(&record, &fields).expect("Discard never fails");
            }
        })
    });
    group.finish();
}
