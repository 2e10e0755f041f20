//! Submission-to-completion throughput across worker counts.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use millrace_engine::{Dispatcher, PoolConfig};

fn bench_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_throughput");
    for workers in [1usize, 2, 4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(workers),
            &workers,
            |b, &workers| {
                let config = PoolConfig {
                    worker_count: workers,
                    queue_capacity: 0,
                    ..Default::default()
                };
                let dispatcher: Dispatcher<u64> = Dispatcher::new(config).unwrap();
                dispatcher.start().unwrap();
                b.iter(|| {
                    let handles: Vec<_> = (0..100u64)
                        .map(|i| dispatcher.submit(move |_| Ok(i.wrapping_mul(31))).unwrap())
                        .collect();
                    for handle in handles {
                        handle.wait().unwrap();
                    }
                });
                dispatcher.shutdown(true).unwrap();
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_throughput);
criterion_main!(benches);
