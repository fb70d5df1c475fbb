use core::{hint::black_box, time::Duration};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::future::try_join_all;
use idgen::{
    BatchAllocator, HttpRemoteClient, IdentifierSource, IdentifierSourceService, IdentifierType,
    MemoryAuditLog, MemoryStore, PoolConfig, SequentialConfig, SourceId, SourceKind,
};
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;

const TOTAL_IDS: usize = 4096;

fn service() -> IdentifierSourceService {
    let allocator = BatchAllocator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryAuditLog::new()),
        Arc::new(HttpRemoteClient::new(Duration::from_secs(1)).unwrap()),
    );
    IdentifierSourceService::new(Arc::new(allocator))
}

fn save(service: &IdentifierSourceService, kind: SourceKind) -> SourceId {
    service
        .save_identifier_source(IdentifierSource::new(
            "bench",
            IdentifierType::new("MRN"),
            kind,
        ))
        .unwrap()
        .id
        .unwrap()
}

/// Sequential generator and a pool refilled from it.
fn sources(service: &IdentifierSourceService) -> (SourceId, SourceId) {
    let generator = save(
        service,
        SourceKind::Sequential(SequentialConfig::decimal("100000")),
    );
    let pool = save(
        service,
        SourceKind::Pool(PoolConfig {
            refill_source: Some(generator),
            refill_batch_size: 1000,
            min_pool_size: 100,
        }),
    );
    (generator, pool)
}

/// Single caller issuing batches of increasing size.
fn bench_batch_sizes(c: &mut Criterion, group_name: &str, pick: fn((SourceId, SourceId)) -> SourceId) {
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));
    let rt = Builder::new_current_thread().enable_all().build().unwrap();

    for batch in [1, 16, 256, TOTAL_IDS] {
        group.bench_function(format!("elems/{TOTAL_IDS}/batch/{batch}"), |b| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let service = service();
                let source = pick(sources(&service));
                let start = Instant::now();

                for _ in 0..iters {
                    for _ in 0..TOTAL_IDS / batch {
                        let ids = service.generate_identifiers(source, batch, "").await.unwrap();
                        black_box(ids);
                    }
                }

                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Many tasks drawing from the same source at once.
fn bench_contended(c: &mut Criterion, group_name: &str, pick: fn((SourceId, SourceId)) -> SourceId) {
    let mut group = c.benchmark_group(group_name);
    group.sample_size(10);
    group.sampling_mode(criterion::SamplingMode::Flat);
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for callers in [1, 4, 16, 64] {
        let per_caller = TOTAL_IDS / callers;
        group.bench_function(format!("elems/{TOTAL_IDS}/callers/{callers}"), |b| {
            b.to_async(&rt).iter_custom(move |iters| async move {
                let service = service();
                let source = pick(sources(&service));
                let start = Instant::now();

                for _ in 0..iters {
                    let tasks = (0..callers).map(|_| {
                        let service = service.clone();
                        tokio::spawn(async move {
                            for _ in 0..per_caller / 16 {
                                black_box(service.generate_identifiers(source, 16, "").await?);
                            }
                            Ok::<_, idgen::Error>(())
                        })
                    });
                    for result in try_join_all(tasks).await.unwrap() {
                        result.unwrap();
                    }
                }

                start.elapsed()
            });
        });
    }

    group.finish();
}

fn benchmark_sequential(c: &mut Criterion) {
    bench_batch_sizes(c, "sequential/batch", |(generator, _)| generator);
}

fn benchmark_pool(c: &mut Criterion) {
    bench_batch_sizes(c, "pool/batch", |(_, pool)| pool);
}

fn benchmark_sequential_contended(c: &mut Criterion) {
    bench_contended(c, "sequential/contended", |(generator, _)| generator);
}

fn benchmark_pool_contended(c: &mut Criterion) {
    bench_contended(c, "pool/contended", |(_, pool)| pool);
}

criterion_group!(
    benches,
    benchmark_sequential,
    benchmark_pool,
    benchmark_sequential_contended,
    benchmark_pool_contended,
);
criterion_main!(benches);
