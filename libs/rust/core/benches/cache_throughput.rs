use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use pso_core::{canonical_key, CacheEntry, Position, ResultCache};

fn position(i: usize) -> Position {
    [("X".to_string(), (i % 201) as f64 - 100.0), ("Y".to_string(), ((i / 201) % 201) as f64 * 2.0 - 200.0)].into_iter().collect()
}

fn bench_cache(c: &mut Criterion) {
    c.bench_function("canonical_key_2_params", |b| {
        let p = position(12_345);
        b.iter(|| { let _ = canonical_key(&p); })
    });

    c.bench_function("cache_upsert_1k", |b| {
        let velocity = position(0);
        b.iter_batched(
            || ResultCache::temporary().unwrap(),
            |cache| {
                for i in 0..1_000 {
                    cache.upsert(&CacheEntry::new(0, i % 30, &position(i), &velocity, i as f64)).unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });

    c.bench_function("cache_lookup_hit", |b| {
        let cache = ResultCache::temporary().unwrap();
        let velocity = position(0);
        for i in 0..10_000 {
            cache.upsert(&CacheEntry::new(0, i % 30, &position(i), &velocity, i as f64)).unwrap();
        }
        let key = canonical_key(&position(4_321));
        b.iter(|| { let _ = cache.lookup(&key).unwrap(); })
    });

    c.bench_function("cache_reserve_uncontended", |b| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cache = ResultCache::temporary().unwrap();
        let key = canonical_key(&position(7));
        b.to_async(&rt).iter(|| async { let _guard = cache.reserve(&key).await; })
    });
}

criterion_group!(name=cache; config=Criterion::default(); targets=bench_cache);
criterion_main!(cache);
