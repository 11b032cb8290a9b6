// ============================================================================
// spark-query - Reconciliation Benchmarks
// ============================================================================

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use spark_query::{
    hash_key, query_key, DefaultOptions, Enabled, FetchError, MergedOptions, Query, QueryClient,
    QueryConfig, QueryKey, QueryOptions,
};

fn bench_hash_key(c: &mut Criterion) {
    let key = query_key!["todos", 42, {"archived": false, "tags": ["a", "b", "c"]}];

    c.bench_function("hash_key/structural", |b| {
        b.iter(|| hash_key(black_box(&key)))
    });
}

fn bench_merge_layers(c: &mut Criterion) {
    let defaults = DefaultOptions::default();
    let base = QueryOptions {
        enabled: Some(Enabled::Fixed(true)),
        stale_time_ms: Some(5_000),
        ..Default::default()
    };
    let dynamic = QueryOptions {
        stale_time_ms: Some(10_000),
        ..Default::default()
    };
    let patch = QueryOptions {
        enabled: Some(Enabled::Fixed(false)),
        ..Default::default()
    };
    let key: QueryKey = query_key!["merge"];

    let layers = [&base, &dynamic, &patch];
    c.bench_function("options/merge_three_layers", |b| {
        b.iter(|| {
            let merged = MergedOptions::merge(black_box(&defaults), black_box(&layers[..]));
            merged.into_resolved(key.clone(), hash_key(&key), true)
        })
    });
}

fn bench_reconcile_pass(c: &mut Criterion) {
    let client = QueryClient::new();
    let query = Query::new(QueryConfig::new(client, query_key!["bench"], |_key| {
        Ok::<_, FetchError>(0u64)
    }));

    let patch = QueryOptions {
        stale_time_ms: Some(1_000),
        ..Default::default()
    };

    c.bench_function("reconciler/update_pass", |b| {
        b.iter(|| query.update(black_box(patch.clone())))
    });
}

criterion_group!(benches, bench_hash_key, bench_merge_layers, bench_reconcile_pass);
criterion_main!(benches);
