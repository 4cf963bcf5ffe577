//! Config Cache & Evaluator Performance Benchmarks

use async_trait::async_trait;
use cf_client::cache::{ConfigCache, ConfigMap, ExposureSink, FlagMetadata, FlagRecord};
use cf_client::storage::InMemoryStore;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

struct NullSink;

#[async_trait]
impl ExposureSink for NullSink {
    async fn push_summary(&self, _key: &str, _metadata: &FlagMetadata) {}
}

fn sample_map(n: usize) -> ConfigMap {
    let mut map = ConfigMap::new();
    for i in 0..n {
        let record = FlagRecord::from_json(&serde_json::json!({
            "variation": i % 2 == 0,
            "config_id": "c1",
            "variation_id": "v1",
            "experience_id": format!("e{i}"),
            "version": "1",
        }));
        map.insert(format!("flag_{i}"), record);
    }
    map
}

fn bench_get_bool(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let cache = Arc::new(ConfigCache::new(Arc::new(NullSink), Arc::new(InMemoryStore::new())));
    runtime.block_on(cache.replace(sample_map(1000)));

    c.bench_function("get_bool_hit", |b| {
        b.iter(|| {
            runtime.block_on(async { black_box(cache.get_bool("flag_500", false).await) })
        });
    });
}

fn bench_replace(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let cache = Arc::new(ConfigCache::new(Arc::new(NullSink), Arc::new(InMemoryStore::new())));
    let map = sample_map(1000);

    c.bench_function("replace_1000_flags", |b| {
        b.iter(|| {
            runtime.block_on(cache.replace(black_box(map.clone())));
        });
    });
}

criterion_group!(benches, bench_get_bool, bench_replace);
criterion_main!(benches);
