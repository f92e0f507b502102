use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pariksha::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn observation(i: usize) -> ValidationRequest {
    let record = Record::new(json!({
        "resourceType": "Observation",
        "id": format!("obs-{}", i),
        "status": "final",
        "meta": {"lastUpdated": "2024-03-01T10:00:00Z"},
        "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
        "subject": {"reference": "Patient/p1"},
        "valueQuantity": {"value": 72, "unit": "beats/minute"}
    }))
    .expect("valid record");
    ValidationRequest::new(record)
}

fn engine(cache: bool, parallel: bool) -> Arc<ValidationEngine> {
    let mut settings = ValidationSettings::default();
    settings.engine.cache_enabled = cache;
    settings.engine.parallel_aspects = parallel;
    settings.pipeline.cache_enabled = cache;
    Arc::new(ValidationEngine::new(Arc::new(StaticSettingsService::new(settings))))
}

fn bench_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_resource");
    let request = observation(0);

    for (name, parallel) in [("sequential", false), ("parallel", true)] {
        let engine = engine(false, parallel);
        group.bench_function(name, |b| {
            b.iter(|| engine.validate_resource(black_box(&request)))
        });
    }

    let cached = engine(true, true);
    group.bench_function("cached", |b| b.iter(|| cached.validate_resource(black_box(&request))));
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(20);

    for size in [10usize, 100] {
        let requests: Vec<_> = (0..size).map(observation).collect();
        let pipeline = ValidationPipeline::new(engine(false, true));
        group.bench_with_input(BenchmarkId::from_parameter(size), &requests, |b, requests| {
            b.iter(|| pipeline.execute_pipeline(requests.clone(), None, None))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single, bench_pipeline);
criterion_main!(benches);
