//! Benchmarks for the instrument registry and field extraction
//!
//! Target: 10K object updates/sec per exporter

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use object_exporter_operator::crd::{InstrumentSpec, InstrumentType, UnitAggregation};
use object_exporter_operator::domain::{ConfigId, ObjectKey};
use object_exporter_operator::extraction::{CompiledInstrument, Sample};
use object_exporter_operator::instruments::{InstrumentKind, InstrumentRegistry, LabelSet};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn sample(team: &str, value: f64) -> Sample {
    let mut labels = LabelSet::new();
    labels.insert("team".to_string(), team.to_string());
    Sample { value, labels }
}

fn bench_apply_objects(c: &mut Criterion) {
    let mut group = c.benchmark_group("instrument_registry");
    group.throughput(Throughput::Elements(1));

    let registry = InstrumentRegistry::new();
    let config = ConfigId::new("monitoring", "deployments");
    let epoch = registry.attach(&config);

    group.bench_function("apply_object", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = ObjectKey::new(Some("shop"), format!("web-{}", counter % 1000));
            let version = counter.to_string();
            let samples = vec![
                ("deployment_replicas".to_string(), InstrumentKind::gauge(), sample("core", 3.0)),
                (
                    "deployment_count".to_string(),
                    InstrumentKind::counter(UnitAggregation::Total),
                    sample("core", 1.0),
                ),
            ];
            let _ = registry.apply_object(black_box(&config), epoch, &key, Some(&version), samples);
        });
    });

    group.finish();
}

fn bench_families(c: &mut Criterion) {
    let mut group = c.benchmark_group("instrument_registry");

    let registry = InstrumentRegistry::new();
    for exporter in 0..10 {
        let config = ConfigId::new("monitoring", format!("exporter-{}", exporter));
        let epoch = registry.attach(&config);
        for i in 0..1000 {
            let key = ObjectKey::new(Some("shop"), format!("web-{}", i));
            let mut s = sample("core", i as f64);
            s.labels.insert("name".to_string(), key.name.clone());
            let samples = vec![("deployment_replicas".to_string(), InstrumentKind::gauge(), s)];
            let _ = registry.apply_object(&config, epoch, &key, Some("1"), samples);
        }
    }
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("families_10k_series", |b| {
        b.iter(|| black_box(registry.families()));
    });

    group.finish();
}

fn bench_concurrent_applies(c: &mut Criterion) {
    let mut group = c.benchmark_group("instrument_registry");
    group.throughput(Throughput::Elements(100));

    let registry = Arc::new(InstrumentRegistry::new());
    let configs: Vec<(ConfigId, u64)> = (0..4)
        .map(|i| {
            let config = ConfigId::new("monitoring", format!("exporter-{}", i));
            let epoch = registry.attach(&config);
            (config, epoch)
        })
        .collect();

    group.bench_function("concurrent_apply_4_exporters", |b| {
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            std::thread::scope(|scope| {
                for (config, epoch) in &configs {
                    let registry = &registry;
                    scope.spawn(move || {
                        for i in 0..25 {
                            let key = ObjectKey::new(Some("shop"), format!("web-{}", i));
                            let version = format!("{}-{}", round, i);
                            let samples = vec![(
                                "deployment_replicas".to_string(),
                                InstrumentKind::gauge(),
                                sample("core", round as f64),
                            )];
                            let _ = registry.apply_object(config, *epoch, &key, Some(&version), samples);
                        }
                    });
                }
            });
        });
    });

    group.finish();
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extraction");
    group.throughput(Throughput::Elements(1));

    let mut labels = BTreeMap::new();
    labels.insert("team".to_string(), ".metadata.labels.team".to_string());
    labels.insert("image".to_string(), ".spec.template.spec.containers[0].image".to_string());
    let spec = InstrumentSpec {
        name: "deployment_replicas".to_string(),
        unit: None,
        r#type: InstrumentType::Gauge,
        value_json_path: Some(".status.replicas".to_string()),
        additional_labels_from_fields: labels,
    };
    let instrument = match CompiledInstrument::compile(&spec) {
        Ok(instrument) => instrument,
        Err(e) => panic!("benchmark instrument failed to compile: {}", e),
    };
    let object = json!({
        "metadata": { "name": "web", "namespace": "shop", "labels": { "team": "core" } },
        "spec": { "template": { "spec": { "containers": [{ "image": "nginx:1.25" }] } } },
        "status": { "replicas": 3 }
    });

    group.bench_function("extract_value_and_labels", |b| {
        b.iter(|| black_box(instrument.extract(black_box(&object))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_apply_objects,
    bench_families,
    bench_concurrent_applies,
    bench_extract,
);
criterion_main!(benches);
