use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use weir_engine::builder::{MultiBuilder, Policy, Settings};
use weir_types::{DiagnosticCollector, SchemaRegistry};

fn precise_routing(c: &mut Criterion) {
    c.bench_function("multi_builder_precise_2k_rows", |b| {
        b.iter(|| {
            let dh = Arc::new(DiagnosticCollector::new());
            let registry = Arc::new(SchemaRegistry::new());
            let mut builder = MultiBuilder::new(
                Policy::Precise { seed_schema: None },
                Settings {
                    ordered: false,
                    timeout: Duration::from_secs(3600),
                    ..Settings::default()
                },
                dh,
                registry,
                Vec::new(),
            )
            .expect("builder");
            for i in 0..2_000i64 {
                let mut row = builder.record();
                row.field("n").data(i);
                if i % 2 == 0 {
                    row.field("tag").data_unparsed("10.0.0.1");
                }
            }
            criterion::black_box(builder.finalize())
        })
    });
}

fn merge_union(c: &mut Criterion) {
    c.bench_function("multi_builder_merge_2k_rows", |b| {
        b.iter(|| {
            let dh = Arc::new(DiagnosticCollector::new());
            let registry = Arc::new(SchemaRegistry::new());
            let mut builder = MultiBuilder::new(
                Policy::Merge { seed_schema: None, reset_on_yield: false },
                Settings {
                    timeout: Duration::from_secs(3600),
                    ..Settings::default()
                },
                dh,
                registry,
                Vec::new(),
            )
            .expect("builder");
            for i in 0..2_000i64 {
                let mut row = builder.record();
                row.field("n").data(i);
                row.field("msg").data_unparsed("connection established");
            }
            criterion::black_box(builder.finalize())
        })
    });
}

criterion_group!(benches, precise_routing, merge_union);
criterion_main!(benches);
