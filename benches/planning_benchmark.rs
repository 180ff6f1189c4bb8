//! Scan planning and in-memory audit throughput
//!
//! Window planning and parameter batching run once per window of every
//! audit and comparison, so they must stay negligible next to the queries.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use global_upc::application::EngineSettings;
use global_upc::domain::requests::{AuditRequest, OperationRequest};
use global_upc::domain::{ParameterBatcher, StoreId, WindowPlan};
use global_upc::test_utils::{
    InMemoryBackend, InMemoryHistory, MemoryRow, TestContext, collection, product, relational_store,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn window_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_plan");
    for total in [10_000u64, 1_000_000, 50_000_000] {
        group.bench_with_input(BenchmarkId::from_parameter(total), &total, |b, &total| {
            b.iter(|| {
                let plan = WindowPlan::new(black_box(total), 5000);
                plan.windows().map(|w| w.limit).sum::<u64>()
            })
        });
    }
    group.finish();
}

fn parameter_batching(c: &mut Criterion) {
    let codes: Vec<String> = (0..100_000).map(|i| format!("{i:012}")).collect();
    let mut group = c.benchmark_group("parameter_batcher");
    for ceiling in [250usize, 2000, 65_527] {
        let batcher = ParameterBatcher::new(ceiling);
        group.bench_with_input(BenchmarkId::from_parameter(ceiling), &batcher, |b, batcher| {
            b.iter(|| batcher.split(black_box(&codes)).map(<[String]>::len).sum::<usize>())
        });
    }
    group.finish();
}

fn in_memory_audit(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let store = relational_store(1, "Bench");
    let rows: Vec<MemoryRow> = (1..=20_000)
        .map(|i| MemoryRow::new(i, if i % 97 == 0 { "missing" } else { "000001" }))
        .collect();
    let backend = InMemoryBackend::for_store(&store)
        .with_products([product(1, "000001", "Cola")])
        .with_collection(collection("InvoicesDetails_tbl"), rows);
    let ctx = TestContext::with_settings(
        vec![store],
        vec![Arc::new(backend)],
        EngineSettings {
            window_size: 2000,
            ..EngineSettings::default()
        },
        InMemoryHistory::default(),
    );

    c.bench_function("audit_20k_rows", |b| {
        b.iter(|| {
            rt.block_on(ctx.engine.execute(OperationRequest::Audit(AuditRequest {
                store_id: StoreId(1),
                date_from: None,
                date_to: None,
            })))
        })
    });
}

criterion_group!(benches, window_planning, parameter_batching, in_memory_audit);
criterion_main!(benches);
