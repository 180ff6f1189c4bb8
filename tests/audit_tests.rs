//! Orphan audit orchestration against in-memory stores
use chrono::NaiveDate;
use global_upc::application::EngineSettings;
use global_upc::domain::events::AuditSummary;
use global_upc::domain::requests::{AuditRequest, OperationRequest};
use global_upc::domain::{
    BackendError, EngineError, FailureReason, HeaderJoin, OperationSummary, ProgressEvent,
    StoreId, UnitProgress, UnitStatus,
};
use global_upc::test_utils::{
    InMemoryBackend, InMemoryHistory, MemoryRow, TestContext, collect_events, collection,
    commerce_store, product, relational_store,
};
use std::sync::Arc;

const COLLECTIONS: [&str; 5] = [
    "InvoicesDetails_tbl",
    "PurchaseOrdersDetails_tbl",
    "QuotationsDetails_tbl",
    "ReturnsDetails_tbl",
    "TransfersDetails_tbl",
];

fn audit(store_id: i64) -> OperationRequest {
    OperationRequest::Audit(AuditRequest {
        store_id: StoreId(store_id),
        date_from: None,
        date_to: None,
    })
}

/// Five collections of four rows each; rows 3 and 4 hold unknown codes.
fn five_collection_backend() -> (global_upc::domain::Store, InMemoryBackend) {
    let store = relational_store(1, "Main Street");
    let mut backend = InMemoryBackend::for_store(&store)
        .with_products([product(1, "111", "Cola"), product(2, "222", "Chips")]);
    for (i, name) in COLLECTIONS.iter().enumerate() {
        let base = (i as i64) * 100;
        backend = backend.with_collection(
            collection(name),
            vec![
                MemoryRow::new(base + 1, "111"),
                MemoryRow::new(base + 2, "222"),
                MemoryRow::new(base + 3, "404").with_secondary_key("1"),
                MemoryRow::new(base + 4, "405").with_description("Chips"),
            ],
        );
    }
    (store, backend)
}

fn settings(window_size: u64, collection_concurrency: usize) -> EngineSettings {
    EngineSettings {
        window_size,
        collection_concurrency,
        ..EngineSettings::default()
    }
}

async fn run_audit(ctx: &TestContext) -> AuditSummary {
    match ctx.engine.execute(audit(1)).await.expect("audit completes") {
        OperationSummary::Audit(summary) => summary,
        other => panic!("unexpected summary {other:?}"),
    }
}

#[tokio::test]
async fn audit_finds_orphans_in_every_collection() {
    let (store, backend) = five_collection_backend();
    let ctx = TestContext::with_settings(
        vec![store],
        vec![Arc::new(backend)],
        settings(3, 2),
        InMemoryHistory::default(),
    );

    let summary = run_audit(&ctx).await;

    assert_eq!(summary.collections.len(), 5);
    assert_eq!(summary.total_orphans, 10);
    assert!(!summary.empty);
    for collection in &summary.collections {
        assert_eq!(collection.status, UnitStatus::Succeeded);
        assert_eq!(collection.records_checked, 4);
        assert_eq!(collection.orphaned_count, 2);
    }
    assert!(ctx.history.batches().is_empty());
}

#[tokio::test]
async fn audit_is_idempotent_without_intervening_updates() {
    let (store, backend) = five_collection_backend();
    let ctx = TestContext::with_settings(
        vec![store],
        vec![Arc::new(backend)],
        settings(2, 3),
        InMemoryHistory::default(),
    );

    let first = run_audit(&ctx).await;
    let second = run_audit(&ctx).await;
    assert_eq!(first.orphans, second.orphans);
    assert_eq!(first.collections, second.collections);
}

#[tokio::test]
async fn excluded_codes_never_surface() {
    let (store, backend) = five_collection_backend();
    let ctx = TestContext::new(vec![store], vec![Arc::new(backend)]);
    ctx.exclusions.exclude(StoreId(1), "404");

    let summary = run_audit(&ctx).await;

    assert_eq!(summary.total_orphans, 5);
    assert_eq!(summary.excluded, 5);
    assert!(summary.orphans.iter().all(|o| o.code != "404"));
    assert!(summary.collections.iter().all(|c| c.orphaned_count == 1));
}

#[tokio::test]
async fn clean_store_reports_an_explicit_empty_outcome() {
    let store = relational_store(1, "Main Street");
    let backend = InMemoryBackend::for_store(&store)
        .with_products([product(1, "111", "Cola")])
        .with_collection(collection("InvoicesDetails_tbl"), vec![MemoryRow::new(1, "111"), MemoryRow::new(2, " ")]);
    let ctx = TestContext::new(vec![store], vec![Arc::new(backend)]);

    let summary = run_audit(&ctx).await;
    assert!(summary.empty);
    assert_eq!(summary.total_orphans, 0);
    assert_eq!(summary.collections[0].total_records, 1);
}

#[tokio::test]
async fn cancelling_after_two_collections_keeps_only_their_results() {
    let (store, backend) = five_collection_backend();
    let backend = Arc::new(backend);
    let ctx = TestContext::with_settings(
        vec![store],
        vec![backend.clone()],
        settings(2, 1),
        InMemoryHistory::default(),
    );

    let (handle, receiver) = ctx.engine.launch(audit(1));
    backend.cancel_when_counting(COLLECTIONS[2], handle.cancellation_token());
    let events = collect_events(receiver).await;

    let Some(ProgressEvent::Failed {
        reason: FailureReason::Cancelled,
        partial: Some(OperationSummary::Audit(partial)),
        ..
    }) = events.last()
    else {
        panic!("expected a cancelled terminal event, got {:?}", events.last());
    };

    let finished: Vec<&str> = partial
        .collections
        .iter()
        .filter(|c| c.status == UnitStatus::Succeeded)
        .map(|c| c.collection.as_str())
        .collect();
    assert_eq!(finished, COLLECTIONS[..2].to_vec());
    for c in partial.collections.iter().skip(2) {
        assert_eq!(c.status, UnitStatus::Cancelled);
        assert_eq!(c.orphaned_count, 0);
        assert_eq!(c.records_checked, 0);
    }
    assert_eq!(partial.total_orphans, 4);
    assert!(partial.orphans.iter().all(|o| o.primary_key < 200));
    assert!(ctx.history.batches().is_empty());
}

#[tokio::test]
async fn failing_window_abandons_only_that_collection() {
    let (store, backend) = five_collection_backend();
    let backend = backend.failing_scan(COLLECTIONS[1], 1, BackendError::Query("deadlock victim".into()));
    let ctx = TestContext::with_settings(
        vec![store],
        vec![Arc::new(backend)],
        settings(2, 2),
        InMemoryHistory::default(),
    );

    let summary = run_audit(&ctx).await;

    let failed = &summary.collections[1];
    assert_eq!(failed.status, UnitStatus::Failed);
    assert_eq!(failed.records_checked, 2);
    assert_eq!(failed.orphaned_count, 0);
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("deadlock victim")));
    assert_eq!(summary.total_orphans, 8);
}

#[tokio::test]
async fn chunk_progress_reports_running_totals() {
    let (store, backend) = five_collection_backend();
    let ctx = TestContext::with_settings(
        vec![store],
        vec![Arc::new(backend)],
        settings(2, 1),
        InMemoryHistory::default(),
    );

    let (_, receiver) = ctx.engine.launch(audit(1));
    let events = collect_events(receiver).await;

    let ticks: Vec<(usize, u64, u64)> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::UnitProgress {
                unit,
                progress:
                    UnitProgress::ChunkProgress {
                        chunk,
                        records_checked,
                        running_total,
                        ..
                    },
            } if unit.collection.as_deref() == Some(COLLECTIONS[0]) => {
                Some((*chunk, *records_checked, *running_total))
            }
            _ => None,
        })
        .collect();
    assert_eq!(ticks, vec![(1, 2, 0), (2, 4, 2)]);
}

#[tokio::test]
async fn date_range_narrows_collections_with_a_header() {
    let store = relational_store(1, "Main Street");
    let day = |d| NaiveDate::from_ymd_opt(2024, 3, d).expect("valid date");
    let mut invoices = collection("InvoicesDetails_tbl");
    invoices.header = Some(HeaderJoin {
        collection: "Invoices_tbl".into(),
        foreign_key: "InvoiceID".into(),
        header_key: "InvoiceID".into(),
        date_field: "InvoiceDate".into(),
    });
    let backend = InMemoryBackend::for_store(&store).with_collection(
        invoices,
        vec![
            MemoryRow::new(1, "404").dated(day(1)),
            MemoryRow::new(2, "405").dated(day(10)),
            MemoryRow::new(3, "406").dated(day(20)),
        ],
    );
    let ctx = TestContext::new(vec![store], vec![Arc::new(backend)]);

    let summary = ctx
        .engine
        .execute(OperationRequest::Audit(AuditRequest {
            store_id: StoreId(1),
            date_from: Some(day(5)),
            date_to: Some(day(20)),
        }))
        .await
        .expect("audit completes");
    let OperationSummary::Audit(summary) = summary else {
        panic!("unexpected summary");
    };
    let codes: Vec<&str> = summary.orphans.iter().map(|o| o.code.as_str()).collect();
    assert_eq!(codes, vec!["405", "406"]);
}

#[tokio::test]
async fn inverted_date_range_is_rejected() {
    let (store, backend) = five_collection_backend();
    let ctx = TestContext::new(vec![store], vec![Arc::new(backend)]);
    let result = ctx
        .engine
        .execute(OperationRequest::Audit(AuditRequest {
            store_id: StoreId(1),
            date_from: NaiveDate::from_ymd_opt(2024, 5, 1),
            date_to: NaiveDate::from_ymd_opt(2024, 4, 1),
        }))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn audit_of_a_commerce_store_is_rejected() {
    let online = commerce_store(2, "Online");
    let backend = InMemoryBackend::for_store(&online);
    let ctx = TestContext::new(vec![online], vec![Arc::new(backend)]);
    let result = ctx.engine.execute(audit(2)).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn unknown_store_fails_the_operation() {
    let ctx = TestContext::new(Vec::new(), Vec::new());
    let (_, receiver) = ctx.engine.launch(audit(9));
    let events = collect_events(receiver).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ProgressEvent::Failed { .. }));
}
