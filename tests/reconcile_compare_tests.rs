//! Reconciliation and cross-store comparison orchestration
use global_upc::application::EngineSettings;
use global_upc::domain::events::{ComparisonSummary, ReconciliationSummary};
use global_upc::domain::records::NOT_APPLICABLE;
use global_upc::domain::requests::{
    ComparisonRequest, OperationRequest, ReconciliationRequest, ReconciliationUpdateRequest,
};
use global_upc::domain::{
    BackendError, BatchKind, ComparisonFilters, EngineError, MatchStrategy, OperationSummary,
    OrphanRecord, ProgressEvent, ReferenceProduct, StoreId, UnitProgress,
};
use global_upc::test_utils::{
    InMemoryBackend, InMemoryHistory, MemoryRow, TestContext, collect_events, collection,
    commerce_store, product, relational_store,
};
use std::sync::Arc;

fn orphan(primary_key: i64, code: &str, secondary_key: Option<&str>, description: Option<&str>) -> OrphanRecord {
    OrphanRecord {
        store_id: StoreId(1),
        collection: "InvoicesDetails_tbl".into(),
        primary_key,
        code: code.into(),
        secondary_key: secondary_key.map(Into::into),
        description: description.map(Into::into),
    }
}

fn reconcile_fixture() -> (TestContext, Arc<InMemoryBackend>) {
    let store = relational_store(1, "Main Street");
    let backend = Arc::new(
        InMemoryBackend::for_store(&store)
            .with_products([product(7, "0007", "Cola 12oz"), product(8, "0008", "Chips")])
            .with_collection(
                collection("InvoicesDetails_tbl"),
                vec![
                    MemoryRow::new(1, "404").with_secondary_key("7"),
                    MemoryRow::new(2, "405").with_description("Chips"),
                    MemoryRow::new(3, "406"),
                ],
            ),
    );
    (TestContext::new(vec![store], vec![backend.clone()]), backend)
}

async fn reconcile(ctx: &TestContext, strategy: MatchStrategy, records: Vec<OrphanRecord>) -> ReconciliationSummary {
    let summary = ctx
        .engine
        .execute(OperationRequest::Reconciliation(ReconciliationRequest {
            store_id: StoreId(1),
            strategy,
            orphan_records: records,
        }))
        .await
        .expect("reconciliation completes");
    match summary {
        OperationSummary::Reconciliation(summary) => summary,
        other => panic!("unexpected summary {other:?}"),
    }
}

#[tokio::test]
async fn secondary_key_match_proposes_reference_codes() {
    let (ctx, _) = reconcile_fixture();
    let summary = reconcile(
        &ctx,
        MatchStrategy::SecondaryKey,
        vec![orphan(1, "404", Some("7"), None), orphan(3, "406", None, None), orphan(9, "409", Some("99"), None)],
    )
    .await;

    assert_eq!(summary.total, 3);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.unmatched, 2);
    assert_eq!(summary.candidates[0].replacement_code.as_deref(), Some("0007"));
    assert_eq!(summary.candidates[0].match_field_value, "7");
    assert!(!summary.candidates[1].match_found);
    assert_eq!(summary.candidates[1].match_field_value, NOT_APPLICABLE);
    assert_eq!(summary.candidates[2].match_field_value, "99");
    assert!(summary.candidates[2].replacement_code.is_none());
}

#[tokio::test]
async fn description_match_is_exact() {
    let (ctx, _) = reconcile_fixture();
    let summary = reconcile(
        &ctx,
        MatchStrategy::Description,
        vec![orphan(2, "405", None, Some("Chips")), orphan(4, "410", None, Some("chips")), orphan(5, "411", None, None)],
    )
    .await;

    assert_eq!(summary.matched, 1);
    assert_eq!(summary.candidates[0].replacement_code.as_deref(), Some("0008"));
    assert!(!summary.candidates[1].match_found);
    assert_eq!(summary.candidates[2].match_field_value, NOT_APPLICABLE);
}

#[tokio::test]
async fn reconciliation_reports_each_record_checked() {
    let (ctx, _) = reconcile_fixture();
    let (_, receiver) = ctx.engine.launch(OperationRequest::Reconciliation(ReconciliationRequest {
        store_id: StoreId(1),
        strategy: MatchStrategy::SecondaryKey,
        orphan_records: vec![orphan(1, "404", Some("7"), None), orphan(3, "406", None, None)],
    }));
    let events = collect_events(receiver).await;

    let checked: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::UnitProgress {
                progress: UnitProgress::Checked { current, total, .. },
                ..
            } => {
                assert_eq!(*total, 2);
                Some(*current)
            }
            _ => None,
        })
        .collect();
    assert_eq!(checked, vec![1, 2]);
}

#[tokio::test]
async fn records_from_another_store_are_rejected() {
    let (ctx, _) = reconcile_fixture();
    let mut foreign = orphan(1, "404", Some("7"), None);
    foreign.store_id = StoreId(2);
    let result = ctx
        .engine
        .execute(OperationRequest::Reconciliation(ReconciliationRequest {
            store_id: StoreId(1),
            strategy: MatchStrategy::SecondaryKey,
            orphan_records: vec![foreign],
        }))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn approved_candidates_are_applied_and_recorded() {
    let (ctx, backend) = reconcile_fixture();
    let matched = reconcile(
        &ctx,
        MatchStrategy::SecondaryKey,
        vec![orphan(1, "404", Some("7"), None)],
    )
    .await;
    let mut approved: Vec<_> = matched.candidates.iter().filter_map(|c| c.approve()).collect();
    approved.push(global_upc::domain::RowReplacement {
        collection: "InvoicesDetails_tbl".into(),
        primary_key: 2,
        orphaned_code: "stale".into(),
        replacement_code: "0008".into(),
    });

    let summary = ctx
        .engine
        .execute(OperationRequest::ReconciliationUpdate(ReconciliationUpdateRequest {
            store_id: StoreId(1),
            approved_candidates: approved,
        }))
        .await
        .expect("update completes");
    let OperationSummary::ReconciliationUpdate(summary) = summary else {
        panic!("unexpected summary {summary:?}");
    };

    assert_eq!(summary.total_updated, 1);
    assert!(summary.results[0].success);
    assert!(!summary.results[1].success);
    assert!(!summary.outcome.success);
    assert!(summary.history_recorded);
    assert_eq!(backend.row_code("InvoicesDetails_tbl", 1).as_deref(), Some("0007"));
    assert_eq!(backend.row_code("InvoicesDetails_tbl", 2).as_deref(), Some("405"));

    let batches = ctx.history.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].kind, BatchKind::Reconciliation { store_id: StoreId(1), rows: 2 });
    assert_eq!(batches[0].total_updated, 1);
    assert_eq!(Some(batches[0].batch_id), summary.batch_id);
}

#[tokio::test]
async fn history_failure_does_not_change_outcomes() {
    let store = relational_store(1, "Main Street");
    let backend = InMemoryBackend::for_store(&store)
        .with_collection(collection("InvoicesDetails_tbl"), vec![MemoryRow::new(1, "404")]);
    let ctx = TestContext::with_settings(
        vec![store],
        vec![Arc::new(backend)],
        EngineSettings::default(),
        InMemoryHistory::unavailable(),
    );

    let summary = ctx
        .engine
        .execute(OperationRequest::ReconciliationUpdate(ReconciliationUpdateRequest {
            store_id: StoreId(1),
            approved_candidates: vec![global_upc::domain::RowReplacement {
                collection: "InvoicesDetails_tbl".into(),
                primary_key: 1,
                orphaned_code: "404".into(),
                replacement_code: "0007".into(),
            }],
        }))
        .await
        .expect("update completes");
    let OperationSummary::ReconciliationUpdate(summary) = summary else {
        panic!("unexpected summary");
    };
    assert!(summary.outcome.success);
    assert_eq!(summary.total_updated, 1);
    assert!(!summary.history_recorded);
}

#[tokio::test]
async fn cancelled_reconciliation_update_touches_no_row_and_has_no_batch() {
    let (ctx, backend) = reconcile_fixture();
    let (handle, receiver) = ctx
        .engine
        .launch(OperationRequest::ReconciliationUpdate(ReconciliationUpdateRequest {
            store_id: StoreId(1),
            approved_candidates: vec![global_upc::domain::RowReplacement {
                collection: "InvoicesDetails_tbl".into(),
                primary_key: 1,
                orphaned_code: "404".into(),
                replacement_code: "0007".into(),
            }],
        }));
    handle.cancel();
    let events = collect_events(receiver).await;

    let Some(ProgressEvent::Failed {
        partial: Some(OperationSummary::ReconciliationUpdate(summary)),
        ..
    }) = events.last()
    else {
        panic!("expected a cancelled reconciliation update, got {:?}", events.last());
    };
    assert_eq!(summary.batch_id, None);
    assert!(summary.results.is_empty());
    assert!(!summary.history_recorded);
    assert!(ctx.history.batches().is_empty());
    assert_eq!(backend.row_code("InvoicesDetails_tbl", 1).as_deref(), Some("404"));
}

fn numbered_products(count: i64, missing_every: i64) -> Vec<ReferenceProduct> {
    (1..=count)
        .map(|i| ReferenceProduct {
            primary_key: i,
            code: format!("{i:06}"),
            description: Some(format!("Product {i}")),
            category_id: if i % missing_every == 0 { Some(i % 3) } else { None },
            subcategory_id: None,
            discontinued: false,
        })
        .collect()
}

fn comparison_fixture(ceiling: usize) -> (TestContext, Arc<InMemoryBackend>) {
    let primary = relational_store(1, "Main Street");
    let other = relational_store(2, "Harbor");
    let products = numbered_products(500, 40);
    // every 40th product is absent from the comparison store: 12 of 500
    let present: Vec<ReferenceProduct> = products
        .iter()
        .filter(|p| p.primary_key % 40 != 0)
        .cloned()
        .collect();

    let primary_backend = Arc::new(InMemoryBackend::for_store(&primary).with_products(products));
    let comparison_backend = Arc::new(
        InMemoryBackend::for_store(&other)
            .with_products(present)
            .with_ceiling(ceiling),
    );
    let ctx = TestContext::with_settings(
        vec![primary, other],
        vec![primary_backend, comparison_backend.clone()],
        EngineSettings {
            window_size: 200,
            ..EngineSettings::default()
        },
        InMemoryHistory::default(),
    );
    (ctx, comparison_backend)
}

fn compare_request() -> OperationRequest {
    OperationRequest::Comparison(ComparisonRequest {
        primary_store_id: StoreId(1),
        comparison_store_id: StoreId(2),
        filters: ComparisonFilters::default(),
    })
}

#[tokio::test]
async fn comparison_reports_missing_products_per_window() {
    let (ctx, _) = comparison_fixture(2000);
    let (_, receiver) = ctx.engine.launch(compare_request());
    let events = collect_events(receiver).await;

    let ticks = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ProgressEvent::UnitProgress {
                    progress: UnitProgress::ChunkProgress { .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(ticks, 3);

    let Some(ProgressEvent::Complete {
        summary: OperationSummary::Comparison(summary),
    }) = events.last()
    else {
        panic!("expected completion, got {:?}", events.last());
    };
    assert_eq!(summary.total_missing, 12);
    assert_eq!(summary.total_checked, 500);
    assert_eq!(summary.gaps.len(), 12);
    assert_eq!(summary.category_breakdown.values().sum::<u64>(), 12);
}

#[tokio::test]
async fn existence_checks_respect_the_parameter_ceiling() {
    let (ctx, comparison) = comparison_fixture(64);
    let summary = ctx.engine.execute(compare_request()).await.expect("comparison completes");
    let OperationSummary::Comparison(ComparisonSummary { total_missing, .. }) = summary else {
        panic!("unexpected summary");
    };
    assert_eq!(total_missing, 12);

    let batches = comparison.existence_batches();
    assert!(batches.iter().all(|&size| size <= 64));
    assert_eq!(batches.iter().sum::<usize>(), 500);
}

#[tokio::test]
async fn comparison_failure_keeps_the_windows_already_checked() {
    let primary = relational_store(1, "Main Street");
    let online = commerce_store(2, "Online");
    let primary_backend = Arc::new(InMemoryBackend::for_store(&primary).with_products(numbered_products(10, 2)));
    let commerce = Arc::new(
        InMemoryBackend::for_store(&online).failing_existence(BackendError::Connectivity("throttled".into())),
    );
    let ctx = TestContext::new(vec![primary, online], vec![primary_backend, commerce]);

    let summary = ctx.engine.execute(compare_request()).await.expect("comparison completes");
    let OperationSummary::Comparison(summary) = summary else {
        panic!("unexpected summary");
    };
    assert_eq!(summary.total_checked, 0);
    assert!(summary.error.as_deref().is_some_and(|e| e.contains("throttled")));
}

#[tokio::test]
async fn comparing_a_store_with_itself_is_rejected() {
    let (ctx, _) = comparison_fixture(2000);
    let result = ctx
        .engine
        .execute(OperationRequest::Comparison(ComparisonRequest {
            primary_store_id: StoreId(1),
            comparison_store_id: StoreId(1),
            filters: ComparisonFilters::default(),
        }))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}
