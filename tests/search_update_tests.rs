//! Search and update orchestration against in-memory stores
use global_upc::domain::events::{SearchSummary, UpdateSummary};
use global_upc::domain::requests::{OperationRequest, SearchRequest, UpdateRequest};
use global_upc::domain::{
    BackendError, BatchKind, EngineError, FailureReason, OperationSummary, ProgressEvent, UnitStatus,
};
use global_upc::test_utils::{
    InMemoryBackend, MemoryRow, TestContext, collect_events, collection, commerce_store, product,
    relational_store,
};
use std::sync::Arc;

fn two_store_fixture() -> (TestContext, Arc<InMemoryBackend>, Arc<InMemoryBackend>) {
    let main = relational_store(1, "Main Street");
    let online = commerce_store(2, "Online");

    let relational = Arc::new(
        InMemoryBackend::for_store(&main)
            .with_products([product(10, "012345", "Cola 12oz")])
            .with_collection(
                collection("InvoicesDetails_tbl"),
                vec![MemoryRow::new(1, "012345"), MemoryRow::new(2, "099999"), MemoryRow::new(3, "012345")],
            ),
    );
    let commerce = Arc::new(InMemoryBackend::for_store(&online).with_variant("p1", "Cola", "v1", "012345"));

    let ctx = TestContext::new(vec![main, online], vec![relational.clone(), commerce.clone()]);
    (ctx, relational, commerce)
}

async fn search(ctx: &TestContext, code: &str) -> SearchSummary {
    match ctx
        .engine
        .execute(OperationRequest::Search(SearchRequest { code: code.into() }))
        .await
        .expect("search completes")
    {
        OperationSummary::Search(summary) => summary,
        other => panic!("unexpected summary {other:?}"),
    }
}

#[tokio::test]
async fn search_merges_matches_from_every_store() {
    let (ctx, _, _) = two_store_fixture();

    let summary = search(&ctx, "012345").await;

    assert_eq!(summary.total_found, 4);
    assert_eq!(summary.stores_searched, 2);
    assert!(summary.failed_stores.is_empty());
    assert!(!summary.no_results);
    assert_eq!(summary.matches.iter().filter(|m| m.store_id.0 == 1).count(), 3);
}

#[tokio::test]
async fn search_trims_the_code() {
    let (ctx, _, _) = two_store_fixture();
    let summary = search(&ctx, "  012345 ").await;
    assert_eq!(summary.code, "012345");
    assert_eq!(summary.total_found, 4);
}

#[tokio::test]
async fn search_reports_no_results_explicitly() {
    let (ctx, _, _) = two_store_fixture();
    let summary = search(&ctx, "777").await;
    assert_eq!(summary.total_found, 0);
    assert!(summary.no_results);
    assert_eq!(summary.stores_searched, 2);
}

#[tokio::test]
async fn unreachable_store_is_a_partial_failure() {
    let main = relational_store(1, "Main Street");
    let online = commerce_store(2, "Online");
    let relational = Arc::new(
        InMemoryBackend::for_store(&main)
            .failing_locate(BackendError::Connectivity("connection refused".into())),
    );
    let commerce = Arc::new(InMemoryBackend::for_store(&online).with_variant("p1", "Cola", "v1", "012345"));
    let ctx = TestContext::new(vec![main, online], vec![relational, commerce]);

    let summary = search(&ctx, "012345").await;

    assert_eq!(summary.total_found, 1);
    assert_eq!(summary.failed_stores.len(), 1);
    assert_eq!(summary.failed_stores[0].store_name, "Main Street");
}

#[tokio::test]
async fn empty_store_set_completes_immediately() {
    let ctx = TestContext::new(Vec::new(), Vec::new());
    let (_, receiver) = ctx
        .engine
        .launch(OperationRequest::Search(SearchRequest { code: "012345".into() }));
    let events = collect_events(receiver).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], ProgressEvent::Starting { units: 0, .. }));
    match &events[1] {
        ProgressEvent::Complete {
            summary: OperationSummary::Search(summary),
        } => {
            assert_eq!(summary.total_found, 0);
            assert_eq!(summary.stores_searched, 0);
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[tokio::test]
async fn blank_code_yields_a_single_validation_failure() {
    let (ctx, relational, commerce) = two_store_fixture();
    let (_, receiver) = ctx
        .engine
        .launch(OperationRequest::Search(SearchRequest { code: "   ".into() }));
    let events = collect_events(receiver).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        ProgressEvent::Failed {
            reason: FailureReason::Validation,
            partial: None,
            ..
        }
    ));
    assert_eq!(relational.locate_calls(), 0);
    assert_eq!(commerce.locate_calls(), 0);
}

#[tokio::test]
async fn every_stream_ends_with_exactly_one_terminal_event() {
    let (ctx, _, _) = two_store_fixture();
    let (_, receiver) = ctx
        .engine
        .launch(OperationRequest::Search(SearchRequest { code: "012345".into() }));
    let events = collect_events(receiver).await;

    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().is_some_and(ProgressEvent::is_terminal));
    let finished = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::UnitFinished { .. }))
        .count();
    assert_eq!(finished, 2);
}

#[tokio::test]
async fn update_records_every_outcome_even_when_a_store_fails() {
    let main = relational_store(1, "Main Street");
    let online = commerce_store(2, "Online");
    let relational = Arc::new(
        InMemoryBackend::for_store(&main)
            .with_collection(collection("InvoicesDetails_tbl"), vec![MemoryRow::new(1, "012345")])
            .failing_replace(BackendError::Connectivity("timed out".into())),
    );
    let commerce = Arc::new(InMemoryBackend::for_store(&online).with_variant("p1", "Cola", "v1", "012345"));
    let ctx = TestContext::new(vec![main, online], vec![relational, commerce.clone()]);

    let found = search(&ctx, "012345").await;
    assert_eq!(found.total_found, 2);

    let summary = ctx
        .engine
        .execute(OperationRequest::Update(UpdateRequest {
            old_code: "012345".into(),
            new_code: "067890".into(),
            matches: found.matches,
        }))
        .await
        .expect("update completes");

    let OperationSummary::Update(summary) = summary else {
        panic!("unexpected summary {summary:?}");
    };
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.failed_stores, 1);
    assert_eq!(summary.total_updated, 1);
    assert!(summary.history_recorded);
    let failed = summary.results.iter().find(|o| !o.success).expect("failed outcome");
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("timed out")));
    assert_eq!(commerce.variant_barcode("v1").as_deref(), Some("067890"));

    let batches = ctx.history.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(Some(batches[0].batch_id), summary.batch_id);
    assert_eq!(batches[0].outcomes.len(), 2);
    assert!(!batches[0].partial);
    assert_eq!(
        batches[0].kind,
        BatchKind::Replacement {
            old_code: "012345".into(),
            new_code: "067890".into()
        }
    );
}

#[tokio::test]
async fn search_after_update_finds_only_the_new_code() {
    let (ctx, relational, _) = two_store_fixture();
    let found = search(&ctx, "012345").await;

    ctx.engine
        .execute(OperationRequest::Update(UpdateRequest {
            old_code: "012345".into(),
            new_code: "067890".into(),
            matches: found.matches,
        }))
        .await
        .expect("update completes");

    assert_eq!(search(&ctx, "012345").await.total_found, 0);
    assert_eq!(search(&ctx, "067890").await.total_found, 4);
    assert_eq!(relational.row_code("InvoicesDetails_tbl", 2).as_deref(), Some("099999"));
}

#[tokio::test]
async fn update_with_unchanged_code_is_rejected() {
    let (ctx, _, _) = two_store_fixture();
    let found = search(&ctx, "012345").await;
    let result = ctx
        .engine
        .execute(OperationRequest::Update(UpdateRequest {
            old_code: "012345".into(),
            new_code: " 012345 ".into(),
            matches: found.matches,
        }))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    assert!(ctx.history.batches().is_empty());
}

#[tokio::test]
async fn stale_matches_update_nothing_and_fail() {
    let (ctx, _, _) = two_store_fixture();
    let found = search(&ctx, "012345").await;
    let update = |matches| {
        OperationRequest::Update(UpdateRequest {
            old_code: "012345".into(),
            new_code: "067890".into(),
            matches,
        })
    };

    ctx.engine.execute(update(found.matches.clone())).await.expect("first update");
    let replay = ctx.engine.execute(update(found.matches)).await.expect("second update");

    let OperationSummary::Update(replay) = replay else {
        panic!("unexpected summary");
    };
    assert_eq!(replay.total_updated, 0);
    assert!(replay.results.iter().all(|o| !o.success));
    assert_eq!(ctx.history.batches().len(), 2);
}

#[tokio::test]
async fn unit_events_carry_store_statuses() {
    let (ctx, _, _) = two_store_fixture();
    let (_, receiver) = ctx
        .engine
        .launch(OperationRequest::Search(SearchRequest { code: "012345".into() }));
    let events = collect_events(receiver).await;

    let mut counts: Vec<(i64, u64)> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::UnitFinished { unit, outcome } => {
                assert_eq!(outcome.status, UnitStatus::Succeeded);
                Some((unit.store_id.0, outcome.count))
            }
            _ => None,
        })
        .collect();
    counts.sort();
    assert_eq!(counts, vec![(1, 3), (2, 1)]);
}

fn update_request(matches: Vec<global_upc::domain::Match>) -> OperationRequest {
    OperationRequest::Update(UpdateRequest {
        old_code: "012345".into(),
        new_code: "067890".into(),
        matches,
    })
}

fn cancelled_update(events: &[ProgressEvent]) -> UpdateSummary {
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    match events.last() {
        Some(ProgressEvent::Failed {
            reason: FailureReason::Cancelled,
            partial: Some(OperationSummary::Update(summary)),
            ..
        }) => summary.clone(),
        other => panic!("expected a cancelled update, got {other:?}"),
    }
}

#[tokio::test]
async fn update_cancelled_before_any_store_records_nothing() {
    let (ctx, relational, commerce) = two_store_fixture();
    let found = search(&ctx, "012345").await;

    let (handle, receiver) = ctx.engine.launch(update_request(found.matches));
    handle.cancel();
    let events = collect_events(receiver).await;
    handle.wait().await;

    let summary = cancelled_update(&events);
    assert!(summary.results.is_empty());
    assert_eq!(summary.batch_id, None);
    assert!(!summary.history_recorded);
    assert!(ctx.history.batches().is_empty());
    assert_eq!(relational.row_code("InvoicesDetails_tbl", 1).as_deref(), Some("012345"));
    assert_eq!(commerce.variant_barcode("v1").as_deref(), Some("012345"));
}

#[tokio::test]
async fn update_cancelled_after_one_store_records_a_partial_batch() {
    let (ctx, relational, commerce) = two_store_fixture();
    let found = search(&ctx, "012345").await;

    let (handle, receiver) = ctx.engine.launch(update_request(found.matches));
    relational.cancel_after_replacing(handle.cancellation_token());
    let events = collect_events(receiver).await;
    handle.wait().await;

    let summary = cancelled_update(&events);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].store_id.0, 1);
    assert_eq!(summary.total_updated, 3);
    assert!(summary.history_recorded);
    assert_eq!(commerce.variant_barcode("v1").as_deref(), Some("012345"));

    let batches = ctx.history.batches();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].partial);
    assert_eq!(batches[0].outcomes.len(), 1);
    assert_eq!(Some(batches[0].batch_id), summary.batch_id);
}
