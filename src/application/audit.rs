//! Orphan audit orchestrator
//!
//! Scans every detail collection of one relational store for codes that
//! have no counterpart in the reference collection. Excluded store+code
//! pairs are dropped before anything is counted or emitted.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use super::engine::EngineDeps;
use super::operation::{OperationContext, OperationOutcome, OperationPhase};
use super::ports::BackendAdapter;
use super::scanner::{ChunkedScanner, ScanStop, WindowCheck};
use crate::domain::events::{AuditSummary, CollectionSummary};
use crate::domain::requests::AuditRequest;
use crate::domain::{
    BackendError, DateRange, EngineError, OperationSummary, OrphanRecord, ScannableCollection,
    Store, UnitOutcome, UnitRef, UnitStatus, Window, WindowPlan,
};

struct OrphanWindowCheck<'a> {
    adapter: &'a dyn BackendAdapter,
    ctx: &'a OperationContext,
    collection: &'a ScannableCollection,
    range: &'a DateRange,
    excluded_codes: &'a HashSet<String>,
    excluded: &'a AtomicU64,
}

#[async_trait]
impl WindowCheck for OrphanWindowCheck<'_> {
    type Item = OrphanRecord;

    async fn check(&self, window: Window) -> Result<Vec<OrphanRecord>, BackendError> {
        self.ctx.ensure_active()?;
        let mut orphans = self
            .adapter
            .scan_orphans_window(self.collection, window, self.range)
            .await?;
        let before = orphans.len();
        orphans.retain(|o| !self.excluded_codes.contains(&o.code));
        self.excluded
            .fetch_add((before - orphans.len()) as u64, Ordering::Relaxed);
        Ok(orphans)
    }
}

struct CollectionResult {
    position: usize,
    summary: CollectionSummary,
    orphans: Vec<OrphanRecord>,
}

pub async fn run(
    deps: &EngineDeps,
    ctx: &OperationContext,
    request: AuditRequest,
) -> Result<OperationOutcome, EngineError> {
    let request = request.validated()?;
    let store = deps.relational_store(request.store_id, "audit")?;
    let adapter = deps.adapter(&store)?;
    let range = request.date_range();

    let excluded_codes = deps
        .exclusions
        .excluded_codes(store.id)
        .await
        .map_err(|e| EngineError::Internal(format!("exclusion store unavailable: {e:#}")))?;

    ctx.ensure_active()?;
    let collections = adapter.list_scannable_collections().await?;
    info!(
        store = %store.name,
        "auditing {} collections ({} excluded codes)",
        collections.len(),
        excluded_codes.len()
    );
    ctx.starting(collections.len()).await;

    ctx.advance(OperationPhase::FanningOut);
    let excluded = AtomicU64::new(0);
    let window_size = deps.settings.window_size;
    let limit = deps.settings.collection_concurrency.max(1);
    let mut pending = collections.iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    for (position, collection) in pending.by_ref().take(limit) {
        in_flight.push(audit_collection(
            ctx,
            adapter.as_ref(),
            &store,
            position,
            collection,
            &range,
            &excluded_codes,
            &excluded,
            window_size,
        ));
    }

    ctx.advance(OperationPhase::Collecting);
    let mut results = Vec::with_capacity(collections.len());
    while let Some(result) = in_flight.next().await {
        results.push(result);
        if let Some((position, collection)) = pending.next() {
            in_flight.push(audit_collection(
                ctx,
                adapter.as_ref(),
                &store,
                position,
                collection,
                &range,
                &excluded_codes,
                &excluded,
                window_size,
            ));
        }
    }
    drop(in_flight);

    ctx.advance(OperationPhase::Finalizing);
    results.sort_by_key(|r| r.position);
    let cancelled = results
        .iter()
        .any(|r| r.summary.status == UnitStatus::Cancelled);

    let mut summaries = Vec::with_capacity(results.len());
    let mut orphans = Vec::new();
    for result in results {
        summaries.push(result.summary);
        orphans.extend(result.orphans);
    }
    let total_orphans = orphans.len() as u64;

    let summary = OperationSummary::Audit(AuditSummary {
        store_id: store.id,
        store_name: store.name.clone(),
        collections: summaries,
        empty: orphans.is_empty(),
        orphans,
        total_orphans,
        excluded: excluded.load(Ordering::Relaxed),
    });

    Ok(if cancelled {
        OperationOutcome::Cancelled(summary)
    } else {
        OperationOutcome::Completed(summary)
    })
}

async fn audit_collection(
    ctx: &OperationContext,
    adapter: &dyn BackendAdapter,
    store: &Store,
    position: usize,
    collection: &ScannableCollection,
    range: &DateRange,
    excluded_codes: &HashSet<String>,
    excluded: &AtomicU64,
    window_size: u64,
) -> CollectionResult {
    let mut summary = CollectionSummary {
        collection: collection.name.clone(),
        status: UnitStatus::Cancelled,
        records_checked: 0,
        total_records: 0,
        orphaned_count: 0,
        error: None,
    };
    if ctx.is_cancelled() {
        return CollectionResult {
            position,
            summary,
            orphans: Vec::new(),
        };
    }

    let unit = UnitRef::store(store.id, &store.name).with_collection(&collection.name);
    ctx.unit_started(&unit).await;

    if !range.is_unbounded() && collection.header.is_none() {
        warn!(collection = %collection.name, "no header declared, date range ignored");
    }

    let total = match count(ctx, adapter, collection, range).await {
        Ok(total) => total,
        Err(BackendError::Cancelled) => {
            ctx.unit_finished(&unit, UnitOutcome::cancelled(0)).await;
            return CollectionResult {
                position,
                summary,
                orphans: Vec::new(),
            };
        }
        Err(e) => {
            warn!(collection = %collection.name, "count failed: {e}");
            summary.status = UnitStatus::Failed;
            summary.error = Some(e.to_string());
            ctx.unit_finished(&unit, UnitOutcome::failed(0, e.to_string()))
                .await;
            return CollectionResult {
                position,
                summary,
                orphans: Vec::new(),
            };
        }
    };
    summary.total_records = total;

    let checker = OrphanWindowCheck {
        adapter,
        ctx,
        collection,
        range,
        excluded_codes,
        excluded,
    };
    let plan = WindowPlan::new(total, window_size);
    let report = ChunkedScanner::new(ctx, &unit, plan).run(&checker).await;

    summary.records_checked = report.records_checked;
    summary.orphaned_count = report.items.len() as u64;
    let outcome = match report.stop {
        ScanStop::Finished => {
            summary.status = UnitStatus::Succeeded;
            UnitOutcome::succeeded(summary.orphaned_count)
        }
        ScanStop::Cancelled => {
            summary.status = UnitStatus::Cancelled;
            UnitOutcome::cancelled(summary.orphaned_count)
        }
        ScanStop::Failed(e) => {
            summary.status = UnitStatus::Failed;
            summary.error = Some(e.to_string());
            UnitOutcome::failed(summary.orphaned_count, e.to_string())
        }
    };
    ctx.unit_finished(&unit, outcome).await;

    CollectionResult {
        position,
        summary,
        orphans: report.items,
    }
}

async fn count(
    ctx: &OperationContext,
    adapter: &dyn BackendAdapter,
    collection: &ScannableCollection,
    range: &DateRange,
) -> Result<u64, BackendError> {
    ctx.ensure_active()?;
    adapter.count_rows(collection, range).await
}
