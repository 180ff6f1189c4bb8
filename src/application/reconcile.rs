//! Reconciliation orchestrators
//!
//! `run_match` proposes replacement codes for orphans via a secondary key or
//! an exact description match. `run_update` applies a caller-approved subset
//! row by row and records the batch.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use super::engine::EngineDeps;
use super::operation::{OperationContext, OperationOutcome, OperationPhase};
use super::ports::BackendAdapter;
use super::update::record_batch;
use crate::domain::events::{ReconciliationSummary, ReconciliationUpdateSummary};
use crate::domain::records::NOT_APPLICABLE;
use crate::domain::requests::{ReconciliationRequest, ReconciliationUpdateRequest};
use crate::domain::{
    BackendError, BatchKind, EngineError, MatchStrategy, OperationSummary, OrphanRecord,
    ReconciliationCandidate, RowUpdateResult, UnitOutcome, UnitProgress, UnitRef, UpdateBatch,
    UpdateOutcome,
};

pub async fn run_match(
    deps: &EngineDeps,
    ctx: &OperationContext,
    request: ReconciliationRequest,
) -> Result<OperationOutcome, EngineError> {
    let request = request.validated()?;
    let store = deps.relational_store(request.store_id, "reconciliation")?;
    let adapter = deps.adapter(&store)?;
    let strategy = request.strategy;
    let total = request.orphan_records.len();

    ctx.starting(1).await;
    let unit = UnitRef::store(store.id, &store.name);
    ctx.unit_started(&unit).await;

    ctx.advance(OperationPhase::FanningOut);
    let limit = deps.settings.reconcile_concurrency.max(1);
    let mut pending = request.orphan_records.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    for (index, record) in pending.by_ref().take(limit) {
        in_flight.push(lookup(ctx, adapter.as_ref(), strategy, index, record));
    }

    ctx.advance(OperationPhase::Collecting);
    let mut candidates: Vec<(usize, ReconciliationCandidate)> = Vec::with_capacity(total);
    let mut matched = 0usize;
    let mut skipped = 0usize;
    while let Some((index, candidate)) = in_flight.next().await {
        match candidate {
            Some(candidate) => {
                if candidate.match_found {
                    matched += 1;
                }
                ctx.unit_progress(
                    &unit,
                    UnitProgress::Checked {
                        current: candidates.len() + 1,
                        total,
                        matched: candidate.match_found,
                        running_matched: matched,
                        collection: candidate.orphan.collection.clone(),
                        primary_key: candidate.orphan.primary_key,
                    },
                )
                .await;
                candidates.push((index, candidate));
            }
            None => skipped += 1,
        }
        if let Some((index, record)) = pending.next() {
            in_flight.push(lookup(ctx, adapter.as_ref(), strategy, index, record));
        }
    }
    drop(in_flight);

    ctx.advance(OperationPhase::Finalizing);
    candidates.sort_by_key(|(index, _)| *index);
    let candidates: Vec<ReconciliationCandidate> = candidates.into_iter().map(|(_, c)| c).collect();
    let checked = candidates.len();

    let cancelled = skipped > 0;
    let unit_outcome = if cancelled {
        UnitOutcome::cancelled(matched as u64)
    } else {
        UnitOutcome::succeeded(matched as u64)
    };
    ctx.unit_finished(&unit, unit_outcome).await;
    info!(store = %store.name, "reconciliation matched {matched}/{checked} of {total}");

    let summary = OperationSummary::Reconciliation(ReconciliationSummary {
        store_id: store.id,
        strategy,
        candidates,
        total,
        matched,
        unmatched: checked - matched,
    });
    Ok(if cancelled {
        OperationOutcome::Cancelled(summary)
    } else {
        OperationOutcome::Completed(summary)
    })
}

/// `None` when cancellation was observed before the lookup was issued.
async fn lookup(
    ctx: &OperationContext,
    adapter: &dyn BackendAdapter,
    strategy: MatchStrategy,
    index: usize,
    record: OrphanRecord,
) -> (usize, Option<ReconciliationCandidate>) {
    if ctx.is_cancelled() {
        return (index, None);
    }

    let Some(value) = strategy.lookup_value(&record).map(str::to_string) else {
        return (
            index,
            Some(ReconciliationCandidate {
                orphan: record,
                strategy,
                match_found: false,
                replacement_code: None,
                match_field_value: NOT_APPLICABLE.to_string(),
                error: None,
            }),
        );
    };

    let (replacement_code, error) = match adapter.secondary_match_lookup(strategy, &record).await {
        Ok(code) => (code, None),
        Err(BackendError::Cancelled) => return (index, None),
        Err(e) => {
            debug!(collection = %record.collection, key = record.primary_key, "lookup failed: {e}");
            (None, Some(e.to_string()))
        }
    };

    (
        index,
        Some(ReconciliationCandidate {
            orphan: record,
            strategy,
            match_found: replacement_code.is_some(),
            replacement_code,
            match_field_value: value,
            error,
        }),
    )
}

pub async fn run_update(
    deps: &EngineDeps,
    ctx: &OperationContext,
    request: ReconciliationUpdateRequest,
) -> Result<OperationOutcome, EngineError> {
    let request = request.validated()?;
    let store = deps.relational_store(request.store_id, "reconciliation update")?;
    let adapter = deps.adapter(&store)?;
    let rows = request.approved_candidates;

    ctx.starting(1).await;
    ctx.advance(OperationPhase::FanningOut);
    let unit = UnitRef::store(store.id, &store.name);

    if ctx.is_cancelled() {
        ctx.advance(OperationPhase::Finalizing);
        let outcome = UpdateOutcome::failed(store.id, &store.name, "cancelled before any row was updated");
        return Ok(OperationOutcome::Cancelled(OperationSummary::ReconciliationUpdate(
            ReconciliationUpdateSummary {
                store_id: store.id,
                batch_id: None,
                outcome,
                results: Vec::new(),
                total_updated: 0,
                history_recorded: false,
            },
        )));
    }

    ctx.unit_started(&unit).await;
    ctx.advance(OperationPhase::Collecting);
    let results = match adapter.replace_rows(&rows).await {
        Ok(results) => results,
        Err(e) => {
            warn!(store = %store.name, "reconciliation update failed: {e}");
            rows.iter()
                .map(|row| RowUpdateResult {
                    collection: row.collection.clone(),
                    primary_key: row.primary_key,
                    success: false,
                    error: Some(e.to_string()),
                })
                .collect()
        }
    };

    ctx.advance(OperationPhase::Finalizing);
    let updated = results.iter().filter(|r| r.success).count() as u64;
    let errors: Vec<String> = results
        .iter()
        .filter_map(|r| {
            r.error
                .as_ref()
                .map(|e| format!("{}#{}: {e}", r.collection, r.primary_key))
        })
        .collect();
    let outcome = UpdateOutcome::from_parts(store.id, &store.name, updated, &errors);

    let unit_outcome = match &outcome.error {
        Some(error) if !outcome.success => UnitOutcome::failed(updated, error),
        _ => UnitOutcome::succeeded(updated),
    };
    ctx.unit_finished(&unit, unit_outcome).await;

    let batch = UpdateBatch::new(
        BatchKind::Reconciliation {
            store_id: store.id,
            rows: rows.len() as u64,
        },
        vec![outcome.clone()],
        false,
    );
    let history_recorded = record_batch(deps, &batch).await;

    Ok(OperationOutcome::Completed(OperationSummary::ReconciliationUpdate(
        ReconciliationUpdateSummary {
            store_id: store.id,
            batch_id: Some(batch.batch_id),
            outcome,
            results,
            total_updated: updated,
            history_recorded,
        },
    )))
}
