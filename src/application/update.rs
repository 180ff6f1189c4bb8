//! Update orchestrator: replace a code in every store holding matches

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use super::engine::EngineDeps;
use super::operation::{OperationContext, OperationOutcome, OperationPhase};
use crate::domain::events::UpdateSummary;
use crate::domain::requests::UpdateRequest;
use crate::domain::{
    BackendError, BatchKind, EngineError, Match, OperationSummary, Store, StoreId, UnitOutcome,
    UnitRef, UpdateBatch, UpdateOutcome,
};

pub async fn run(
    deps: &EngineDeps,
    ctx: &OperationContext,
    request: UpdateRequest,
) -> Result<OperationOutcome, EngineError> {
    let request = request.validated()?;

    let mut by_store: BTreeMap<StoreId, Vec<Match>> = BTreeMap::new();
    for m in request.matches {
        by_store.entry(m.store_id).or_default().push(m);
    }
    let stores: HashMap<StoreId, Store> = deps
        .registry
        .list_active_stores(None)
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    ctx.starting(by_store.len()).await;
    ctx.advance(OperationPhase::FanningOut);
    let mut units = FuturesUnordered::new();
    for (store_id, matches) in &by_store {
        units.push(update_store(
            deps,
            ctx,
            *store_id,
            stores.get(store_id),
            matches,
            &request.old_code,
            &request.new_code,
        ));
    }

    ctx.advance(OperationPhase::Collecting);
    let mut outcomes = Vec::with_capacity(by_store.len());
    while let Some(outcome) = units.next().await {
        outcomes.extend(outcome);
    }
    drop(units);

    ctx.advance(OperationPhase::Finalizing);
    outcomes.sort_by_key(|o| o.store_id);
    let partial = outcomes.len() < by_store.len();

    let batch = UpdateBatch::new(
        BatchKind::Replacement {
            old_code: request.old_code.clone(),
            new_code: request.new_code.clone(),
        },
        outcomes,
        partial,
    );
    let (batch_id, history_recorded) = if batch.outcomes.is_empty() {
        (None, false)
    } else {
        (Some(batch.batch_id), record_batch(deps, &batch).await)
    };

    let summary = OperationSummary::Update(UpdateSummary {
        old_code: request.old_code,
        new_code: request.new_code,
        batch_id,
        failed_stores: batch.failed_count(),
        total_updated: batch.total_updated,
        results: batch.outcomes,
        history_recorded,
    });

    Ok(if partial {
        OperationOutcome::Cancelled(summary)
    } else {
        OperationOutcome::Completed(summary)
    })
}

/// `None` when cancellation was observed before the store was touched.
async fn update_store(
    deps: &EngineDeps,
    ctx: &OperationContext,
    store_id: StoreId,
    store: Option<&Store>,
    matches: &[Match],
    old_code: &str,
    new_code: &str,
) -> Option<UpdateOutcome> {
    if ctx.is_cancelled() {
        return None;
    }
    let Some(store) = store else {
        let store_name = matches
            .first()
            .map(|m| m.store_name.clone())
            .unwrap_or_default();
        let unit = UnitRef::store(store_id, &store_name);
        let error = "store is not active";
        ctx.unit_finished(&unit, UnitOutcome::failed(0, error)).await;
        return Some(UpdateOutcome::failed(store_id, store_name, error));
    };

    let unit = UnitRef::store(store.id, &store.name);
    ctx.unit_started(&unit).await;

    let replaced = match deps.adapters.adapter_for(store) {
        Ok(adapter) => match ctx.ensure_active() {
            Ok(()) => adapter.replace_code(old_code, new_code, matches).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    let outcome = match replaced {
        Ok(outcome) => outcome,
        Err(BackendError::Cancelled) => {
            ctx.unit_finished(&unit, UnitOutcome::cancelled(0)).await;
            return None;
        }
        Err(e) => {
            warn!(store = %store.name, "update failed: {e}");
            UpdateOutcome::failed(store.id, &store.name, e.to_string())
        }
    };

    let unit_outcome = match &outcome.error {
        Some(error) if !outcome.success => UnitOutcome::failed(outcome.updated_count, error),
        _ => UnitOutcome::succeeded(outcome.updated_count),
    };
    ctx.unit_finished(&unit, unit_outcome).await;
    Some(outcome)
}

/// Failures are logged and never change the outcomes already computed.
pub(crate) async fn record_batch(deps: &EngineDeps, batch: &UpdateBatch) -> bool {
    match deps.history.record(batch).await {
        Ok(()) => {
            info!(batch_id = %batch.batch_id, partial = batch.partial, "update batch recorded");
            true
        }
        Err(e) => {
            warn!(batch_id = %batch.batch_id, "failed to record update batch: {e:#}");
            false
        }
    }
}
