//! Search orchestrator: locate one code in every active store

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use super::engine::EngineDeps;
use super::operation::{OperationContext, OperationOutcome, OperationPhase};
use crate::domain::events::{SearchSummary, StoreFailure};
use crate::domain::requests::SearchRequest;
use crate::domain::{
    BackendError, EngineError, Match, OperationSummary, Store, UnitOutcome, UnitRef,
};

enum UnitResult {
    Located(Vec<Match>),
    Failed(StoreFailure),
    NotStarted,
}

pub async fn run(
    deps: &EngineDeps,
    ctx: &OperationContext,
    request: SearchRequest,
) -> Result<OperationOutcome, EngineError> {
    let request = request.validated()?;
    let stores = deps.registry.list_active_stores(None);
    ctx.starting(stores.len()).await;

    ctx.advance(OperationPhase::FanningOut);
    let mut units = FuturesUnordered::new();
    for store in &stores {
        units.push(locate_in_store(deps, ctx, store, &request.code));
    }

    ctx.advance(OperationPhase::Collecting);
    let mut matches = Vec::new();
    let mut failed_stores = Vec::new();
    let mut skipped = 0usize;
    while let Some(result) = units.next().await {
        match result {
            UnitResult::Located(found) => matches.extend(found),
            UnitResult::Failed(failure) => failed_stores.push(failure),
            UnitResult::NotStarted => skipped += 1,
        }
    }
    drop(units);

    ctx.advance(OperationPhase::Finalizing);
    matches.sort_by(|a, b| {
        (a.store_id, a.group_key()).cmp(&(b.store_id, b.group_key()))
    });
    failed_stores.sort_by_key(|f| f.store_id);

    let summary = OperationSummary::Search(SearchSummary {
        code: request.code,
        total_found: matches.len(),
        no_results: matches.is_empty(),
        stores_searched: stores.len(),
        matches,
        failed_stores,
    });

    Ok(if skipped > 0 {
        OperationOutcome::Cancelled(summary)
    } else {
        OperationOutcome::Completed(summary)
    })
}

async fn locate_in_store(
    deps: &EngineDeps,
    ctx: &OperationContext,
    store: &Store,
    code: &str,
) -> UnitResult {
    if ctx.is_cancelled() {
        return UnitResult::NotStarted;
    }
    let unit = UnitRef::store(store.id, &store.name);
    ctx.unit_started(&unit).await;

    let located = match deps.adapters.adapter_for(store) {
        Ok(adapter) => match ctx.ensure_active() {
            Ok(()) => adapter.locate_by_code(code).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    match located {
        Ok(found) => {
            debug!(store = %store.name, "located {} matches", found.len());
            ctx.unit_finished(&unit, UnitOutcome::succeeded(found.len() as u64))
                .await;
            UnitResult::Located(found)
        }
        Err(BackendError::Cancelled) => {
            ctx.unit_finished(&unit, UnitOutcome::cancelled(0)).await;
            UnitResult::NotStarted
        }
        Err(e) => {
            warn!(store = %store.name, "search failed: {e}");
            ctx.unit_finished(&unit, UnitOutcome::failed(0, e.to_string()))
                .await;
            UnitResult::Failed(StoreFailure {
                store_id: store.id,
                store_name: store.name.clone(),
                error: e.to_string(),
            })
        }
    }
}
