//! Cross-store comparison orchestrator
//!
//! Scans the primary store's reference collection window by window and
//! checks each window's codes against the comparison store in
//! parameter-bounded batches. Codes found in no batch become gaps.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{info, warn};

use super::engine::EngineDeps;
use super::operation::{OperationContext, OperationOutcome, OperationPhase};
use super::ports::BackendAdapter;
use super::scanner::{ChunkedScanner, ScanStop, WindowCheck};
use crate::domain::events::ComparisonSummary;
use crate::domain::requests::ComparisonRequest;
use crate::domain::{
    BackendError, ComparisonFilters, ComparisonGap, EngineError, OperationSummary,
    ParameterBatcher, UnitOutcome, UnitRef, Window, WindowPlan,
};

const UNCATEGORIZED: &str = "uncategorized";

struct GapWindowCheck<'a> {
    ctx: &'a OperationContext,
    primary: &'a dyn BackendAdapter,
    comparison: &'a dyn BackendAdapter,
    filters: &'a ComparisonFilters,
    batcher: ParameterBatcher,
}

#[async_trait]
impl WindowCheck for GapWindowCheck<'_> {
    type Item = ComparisonGap;

    async fn check(&self, window: Window) -> Result<Vec<ComparisonGap>, BackendError> {
        self.ctx.ensure_active()?;
        let products = self.primary.products_window(self.filters, window).await?;

        let codes: Vec<String> = products
            .iter()
            .map(|p| p.code.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut present: HashSet<String> = HashSet::with_capacity(codes.len());
        for batch in self.batcher.split(&codes) {
            self.ctx.ensure_active()?;
            present.extend(self.comparison.existence_batch_check(batch).await?);
        }

        Ok(products
            .into_iter()
            .filter(|p| !present.contains(&p.code))
            .map(ComparisonGap::from)
            .collect())
    }
}

pub async fn run(
    deps: &EngineDeps,
    ctx: &OperationContext,
    request: ComparisonRequest,
) -> Result<OperationOutcome, EngineError> {
    let request = request.validated()?;
    let primary_store = deps.relational_store(request.primary_store_id, "comparison")?;
    let comparison_store = deps.store(request.comparison_store_id)?;
    let primary = deps.adapter(&primary_store)?;
    let comparison = deps.adapter(&comparison_store)?;

    ctx.starting(1).await;
    ctx.advance(OperationPhase::FanningOut);
    ctx.ensure_active()?;
    let total = primary.count_products(&request.filters).await?;

    let unit = UnitRef::store(primary_store.id, &primary_store.name)
        .with_collection(format!("vs {}", comparison_store.name));
    ctx.unit_started(&unit).await;

    let batcher = ParameterBatcher::new(comparison.parameter_ceiling());
    info!(
        primary = %primary_store.name,
        comparison = %comparison_store.name,
        "comparing {total} products, {} keys per existence check",
        batcher.ceiling()
    );

    ctx.advance(OperationPhase::Collecting);
    let checker = GapWindowCheck {
        ctx,
        primary: primary.as_ref(),
        comparison: comparison.as_ref(),
        filters: &request.filters,
        batcher,
    };
    let plan = WindowPlan::new(total, deps.settings.window_size);
    let report = ChunkedScanner::new(ctx, &unit, plan).run(&checker).await;

    ctx.advance(OperationPhase::Finalizing);
    let total_missing = report.items.len() as u64;
    let (cancelled, error, unit_outcome) = match report.stop {
        ScanStop::Finished => (false, None, UnitOutcome::succeeded(total_missing)),
        ScanStop::Cancelled => (true, None, UnitOutcome::cancelled(total_missing)),
        ScanStop::Failed(e) => {
            warn!("comparison stopped early: {e}");
            (false, Some(e.to_string()), UnitOutcome::failed(total_missing, e.to_string()))
        }
    };
    ctx.unit_finished(&unit, unit_outcome).await;

    let summary = OperationSummary::Comparison(ComparisonSummary {
        primary_store_id: primary_store.id,
        comparison_store_id: comparison_store.id,
        total_checked: report.records_checked,
        total_missing,
        category_breakdown: category_breakdown(&report.items),
        gaps: report.items,
        error,
    });

    Ok(if cancelled {
        OperationOutcome::Cancelled(summary)
    } else {
        OperationOutcome::Completed(summary)
    })
}

fn category_breakdown(gaps: &[ComparisonGap]) -> BTreeMap<String, u64> {
    let mut breakdown = BTreeMap::new();
    for gap in gaps {
        let key = gap
            .category_id
            .map_or_else(|| UNCATEGORIZED.to_string(), |id| id.to_string());
        *breakdown.entry(key).or_insert(0) += 1;
    }
    breakdown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gap(code: &str, category: Option<i64>) -> ComparisonGap {
        ComparisonGap {
            primary_key: 1,
            code: code.into(),
            description: None,
            category_id: category,
            subcategory_id: None,
            discontinued: false,
        }
    }

    #[test]
    fn breakdown_groups_by_category() {
        let breakdown = category_breakdown(&[gap("a", Some(2)), gap("b", Some(2)), gap("c", None)]);
        assert_eq!(breakdown.get("2"), Some(&2));
        assert_eq!(breakdown.get(UNCATEGORIZED), Some(&1));
    }
}
