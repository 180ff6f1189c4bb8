//! Chunked collection scanner
//!
//! Walks one collection window by window in increasing offset order. Only
//! one window's rows are held by the checker at a time; matching items
//! accumulate into the report and each window emits a `chunk_progress` tick.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::operation::OperationContext;
use crate::domain::{BackendError, UnitProgress, UnitRef, Window, WindowPlan};

/// Checks one window and returns the rows matching the scan predicate
#[async_trait]
pub trait WindowCheck: Send + Sync {
    type Item: Send;

    async fn check(&self, window: Window) -> Result<Vec<Self::Item>, BackendError>;
}

/// Why a scan stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    Finished,
    Cancelled,
    /// Remaining windows of this collection were abandoned
    Failed(BackendError),
}

#[derive(Debug)]
pub struct ScanReport<T> {
    /// Items from every window checked before the scan stopped
    pub items: Vec<T>,
    pub windows_checked: usize,
    pub records_checked: u64,
    pub stop: ScanStop,
}

pub struct ChunkedScanner<'a> {
    ctx: &'a OperationContext,
    unit: &'a UnitRef,
    plan: WindowPlan,
}

impl<'a> ChunkedScanner<'a> {
    pub const fn new(ctx: &'a OperationContext, unit: &'a UnitRef, plan: WindowPlan) -> Self {
        Self { ctx, unit, plan }
    }

    pub async fn run<C: WindowCheck + ?Sized>(&self, checker: &C) -> ScanReport<C::Item> {
        let total_chunks = self.plan.window_count();
        let mut report = ScanReport {
            items: Vec::new(),
            windows_checked: 0,
            records_checked: 0,
            stop: ScanStop::Finished,
        };

        for window in self.plan.windows() {
            if self.ctx.is_cancelled() {
                debug!(unit = ?self.unit.collection, "scan cancelled before window {}", window.index + 1);
                report.stop = ScanStop::Cancelled;
                break;
            }

            let found = match checker.check(window).await {
                Ok(found) => found,
                Err(BackendError::Cancelled) => {
                    report.stop = ScanStop::Cancelled;
                    break;
                }
                Err(e) => {
                    warn!(
                        store = %self.unit.store_name,
                        collection = ?self.unit.collection,
                        "window {}/{} failed, abandoning remaining windows: {e}",
                        window.index + 1,
                        total_chunks
                    );
                    report.stop = ScanStop::Failed(e);
                    break;
                }
            };

            let found_in_chunk = found.len() as u64;
            report.items.extend(found);
            report.windows_checked += 1;
            report.records_checked = window.rows_checked();

            self.ctx
                .unit_progress(
                    self.unit,
                    UnitProgress::ChunkProgress {
                        chunk: window.index + 1,
                        total_chunks,
                        records_checked: report.records_checked,
                        total_records: self.plan.total(),
                        found_in_chunk,
                        running_total: report.items.len() as u64,
                    },
                )
                .await;
        }

        report
    }
}
