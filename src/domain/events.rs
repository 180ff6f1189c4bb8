//! Progress events
//!
//! One stream of [`ProgressEvent`]s per top-level operation. Events are
//! ordered within a unit (a store or a collection) and interleaved across
//! units in arrival order. Exactly one terminal event, `complete` or
//! `failed`, ends the stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;
use uuid::Uuid;

use super::records::{ComparisonGap, Match, MatchStrategy, OrphanRecord, ReconciliationCandidate, RowUpdateResult};
use super::store::StoreId;
use super::update::UpdateOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Search,
    Update,
    Audit,
    Reconciliation,
    ReconciliationUpdate,
    Comparison,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Search => "search",
            Self::Update => "update",
            Self::Audit => "audit",
            Self::Reconciliation => "reconciliation",
            Self::ReconciliationUpdate => "reconciliation_update",
            Self::Comparison => "comparison",
        };
        f.write_str(name)
    }
}

/// Identifies the unit of work an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
pub struct UnitRef {
    pub store_id: StoreId,
    pub store_name: String,
    /// Set for collection-level units (audit, comparison)
    pub collection: Option<String>,
}

impl UnitRef {
    pub fn store(store_id: StoreId, store_name: impl Into<String>) -> Self {
        Self {
            store_id,
            store_name: store_name.into(),
            collection: None,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitProgress {
    /// One window of a chunked scan has been checked
    ChunkProgress {
        /// 1-based window number
        chunk: usize,
        total_chunks: usize,
        records_checked: u64,
        total_records: u64,
        found_in_chunk: u64,
        running_total: u64,
    },
    /// One reconciliation record has been looked up
    Checked {
        current: usize,
        total: usize,
        matched: bool,
        running_matched: usize,
        collection: String,
        primary_key: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct UnitOutcome {
    pub status: UnitStatus,
    /// Unit-local count: matches, rows changed or orphans found
    pub count: u64,
    pub error: Option<String>,
}

impl UnitOutcome {
    pub const fn succeeded(count: u64) -> Self {
        Self {
            status: UnitStatus::Succeeded,
            count,
            error: None,
        }
    }

    pub fn failed(count: u64, error: impl Into<String>) -> Self {
        Self {
            status: UnitStatus::Failed,
            count,
            error: Some(error.into()),
        }
    }

    pub const fn cancelled(count: u64) -> Self {
        Self {
            status: UnitStatus::Cancelled,
            count,
            error: None,
        }
    }
}

/// A store that could not be searched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct StoreFailure {
    pub store_id: StoreId,
    pub store_name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct SearchSummary {
    pub code: String,
    pub matches: Vec<Match>,
    pub total_found: usize,
    pub stores_searched: usize,
    pub failed_stores: Vec<StoreFailure>,
    /// Searched everywhere reachable and found nothing
    pub no_results: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct UpdateSummary {
    pub old_code: String,
    pub new_code: String,
    /// Absent when no store finished, in which case nothing was recorded
    pub batch_id: Option<Uuid>,
    pub results: Vec<UpdateOutcome>,
    pub total_updated: u64,
    pub failed_stores: usize,
    pub history_recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct CollectionSummary {
    pub collection: String,
    pub status: UnitStatus,
    pub records_checked: u64,
    pub total_records: u64,
    pub orphaned_count: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct AuditSummary {
    pub store_id: StoreId,
    pub store_name: String,
    pub collections: Vec<CollectionSummary>,
    pub orphans: Vec<OrphanRecord>,
    pub total_orphans: u64,
    /// Orphans withheld because their code is excluded for this store
    pub excluded: u64,
    /// Audit finished and found no orphans
    pub empty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ReconciliationSummary {
    pub store_id: StoreId,
    pub strategy: MatchStrategy,
    pub candidates: Vec<ReconciliationCandidate>,
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ReconciliationUpdateSummary {
    pub store_id: StoreId,
    /// Absent when cancelled before any row was touched
    pub batch_id: Option<Uuid>,
    pub outcome: UpdateOutcome,
    pub results: Vec<RowUpdateResult>,
    pub total_updated: u64,
    pub history_recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ComparisonSummary {
    pub primary_store_id: StoreId,
    pub comparison_store_id: StoreId,
    pub total_checked: u64,
    pub total_missing: u64,
    pub gaps: Vec<ComparisonGap>,
    /// Missing products per category id, `uncategorized` when absent
    pub category_breakdown: BTreeMap<String, u64>,
    /// Set when the scan stopped early on a backend failure
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationSummary {
    Search(SearchSummary),
    Update(UpdateSummary),
    Audit(AuditSummary),
    Reconciliation(ReconciliationSummary),
    ReconciliationUpdate(ReconciliationUpdateSummary),
    Comparison(ComparisonSummary),
}

impl OperationSummary {
    /// True when some unit failed even though the operation completed.
    pub fn has_partial_failures(&self) -> bool {
        match self {
            Self::Search(s) => !s.failed_stores.is_empty(),
            Self::Update(s) => s.failed_stores > 0,
            Self::Audit(s) => s
                .collections
                .iter()
                .any(|c| c.status == UnitStatus::Failed),
            Self::Reconciliation(s) => s.candidates.iter().any(|c| c.error.is_some()),
            Self::ReconciliationUpdate(s) => !s.outcome.success,
            Self::Comparison(s) => s.error.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Validation,
    Cancelled,
    Backend,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[ts(export)]
pub enum ProgressEvent {
    Starting {
        operation_id: Uuid,
        operation: OperationKind,
        units: usize,
        started_at: DateTime<Utc>,
    },
    UnitStarted {
        unit: UnitRef,
    },
    UnitProgress {
        unit: UnitRef,
        progress: UnitProgress,
    },
    UnitFinished {
        unit: UnitRef,
        outcome: UnitOutcome,
    },
    Complete {
        summary: OperationSummary,
    },
    Failed {
        reason: FailureReason,
        message: String,
        /// Results produced before the operation stopped
        partial: Option<OperationSummary>,
    },
}

impl ProgressEvent {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_in_kebab_case() {
        let event = ProgressEvent::UnitStarted {
            unit: UnitRef::store(StoreId(3), "Main").with_collection("InvoicesDetails_tbl"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "unit-started");
        assert_eq!(json["unit"]["collection"], "InvoicesDetails_tbl");
        assert!(!event.is_terminal());
    }

    #[test]
    fn chunk_progress_carries_status_tag() {
        let progress = UnitProgress::ChunkProgress {
            chunk: 1,
            total_chunks: 3,
            records_checked: 200,
            total_records: 500,
            found_in_chunk: 4,
            running_total: 4,
        };
        let json = serde_json::to_value(progress).unwrap();
        assert_eq!(json["status"], "chunk_progress");
    }

    #[test]
    fn summary_is_tagged_by_operation() {
        let summary = OperationSummary::Search(SearchSummary {
            code: "012345".into(),
            matches: vec![],
            total_found: 0,
            stores_searched: 0,
            failed_stores: vec![],
            no_results: true,
        });
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["operation"], "search");
        assert_eq!(json["total_found"], 0);
        assert!(ProgressEvent::Complete { summary }.is_terminal());
    }
}
