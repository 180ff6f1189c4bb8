//! Operation request payloads and their validation
//!
//! Validation runs before any fan-out. A request that fails it produces a
//! single `failed` event with reason `validation` and no backend traffic.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::errors::EngineError;
use super::events::OperationKind;
use super::records::{ComparisonFilters, DateRange, Match, MatchStrategy, OrphanRecord, RowReplacement};
use super::store::StoreId;

/// Trims a code and rejects blank input.
pub fn normalize_code(raw: &str, field: &str) -> Result<String, EngineError> {
    let code = raw.trim();
    if code.is_empty() {
        return Err(EngineError::validation(format!("{field} cannot be empty")));
    }
    Ok(code.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct SearchRequest {
    #[serde(alias = "upc")]
    pub code: String,
}

impl SearchRequest {
    pub fn validated(self) -> Result<Self, EngineError> {
        Ok(Self {
            code: normalize_code(&self.code, "code")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct UpdateRequest {
    #[serde(alias = "oldCode")]
    pub old_code: String,
    #[serde(alias = "newCode")]
    pub new_code: String,
    pub matches: Vec<Match>,
}

impl UpdateRequest {
    pub fn validated(self) -> Result<Self, EngineError> {
        let old_code = normalize_code(&self.old_code, "old code")?;
        let new_code = normalize_code(&self.new_code, "new code")?;
        if old_code == new_code {
            return Err(EngineError::validation("new code must differ from old code"));
        }
        if self.matches.is_empty() {
            return Err(EngineError::validation("no matches provided"));
        }
        Ok(Self {
            old_code,
            new_code,
            matches: self.matches,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct AuditRequest {
    #[serde(alias = "storeId")]
    pub store_id: StoreId,
    #[serde(default, alias = "dateFrom")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, alias = "dateTo")]
    pub date_to: Option<NaiveDate>,
}

impl AuditRequest {
    pub const fn date_range(&self) -> DateRange {
        DateRange {
            from: self.date_from,
            to: self.date_to,
        }
    }

    pub fn validated(self) -> Result<Self, EngineError> {
        if !self.date_range().is_ordered() {
            return Err(EngineError::validation("date_from must not be after date_to"));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ReconciliationRequest {
    #[serde(alias = "storeId")]
    pub store_id: StoreId,
    pub strategy: MatchStrategy,
    #[serde(alias = "orphanRecords")]
    pub orphan_records: Vec<OrphanRecord>,
}

impl ReconciliationRequest {
    pub fn validated(self) -> Result<Self, EngineError> {
        if let Some(foreign) = self.orphan_records.iter().find(|r| r.store_id != self.store_id) {
            return Err(EngineError::validation(format!(
                "orphan record {}#{} belongs to store {}, not {}",
                foreign.collection, foreign.primary_key, foreign.store_id, self.store_id
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ReconciliationUpdateRequest {
    #[serde(alias = "storeId")]
    pub store_id: StoreId,
    #[serde(alias = "approvedCandidates")]
    pub approved_candidates: Vec<RowReplacement>,
}

impl ReconciliationUpdateRequest {
    pub fn validated(self) -> Result<Self, EngineError> {
        if self.approved_candidates.is_empty() {
            return Err(EngineError::validation("no approved candidates provided"));
        }
        let mut approved = Vec::with_capacity(self.approved_candidates.len());
        for row in self.approved_candidates {
            let orphaned_code = normalize_code(&row.orphaned_code, "orphaned code")?;
            let replacement_code = normalize_code(&row.replacement_code, "replacement code")?;
            if orphaned_code == replacement_code {
                return Err(EngineError::validation(format!(
                    "{}#{}: replacement code equals the orphaned code",
                    row.collection, row.primary_key
                )));
            }
            approved.push(RowReplacement {
                orphaned_code,
                replacement_code,
                ..row
            });
        }
        Ok(Self {
            store_id: self.store_id,
            approved_candidates: approved,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ComparisonRequest {
    #[serde(alias = "primaryStoreId")]
    pub primary_store_id: StoreId,
    #[serde(alias = "comparisonStoreId")]
    pub comparison_store_id: StoreId,
    #[serde(default)]
    pub filters: ComparisonFilters,
}

impl ComparisonRequest {
    pub fn validated(self) -> Result<Self, EngineError> {
        if self.primary_store_id == self.comparison_store_id {
            return Err(EngineError::validation(
                "primary and comparison stores must differ",
            ));
        }
        Ok(self)
    }
}

/// Any operation the engine can launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationRequest {
    Search(SearchRequest),
    Update(UpdateRequest),
    Audit(AuditRequest),
    Reconciliation(ReconciliationRequest),
    ReconciliationUpdate(ReconciliationUpdateRequest),
    Comparison(ComparisonRequest),
}

impl OperationRequest {
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Search(_) => OperationKind::Search,
            Self::Update(_) => OperationKind::Update,
            Self::Audit(_) => OperationKind::Audit,
            Self::Reconciliation(_) => OperationKind::Reconciliation,
            Self::ReconciliationUpdate(_) => OperationKind::ReconciliationUpdate,
            Self::Comparison(_) => OperationKind::Comparison,
        }
    }

    pub fn validated(self) -> Result<Self, EngineError> {
        Ok(match self {
            Self::Search(r) => Self::Search(r.validated()?),
            Self::Update(r) => Self::Update(r.validated()?),
            Self::Audit(r) => Self::Audit(r.validated()?),
            Self::Reconciliation(r) => Self::Reconciliation(r.validated()?),
            Self::ReconciliationUpdate(r) => Self::ReconciliationUpdate(r.validated()?),
            Self::Comparison(r) => Self::Comparison(r.validated()?),
        })
    }
}
