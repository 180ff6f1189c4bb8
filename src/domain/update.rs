//! Update outcomes and the write-once batch persisted to history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use super::store::StoreId;

/// Per-store result of an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct UpdateOutcome {
    pub store_id: StoreId,
    pub store_name: String,
    pub success: bool,
    /// Rows or variants actually changed, not merely attempted
    pub updated_count: u64,
    pub error: Option<String>,
}

impl UpdateOutcome {
    pub fn succeeded(store_id: StoreId, store_name: impl Into<String>, updated_count: u64) -> Self {
        Self {
            store_id,
            store_name: store_name.into(),
            success: true,
            updated_count,
            error: None,
        }
    }

    pub fn failed(store_id: StoreId, store_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            store_id,
            store_name: store_name.into(),
            success: false,
            updated_count: 0,
            error: Some(error.into()),
        }
    }

    /// Builds an outcome from partial work: success only when nothing failed
    /// and at least one item changed.
    pub fn from_parts(
        store_id: StoreId,
        store_name: impl Into<String>,
        updated_count: u64,
        errors: &[String],
    ) -> Self {
        let error = if !errors.is_empty() {
            Some(errors.join("; "))
        } else if updated_count == 0 {
            Some("no rows changed".to_string())
        } else {
            None
        };
        Self {
            store_id,
            store_name: store_name.into(),
            success: error.is_none(),
            updated_count,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchKind {
    /// Code replacement driven by a prior search
    Replacement { old_code: String, new_code: String },
    /// Approved per-row replacements from a reconciliation
    Reconciliation { store_id: StoreId, rows: u64 },
}

/// One update operation's outcomes. Never edited once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct UpdateBatch {
    pub batch_id: Uuid,
    pub kind: BatchKind,
    pub outcomes: Vec<UpdateOutcome>,
    pub total_updated: u64,
    /// Set when the operation was cancelled before every store finished
    pub partial: bool,
    pub created_at: DateTime<Utc>,
}

impl UpdateBatch {
    pub fn new(kind: BatchKind, outcomes: Vec<UpdateOutcome>, partial: bool) -> Self {
        let total_updated = outcomes.iter().map(|o| o.updated_count).sum();
        Self {
            batch_id: Uuid::new_v4(),
            kind,
            outcomes,
            total_updated,
            partial,
            created_at: Utc::now(),
        }
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}
