//! Records produced and consumed by the orchestrators
//!
//! Each record is built by exactly one orchestrator and never mutated after
//! it has been emitted.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::store::{StoreId, StoreKind};

/// Description placeholder used when a row carries no description
pub const UNKNOWN_DESCRIPTION: &str = "Unknown";

/// Value reported for the match field when a record cannot be looked up
pub const NOT_APPLICABLE: &str = "N/A";

/// Where a located code lives, with what an update needs to rewrite it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchLocation {
    Variant {
        product_id: String,
        product_title: String,
        variant_id: String,
        variant_title: String,
        sku: Option<String>,
    },
    Row {
        collection: String,
        primary_key_field: String,
        primary_key: i64,
    },
}

/// One located occurrence of a code inside a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct Match {
    pub store_id: StoreId,
    pub store_name: String,
    pub store_kind: StoreKind,
    /// Code held by the item when it was located
    pub code: String,
    /// Human label: product/variant title or row description
    pub label: String,
    pub location: MatchLocation,
}

impl Match {
    /// Grouping key inside a store: product id for variants, collection for rows.
    pub fn group_key(&self) -> &str {
        match &self.location {
            MatchLocation::Variant { product_id, .. } => product_id,
            MatchLocation::Row { collection, .. } => collection,
        }
    }
}

/// A detail row whose code has no counterpart in the reference collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
pub struct OrphanRecord {
    pub store_id: StoreId,
    pub collection: String,
    pub primary_key: i64,
    pub code: String,
    /// Secondary product identifier, when the row has one
    #[serde(default)]
    pub secondary_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl OrphanRecord {
    pub fn description_or_unknown(&self) -> &str {
        self.description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(UNKNOWN_DESCRIPTION)
    }
}

/// How a replacement code is looked up for an orphan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    #[serde(alias = "product_id", alias = "secondaryKey")]
    SecondaryKey,
    Description,
}

impl MatchStrategy {
    /// Value the lookup will key on, or `None` when the record lacks it.
    pub fn lookup_value(self, record: &OrphanRecord) -> Option<&str> {
        match self {
            Self::SecondaryKey => record
                .secondary_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty()),
            Self::Description => Some(record.description_or_unknown())
                .filter(|d| *d != UNKNOWN_DESCRIPTION),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ReconciliationCandidate {
    pub orphan: OrphanRecord,
    pub strategy: MatchStrategy,
    pub match_found: bool,
    /// Reference code for the matched product
    pub replacement_code: Option<String>,
    /// Secondary key or description the lookup keyed on, `N/A` when absent
    pub match_field_value: String,
    pub error: Option<String>,
}

impl ReconciliationCandidate {
    /// Row replacement for an approved candidate; `None` when nothing would change.
    pub fn approve(&self) -> Option<RowReplacement> {
        let replacement = self.replacement_code.as_deref()?;
        if !self.match_found || replacement == self.orphan.code {
            return None;
        }
        Some(RowReplacement {
            collection: self.orphan.collection.clone(),
            primary_key: self.orphan.primary_key,
            orphaned_code: self.orphan.code.clone(),
            replacement_code: replacement.to_string(),
        })
    }
}

/// A single approved row rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct RowReplacement {
    pub collection: String,
    pub primary_key: i64,
    #[serde(alias = "orphanedCode")]
    pub orphaned_code: String,
    #[serde(alias = "replacementCode")]
    pub replacement_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct RowUpdateResult {
    pub collection: String,
    pub primary_key: i64,
    pub success: bool,
    pub error: Option<String>,
}

/// Inclusive document-date range for audits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub const fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    /// Exclusive upper bound, i.e. the day after `to`.
    pub fn upper_exclusive(&self) -> Option<NaiveDate> {
        self.to.and_then(|to| to.succ_opt())
    }

    pub fn is_ordered(&self) -> bool {
        match (self.from, self.to) {
            (Some(from), Some(to)) => from <= to,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ComparisonFilters {
    #[serde(default, alias = "categoryIds")]
    pub category_ids: Vec<i64>,
    #[serde(default, alias = "subcategoryIds")]
    pub subcategory_ids: Vec<i64>,
    #[serde(default, alias = "includeDiscontinued")]
    pub include_discontinued: bool,
}

/// A row of a store's reference collection, as read by a comparison scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceProduct {
    pub primary_key: i64,
    pub code: String,
    pub description: Option<String>,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
    pub discontinued: bool,
}

/// A primary-store product absent from the comparison store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ComparisonGap {
    pub primary_key: i64,
    pub code: String,
    pub description: Option<String>,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
    pub discontinued: bool,
}

impl From<ReferenceProduct> for ComparisonGap {
    fn from(product: ReferenceProduct) -> Self {
        Self {
            primary_key: product.primary_key,
            code: product.code,
            description: product.description,
            category_id: product.category_id,
            subcategory_id: product.subcategory_id,
            discontinued: product.discontinued,
        }
    }
}
