//! Collaborator interfaces
//!
//! The engine depends only on these traits. Infrastructure provides the
//! relational, commerce and SQLite implementations; `test_utils` provides
//! in-memory ones.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::{
    BackendError, ComparisonFilters, DateRange, Match, MatchStrategy, OrphanRecord,
    ReferenceProduct, RowReplacement, RowUpdateResult, ScannableCollection, Store, StoreId,
    StoreKind, UpdateBatch, UpdateOutcome, Window,
};

/// Uniform capability set over one store.
///
/// Adapters return empty results for "not found" and only fail for
/// connectivity or protocol problems. Relational-only capabilities default
/// to [`BackendError::Unsupported`].
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Largest number of keys one existence check or batched update may bind.
    fn parameter_ceiling(&self) -> usize;

    async fn locate_by_code(&self, code: &str) -> Result<Vec<Match>, BackendError>;

    /// `matches` are scoped to this adapter's store.
    async fn replace_code(
        &self,
        old_code: &str,
        new_code: &str,
        matches: &[Match],
    ) -> Result<UpdateOutcome, BackendError>;

    /// Collections present in this store instance; absent ones are omitted.
    async fn list_scannable_collections(&self) -> Result<Vec<ScannableCollection>, BackendError> {
        Err(self.unsupported("list_scannable_collections"))
    }

    /// Rows with a non-empty code, narrowed by `range` when the collection has a header.
    async fn count_rows(
        &self,
        _collection: &ScannableCollection,
        _range: &DateRange,
    ) -> Result<u64, BackendError> {
        Err(self.unsupported("count_rows"))
    }

    /// Orphans among the rows of `window`, ordered by primary key.
    async fn scan_orphans_window(
        &self,
        _collection: &ScannableCollection,
        _window: Window,
        _range: &DateRange,
    ) -> Result<Vec<OrphanRecord>, BackendError> {
        Err(self.unsupported("scan_orphans_window"))
    }

    /// Subset of `codes` present in the reference collection. `codes` must
    /// not exceed [`parameter_ceiling`](Self::parameter_ceiling).
    async fn existence_batch_check(&self, codes: &[String]) -> Result<HashSet<String>, BackendError>;

    async fn secondary_match_lookup(
        &self,
        _strategy: MatchStrategy,
        _record: &OrphanRecord,
    ) -> Result<Option<String>, BackendError> {
        Err(self.unsupported("secondary_match_lookup"))
    }

    async fn count_products(&self, _filters: &ComparisonFilters) -> Result<u64, BackendError> {
        Err(self.unsupported("count_products"))
    }

    /// Reference products in `window`, ordered by primary key.
    async fn products_window(
        &self,
        _filters: &ComparisonFilters,
        _window: Window,
    ) -> Result<Vec<ReferenceProduct>, BackendError> {
        Err(self.unsupported("products_window"))
    }

    /// Applies approved single-row replacements, one result per row.
    async fn replace_rows(&self, _rows: &[RowReplacement]) -> Result<Vec<RowUpdateResult>, BackendError> {
        Err(self.unsupported("replace_rows"))
    }

    fn unsupported(&self, operation: &'static str) -> BackendError {
        BackendError::Unsupported {
            kind: self.kind(),
            operation,
        }
    }
}

/// Builds the adapter for a store snapshot
pub trait AdapterFactory: Send + Sync {
    fn adapter_for(&self, store: &Store) -> Result<Arc<dyn BackendAdapter>, BackendError>;
}

/// Read-only view of the configured stores
pub trait StoreRegistry: Send + Sync {
    /// Snapshot of active stores, optionally narrowed to one kind.
    fn list_active_stores(&self, kind: Option<StoreKind>) -> Vec<Store>;

    fn active_store(&self, id: StoreId) -> Option<Store> {
        self.list_active_stores(None).into_iter().find(|s| s.id == id)
    }
}

#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn record(&self, batch: &UpdateBatch) -> Result<()>;
}

#[async_trait]
pub trait ExclusionStore: Send + Sync {
    /// Bulk fetch of every excluded code for a store.
    async fn excluded_codes(&self, store_id: StoreId) -> Result<HashSet<String>>;

    async fn is_excluded(&self, store_id: StoreId, code: &str) -> Result<bool> {
        Ok(self.excluded_codes(store_id).await?.contains(code))
    }
}
