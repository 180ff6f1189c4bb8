//! Domain module - Core reconciliation entities and pure planning logic
//!
//! Nothing in here performs I/O. Types are shared by the orchestrators,
//! the backend adapters and the HTTP surface.

pub mod batching;
pub mod collections;
pub mod errors;
pub mod events;
pub mod records;
pub mod requests;
pub mod store;
pub mod update;
pub mod windows;

pub use batching::ParameterBatcher;
pub use collections::{HeaderJoin, ReferenceCollection, ScannableCollection, SchemaCatalog};
pub use errors::{BackendError, EngineError};
pub use events::{
    FailureReason, OperationKind, OperationSummary, ProgressEvent, UnitOutcome, UnitProgress,
    UnitRef, UnitStatus,
};
pub use records::{
    ComparisonFilters, ComparisonGap, DateRange, Match, MatchLocation, MatchStrategy,
    OrphanRecord, ReconciliationCandidate, ReferenceProduct, RowReplacement, RowUpdateResult,
};
pub use store::{CommerceConnection, RelationalConnection, Store, StoreConnection, StoreId, StoreKind};
pub use update::{BatchKind, UpdateBatch, UpdateOutcome};
pub use windows::{Window, WindowPlan};
