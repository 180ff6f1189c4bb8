//! Application layer module
//!
//! Orchestrators for each operation family, the collaborator ports they
//! depend on, and the engine façade that launches them.

pub mod audit;
pub mod comparison;
pub mod engine;
pub mod operation;
pub mod ports;
pub mod progress;
pub mod reconcile;
pub mod scanner;
pub mod search;
pub mod update;

pub use engine::{EngineSettings, ReconciliationEngine};
pub use operation::{OperationContext, OperationHandle, OperationOutcome, OperationPhase};
pub use ports::{AdapterFactory, BackendAdapter, ExclusionStore, HistoryRecorder, StoreRegistry};
pub use progress::ProgressSink;
pub use scanner::{ChunkedScanner, ScanReport, ScanStop, WindowCheck};
