//! Reconciliation engine façade
//!
//! Launches one orchestrator per request on its own task, wired to a fresh
//! progress channel and cancellation token. Operations share no mutable state.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::operation::{OperationContext, OperationHandle, OperationOutcome, OperationPhase};
use super::ports::{AdapterFactory, BackendAdapter, ExclusionStore, HistoryRecorder, StoreRegistry};
use super::progress::ProgressSink;
use super::{audit, comparison, reconcile, search, update};
use crate::domain::requests::OperationRequest;
use crate::domain::{EngineError, FailureReason, OperationSummary, ProgressEvent, Store, StoreId};

/// Tunables the orchestrators read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Rows per scanner window
    pub window_size: u64,
    /// Simultaneous secondary-match lookups against one store
    pub reconcile_concurrency: usize,
    /// Collections of one store audited at the same time
    pub collection_concurrency: usize,
    /// Progress events buffered between the operation and its consumer
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            window_size: 5000,
            reconcile_concurrency: 8,
            collection_concurrency: 2,
            event_buffer: 256,
        }
    }
}

/// Collaborators every orchestrator receives
pub struct EngineDeps {
    pub registry: Arc<dyn StoreRegistry>,
    pub adapters: Arc<dyn AdapterFactory>,
    pub history: Arc<dyn HistoryRecorder>,
    pub exclusions: Arc<dyn ExclusionStore>,
    pub settings: EngineSettings,
}

impl EngineDeps {
    pub(crate) fn store(&self, id: StoreId) -> Result<Store, EngineError> {
        self.registry
            .active_store(id)
            .ok_or(EngineError::UnknownStore(id))
    }

    /// Active relational store, or a validation error naming `purpose`.
    pub(crate) fn relational_store(&self, id: StoreId, purpose: &str) -> Result<Store, EngineError> {
        let store = self.store(id)?;
        if !store.is_relational() {
            return Err(EngineError::validation(format!(
                "{purpose} requires a relational store, {} is {}",
                store.name,
                store.kind()
            )));
        }
        Ok(store)
    }

    pub(crate) fn adapter(&self, store: &Store) -> Result<Arc<dyn BackendAdapter>, EngineError> {
        Ok(self.adapters.adapter_for(store)?)
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    deps: Arc<EngineDeps>,
}

impl ReconciliationEngine {
    pub fn new(
        registry: Arc<dyn StoreRegistry>,
        adapters: Arc<dyn AdapterFactory>,
        history: Arc<dyn HistoryRecorder>,
        exclusions: Arc<dyn ExclusionStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            deps: Arc::new(EngineDeps {
                registry,
                adapters,
                history,
                exclusions,
                settings,
            }),
        }
    }

    /// Spawns the operation. The receiver yields its events and ends after
    /// the terminal one.
    pub fn launch(&self, request: OperationRequest) -> (OperationHandle, mpsc::Receiver<ProgressEvent>) {
        let id = Uuid::new_v4();
        let kind = request.kind();
        let token = CancellationToken::new();
        let (sink, receiver) = ProgressSink::channel(self.deps.settings.event_buffer);
        let (phase_tx, phase_rx) = watch::channel(OperationPhase::Idle);
        let ctx = OperationContext::new(id, kind, sink, token.clone(), phase_tx);
        let deps = Arc::clone(&self.deps);

        let span = info_span!("operation", %id, operation = %kind);
        let task = tokio::spawn(
            async move {
                drive(&deps, &ctx, request).await;
            }
            .instrument(span),
        );

        (OperationHandle::new(id, kind, token, phase_rx, task), receiver)
    }

    /// Runs an operation to completion and returns its summary.
    pub async fn execute(&self, request: OperationRequest) -> Result<OperationSummary, EngineError> {
        let (handle, mut receiver) = self.launch(request);
        let mut terminal = None;
        while let Some(event) = receiver.recv().await {
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        handle.wait().await;

        match terminal {
            Some(ProgressEvent::Complete { summary }) => Ok(summary),
            Some(ProgressEvent::Failed { reason, message, .. }) => Err(match reason {
                FailureReason::Cancelled => EngineError::Cancelled,
                FailureReason::Validation => EngineError::Validation(message),
                FailureReason::Backend | FailureReason::Internal => EngineError::Internal(message),
            }),
            _ => Err(EngineError::Internal(
                "operation ended without a terminal event".to_string(),
            )),
        }
    }
}

/// Runs the orchestrator and emits exactly one terminal event.
async fn drive(deps: &EngineDeps, ctx: &OperationContext, request: OperationRequest) {
    info!("operation started");
    let result = match request {
        OperationRequest::Search(r) => search::run(deps, ctx, r).await,
        OperationRequest::Update(r) => update::run(deps, ctx, r).await,
        OperationRequest::Audit(r) => audit::run(deps, ctx, r).await,
        OperationRequest::Reconciliation(r) => reconcile::run_match(deps, ctx, r).await,
        OperationRequest::ReconciliationUpdate(r) => reconcile::run_update(deps, ctx, r).await,
        OperationRequest::Comparison(r) => comparison::run(deps, ctx, r).await,
    };

    let terminal = match result {
        Ok(OperationOutcome::Completed(summary)) => {
            if summary.has_partial_failures() {
                info!("operation completed with partial failures");
            } else {
                info!("operation completed");
            }
            ProgressEvent::Complete { summary }
        }
        Ok(OperationOutcome::Cancelled(summary)) => {
            info!("operation cancelled");
            ProgressEvent::Failed {
                reason: FailureReason::Cancelled,
                message: "operation cancelled".to_string(),
                partial: Some(summary),
            }
        }
        Err(e) => {
            warn!("operation failed: {e}");
            ProgressEvent::Failed {
                reason: e.reason(),
                message: e.to_string(),
                partial: None,
            }
        }
    };

    ctx.emit(terminal).await;
    ctx.advance(OperationPhase::Done);
}
