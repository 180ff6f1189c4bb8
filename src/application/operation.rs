//! Per-operation context, lifecycle phases and the caller-facing handle

use chrono::Utc;
use std::fmt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::progress::ProgressSink;
use crate::domain::{
    BackendError, OperationKind, OperationSummary, ProgressEvent, UnitOutcome, UnitProgress,
    UnitRef,
};

/// Lifecycle shared by every orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Idle,
    FanningOut,
    Collecting,
    Finalizing,
    Done,
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::FanningOut => "fanning-out",
            Self::Collecting => "collecting",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// How an orchestrator finished when it did not fail outright
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed(OperationSummary),
    /// Cancellation was observed; the summary holds only finished work
    Cancelled(OperationSummary),
}

/// Everything one running operation shares between its units
#[derive(Debug)]
pub struct OperationContext {
    id: Uuid,
    kind: OperationKind,
    sink: ProgressSink,
    token: CancellationToken,
    phase: watch::Sender<OperationPhase>,
}

impl OperationContext {
    pub fn new(
        id: Uuid,
        kind: OperationKind,
        sink: ProgressSink,
        token: CancellationToken,
        phase: watch::Sender<OperationPhase>,
    ) -> Self {
        Self {
            id,
            kind,
            sink,
            token,
            phase,
        }
    }

    /// Context with its own channel, for driving an orchestrator directly.
    pub fn detached(kind: OperationKind, buffer: usize) -> (Self, tokio::sync::mpsc::Receiver<ProgressEvent>) {
        let (sink, receiver) = ProgressSink::channel(buffer);
        let (phase, _) = watch::channel(OperationPhase::Idle);
        (
            Self::new(Uuid::new_v4(), kind, sink, CancellationToken::new(), phase),
            receiver,
        )
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Gate in front of every adapter call and window iteration.
    pub fn ensure_active(&self) -> Result<(), BackendError> {
        if self.token.is_cancelled() {
            Err(BackendError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn advance(&self, next: OperationPhase) {
        let previous = self.phase.send_replace(next);
        debug!(operation = %self.kind, id = %self.id, "phase {previous} -> {next}");
    }

    pub fn phase(&self) -> OperationPhase {
        *self.phase.borrow()
    }

    pub async fn emit(&self, event: ProgressEvent) {
        self.sink.emit(event).await;
    }

    pub async fn starting(&self, units: usize) {
        self.emit(ProgressEvent::Starting {
            operation_id: self.id,
            operation: self.kind,
            units,
            started_at: Utc::now(),
        })
        .await;
    }

    pub async fn unit_started(&self, unit: &UnitRef) {
        self.emit(ProgressEvent::UnitStarted { unit: unit.clone() })
            .await;
    }

    pub async fn unit_progress(&self, unit: &UnitRef, progress: UnitProgress) {
        self.emit(ProgressEvent::UnitProgress {
            unit: unit.clone(),
            progress,
        })
        .await;
    }

    pub async fn unit_finished(&self, unit: &UnitRef, outcome: UnitOutcome) {
        self.emit(ProgressEvent::UnitFinished {
            unit: unit.clone(),
            outcome,
        })
        .await;
    }
}

/// Caller-side handle on a launched operation
#[derive(Debug)]
pub struct OperationHandle {
    id: Uuid,
    kind: OperationKind,
    token: CancellationToken,
    phase: watch::Receiver<OperationPhase>,
    task: JoinHandle<()>,
}

impl OperationHandle {
    pub(crate) const fn new(
        id: Uuid,
        kind: OperationKind,
        token: CancellationToken,
        phase: watch::Receiver<OperationPhase>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            kind,
            token,
            phase,
            task,
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Token the transport can hold on to for out-of-band cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Advisory: in-flight remote calls finish, nothing new is scheduled.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn phase(&self) -> OperationPhase {
        *self.phase.borrow()
    }

    /// Waits for the operation task to exit.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            debug!(id = %self.id, "operation task ended abnormally: {e}");
        }
    }
}
