//! Error taxonomy for adapters and orchestrators

use thiserror::Error;

use super::events::FailureReason;
use super::store::{StoreId, StoreKind};

/// Failures raised by a backend adapter. "Not found" is never an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Store unreachable: {0}")]
    Connectivity(String),

    #[error("Parameter limit exceeded: {requested} bound parameters, ceiling {ceiling}")]
    ProtocolLimit { requested: usize, ceiling: usize },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("{operation} is not supported by {kind} stores")]
    Unsupported {
        kind: StoreKind,
        operation: &'static str,
    },

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl BackendError {
    /// Connectivity and protocol-limit failures degrade one unit only.
    pub const fn is_connectivity_class(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::ProtocolLimit { .. })
    }
}

/// Operation-level failures. Anything else is reported per unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Store {0} is not an active store")]
    UnknownStore(StoreId),

    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub const fn reason(&self) -> FailureReason {
        match self {
            Self::Validation(_) | Self::UnknownStore(_) => FailureReason::Validation,
            Self::Backend(BackendError::Cancelled) | Self::Cancelled => FailureReason::Cancelled,
            Self::Backend(_) => FailureReason::Backend,
            Self::Internal(_) => FailureReason::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_limit_is_connectivity_class() {
        let err = BackendError::ProtocolLimit {
            requested: 3000,
            ceiling: 2000,
        };
        assert!(err.is_connectivity_class());
        assert!(!BackendError::Query("syntax".into()).is_connectivity_class());
    }

    #[test]
    fn reasons_map_from_variants() {
        assert_eq!(EngineError::validation("x").reason(), FailureReason::Validation);
        assert_eq!(EngineError::UnknownStore(StoreId(9)).reason(), FailureReason::Validation);
        assert_eq!(EngineError::from(BackendError::Cancelled).reason(), FailureReason::Cancelled);
        assert_eq!(
            EngineError::from(BackendError::Connectivity("down".into())).reason(),
            FailureReason::Backend
        );
    }
}
