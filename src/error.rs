// Intent-level errors returned to the presentation layer

use crate::backend::BackendError;
use crate::orders::{IllegalTransition, OrderId, UpsertRejection};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcceptanceError {
    /// Another driver won the race. Expected, and informational only.
    #[error("Order {order_id} was claimed by another driver")]
    AlreadyClaimed { order_id: OrderId },
    #[error(transparent)]
    Backend(BackendError),
}

impl AcceptanceError {
    pub fn is_informational(&self) -> bool {
        matches!(self, AcceptanceError::AlreadyClaimed { .. })
    }
}

impl From<BackendError> for AcceptanceError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::AlreadyClaimed { order_id } => AcceptanceError::AlreadyClaimed { order_id },
            other => AcceptanceError::Backend(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Order {order_id}: {transition}")]
    IllegalTransition {
        order_id: OrderId,
        transition: IllegalTransition,
    },
    #[error("Order {order_id} is not known locally")]
    UnknownOrder { order_id: OrderId },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Acceptance(#[from] AcceptanceError),
}

impl SyncError {
    /// The surrounding app should run its login flow
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            SyncError::Backend(BackendError::Unauthorized)
                | SyncError::Acceptance(AcceptanceError::Backend(BackendError::Unauthorized))
        )
    }
}

impl From<UpsertRejection> for SyncError {
    fn from(rejection: UpsertRejection) -> Self {
        match rejection {
            UpsertRejection::IllegalTransition { order_id, transition } => {
                SyncError::IllegalTransition { order_id, transition }
            }
            // Intents only write optimistically, so a stale version can only
            // mean the local copy is gone or replaced.
            UpsertRejection::StaleVersion { order_id, .. } | UpsertRejection::UnknownOrder { order_id } => {
                SyncError::UnknownOrder { order_id }
            }
        }
    }
}
