use crate::orders::OrderId;
use thiserror::Error;

/// Failures reported by a backend call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Network error: {message}")]
    Network { message: String },
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("Order not found: {order_id}")]
    NotFound { order_id: OrderId },
    #[error("Backend rejected credentials")]
    Unauthorized,
    #[error("Order {order_id} was already claimed by another driver")]
    AlreadyClaimed { order_id: OrderId },
    #[error("Backend returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Invalid response from backend: {message}")]
    Decode { message: String },
    #[error("Invalid backend URL: {message}")]
    InvalidUrl { message: String },
}

impl BackendError {
    pub fn network(message: impl Into<String>) -> Self {
        BackendError::Network {
            message: message.into(),
        }
    }

    /// Errors worth another attempt on the next polling tick
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Network { .. } | BackendError::Timeout { .. } | BackendError::Decode { .. } => true,
            BackendError::Http { status, .. } => *status >= 500 || *status == 429,
            BackendError::NotFound { .. }
            | BackendError::Unauthorized
            | BackendError::AlreadyClaimed { .. }
            | BackendError::InvalidUrl { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode {
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            BackendError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            BackendError::network(err.to_string())
        }
    }
}
