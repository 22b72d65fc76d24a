//! Backend API abstractions
//!
//! The sync engine talks to the ride backend only through [`OrderBackend`],
//! so the HTTP client, the in-memory simulator and test mocks are
//! interchangeable.

pub mod error;
pub mod http;
pub mod memory;

pub use error::BackendError;
pub use http::HttpOrderBackend;
pub use memory::InMemoryBackend;

use crate::orders::{HistoryPage, Order, OrderRequest, OrderStatus};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// Ride backend operations consumed by the sync engine.
///
/// Every call is fallible. Only `get_order` and `list_order_history` are
/// safe to repeat; the engine never retries the others on its own.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrderBackend: Send + Sync {
    async fn create_order(&self, request: &OrderRequest) -> Result<Order, BackendError>;

    async fn get_order(&self, order_id: &str) -> Result<Order, BackendError>;

    /// Claim an open order. The backend decides the race: the first accept
    /// wins and later ones get [`BackendError::AlreadyClaimed`].
    async fn accept_order(&self, order_id: &str, driver_id: &str) -> Result<Order, BackendError>;

    async fn cancel_order(&self, order_id: &str, reason: Option<String>) -> Result<(), BackendError>;

    /// Report driver progress (en route, arrived, trip started, completed)
    async fn update_order_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, BackendError>;

    async fn list_order_history(&self, cursor: Option<String>, limit: u32) -> Result<HistoryPage, BackendError>;

    /// Open orders a driver may claim
    async fn list_available_orders(&self) -> Result<Vec<Order>, BackendError>;
}

/// Run a backend call under a per-call deadline
pub async fn with_deadline<T, F>(operation: &str, deadline: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            operation: operation.to_string(),
            timeout_ms: deadline.as_millis() as u64,
        }),
    }
}
