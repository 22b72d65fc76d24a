// Ride Sync Library - order lifecycle synchronization for the driver client
// This exposes the core components for testing and integration

pub mod acceptance;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod orders;
pub mod shutdown;
pub mod telemetry;
pub mod tracking;

// Re-export key types for easy access
pub use acceptance::AcceptanceArbiter;
pub use backend::{BackendError, HttpOrderBackend, InMemoryBackend, OrderBackend};
pub use config::{config, OnTimeout, RideSyncConfig, TrackingConfig};
pub use engine::OrderSyncEngine;
pub use error::{AcceptanceError, SyncError};
pub use history::HistoryPaginator;
pub use orders::{
    EventKind, HistoryPage, Location, Order, OrderId, OrderRequest, OrderStatus, OrderStore, SyncEvent,
    WriteSource,
};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_sync_span, generate_correlation_id, init_telemetry};
pub use tracking::{ReconciliationRecord, Reconciler};
