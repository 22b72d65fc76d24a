// Order model, status transition table and the authoritative in-memory store

pub mod events;
pub mod store;
pub mod transitions;
pub mod types;

pub use events::{EventKind, SyncEvent, WriteSource};
pub use store::{OrderStore, SubscriptionId, UpsertOutcome, UpsertRejection};
pub use transitions::{allowed_next, can_transition, validate_transition, IllegalTransition};
pub use types::{
    DriverId, HistoryPage, Location, Order, OrderId, OrderRequest, OrderStatus, ServiceOption,
};
