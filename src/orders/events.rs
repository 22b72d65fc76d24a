// Events delivered to store subscribers

use super::types::{Order, OrderId, OrderStatus};
use serde::Serialize;

/// Origin of a store write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteSource {
    /// Local write applied ahead of backend confirmation
    Optimistic,
    /// Backend truth
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    Informational,
    SyncProblem,
}

/// Everything a presentation layer can observe about order synchronization.
///
/// State changes and synchronization problems travel on the same channel and
/// are told apart by [`SyncEvent::kind`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    OrderUpdated {
        order: Order,
        source: WriteSource,
    },
    OrderRemoved {
        order_id: OrderId,
    },
    LocalUpdateRejected {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
    /// Another driver won the acceptance race
    OrderClaimedElsewhere {
        order_id: OrderId,
    },
    TrackingDegraded {
        order_id: OrderId,
        consecutive_failures: u32,
    },
    TrackingRecovered {
        order_id: OrderId,
    },
    OrderNotFound {
        order_id: OrderId,
    },
    AuthenticationRequired,
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::OrderUpdated { .. } | SyncEvent::OrderRemoved { .. } => {
                EventKind::StateChanged
            }
            SyncEvent::LocalUpdateRejected { .. }
            | SyncEvent::OrderClaimedElsewhere { .. }
            | SyncEvent::TrackingRecovered { .. } => EventKind::Informational,
            SyncEvent::TrackingDegraded { .. }
            | SyncEvent::OrderNotFound { .. }
            | SyncEvent::AuthenticationRequired => EventKind::SyncProblem,
        }
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            SyncEvent::OrderUpdated { order, .. } => Some(&order.id),
            SyncEvent::OrderRemoved { order_id }
            | SyncEvent::LocalUpdateRejected { order_id, .. }
            | SyncEvent::OrderClaimedElsewhere { order_id }
            | SyncEvent::TrackingDegraded { order_id, .. }
            | SyncEvent::TrackingRecovered { order_id }
            | SyncEvent::OrderNotFound { order_id } => Some(order_id),
            SyncEvent::AuthenticationRequired => None,
        }
    }
}
