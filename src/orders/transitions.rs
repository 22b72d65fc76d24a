// Order status transition table
//
//   pending -> matching -> matched -> driverEnRoute -> arrived -> inProgress -> completed
//      \__________\___________\____________\______________\
//                                                          +--> cancelled
//
// A ride in progress or finished cannot be cancelled.

use super::types::OrderStatus;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal order transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

fn forward(from: OrderStatus) -> Option<OrderStatus> {
    use OrderStatus::*;
    match from {
        Pending => Some(Matching),
        Matching => Some(Matched),
        Matched => Some(DriverEnRoute),
        DriverEnRoute => Some(Arrived),
        Arrived => Some(InProgress),
        InProgress => Some(Completed),
        Completed | Cancelled => None,
    }
}

fn cancellable(from: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(from, Pending | Matching | Matched | DriverEnRoute | Arrived)
}

pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    if to == OrderStatus::Cancelled {
        return cancellable(from);
    }
    forward(from) == Some(to)
}

pub fn allowed_next(from: OrderStatus) -> BTreeSet<OrderStatus> {
    let mut next = BTreeSet::new();
    if let Some(status) = forward(from) {
        next.insert(status);
    }
    if cancellable(from) {
        next.insert(OrderStatus::Cancelled);
    }
    next
}

pub fn validate_transition(from: OrderStatus, to: OrderStatus) -> Result<(), IllegalTransition> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}
