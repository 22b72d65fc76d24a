// Core order types shared by the store, the tracking loop and the backend client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type OrderId = String;
pub type DriverId = String;

/// Lifecycle status of a ride order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
    Pending,
    Matching,
    Matched,
    DriverEnRoute,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::Pending,
        OrderStatus::Matching,
        OrderStatus::Matched,
        OrderStatus::DriverEnRoute,
        OrderStatus::Arrived,
        OrderStatus::InProgress,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    /// True for every status except completed and cancelled
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Open orders can still be claimed by a driver
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Matching)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Matching => "matching",
            OrderStatus::Matched => "matched",
            OrderStatus::DriverEnRoute => "driverEnRoute",
            OrderStatus::Arrived => "arrived",
            OrderStatus::InProgress => "inProgress",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceOption {
    ChildSeat,
    PetFriendly,
    WheelchairAccessible,
    ExtraLuggage,
    QuietRide,
}

/// A ride order as known to the driver client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub status: OrderStatus,
    pub pickup: Location,
    pub destination: Location,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub passenger_count: u8,
    #[serde(default)]
    pub service_options: BTreeSet<ServiceOption>,
    #[serde(default)]
    pub driver_id: Option<DriverId>,
    /// Monotonic backend revision, used to order confirmed writes
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Copy of this order with a different status, keeping the version
    pub fn with_status(&self, status: OrderStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Payload for creating a new order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub pickup: Location,
    pub destination: Location,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub passenger_count: u8,
    #[serde(default)]
    pub service_options: BTreeSet<ServiceOption>,
}

/// One page of order history as returned by the backend
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub orders: Vec<Order>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl HistoryPage {
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
