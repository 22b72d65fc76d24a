// In-memory ride backend
//
// Plays the part of backend truth for the CLI simulation and for tests:
// versions every change, arbitrates acceptance races under one lock and can
// inject failures per order.

use super::{BackendError, OrderBackend};
use crate::orders::{HistoryPage, Order, OrderId, OrderRequest, OrderStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct BackendState {
    // Insertion order doubles as history order
    orders: Vec<Order>,
    next_id: u64,
    failing_gets: HashMap<OrderId, u32>,
    get_calls: HashMap<OrderId, Vec<Instant>>,
    unauthorized: bool,
    failure_rate: f64,
}

impl BackendState {
    fn find_mut(&mut self, order_id: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.id == order_id)
    }

    fn check_auth(&self) -> Result<(), BackendError> {
        if self.unauthorized {
            Err(BackendError::Unauthorized)
        } else {
            Ok(())
        }
    }
}

fn bump(order: &mut Order) {
    order.version += 1;
    order.updated_at = Utc::now();
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an order as-is
    pub fn seed(&self, order: Order) {
        let mut state = self.state.lock();
        match state.find_mut(&order.id) {
            Some(existing) => *existing = order,
            None => state.orders.push(order),
        }
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.state.lock().orders.iter().find(|o| o.id == order_id).cloned()
    }

    /// Move an order to any status, bumping its version
    pub fn set_status(&self, order_id: &str, status: OrderStatus) -> Option<Order> {
        let mut state = self.state.lock();
        let order = state.find_mut(order_id)?;
        order.status = status;
        bump(order);
        Some(order.clone())
    }

    /// Drop an order, as if deleted server-side
    pub fn delete(&self, order_id: &str) -> Option<Order> {
        let mut state = self.state.lock();
        let index = state.orders.iter().position(|o| o.id == order_id)?;
        Some(state.orders.remove(index))
    }

    /// Make the next `count` reads of an order fail with a network error
    pub fn fail_next_gets(&self, order_id: &str, count: u32) {
        self.state.lock().failing_gets.insert(order_id.to_string(), count);
    }

    /// Random network failure probability for reads, clamped to [0, 1]
    pub fn set_failure_rate(&self, rate: f64) {
        self.state.lock().failure_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.state.lock().unauthorized = unauthorized;
    }

    pub fn get_call_count(&self, order_id: &str) -> usize {
        self.state.lock().get_calls.get(order_id).map_or(0, Vec::len)
    }

    /// Instants at which `get_order` was called for an order
    pub fn get_call_times(&self, order_id: &str) -> Vec<Instant> {
        self.state.lock().get_calls.get(order_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl OrderBackend for InMemoryBackend {
    async fn create_order(&self, request: &OrderRequest) -> Result<Order, BackendError> {
        let mut state = self.state.lock();
        state.check_auth()?;
        state.next_id += 1;
        let order = Order {
            id: format!("ord-{:04}", state.next_id),
            status: OrderStatus::Pending,
            pickup: request.pickup.clone(),
            destination: request.destination.clone(),
            scheduled_at: request.scheduled_at,
            passenger_count: request.passenger_count,
            service_options: request.service_options.clone(),
            driver_id: None,
            version: 1,
            updated_at: Utc::now(),
        };
        state.orders.push(order.clone());
        debug!(order_id = %order.id, "Simulated backend created order");
        Ok(order)
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, BackendError> {
        let mut state = self.state.lock();
        state
            .get_calls
            .entry(order_id.to_string())
            .or_default()
            .push(Instant::now());
        state.check_auth()?;

        if let Some(remaining) = state.failing_gets.get_mut(order_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::network(format!("injected failure reading {order_id}")));
            }
        }
        if state.failure_rate > 0.0 && rand::rng().random_bool(state.failure_rate) {
            return Err(BackendError::network("simulated connection reset"));
        }

        state
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                order_id: order_id.to_string(),
            })
    }

    async fn accept_order(&self, order_id: &str, driver_id: &str) -> Result<Order, BackendError> {
        let mut state = self.state.lock();
        state.check_auth()?;
        let order = state.find_mut(order_id).ok_or_else(|| BackendError::NotFound {
            order_id: order_id.to_string(),
        })?;

        if !order.status.is_open() || order.driver_id.is_some() {
            return Err(BackendError::AlreadyClaimed {
                order_id: order_id.to_string(),
            });
        }
        order.status = OrderStatus::Matched;
        order.driver_id = Some(driver_id.to_string());
        bump(order);
        Ok(order.clone())
    }

    async fn cancel_order(&self, order_id: &str, _reason: Option<String>) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_auth()?;
        let order = state.find_mut(order_id).ok_or_else(|| BackendError::NotFound {
            order_id: order_id.to_string(),
        })?;

        if !crate::orders::can_transition(order.status, OrderStatus::Cancelled) {
            return Err(BackendError::Http {
                status: 409,
                message: format!("order {order_id} cannot be cancelled while {}", order.status),
            });
        }
        order.status = OrderStatus::Cancelled;
        bump(order);
        Ok(())
    }

    async fn update_order_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, BackendError> {
        let mut state = self.state.lock();
        state.check_auth()?;
        let order = state.find_mut(order_id).ok_or_else(|| BackendError::NotFound {
            order_id: order_id.to_string(),
        })?;

        if !crate::orders::can_transition(order.status, status) {
            return Err(BackendError::Http {
                status: 422,
                message: format!("cannot move order {order_id} from {} to {status}", order.status),
            });
        }
        order.status = status;
        bump(order);
        Ok(order.clone())
    }

    async fn list_order_history(&self, cursor: Option<String>, limit: u32) -> Result<HistoryPage, BackendError> {
        let state = self.state.lock();
        state.check_auth()?;
        let offset = match cursor {
            Some(cursor) => cursor.parse::<usize>().map_err(|_| BackendError::Http {
                status: 400,
                message: format!("invalid cursor '{cursor}'"),
            })?,
            None => 0,
        };

        let end = (offset + limit as usize).min(state.orders.len());
        let orders = state.orders.get(offset..end).map(<[Order]>::to_vec).unwrap_or_default();
        let has_more = end < state.orders.len();
        Ok(HistoryPage {
            orders,
            next_cursor: has_more.then(|| end.to_string()),
            has_more,
        })
    }

    async fn list_available_orders(&self) -> Result<Vec<Order>, BackendError> {
        let state = self.state.lock();
        state.check_auth()?;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.status.is_open() && o.driver_id.is_none())
            .cloned()
            .collect())
    }
}
