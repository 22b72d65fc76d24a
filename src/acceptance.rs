// Acceptance Arbiter - claiming open orders against other drivers
//
// The backend alone decides who wins. Locally we only keep the available
// orders board in step with the outcome and push the winner into the store.

use crate::backend::{with_deadline, BackendError, OrderBackend};
use crate::error::AcceptanceError;
use crate::orders::{Order, OrderId, OrderStore, SyncEvent, WriteSource};
use crate::telemetry::{create_sync_span, generate_correlation_id};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Default)]
struct Board {
    orders: Vec<Order>,
    // Ids settled while at least one refresh was in flight. Such a refresh
    // may carry a snapshot taken before the settlement.
    settled: HashSet<OrderId>,
    refreshing: usize,
}

/// Marks a board refresh as in flight for as long as it is alive, so a
/// cancelled refresh is still accounted for.
struct RefreshGuard<'a> {
    board: &'a Mutex<Board>,
}

impl<'a> RefreshGuard<'a> {
    fn enter(board: &'a Mutex<Board>) -> Self {
        board.lock().refreshing += 1;
        Self { board }
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let mut board = self.board.lock();
        board.refreshing -= 1;
        if board.refreshing == 0 {
            board.settled.clear();
        }
    }
}

pub struct AcceptanceArbiter {
    store: Arc<OrderStore>,
    backend: Arc<dyn OrderBackend>,
    call_timeout: Duration,
    board: Mutex<Board>,
}

impl std::fmt::Debug for AcceptanceArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let board = self.board.lock();
        f.debug_struct("AcceptanceArbiter")
            .field("available", &board.orders.len())
            .field("refreshing", &board.refreshing)
            .finish()
    }
}

impl AcceptanceArbiter {
    pub fn new(store: Arc<OrderStore>, backend: Arc<dyn OrderBackend>, call_timeout: Duration) -> Self {
        Self {
            store,
            backend,
            call_timeout,
            board: Mutex::new(Board::default()),
        }
    }

    /// Replace the board with the backend's current open orders.
    ///
    /// Orders whose acceptance settled while the call was in flight are left
    /// off, even when the backend snapshot predates the settlement.
    pub async fn refresh_available(&self) -> Result<Vec<Order>, BackendError> {
        let _refreshing = RefreshGuard::enter(&self.board);
        let mut orders = with_deadline(
            "list_available_orders",
            self.call_timeout,
            self.backend.list_available_orders(),
        )
        .await?;

        let mut board = self.board.lock();
        let fetched = orders.len();
        orders.retain(|o| !board.settled.contains(&o.id));
        debug!(
            count = orders.len(),
            settled_during_refresh = fetched - orders.len(),
            "Refreshed available orders"
        );
        board.orders = orders.clone();
        Ok(orders)
    }

    pub fn available_orders(&self) -> Vec<Order> {
        self.board.lock().orders.clone()
    }

    pub fn is_available(&self, order_id: &str) -> bool {
        self.board.lock().orders.iter().any(|o| o.id == order_id)
    }

    fn drop_from_board(&self, order_id: &str) {
        let mut board = self.board.lock();
        board.orders.retain(|o| o.id != order_id);
        if board.refreshing > 0 {
            board.settled.insert(order_id.to_string());
        }
    }

    /// Try to claim an order for a driver.
    ///
    /// Losing the race yields [`AcceptanceError::AlreadyClaimed`], which is an
    /// informational outcome: the order leaves the board and an
    /// `OrderClaimedElsewhere` event is published.
    pub async fn attempt_accept(&self, order_id: &str, driver_id: &str) -> Result<Order, AcceptanceError> {
        let correlation_id = generate_correlation_id();
        let span = create_sync_span("attempt_accept", Some(order_id), Some(driver_id), Some(&correlation_id));

        async move {
            let result = with_deadline(
                "accept_order",
                self.call_timeout,
                self.backend.accept_order(order_id, driver_id),
            )
            .await;

            match result {
                Ok(order) => {
                    self.drop_from_board(order_id);
                    if let Err(rejection) = self.store.upsert(order.clone(), WriteSource::Confirmed) {
                        debug!(error = %rejection, "Store already holds a newer version of the accepted order");
                    }
                    info!(status = %order.status, "Order accepted");
                    Ok(order)
                }
                Err(BackendError::AlreadyClaimed { .. }) => {
                    self.drop_from_board(order_id);
                    info!("Order claimed by another driver first");
                    self.store.publish(SyncEvent::OrderClaimedElsewhere {
                        order_id: order_id.to_string(),
                    });
                    Err(AcceptanceError::AlreadyClaimed {
                        order_id: order_id.to_string(),
                    })
                }
                Err(err) => {
                    if matches!(err, BackendError::NotFound { .. }) {
                        self.drop_from_board(order_id);
                    }
                    warn!(error = %err, "Accept request failed");
                    Err(AcceptanceError::from(err))
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockOrderBackend;
    use crate::orders::{Location, OrderStatus};
    use chrono::Utc;

    fn open_order(id: &str) -> Order {
        Order {
            id: id.to_string(),
            status: OrderStatus::Matching,
            pickup: Location::new(35.68, 139.76),
            destination: Location::new(35.66, 139.70),
            scheduled_at: None,
            passenger_count: 3,
            service_options: Default::default(),
            driver_id: None,
            version: 4,
            updated_at: Utc::now(),
        }
    }

    fn arbiter_with(backend: MockOrderBackend) -> (Arc<OrderStore>, AcceptanceArbiter) {
        let store = Arc::new(OrderStore::new());
        let arbiter = AcceptanceArbiter::new(Arc::clone(&store), Arc::new(backend), Duration::from_secs(5));
        (store, arbiter)
    }

    #[tokio::test]
    async fn test_winning_accept_lands_in_store_and_leaves_board() {
        let mut backend = MockOrderBackend::new();
        backend
            .expect_list_available_orders()
            .returning(|| Ok(vec![open_order("A1"), open_order("A2")]));
        backend
            .expect_accept_order()
            .withf(|id, driver| id == "A1" && driver == "driver-9")
            .times(1)
            .returning(|id, driver| {
                let mut order = open_order(id);
                order.status = OrderStatus::Matched;
                order.driver_id = Some(driver.to_string());
                order.version = 5;
                Ok(order)
            });
        let (store, arbiter) = arbiter_with(backend);

        arbiter.refresh_available().await.unwrap();
        let order = arbiter.attempt_accept("A1", "driver-9").await.unwrap();

        assert_eq!(order.status, OrderStatus::Matched);
        assert_eq!(store.get("A1").unwrap().driver_id.as_deref(), Some("driver-9"));
        assert!(!arbiter.is_available("A1"));
        assert!(arbiter.is_available("A2"));
    }

    #[tokio::test]
    async fn test_lost_race_is_informational() {
        let mut backend = MockOrderBackend::new();
        backend
            .expect_list_available_orders()
            .returning(|| Ok(vec![open_order("A1")]));
        backend.expect_accept_order().returning(|id, _| {
            Err(BackendError::AlreadyClaimed {
                order_id: id.to_string(),
            })
        });
        let (store, arbiter) = arbiter_with(backend);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.subscribe(move |e| sink.lock().push(e.clone()));

        arbiter.refresh_available().await.unwrap();
        let err = arbiter.attempt_accept("A1", "driver-9").await.unwrap_err();

        assert!(err.is_informational());
        assert!(arbiter.available_orders().is_empty());
        assert!(!store.contains("A1"));
        assert_eq!(
            *events.lock(),
            vec![SyncEvent::OrderClaimedElsewhere {
                order_id: "A1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_settlements_are_forgotten_once_no_refresh_is_in_flight() {
        let mut backend = MockOrderBackend::new();
        backend
            .expect_list_available_orders()
            .returning(|| Ok(vec![open_order("A1")]));
        backend
            .expect_accept_order()
            .returning(|id, _| Err(BackendError::NotFound { order_id: id.to_string() }));
        let (_store, arbiter) = arbiter_with(backend);

        arbiter.attempt_accept("A1", "driver-9").await.unwrap_err();
        assert!(arbiter.board.lock().settled.is_empty());

        // The order reappeared server-side; a later refresh trusts the backend
        arbiter.refresh_available().await.unwrap();
        assert!(arbiter.is_available("A1"));
        assert_eq!(arbiter.board.lock().refreshing, 0);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_order_on_board() {
        let mut backend = MockOrderBackend::new();
        backend
            .expect_list_available_orders()
            .returning(|| Ok(vec![open_order("A1")]));
        backend
            .expect_accept_order()
            .times(1)
            .returning(|_, _| Err(BackendError::network("connection reset")));
        let (_store, arbiter) = arbiter_with(backend);

        arbiter.refresh_available().await.unwrap();
        let err = arbiter.attempt_accept("A1", "driver-9").await.unwrap_err();

        assert!(!err.is_informational());
        assert!(arbiter.is_available("A1"));
    }
}
