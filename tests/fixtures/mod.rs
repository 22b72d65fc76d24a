//! Shared builders and test doubles for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use ride_sync::backend::InMemoryBackend;
use ride_sync::config::{HistoryConfig, TrackingConfig};
use ride_sync::orders::{HistoryPage, Location, Order, OrderRequest, OrderStatus, OrderStore, SyncEvent};
use ride_sync::{BackendError, OrderBackend, OrderSyncEngine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

pub fn order(id: &str, status: OrderStatus, version: u64) -> Order {
    Order {
        id: id.to_string(),
        status,
        pickup: Location::new(52.52, 13.40).with_address("Alexanderplatz"),
        destination: Location::new(52.36, 13.50).with_address("BER Terminal 1"),
        scheduled_at: None,
        passenger_count: 1,
        service_options: Default::default(),
        driver_id: None,
        version,
        updated_at: Utc::now(),
    }
}

pub fn request() -> OrderRequest {
    OrderRequest {
        pickup: Location::new(52.52, 13.40),
        destination: Location::new(52.36, 13.50),
        scheduled_at: None,
        passenger_count: 2,
        service_options: Default::default(),
    }
}

/// Engine wired to a backend with the default 10s interval and threshold 3
pub fn engine_with(backend: Arc<dyn OrderBackend>) -> OrderSyncEngine {
    OrderSyncEngine::with_settings(backend, TrackingConfig::default(), &HistoryConfig::default())
}

/// Records every event a store publishes, in delivery order
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl EventRecorder {
    pub fn attach(store: &OrderStore) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.events);
        store.subscribe(move |event| sink.lock().push(event.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn statuses(&self, order_id: &str) -> Vec<OrderStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SyncEvent::OrderUpdated { order, .. } if order.id == order_id => Some(order.status),
                _ => None,
            })
            .collect()
    }
}

/// Wraps the in-memory backend and can hold `get_order` calls open until
/// the test releases them. The available-orders listing has its own gate,
/// closed after the snapshot is taken, and polls can be slowed down.
pub struct GatedBackend {
    pub inner: Arc<InMemoryBackend>,
    closed: AtomicBool,
    gate: Semaphore,
    pub entered: Notify,
    board_held: AtomicBool,
    board_gate: Semaphore,
    pub board_entered: Notify,
    poll_delay: Mutex<Option<Duration>>,
}

impl GatedBackend {
    pub fn new(inner: Arc<InMemoryBackend>) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
            gate: Semaphore::new(0),
            entered: Notify::new(),
            board_held: AtomicBool::new(false),
            board_gate: Semaphore::new(0),
            board_entered: Notify::new(),
            poll_delay: Mutex::new(None),
        }
    }

    pub fn hold_board(&self) {
        self.board_held.store(true, Ordering::SeqCst);
    }

    pub fn release_board(&self) {
        self.board_held.store(false, Ordering::SeqCst);
        self.board_gate.add_permits(1024);
    }

    /// Every `get_order` sleeps this long before answering
    pub fn slow_polls(&self, delay: Duration) {
        *self.poll_delay.lock() = Some(delay);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.gate.add_permits(1024);
    }
}

#[async_trait]
impl OrderBackend for GatedBackend {
    async fn create_order(&self, request: &OrderRequest) -> Result<Order, BackendError> {
        self.inner.create_order(request).await
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, BackendError> {
        let delay = *self.poll_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await;
        }
        self.inner.get_order(order_id).await
    }

    async fn accept_order(&self, order_id: &str, driver_id: &str) -> Result<Order, BackendError> {
        self.inner.accept_order(order_id, driver_id).await
    }

    async fn cancel_order(&self, order_id: &str, reason: Option<String>) -> Result<(), BackendError> {
        self.inner.cancel_order(order_id, reason).await
    }

    async fn update_order_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, BackendError> {
        self.inner.update_order_status(order_id, status).await
    }

    async fn list_order_history(&self, cursor: Option<String>, limit: u32) -> Result<HistoryPage, BackendError> {
        self.inner.list_order_history(cursor, limit).await
    }

    async fn list_available_orders(&self) -> Result<Vec<Order>, BackendError> {
        let snapshot = self.inner.list_available_orders().await;
        if self.board_held.load(Ordering::SeqCst) {
            self.board_entered.notify_one();
            let _permit = self.board_gate.acquire().await;
        }
        snapshot
    }
}
