//! The sync engine context object.
//!
//! One [`OrderSyncEngine`] per signed-in driver session owns the store, the
//! reconciler, the arbiter and the history paginator. UI layers hold it
//! behind an `Arc` and call its intents; nothing here is a global.

use crate::acceptance::AcceptanceArbiter;
use crate::backend::{with_deadline, BackendError, OrderBackend};
use crate::config::{HistoryConfig, RideSyncConfig, TrackingConfig};
use crate::error::{AcceptanceError, SyncError};
use crate::history::HistoryPaginator;
use crate::orders::{
    HistoryPage, Order, OrderRequest, OrderStatus, OrderStore, SubscriptionId, SyncEvent, WriteSource,
};
use crate::telemetry::{create_sync_span, generate_correlation_id};
use crate::tracking::{ReconciliationRecord, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

pub struct OrderSyncEngine {
    store: Arc<OrderStore>,
    backend: Arc<dyn OrderBackend>,
    reconciler: Reconciler,
    arbiter: AcceptanceArbiter,
    history: HistoryPaginator,
    call_timeout: Duration,
}

impl std::fmt::Debug for OrderSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderSyncEngine")
            .field("store", &self.store)
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

impl OrderSyncEngine {
    pub fn new(backend: Arc<dyn OrderBackend>, config: &RideSyncConfig) -> Self {
        Self::with_settings(backend, config.tracking.clone(), &config.history)
    }

    pub fn with_settings(backend: Arc<dyn OrderBackend>, tracking: TrackingConfig, history: &HistoryConfig) -> Self {
        let store = Arc::new(OrderStore::new());
        let call_timeout = tracking.call_timeout();
        Self {
            arbiter: AcceptanceArbiter::new(Arc::clone(&store), Arc::clone(&backend), call_timeout),
            history: HistoryPaginator::new(Arc::clone(&store), Arc::clone(&backend), call_timeout, history.page_size),
            reconciler: Reconciler::new(Arc::clone(&store), Arc::clone(&backend), tracking),
            store,
            backend,
            call_timeout,
        }
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Current view of an order, optimistic status included
    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.store.get(order_id)
    }

    pub fn active_orders(&self) -> Vec<Order> {
        self.store.active_orders()
    }

    /// Submit a new ride request and start tracking the created order
    pub async fn create_order(&self, request: &OrderRequest) -> Result<Order, SyncError> {
        let span = create_sync_span("create_order", None, None, Some(&generate_correlation_id()));
        async move {
            let order = with_deadline("create_order", self.call_timeout, self.backend.create_order(request))
                .await
                .map_err(|e| self.surface(e))?;
            self.store.upsert(order.clone(), WriteSource::Confirmed)?;
            self.reconciler.track(&order.id);
            info!(order_id = %order.id, "Order created");
            Ok(order)
        }
        .instrument(span)
        .await
    }

    /// Cancel an order. The store shows `Cancelled` at once; a backend
    /// failure rolls the view back to the last confirmed status.
    pub async fn cancel_order(&self, order_id: &str, reason: Option<String>) -> Result<(), SyncError> {
        let span = create_sync_span("cancel_order", Some(order_id), None, Some(&generate_correlation_id()));
        async move {
            self.write_optimistic(order_id, OrderStatus::Cancelled)?;

            let result = with_deadline(
                "cancel_order",
                self.call_timeout,
                self.backend.cancel_order(order_id, reason),
            )
            .await;

            match result {
                Ok(()) => {
                    info!("Cancellation accepted by backend");
                    self.confirm_soon(order_id).await;
                    Ok(())
                }
                Err(err) => {
                    warn!(error = %err, "Cancellation failed, rolling back");
                    self.store.discard_pending(order_id);
                    Err(self.surface(err).into())
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Report driver progress on an assigned order
    pub async fn report_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, SyncError> {
        let span = create_sync_span("report_status", Some(order_id), None, Some(&generate_correlation_id()));
        async move {
            self.write_optimistic(order_id, status)?;

            let result = with_deadline(
                "update_order_status",
                self.call_timeout,
                self.backend.update_order_status(order_id, status),
            )
            .await;

            match result {
                Ok(order) => {
                    if let Err(rejection) = self.store.upsert(order.clone(), WriteSource::Confirmed) {
                        debug!(error = %rejection, "Poll already delivered a newer version");
                    }
                    info!(status = %order.status, "Status update confirmed");
                    Ok(order)
                }
                Err(err) => {
                    warn!(error = %err, status = %status, "Status update failed, rolling back");
                    self.store.discard_pending(order_id);
                    Err(self.surface(err).into())
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Claim an open order. A win starts tracking it.
    pub async fn attempt_accept(&self, order_id: &str, driver_id: &str) -> Result<Order, AcceptanceError> {
        let result = self.arbiter.attempt_accept(order_id, driver_id).await;
        match &result {
            Ok(order) => {
                self.reconciler.track(&order.id);
            }
            Err(AcceptanceError::Backend(err)) => {
                self.surface(err.clone());
            }
            Err(AcceptanceError::AlreadyClaimed { .. }) => {}
        }
        result
    }

    pub async fn refresh_available_orders(&self) -> Result<Vec<Order>, SyncError> {
        self.arbiter
            .refresh_available()
            .await
            .map_err(|e| self.surface(e).into())
    }

    pub fn available_orders(&self) -> Vec<Order> {
        self.arbiter.available_orders()
    }

    /// Reload history from the first page
    pub async fn load_history(&self) -> Result<HistoryPage, SyncError> {
        self.history.load_first().await.map_err(|e| self.surface(e).into())
    }

    pub async fn load_more_history(&self) -> Result<Option<HistoryPage>, SyncError> {
        self.history.load_next().await.map_err(|e| self.surface(e).into())
    }

    pub async fn history(&self) -> Vec<Order> {
        self.history.orders().await
    }

    pub async fn history_has_more(&self) -> bool {
        self.history.has_more().await
    }

    /// Fetch one order now and apply it as confirmed
    pub async fn refresh_order(&self, order_id: &str) -> Result<Order, SyncError> {
        let order = with_deadline("get_order", self.call_timeout, self.backend.get_order(order_id))
            .await
            .map_err(|e| self.surface(e))?;
        match self.store.refresh(order.clone()) {
            Some(Err(rejection)) => debug!(order_id = %order_id, error = %rejection, "Refresh skipped"),
            Some(Ok(_)) => {}
            None => {
                self.store.upsert(order.clone(), WriteSource::Confirmed)?;
            }
        }
        Ok(self.store.get(order_id).unwrap_or(order))
    }

    pub fn track(&self, order_id: &str) -> bool {
        self.reconciler.track(order_id)
    }

    pub fn stop_tracking(&self, order_id: &str) -> bool {
        self.reconciler.stop_tracking(order_id)
    }

    /// The UI has shown a terminal order; forget it
    pub fn acknowledge(&self, order_id: &str) -> bool {
        self.reconciler.acknowledge(order_id)
    }

    /// A push notification mentioned this order
    pub fn on_push(&self, order_id: &str) -> bool {
        self.reconciler.notify(order_id)
    }

    pub fn tracking_record(&self, order_id: &str) -> Option<ReconciliationRecord> {
        self.reconciler.record(order_id)
    }

    /// App moved to background
    pub fn suspend(&self) {
        self.reconciler.suspend_all();
    }

    /// App back in foreground
    pub fn resume(&self) {
        self.reconciler.resume_all();
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.reconciler.shutdown(grace).await;
    }

    fn write_optimistic(&self, order_id: &str, status: OrderStatus) -> Result<(), SyncError> {
        let current = self.store.get(order_id).ok_or_else(|| SyncError::UnknownOrder {
            order_id: order_id.to_string(),
        })?;
        self.store.upsert(current.with_status(status), WriteSource::Optimistic)?;
        Ok(())
    }

    /// Ask the backend for the outcome of a write it acknowledged without
    /// returning the order
    async fn confirm_soon(&self, order_id: &str) {
        if self.reconciler.notify(order_id) {
            return;
        }
        if let Err(err) = self.refresh_order(order_id).await {
            debug!(order_id = %order_id, error = %err, "Confirmation deferred until next poll");
        }
    }

    fn surface(&self, err: BackendError) -> BackendError {
        if err == BackendError::Unauthorized {
            self.store.publish(SyncEvent::AuthenticationRequired);
        }
        err
    }
}
