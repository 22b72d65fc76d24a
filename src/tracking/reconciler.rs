// Reconciliation Loop - per-order polling of backend truth into the Order Store
//
// One cooperative task per tracked order. Tasks suspend only on the polling
// delay and on the backend call, and every write goes through the store.

use super::health::{HealthEvent, TrackingHealth};
use crate::backend::{with_deadline, BackendError, OrderBackend};
use crate::config::{OnTimeout, TrackingConfig};
use crate::orders::{Order, OrderId, OrderStatus, OrderStore, SyncEvent, UpsertRejection};
use crate::telemetry::create_sync_span;
use parking_lot::Mutex;
use statig::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Snapshot of the bookkeeping kept for one tracked order
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationRecord {
    pub order_id: OrderId,
    pub last_confirmed_status: Option<OrderStatus>,
    pub pending_local_status: Option<OrderStatus>,
    pub last_poll_at: Option<Instant>,
    pub last_confirmed_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub degraded: bool,
    /// False while suspended or after the task halted itself
    pub polling: bool,
}

struct RecordState {
    health: StateMachine<TrackingHealth>,
    last_confirmed_status: Option<OrderStatus>,
    last_confirmed_at: Option<Instant>,
    last_poll_at: Option<Instant>,
}

impl RecordState {
    fn new(order_id: &str, degraded_threshold: u32) -> Self {
        Self {
            health: TrackingHealth::new(order_id.to_string(), degraded_threshold).state_machine(),
            last_confirmed_status: None,
            last_confirmed_at: None,
            last_poll_at: None,
        }
    }
}

struct PollTask {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl PollTask {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

struct TrackedOrder {
    generation: u64,
    record: Arc<Mutex<RecordState>>,
    task: Option<PollTask>,
}

type TrackedMap = Arc<Mutex<HashMap<OrderId, TrackedOrder>>>;

pub struct Reconciler {
    store: Arc<OrderStore>,
    backend: Arc<dyn OrderBackend>,
    config: TrackingConfig,
    tracked: TrackedMap,
    next_generation: AtomicU64,
    suspended: AtomicBool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("tracked", &self.tracked.lock().len())
            .field("suspended", &self.suspended.load(Ordering::SeqCst))
            .field("config", &self.config)
            .finish()
    }
}

impl Reconciler {
    pub fn new(store: Arc<OrderStore>, backend: Arc<dyn OrderBackend>, config: TrackingConfig) -> Self {
        Self {
            store,
            backend,
            config,
            tracked: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Start polling an order. The first poll happens immediately, then once
    /// per interval. Returns false if the order already has a live task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn track(&self, order_id: &str) -> bool {
        let suspended = self.suspended.load(Ordering::SeqCst);
        let mut tracked = self.tracked.lock();

        if let Some(existing) = tracked.get_mut(order_id) {
            if existing.task.as_ref().is_some_and(PollTask::is_live) {
                return false;
            }
            if !suspended {
                existing.task = Some(self.spawn(order_id, existing.generation, &existing.record, Instant::now()));
            }
            return true;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(Mutex::new(RecordState::new(order_id, self.config.degraded_threshold)));
        let task = (!suspended).then(|| self.spawn(order_id, generation, &record, Instant::now()));
        tracked.insert(
            order_id.to_string(),
            TrackedOrder {
                generation,
                record,
                task,
            },
        );
        info!(order_id = %order_id, suspended = suspended, "Started tracking order");
        true
    }

    /// Stop polling one order. A request already in flight completes and its
    /// result is discarded. Other orders are unaffected.
    pub fn stop_tracking(&self, order_id: &str) -> bool {
        let removed = self.tracked.lock().remove(order_id);
        match removed {
            Some(entry) => {
                if let Some(task) = entry.task {
                    task.cancel.cancel();
                }
                info!(order_id = %order_id, "Stopped tracking order");
                true
            }
            None => false,
        }
    }

    /// The UI has seen the order's terminal status: stop polling and drop it
    /// from the store. Orders the backend still reports as active are kept.
    pub fn acknowledge(&self, order_id: &str) -> bool {
        if let Some(order) = self.store.confirmed(order_id) {
            if order.is_active() {
                warn!(
                    order_id = %order_id,
                    status = %order.status,
                    "Ignoring acknowledgement of an order that is still active"
                );
                return false;
            }
        }
        self.stop_tracking(order_id);
        self.store.remove(order_id);
        true
    }

    /// Poll an order right away, e.g. after a push notification
    pub fn notify(&self, order_id: &str) -> bool {
        let tracked = self.tracked.lock();
        match tracked.get(order_id).and_then(|t| t.task.as_ref()) {
            Some(task) if task.is_live() => {
                task.wake.notify_one();
                true
            }
            _ => false,
        }
    }

    pub fn is_tracking(&self, order_id: &str) -> bool {
        self.tracked
            .lock()
            .get(order_id)
            .and_then(|t| t.task.as_ref())
            .is_some_and(PollTask::is_live)
    }

    pub fn tracked_ids(&self) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self.tracked.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn record(&self, order_id: &str) -> Option<ReconciliationRecord> {
        let tracked = self.tracked.lock();
        let entry = tracked.get(order_id)?;
        let record = entry.record.lock();
        let health = record.health.inner();
        Some(ReconciliationRecord {
            order_id: order_id.to_string(),
            last_confirmed_status: record.last_confirmed_status,
            pending_local_status: self.store.pending_status(order_id),
            last_poll_at: record.last_poll_at,
            last_confirmed_at: record.last_confirmed_at,
            consecutive_failures: health.consecutive_failures(),
            degraded: health.is_degraded(),
            polling: entry.task.as_ref().is_some_and(PollTask::is_live),
        })
    }

    /// Pause every per-order poll (app moved to background). Records are kept.
    pub fn suspend_all(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        let mut tracked = self.tracked.lock();
        for entry in tracked.values_mut() {
            if let Some(task) = entry.task.take() {
                task.cancel.cancel();
            }
        }
        info!(orders = tracked.len(), "Suspended order tracking");
    }

    /// Resume every poll. Orders confirmed less than one interval ago wait
    /// for the rest of that interval instead of polling immediately.
    pub fn resume_all(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        let now = Instant::now();
        let interval = self.config.poll_interval();
        let mut tracked = self.tracked.lock();

        for (order_id, entry) in tracked.iter_mut() {
            if entry.task.as_ref().is_some_and(PollTask::is_live) {
                continue;
            }
            let first_poll = match entry.record.lock().last_confirmed_at {
                Some(at) if now.saturating_duration_since(at) < interval => at + interval,
                _ => now,
            };
            entry.task = Some(self.spawn(order_id, entry.generation, &entry.record, first_poll));
        }
        info!(orders = tracked.len(), "Resumed order tracking");
    }

    /// Cancel every task and wait for them to wind down
    pub async fn shutdown(&self, grace: Duration) {
        self.suspended.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = {
            let mut tracked = self.tracked.lock();
            tracked
                .drain()
                .filter_map(|(_, entry)| entry.task)
                .map(|task| {
                    task.cancel.cancel();
                    task.handle
                })
                .collect()
        };

        let count = handles.len();
        let joined = tokio::time::timeout(grace, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        match joined {
            Ok(()) => info!(tasks = count, "Order tracking shut down"),
            Err(_) => warn!(tasks = count, "Timed out waiting for tracking tasks to stop"),
        }
    }

    fn spawn(
        &self,
        order_id: &str,
        generation: u64,
        record: &Arc<Mutex<RecordState>>,
        first_poll: Instant,
    ) -> PollTask {
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let poll = PollLoop {
            order_id: order_id.to_string(),
            generation,
            store: Arc::clone(&self.store),
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
            record: Arc::clone(record),
            tracked: Arc::clone(&self.tracked),
            cancel: cancel.clone(),
            wake: Arc::clone(&wake),
        };
        let span = create_sync_span("track_order", Some(order_id), None, None);
        let handle = tokio::spawn(poll.run(first_poll).instrument(span));
        PollTask { cancel, wake, handle }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct PollLoop {
    order_id: OrderId,
    generation: u64,
    store: Arc<OrderStore>,
    backend: Arc<dyn OrderBackend>,
    config: TrackingConfig,
    record: Arc<Mutex<RecordState>>,
    tracked: TrackedMap,
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

impl PollLoop {
    async fn run(self, first_poll: Instant) {
        let mut deadline = first_poll;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => debug!(order_id = %self.order_id, "Poll requested early"),
                _ = sleep_until(deadline) => {}
            }

            if !self.store.contains(&self.order_id) {
                debug!(order_id = %self.order_id, "Order left the store, stopping poll");
                self.forget();
                break;
            }

            let result = with_deadline(
                "get_order",
                self.config.call_timeout(),
                self.backend.get_order(&self.order_id),
            )
            .await;

            if self.cancel.is_cancelled() {
                debug!(order_id = %self.order_id, "Discarding poll result for untracked order");
                break;
            }

            match self.apply(result) {
                Flow::Continue => deadline = Instant::now() + self.config.poll_interval(),
                Flow::Stop => {
                    self.forget();
                    break;
                }
            }
        }
    }

    fn apply(&self, result: Result<Order, BackendError>) -> Flow {
        let now = Instant::now();
        let mut record = self.record.lock();
        record.last_poll_at = Some(now);

        match result {
            Ok(order) => {
                let was_degraded = record.health.inner().is_degraded();
                record.health.handle(&HealthEvent::PollSucceeded);
                drop(record);

                if was_degraded {
                    self.store.publish(SyncEvent::TrackingRecovered {
                        order_id: self.order_id.clone(),
                    });
                }
                let status = order.status;
                match self.store.refresh(order) {
                    None => Flow::Stop,
                    // Older than what the store holds; the record keeps the last
                    // value the store actually accepted.
                    Some(Err(UpsertRejection::StaleVersion { .. })) => Flow::Continue,
                    Some(_) => {
                        let mut record = self.record.lock();
                        record.last_confirmed_status = Some(status);
                        record.last_confirmed_at = Some(now);
                        Flow::Continue
                    }
                }
            }
            Err(BackendError::NotFound { .. }) => {
                record.health.handle(&HealthEvent::Halt);
                drop(record);
                warn!(order_id = %self.order_id, "Backend no longer knows this order");
                self.store.publish(SyncEvent::OrderNotFound {
                    order_id: self.order_id.clone(),
                });
                self.store.remove(&self.order_id);
                Flow::Stop
            }
            Err(BackendError::Unauthorized) => {
                record.health.handle(&HealthEvent::Halt);
                drop(record);
                warn!(order_id = %self.order_id, "Backend refused credentials, halting poll");
                self.store.publish(SyncEvent::AuthenticationRequired);
                Flow::Stop
            }
            Err(err) if err.is_timeout() && self.config.timeout.on_timeout == OnTimeout::Ignore => {
                debug!(order_id = %self.order_id, error = %err, "Ignoring timed out poll");
                Flow::Continue
            }
            Err(err) => {
                let was_degraded = record.health.inner().is_degraded();
                record.health.handle(&HealthEvent::PollFailed);
                let degraded = record.health.inner().is_degraded();
                let consecutive_failures = record.health.inner().consecutive_failures();
                drop(record);

                warn!(
                    order_id = %self.order_id,
                    error = %err,
                    transient = err.is_transient(),
                    consecutive_failures = consecutive_failures,
                    "Order poll failed"
                );
                if degraded && !was_degraded {
                    self.store.publish(SyncEvent::TrackingDegraded {
                        order_id: self.order_id.clone(),
                        consecutive_failures,
                    });
                }
                Flow::Continue
            }
        }
    }

    fn forget(&self) {
        let mut tracked = self.tracked.lock();
        if tracked
            .get(&self.order_id)
            .is_some_and(|t| t.generation == self.generation)
        {
            tracked.remove(&self.order_id);
        }
    }
}
