// Order Store - single arbitration point for order state
//
// Durable state only ever comes from confirmed writes (or the first insert of
// an order). Optimistic writes live beside it as a pending overlay until the
// backend confirms or overrides them.

use super::events::{SyncEvent, WriteSource};
use super::transitions::{validate_transition, IllegalTransition};
use super::types::{Order, OrderId, OrderStatus};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type Subscriber = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Applied,
    /// Confirmed write identical to what the store already holds
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpsertRejection {
    #[error("Order {order_id}: {transition}")]
    IllegalTransition {
        order_id: OrderId,
        transition: IllegalTransition,
    },
    #[error("Order {order_id}: confirmed version {offered} is older than held version {held}")]
    StaleVersion {
        order_id: OrderId,
        held: u64,
        offered: u64,
    },
    #[error("Order {order_id} is not held locally")]
    UnknownOrder { order_id: OrderId },
}

#[derive(Debug)]
struct Entry {
    durable: Order,
    pending: Option<Order>,
}

impl Entry {
    fn view(&self) -> &Order {
        self.pending.as_ref().unwrap_or(&self.durable)
    }
}

pub struct OrderStore {
    entries: Mutex<HashMap<OrderId, Entry>>,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    // Held across apply + notify so subscribers observe writes in upsert order.
    // Re-entrant so a callback may write back into the store on the same thread.
    delivery: ReentrantMutex<()>,
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OrderStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderStore")
            .field("orders", &self.entries.lock().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            delivery: ReentrantMutex::new(()),
        }
    }

    /// Insert or update an order.
    ///
    /// Optimistic writes must follow the transition table from the order's
    /// current (possibly pending) status. Confirmed writes may jump to any
    /// status, clear the pending overlay, and are only refused when older
    /// than the confirmed version already held.
    pub fn upsert(&self, order: Order, source: WriteSource) -> Result<UpsertOutcome, UpsertRejection> {
        let _delivery = self.delivery.lock();
        let applied = {
            let mut entries = self.entries.lock();
            Self::apply(&mut entries, order, source)
        };
        self.settle(applied, source)
    }

    /// Confirmed write for an order the store already holds. Returns `None`
    /// without touching anything when the order has been removed, so a late
    /// poll result can never bring back an acknowledged order.
    pub fn refresh(&self, order: Order) -> Option<Result<UpsertOutcome, UpsertRejection>> {
        let _delivery = self.delivery.lock();
        let applied = {
            let mut entries = self.entries.lock();
            if !entries.contains_key(&order.id) {
                return None;
            }
            Self::apply(&mut entries, order, WriteSource::Confirmed)
        };
        Some(self.settle(applied, WriteSource::Confirmed))
    }

    fn settle(
        &self,
        applied: Result<(UpsertOutcome, Option<Order>), UpsertRejection>,
        source: WriteSource,
    ) -> Result<UpsertOutcome, UpsertRejection> {
        match applied {
            Ok((outcome, Some(view))) => {
                debug!(
                    order_id = %view.id,
                    status = %view.status,
                    version = view.version,
                    source = ?source,
                    "Order upserted"
                );
                self.dispatch(&SyncEvent::OrderUpdated { order: view, source });
                Ok(outcome)
            }
            Ok((outcome, None)) => Ok(outcome),
            Err(rejection) => {
                match &rejection {
                    UpsertRejection::IllegalTransition { order_id, transition } => {
                        warn!(
                            order_id = %order_id,
                            from = %transition.from,
                            to = %transition.to,
                            "Dropped illegal optimistic transition"
                        );
                        self.dispatch(&SyncEvent::LocalUpdateRejected {
                            order_id: order_id.clone(),
                            from: transition.from,
                            to: transition.to,
                        });
                    }
                    UpsertRejection::StaleVersion { order_id, held, offered } => {
                        debug!(
                            order_id = %order_id,
                            held = held,
                            offered = offered,
                            "Dropped stale confirmed write"
                        );
                    }
                    UpsertRejection::UnknownOrder { order_id } => {
                        warn!(order_id = %order_id, "Dropped optimistic write for unknown order");
                    }
                }
                Err(rejection)
            }
        }
    }

    fn apply(
        entries: &mut HashMap<OrderId, Entry>,
        order: Order,
        source: WriteSource,
    ) -> Result<(UpsertOutcome, Option<Order>), UpsertRejection> {
        let Some(entry) = entries.get_mut(&order.id) else {
            // A guess has no durable value to fall back on
            if source == WriteSource::Optimistic {
                return Err(UpsertRejection::UnknownOrder { order_id: order.id });
            }
            let view = order.clone();
            entries.insert(
                order.id.clone(),
                Entry {
                    durable: order,
                    pending: None,
                },
            );
            return Ok((UpsertOutcome::Inserted, Some(view)));
        };

        match source {
            WriteSource::Confirmed => {
                if order.version < entry.durable.version {
                    return Err(UpsertRejection::StaleVersion {
                        order_id: order.id,
                        held: entry.durable.version,
                        offered: order.version,
                    });
                }
                if entry.pending.is_none() && entry.durable == order {
                    return Ok((UpsertOutcome::Unchanged, None));
                }
                entry.pending = None;
                entry.durable = order;
                Ok((UpsertOutcome::Applied, Some(entry.durable.clone())))
            }
            WriteSource::Optimistic => {
                let current = entry.view().status;
                if let Err(transition) = validate_transition(current, order.status) {
                    return Err(UpsertRejection::IllegalTransition {
                        order_id: order.id,
                        transition,
                    });
                }
                entry.pending = Some(order.clone());
                Ok((UpsertOutcome::Applied, Some(order)))
            }
        }
    }

    /// Current view of an order: the pending optimistic value if any,
    /// otherwise the last confirmed one.
    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.entries.lock().get(order_id).map(|e| e.view().clone())
    }

    /// Last confirmed value, ignoring any pending optimistic write
    pub fn confirmed(&self, order_id: &str) -> Option<Order> {
        self.entries.lock().get(order_id).map(|e| e.durable.clone())
    }

    pub fn pending_status(&self, order_id: &str) -> Option<OrderStatus> {
        self.entries
            .lock()
            .get(order_id)
            .and_then(|e| e.pending.as_ref().map(|p| p.status))
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.entries.lock().contains_key(order_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// All orders, sorted by identifier
    pub fn snapshot(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.entries.lock().values().map(|e| e.view().clone()).collect();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        orders
    }

    pub fn active_orders(&self) -> Vec<Order> {
        self.snapshot().into_iter().filter(Order::is_active).collect()
    }

    /// Roll back a pending optimistic write, re-publishing the durable value.
    /// Returns false when nothing was pending.
    pub fn discard_pending(&self, order_id: &str) -> bool {
        let _delivery = self.delivery.lock();
        let durable = {
            let mut entries = self.entries.lock();
            match entries.get_mut(order_id) {
                Some(entry) => entry.pending.take().map(|_| entry.durable.clone()),
                None => None,
            }
        };

        match durable {
            Some(order) => {
                info!(order_id = %order_id, status = %order.status, "Rolled back optimistic write");
                self.dispatch(&SyncEvent::OrderUpdated {
                    order,
                    source: WriteSource::Confirmed,
                });
                true
            }
            None => false,
        }
    }

    /// Drop an order once its terminal status has been acknowledged
    pub fn remove(&self, order_id: &str) -> Option<Order> {
        let _delivery = self.delivery.lock();
        let removed = self.entries.lock().remove(order_id).map(|e| e.durable);
        if removed.is_some() {
            info!(order_id = %order_id, "Order removed from store");
            self.dispatch(&SyncEvent::OrderRemoved {
                order_id: order_id.to_string(),
            });
        }
        removed
    }

    /// Register a callback invoked synchronously for every event, in write order.
    ///
    /// Callbacks run on whichever task performed the write and should hand
    /// the event off to the UI's own context rather than render from here.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Deliver a non-write event (tracking problems, race outcomes) on the
    /// same channel as state changes
    pub fn publish(&self, event: SyncEvent) {
        let _delivery = self.delivery.lock();
        self.dispatch(&event);
    }

    fn dispatch(&self, event: &SyncEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::types::Location;
    use chrono::Utc;

    fn order(id: &str, status: OrderStatus, version: u64) -> Order {
        Order {
            id: id.to_string(),
            status,
            pickup: Location::new(52.52, 13.40),
            destination: Location::new(52.50, 13.45),
            scheduled_at: None,
            passenger_count: 1,
            service_options: Default::default(),
            driver_id: None,
            version,
            updated_at: Utc::now(),
        }
    }

    fn recorder(store: &OrderStore) -> Arc<Mutex<Vec<SyncEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.subscribe(move |event| sink.lock().push(event.clone()));
        events
    }

    #[test]
    fn test_illegal_optimistic_write_then_confirmed_override() {
        let store = OrderStore::new();
        store.upsert(order("O1", OrderStatus::Pending, 1), WriteSource::Confirmed).unwrap();

        let rejected = store.upsert(order("O1", OrderStatus::InProgress, 1), WriteSource::Optimistic);
        assert!(matches!(rejected, Err(UpsertRejection::IllegalTransition { .. })));
        assert_eq!(store.get("O1").unwrap().status, OrderStatus::Pending);

        let applied = store.upsert(order("O1", OrderStatus::Matched, 2), WriteSource::Confirmed);
        assert_eq!(applied, Ok(UpsertOutcome::Applied));
        assert_eq!(store.get("O1").unwrap().status, OrderStatus::Matched);
    }

    #[test]
    fn test_confirmed_write_is_idempotent() {
        let store = OrderStore::new();
        let events = recorder(&store);
        let o = order("O1", OrderStatus::Matched, 3);

        assert_eq!(store.upsert(o.clone(), WriteSource::Confirmed), Ok(UpsertOutcome::Inserted));
        let after_first = store.snapshot();
        assert_eq!(store.upsert(o, WriteSource::Confirmed), Ok(UpsertOutcome::Unchanged));

        assert_eq!(store.snapshot(), after_first);
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_optimistic_write_stays_in_side_channel() {
        let store = OrderStore::new();
        store.upsert(order("O1", OrderStatus::Arrived, 5), WriteSource::Confirmed).unwrap();
        store.upsert(order("O1", OrderStatus::Cancelled, 5), WriteSource::Optimistic).unwrap();

        assert_eq!(store.get("O1").unwrap().status, OrderStatus::Cancelled);
        assert_eq!(store.confirmed("O1").unwrap().status, OrderStatus::Arrived);
        assert_eq!(store.pending_status("O1"), Some(OrderStatus::Cancelled));
    }

    #[test]
    fn test_newer_confirmed_write_overrides_pending() {
        let store = OrderStore::new();
        store.upsert(order("O1", OrderStatus::Arrived, 5), WriteSource::Confirmed).unwrap();
        store.upsert(order("O1", OrderStatus::Cancelled, 5), WriteSource::Optimistic).unwrap();

        store.upsert(order("O1", OrderStatus::InProgress, 6), WriteSource::Confirmed).unwrap();

        assert_eq!(store.get("O1").unwrap().status, OrderStatus::InProgress);
        assert_eq!(store.pending_status("O1"), None);
    }

    #[test]
    fn test_stale_confirmed_write_is_dropped() {
        let store = OrderStore::new();
        store.upsert(order("O1", OrderStatus::DriverEnRoute, 7), WriteSource::Confirmed).unwrap();

        let stale = store.upsert(order("O1", OrderStatus::Matched, 6), WriteSource::Confirmed);
        assert_eq!(
            stale,
            Err(UpsertRejection::StaleVersion {
                order_id: "O1".to_string(),
                held: 7,
                offered: 6,
            })
        );
        assert_eq!(store.get("O1").unwrap().status, OrderStatus::DriverEnRoute);
    }

    #[test]
    fn test_confirmed_write_may_skip_intermediate_statuses() {
        let store = OrderStore::new();
        store.upsert(order("O1", OrderStatus::Pending, 1), WriteSource::Confirmed).unwrap();
        store.upsert(order("O1", OrderStatus::Completed, 9), WriteSource::Confirmed).unwrap();
        assert_eq!(store.get("O1").unwrap().status, OrderStatus::Completed);
    }

    #[test]
    fn test_subscribers_see_writes_in_order_with_rejections_tagged() {
        let store = OrderStore::new();
        let events = recorder(&store);

        store.upsert(order("O1", OrderStatus::Pending, 1), WriteSource::Confirmed).unwrap();
        store.upsert(order("O1", OrderStatus::Matching, 1), WriteSource::Optimistic).unwrap();
        let _ = store.upsert(order("O1", OrderStatus::Completed, 1), WriteSource::Optimistic);
        store.upsert(order("O1", OrderStatus::Matched, 2), WriteSource::Confirmed).unwrap();

        let seen: Vec<_> = events
            .lock()
            .iter()
            .map(|e| match e {
                SyncEvent::OrderUpdated { order, source } => format!("{}:{:?}", order.status, source),
                SyncEvent::LocalUpdateRejected { to, .. } => format!("rejected:{to}"),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                "pending:Confirmed",
                "matching:Optimistic",
                "rejected:completed",
                "matched:Confirmed",
            ]
        );
    }

    #[test]
    fn test_discard_pending_republishes_durable_value() {
        let store = OrderStore::new();
        store.upsert(order("O1", OrderStatus::Matched, 2), WriteSource::Confirmed).unwrap();
        store.upsert(order("O1", OrderStatus::Cancelled, 2), WriteSource::Optimistic).unwrap();
        let events = recorder(&store);

        assert!(store.discard_pending("O1"));
        assert!(!store.discard_pending("O1"));
        assert_eq!(store.get("O1").unwrap().status, OrderStatus::Matched);
        assert_eq!(store.pending_status("O1"), None);
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SyncEvent::OrderUpdated { order, source: WriteSource::Confirmed }
                if order.status == OrderStatus::Matched && order.version == 2
        ));
        assert!(!store.discard_pending("missing"));
    }

    #[test]
    fn test_optimistic_write_for_unknown_order_is_refused() {
        let store = OrderStore::new();
        let events = recorder(&store);

        let refused = store.upsert(order("P1", OrderStatus::Matched, 5), WriteSource::Optimistic);
        assert_eq!(
            refused,
            Err(UpsertRejection::UnknownOrder {
                order_id: "P1".to_string()
            })
        );
        assert!(!store.contains("P1"));
        assert!(!store.discard_pending("P1"));
        assert!(events.lock().is_empty());

        // Backend truth at a lower version than the refused guess still lands
        assert_eq!(
            store.upsert(order("P1", OrderStatus::Pending, 2), WriteSource::Confirmed),
            Ok(UpsertOutcome::Inserted)
        );
        assert_eq!(store.get("P1").unwrap().status, OrderStatus::Pending);
        assert_eq!(store.pending_status("P1"), None);
    }

    #[test]
    fn test_remove_and_unsubscribe() {
        let store = OrderStore::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = store.subscribe(move |e: &SyncEvent| sink.lock().push(e.clone()));

        store.upsert(order("O3", OrderStatus::Completed, 4), WriteSource::Confirmed).unwrap();
        assert!(store.remove("O3").is_some());
        assert!(store.remove("O3").is_none());
        assert!(!store.contains("O3"));

        assert!(store.unsubscribe(id));
        store.upsert(order("O4", OrderStatus::Pending, 1), WriteSource::Confirmed).unwrap();
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn test_refresh_never_resurrects_removed_order() {
        let store = OrderStore::new();
        assert_eq!(store.refresh(order("O3", OrderStatus::Completed, 4)), None);
        assert!(store.is_empty());

        store.upsert(order("O3", OrderStatus::InProgress, 3), WriteSource::Confirmed).unwrap();
        assert_eq!(
            store.refresh(order("O3", OrderStatus::Completed, 4)),
            Some(Ok(UpsertOutcome::Applied))
        );
    }

    #[test]
    fn test_callback_can_reenter_store() {
        let store = Arc::new(OrderStore::new());
        let inner = Arc::clone(&store);
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        store.subscribe(move |event| {
            if let SyncEvent::OrderUpdated { order, .. } = event {
                *sink.lock() = inner.get(&order.id).map(|o| o.status);
            }
        });

        store.upsert(order("O1", OrderStatus::Matching, 1), WriteSource::Confirmed).unwrap();
        assert_eq!(*observed.lock(), Some(OrderStatus::Matching));
    }
}
