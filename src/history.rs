// History Paginator - cursor-driven, de-duplicated order history

use crate::backend::{with_deadline, BackendError, OrderBackend};
use crate::orders::{HistoryPage, Order, OrderId, OrderStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct HistoryState {
    orders: Vec<Order>,
    positions: HashMap<OrderId, usize>,
    next_cursor: Option<String>,
    has_more: bool,
    pages_loaded: usize,
}

impl HistoryState {
    fn reset(&mut self) {
        *self = HistoryState::default();
    }

    fn merge(&mut self, order: Order) {
        match self.positions.get(&order.id) {
            Some(&index) => {
                if order.version >= self.orders[index].version {
                    self.orders[index] = order;
                }
            }
            None => {
                self.positions.insert(order.id.clone(), self.orders.len());
                self.orders.push(order);
            }
        }
    }
}

/// Accumulates history pages into one list with no duplicate ids.
///
/// Completion is whatever the backend says in `has_more`; a short page does
/// not end the history on its own.
pub struct HistoryPaginator {
    store: Arc<OrderStore>,
    backend: Arc<dyn OrderBackend>,
    call_timeout: Duration,
    page_size: u32,
    state: Mutex<HistoryState>,
}

impl std::fmt::Debug for HistoryPaginator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryPaginator")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl HistoryPaginator {
    pub fn new(
        store: Arc<OrderStore>,
        backend: Arc<dyn OrderBackend>,
        call_timeout: Duration,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            backend,
            call_timeout,
            page_size: page_size.max(1),
            state: Mutex::new(HistoryState::default()),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch one page. A `None` cursor starts over and replaces the
    /// accumulated list; any other cursor appends to it.
    ///
    /// Orders the store already holds are returned in their store version.
    pub async fn load_page(&self, cursor: Option<String>, limit: u32) -> Result<HistoryPage, BackendError> {
        // Held across the call so overlapping loads merge in request order
        let mut state = self.state.lock().await;

        let page = with_deadline(
            "list_order_history",
            self.call_timeout,
            self.backend.list_order_history(cursor.clone(), limit),
        )
        .await?;

        let orders: Vec<Order> = page.orders.into_iter().map(|o| self.prefer_store(o)).collect();

        if cursor.is_none() {
            state.reset();
        }
        let before = state.orders.len();
        for order in &orders {
            state.merge(order.clone());
        }
        state.next_cursor = page.next_cursor.clone();
        state.has_more = page.has_more;
        state.pages_loaded += 1;

        debug!(
            fetched = orders.len(),
            added = state.orders.len() - before,
            total = state.orders.len(),
            has_more = page.has_more,
            "Loaded history page"
        );

        Ok(HistoryPage {
            orders,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    /// Start over from the first page
    pub async fn load_first(&self) -> Result<HistoryPage, BackendError> {
        self.load_page(None, self.page_size).await
    }

    /// Fetch the page after the last one loaded. `Ok(None)` once the backend
    /// has reported there is nothing more.
    pub async fn load_next(&self) -> Result<Option<HistoryPage>, BackendError> {
        let cursor = {
            let state = self.state.lock().await;
            if state.pages_loaded == 0 {
                None
            } else if !state.has_more {
                return Ok(None);
            } else {
                match state.next_cursor.clone() {
                    Some(cursor) => Some(cursor),
                    None => {
                        warn!("Backend reported more history without a cursor");
                        return Ok(None);
                    }
                }
            }
        };
        self.load_page(cursor, self.page_size).await.map(Some)
    }

    /// The accumulated list, with live store versions layered on top
    pub async fn orders(&self) -> Vec<Order> {
        let state = self.state.lock().await;
        state.orders.iter().cloned().map(|o| self.prefer_store(o)).collect()
    }

    pub async fn has_more(&self) -> bool {
        self.state.lock().await.has_more
    }

    pub async fn next_cursor(&self) -> Option<String> {
        self.state.lock().await.next_cursor.clone()
    }

    fn prefer_store(&self, order: Order) -> Order {
        self.store.get(&order.id).unwrap_or(order)
    }
}
