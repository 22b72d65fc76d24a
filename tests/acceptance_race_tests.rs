//! Two drivers racing for the same open order

mod fixtures;

use fixtures::{engine_with, order, EventRecorder, GatedBackend};
use ride_sync::backend::InMemoryBackend;
use ride_sync::orders::{OrderStatus, SyncEvent};
use ride_sync::AcceptanceError;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_exactly_one_driver_wins() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(order("R1", OrderStatus::Matching, 2));
    backend.seed(order("R2", OrderStatus::Pending, 1));

    let alice = engine_with(backend.clone());
    let bob = engine_with(backend.clone());
    let bob_events = EventRecorder::attach(bob.store());
    alice.refresh_available_orders().await.unwrap();
    bob.refresh_available_orders().await.unwrap();

    let (a, b) = tokio::join!(
        alice.attempt_accept("R1", "driver-alice"),
        bob.attempt_accept("R1", "driver-bob"),
    );

    let (winner, loser, loser_result) = match (&a, &b) {
        (Ok(_), Err(_)) => (&alice, &bob, b.clone()),
        (Err(_), Ok(_)) => (&bob, &alice, a.clone()),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    let won = a.as_ref().or(b.as_ref()).unwrap();

    assert_eq!(won.status, OrderStatus::Matched);
    assert_eq!(
        loser_result.unwrap_err(),
        AcceptanceError::AlreadyClaimed {
            order_id: "R1".to_string()
        }
    );
    for engine in [&alice, &bob] {
        assert!(engine.available_orders().iter().all(|o| o.id != "R1"));
        assert!(engine.available_orders().iter().any(|o| o.id == "R2"));
    }
    assert_eq!(winner.order("R1").unwrap().status, OrderStatus::Matched);
    assert!(winner.reconciler().is_tracking("R1"));
    assert!(loser.order("R1").is_none());
    assert_eq!(backend.order("R1").unwrap().driver_id, won.driver_id);

    if a.is_ok() {
        assert!(bob_events
            .events()
            .contains(&SyncEvent::OrderClaimedElsewhere { order_id: "R1".to_string() }));
    }

    alice.shutdown(Duration::from_secs(1)).await;
    bob.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_accepting_a_matched_order_is_informational() {
    let backend = Arc::new(InMemoryBackend::new());
    let mut taken = order("R1", OrderStatus::Matched, 3);
    taken.driver_id = Some("driver-carol".to_string());
    backend.seed(taken);

    let engine = engine_with(backend.clone());
    let err = engine.attempt_accept("R1", "driver-dave").await.unwrap_err();

    assert!(err.is_informational());
    assert!(!engine.reconciler().is_tracking("R1"));
}

#[tokio::test]
async fn test_refresh_overlapping_a_won_accept_keeps_order_off_board() {
    let inner = Arc::new(InMemoryBackend::new());
    inner.seed(order("R1", OrderStatus::Matching, 2));
    inner.seed(order("R2", OrderStatus::Pending, 1));
    let backend = Arc::new(GatedBackend::new(inner.clone()));
    let engine = engine_with(backend.clone());

    backend.hold_board();
    let (refreshed, won) = tokio::join!(engine.refresh_available_orders(), async {
        // The refresh already holds a snapshot that still lists R1
        backend.board_entered.notified().await;
        let won = engine.attempt_accept("R1", "driver-erin").await;
        backend.release_board();
        won
    });

    assert_eq!(won.unwrap().status, OrderStatus::Matched);
    let ids = |orders: Vec<ride_sync::orders::Order>| orders.into_iter().map(|o| o.id).collect::<Vec<_>>();
    assert_eq!(ids(refreshed.unwrap()), vec!["R2".to_string()]);
    assert_eq!(ids(engine.available_orders()), vec!["R2".to_string()]);
    assert_eq!(engine.order("R1").unwrap().status, OrderStatus::Matched);

    // Once nothing is in flight the backend's word is final again
    engine.refresh_available_orders().await.unwrap();
    assert_eq!(ids(engine.available_orders()), vec!["R2".to_string()]);

    engine.shutdown(Duration::from_secs(1)).await;
}
