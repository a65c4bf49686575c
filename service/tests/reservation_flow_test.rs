//! End-to-end slot lifecycle over the in-memory collaborators.
//!
//! Run with: `cargo test -p stockroom --test reservation_flow_test`

#![allow(clippy::unwrap_used)]

mod common;

use chrono::Duration;
use common::Harness;
use stockroom::reservation::NOT_ENOUGH_STORES;
use stockroom_core::command::{BookLine, BookStores, PayStores, UnbookStore};
use stockroom_core::environment::Clock;
use stockroom_core::error::{CatalogError, ConflictKind};
use stockroom_core::event_bus::topics;
use stockroom_core::message::{CatalogMessage, OrderStatus};
use stockroom_core::model::{OrderId, ProductId, Store, StoreId};
use stockroom_testing::mocks::epoch;

fn order(lines: &[(ProductId, u32)]) -> BookStores {
    BookStores {
        order_id: OrderId::new(),
        products: lines
            .iter()
            .map(|&(product_id, quantity)| BookLine {
                product_id,
                quantity,
            })
            .collect(),
    }
}

fn oldest_first(mut stores: Vec<Store>) -> Vec<Store> {
    stores.sort_by_key(|s| s.created_at);
    stores
}

fn ids(stores: &[Store]) -> Vec<StoreId> {
    let mut ids: Vec<StoreId> = stores.iter().map(|s| s.id).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn book_expire_and_pay() {
    let mut h = Harness::new();
    let product = h.product_with("Desk Lamp", 3).await;

    // Provisioned through the store-create command on the bus.
    let slots = oldest_first(h.ledger.stores_of(product.id));
    assert_eq!(slots.len(), 3);
    assert!(slots.iter().all(|s| s.version == 0 && s.booked_at.is_none() && !s.sold));

    let booked = h
        .catalog
        .book_stores(order(&[(product.id, 2)]))
        .await
        .unwrap();
    assert_eq!(ids(&booked), ids(&slots[..2]));
    let hold_until = epoch() + Duration::minutes(1);
    assert!(booked
        .iter()
        .all(|s| s.booked_at == Some(hold_until) && s.version == 1));
    let available = h
        .ledger
        .stores_of(product.id)
        .iter()
        .filter(|s| s.is_available(h.clock.now()))
        .count();
    assert_eq!(available, 1);

    // Nothing is released before the hold expires.
    h.watchdog.drain_commands();
    h.clock.advance(Duration::seconds(59));
    assert_eq!(h.watchdog.scan().await.unwrap(), 0);

    h.clock.advance(Duration::seconds(1));
    assert_eq!(h.watchdog.scan().await.unwrap(), 2);
    h.pump().await;

    for store in &booked {
        let stored = h.ledger.store(store.id).unwrap();
        assert_eq!(stored.booked_at, None);
        assert_eq!(stored.version, 2);
    }

    let paid = h
        .catalog
        .pay_stores(PayStores {
            ids: vec![booked[0].id],
        })
        .await
        .unwrap();
    assert_eq!(paid.len(), 1);
    let sold = h.ledger.store(booked[0].id).unwrap();
    assert!(sold.sold);
    assert_eq!(sold.booked_at, None);
    assert_eq!(sold.version, 3);
}

#[tokio::test]
async fn book_then_pay_moves_version_by_two() {
    let mut h = Harness::new();
    let product = h.product_with("Stool", 1).await;

    let booked = h
        .catalog
        .book_stores(order(&[(product.id, 1)]))
        .await
        .unwrap();
    h.catalog
        .pay_stores(PayStores {
            ids: vec![booked[0].id],
        })
        .await
        .unwrap();

    let stored = h.ledger.store(booked[0].id).unwrap();
    assert!(stored.sold);
    assert_eq!(stored.version, 2);

    // Paying forgets the slot, so the watchdog never releases it.
    h.watchdog.drain_commands();
    h.clock.advance(Duration::minutes(5));
    assert_eq!(h.watchdog.scan().await.unwrap(), 0);
}

#[tokio::test]
async fn successful_booking_notifies_orders_and_replica() {
    let mut h = Harness::new();
    let product = h.product_with("Chair", 2).await;
    let cmd = order(&[(product.id, 2)]);
    let order_id = cmd.order_id;

    let booked = h.catalog.book_stores(cmd).await.unwrap();
    h.pump().await;

    let handed_over = h.messages_on(topics::ORDER_STORE_BOOKED);
    assert!(matches!(
        handed_over.as_slice(),
        [CatalogMessage::StoreOrderUpdate { order_id: id, stores }] if *id == order_id && stores.len() == 2
    ));
    for store in &booked {
        assert_eq!(h.replica.store(store.id).unwrap().version, 1);
    }
    assert!(h.messages_on(topics::ORDER_STATUS).is_empty());
}

#[tokio::test]
async fn concurrent_bookings_for_the_last_slot() {
    let mut h = Harness::new();
    let product = h.product_with("Last One", 1).await;

    let (a, b) = tokio::join!(
        h.catalog.book_stores(order(&[(product.id, 1)])),
        h.catalog.book_stores(order(&[(product.id, 1)])),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(
        loser,
        &CatalogError::conflict(ConflictKind::InsufficientStock, NOT_ENOUGH_STORES)
    );

    h.pump().await;
    assert_eq!(h.messages_on(topics::ORDER_STATUS).len(), 1);
}

#[tokio::test]
async fn failed_multi_product_booking_releases_what_it_held() {
    let mut h = Harness::new();
    let plenty = h.product_with("Plenty", 2).await;
    let scarce = h.product_with("Scarce", 1).await;
    let cmd = order(&[(plenty.id, 2), (scarce.id, 2)]);
    let order_id = cmd.order_id;

    let err = h.catalog.book_stores(cmd).await.unwrap_err();
    h.pump().await;

    assert!(matches!(
        err,
        CatalogError::Conflict {
            kind: ConflictKind::InsufficientStock,
            ..
        }
    ));
    let now = h.clock.now();
    for store in h.ledger.stores_of(plenty.id) {
        assert!(store.is_available(now));
        assert_eq!(store.version, 2);
    }
    assert!(h.ledger.stores_of(scarce.id).iter().all(|s| s.version == 0));

    let canceled = h.messages_on(topics::ORDER_STATUS);
    assert!(matches!(
        canceled.as_slice(),
        [CatalogMessage::OrderStatusChanged { order_id: id, status: OrderStatus::Canceled, .. }] if *id == order_id
    ));
    assert!(matches!(
        h.messages_on(topics::STORE_UNBOOK_REPLICA).as_slice(),
        [CatalogMessage::StoresUnbooked { stores, .. }] if stores.len() == 2
    ));
    assert!(h.messages_on(topics::STORE_BOOK_REPLICA).is_empty());
}

#[tokio::test]
async fn booking_a_whole_batch_of_lines() {
    let mut h = Harness::new();
    let lamp = h.product_with("Lamp", 2).await;
    let desk = h.product_with("Desk", 1).await;

    let booked = h
        .catalog
        .book_stores(order(&[(lamp.id, 1), (desk.id, 1)]))
        .await
        .unwrap();

    assert_eq!(booked.len(), 2);
    assert_eq!(booked.iter().filter(|s| s.product_id == lamp.id).count(), 1);
    assert_eq!(booked.iter().filter(|s| s.product_id == desk.id).count(), 1);
}

#[tokio::test]
async fn explicit_unbook_releases_and_stops_watching() {
    let mut h = Harness::new();
    let product = h.product_with("Shelf", 1).await;
    let booked = h
        .catalog
        .book_stores(order(&[(product.id, 1)]))
        .await
        .unwrap();

    let released = h
        .catalog
        .unbook_store(UnbookStore::new(booked[0].id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(released.booked_at, None);
    assert_eq!(released.version, 2);

    h.watchdog.drain_commands();
    assert!(!h.watchdog.is_watching(booked[0].id));
    h.pump().await;
    assert_eq!(h.replica.store(booked[0].id).unwrap().booked_at, None);
}

#[tokio::test]
async fn late_expiry_unbook_leaves_a_newer_hold_alone() {
    let mut h = Harness::new();
    let product = h.product_with("Bench", 1).await;

    let first = h
        .catalog
        .book_stores(order(&[(product.id, 1)]))
        .await
        .unwrap();
    let slot = first[0].id;
    h.watchdog.drain_commands();
    h.clock.advance(Duration::seconds(60));
    assert_eq!(h.watchdog.scan().await.unwrap(), 1);

    // The hold lapsed, so another order takes the slot before the queued
    // unbook reaches the ledger.
    let second = h
        .catalog
        .book_stores(order(&[(product.id, 1)]))
        .await
        .unwrap();
    assert_eq!(second[0].id, slot);
    let second_hold = h.clock.now() + Duration::minutes(1);
    h.pump().await;

    let stored = h.ledger.store(slot).unwrap();
    assert_eq!(stored.booked_at, Some(second_hold));
    assert_eq!(stored.version, 2);
    assert_eq!(h.replica.store(slot).unwrap().version, 2);

    let err = h
        .catalog
        .book_stores(order(&[(product.id, 1)]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CatalogError::conflict(ConflictKind::InsufficientStock, NOT_ENOUGH_STORES)
    );
    h.watchdog.drain_commands();
    assert!(h.watchdog.is_watching(slot));
}

#[tokio::test]
async fn nil_unbook_is_a_no_op() {
    let h = Harness::new();
    let result = h
        .catalog
        .unbook_store(UnbookStore::new(StoreId::nil()))
        .await
        .unwrap();

    assert!(result.is_none());
    h.outbox.settle().await;
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn unbooking_an_unknown_slot_is_not_found() {
    let h = Harness::new();
    let id = StoreId::new();

    let err = h.catalog.unbook_store(UnbookStore::new(id)).await.unwrap_err();
    assert_eq!(err, CatalogError::not_found(format!("store id: {id} not found")));
}

#[tokio::test]
async fn paying_with_a_missing_slot_changes_nothing() {
    let mut h = Harness::new();
    let product = h.product_with("Rug", 1).await;
    let booked = h
        .catalog
        .book_stores(order(&[(product.id, 1)]))
        .await
        .unwrap();
    let missing = StoreId::new();

    let err = h
        .catalog
        .pay_stores(PayStores {
            ids: vec![booked[0].id, missing],
        })
        .await
        .unwrap_err();

    assert_eq!(err, CatalogError::not_found(format!("store id: {missing} not found")));
    let stored = h.ledger.store(booked[0].id).unwrap();
    assert!(!stored.sold);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_the_ledger() {
    let h = Harness::new();

    let empty = h.catalog.book_stores(order(&[])).await.unwrap_err();
    assert!(matches!(empty, CatalogError::Validation(_)));

    let zero = h
        .catalog
        .book_stores(order(&[(ProductId::new(), 0)]))
        .await
        .unwrap_err();
    assert!(matches!(zero, CatalogError::Validation(_)));

    let nothing_to_pay = h.catalog.pay_stores(PayStores { ids: vec![] }).await.unwrap_err();
    assert!(matches!(nothing_to_pay, CatalogError::Validation(_)));
}

#[tokio::test]
async fn booking_against_a_down_ledger_cancels_the_order() {
    let mut h = Harness::new();
    let product = h.product_with("Vase", 1).await;
    h.ledger.set_failing(true);

    let err = h
        .catalog
        .book_stores(order(&[(product.id, 1)]))
        .await
        .unwrap_err();
    h.pump().await;

    assert!(matches!(err, CatalogError::Infrastructure(_)));
    assert_eq!(h.messages_on(topics::ORDER_STATUS).len(), 1);
}
