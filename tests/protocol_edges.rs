//! Boundary behaviors: packet size minima, lock-time drift tolerance,
//! dust rejection and replay immunity.

mod common;

use chainswap::{
    order::Role,
    protocol::packet::{Command, Packet},
    wallet::WalletConnector,
};
use common::*;

#[test]
fn packet_size_minima_are_enforced() {
    let world = swap_world(0);
    let (key, _) = snode_keypair();

    // exact declared size is accepted; the unknown order is dropped quietly
    let mut hold = Packet::new(Command::TransactionHold);
    hold.append_address(&[0u8; 20]);
    hold.append_hash(&[9u8; 32]);
    hold.sign(&key);
    assert_eq!(hold.size(), 52);
    assert!(world.maker.session.process_packet(&hold).is_ok());

    // one byte below the minimum is a protocol violation
    let mut short = Packet::new(Command::TransactionHold);
    short.append_address(&[0u8; 20]);
    short.append_bytes(&[9u8; 31]);
    short.sign(&key);
    assert!(world.maker.session.process_packet(&short).is_err());

    let mut cancel = Packet::new(Command::TransactionCancel);
    cancel.append_hash(&[9u8; 32]);
    // reason truncated to three bytes
    cancel.append_bytes(&[0u8; 3]);
    cancel.sign(&key);
    assert!(world.maker.session.process_packet(&cancel).is_err());
}

#[test]
fn locktime_drift_boundary() {
    let chain = MockChain::new();
    let conn = MockConnector::new(cur("XLT"), chain.clone());
    let expected = chain.height() + MockConnector::MAKER_LOCK_OFFSET;

    // drift exactly at the tolerance is accepted, one block beyond is not
    assert!(conn.acceptable_lock_time_drift(
        Role::Maker,
        expected + MockConnector::DRIFT_TOLERANCE
    ));
    assert!(conn.acceptable_lock_time_drift(
        Role::Maker,
        expected - MockConnector::DRIFT_TOLERANCE
    ));
    assert!(!conn.acceptable_lock_time_drift(
        Role::Maker,
        expected + MockConnector::DRIFT_TOLERANCE + 1
    ));
    assert!(!conn.acceptable_lock_time_drift(Role::Taker, expected));
}

#[test]
fn dust_orders_are_rejected_at_entry() {
    let world = swap_world(0);

    let mut params = world.maker_params.clone();
    params.from_amount = MockConnector::DUST - 1;
    assert!(world.maker.session.create_order(params).is_err());

    // at the threshold the amount is no longer dust
    let mut params = world.maker_params.clone();
    params.from_amount = MockConnector::DUST;
    assert!(world.maker.session.create_order(params).is_ok());
}

#[test]
fn replaying_the_whole_conversation_changes_nothing() {
    let world = swap_world(0);
    let all = [&world.maker, &world.taker, &world.snode];

    let id = world
        .maker
        .session
        .create_order(world.maker_params.clone())
        .unwrap();
    settle(&world.bus, &all);
    world
        .taker
        .session
        .accept_order(&id, world.taker_params.clone())
        .unwrap();
    settle(&world.bus, &all);

    let maker_hist = world.maker.app.store.history_entry(&id).unwrap();
    let taker_hist = world.taker.app.store.history_entry(&id).unwrap();
    let conversation: Vec<Packet> = world.bus.log.lock().unwrap().clone();

    // replay every packet of the finished swap
    for packet in conversation {
        world.bus.inject_broadcast(packet);
    }
    settle(&world.bus, &all);

    // nothing rewound, nothing re-locked, nothing re-opened
    assert_eq!(
        world.maker.app.store.history_entry(&id).unwrap().state,
        maker_hist.state
    );
    assert_eq!(
        world.taker.app.store.history_entry(&id).unwrap().state,
        taker_hist.state
    );
    assert_eq!(world.maker.app.store.active_len(), 0);
    assert_eq!(world.taker.app.store.active_len(), 0);
    assert!(world.maker.app.lock_registry.is_empty());
    assert!(world.taker.app.lock_registry.is_empty());
    assert!(world.snode.app.lock_registry.is_empty());
    let exchange = world.snode.app.exchange.as_ref().unwrap();
    assert!(exchange.trade(&id).is_none());
}
