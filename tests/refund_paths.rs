//! Cancel and refund scenarios: a dead taker and a short deposit.

mod common;

use std::sync::atomic::Ordering::Relaxed;

use chainswap::order::{CancelReason, TraderState};
use common::*;

#[test]
fn dead_taker_rolls_maker_back_after_locktime() {
    let world = swap_world(0);
    let all = [&world.maker, &world.taker, &world.snode];

    // the taker's node dies before it can broadcast its deposit
    world.taker_y.fail_sends.store(true, Relaxed);

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

    // the taker cancelled itself; its deposit never reached the chain
    {
        let taker_handle = world.taker.app.store.get(&id).unwrap();
        let taker = taker_handle.lock().unwrap();
        assert_eq!(taker.state, TraderState::Cancelled);
        assert_eq!(taker.reason, CancelReason::RpcError);
        assert!(!world.chain_y.has_tx(&taker.bin_txid));
    }
    assert!(world.taker.app.lock_registry.is_empty());

    // the maker deposited and now waits on its lock-time
    let maker_handle = world.maker.app.store.get(&id).unwrap();
    let (ref_txid, bin_txid) = {
        let maker = maker_handle.lock().unwrap();
        assert_eq!(maker.state, TraderState::Rollback);
        assert!(world.chain_x.has_tx(&maker.bin_txid));
        assert!(!world.chain_x.has_tx(&maker.ref_txid));
        (maker.ref_txid.clone(), maker.bin_txid.clone())
    };

    // lock-time passes; the deferred cancel retries and refunds
    world.chain_x.advance(100);
    settle(&world.bus, &all);

    {
        let maker = maker_handle.lock().unwrap();
        assert_eq!(maker.state, TraderState::Rollback);
    }
    assert!(world.chain_x.has_tx(&ref_txid));
    assert!(world.chain_x.has_tx(&bin_txid));
    assert!(world.maker.app.lock_registry.is_empty());

    // the facilitator tore the trade out of its book and released locks
    let exchange = world.snode.app.exchange.as_ref().unwrap();
    assert!(exchange.trade(&id).is_none());
    assert!(world.snode.app.lock_registry.is_empty());
}

#[test]
fn short_taker_deposit_cancels_with_bad_deposit_reason() {
    // taker's deposit lands one base unit short of the agreed amount
    let world = swap_world(1);
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

    // the maker spotted the short deposit and cancelled
    let maker_handle = world.maker.app.store.get(&id).unwrap();
    {
        let maker = maker_handle.lock().unwrap();
        assert_eq!(maker.state, TraderState::Rollback);
        assert_eq!(maker.reason, CancelReason::BadDepositB);
        // the pay transaction never went out
        assert!(maker.pay_txid.is_empty() || !world.chain_y.has_tx(&maker.pay_txid));
    }

    // both sides refund themselves once their lock-times expire
    world.chain_x.advance(100);
    world.chain_y.advance(60);
    settle(&world.bus, &all);

    let maker_ref = maker_handle.lock().unwrap().ref_txid.clone();
    assert!(world.chain_x.has_tx(&maker_ref));

    let taker_handle = world.taker.app.store.get(&id).unwrap();
    {
        let taker = taker_handle.lock().unwrap();
        assert_eq!(taker.state, TraderState::Rollback);
        assert!(world.chain_y.has_tx(&taker.ref_txid));
    }

    assert!(world.maker.app.lock_registry.is_empty());
    assert!(world.taker.app.lock_registry.is_empty());
}
