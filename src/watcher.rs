//! Deposit watcher.
//!
//! One poll thread per node covers two concerns:
//!
//! * **Spent-deposit watch (trader).** After the Taker broadcasts its
//!   deposit it watches the output for the Maker's redeeming pay
//!   transaction. When found, the secret preimage is extracted and the
//!   Taker's own redemption completes even if the confirm round never
//!   arrives.
//! * **Trader-deposit watch (facilitator).** The service node records each
//!   trader's refund transaction during the create round. If a trade dies
//!   and a trader vanishes, the stored refund is submitted on its behalf
//!   once the deposit lock-time expires.
//!
//! Commands reach the watcher over an mpsc channel through
//! [`WatchService`]; sends are fire-and-forget so a node without a watcher
//! thread works unchanged.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc::{channel, Receiver, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crate::{
    exchange::ExchangeOrderRef,
    order::{OrderId, TraderState},
    session::{lock, Session},
    utill::{HEART_BEAT_INTERVAL, MAX_OTHER_PAY_TX_TRIES},
};

/// How many failed refund submissions the facilitator tolerates per trader
/// before giving up on that side.
const MAX_REFUND_ATTEMPTS: u32 = 10;

/// Commands accepted by the watcher thread.
pub enum WatchCommand {
    /// Start watching this trader order's own deposit for a counterparty
    /// spend.
    WatchSpentDeposit(OrderId),
    /// Stop watching a trader order's deposit.
    UnwatchSpentDeposit(OrderId),
    /// Start covering a brokered trade's trader deposits.
    WatchTraderDeposit(OrderId, ExchangeOrderRef),
    /// Stop covering a brokered trade.
    UnwatchTraderDeposit(OrderId),
    /// Stop the watcher thread.
    Shutdown,
}

/// Cheap cloneable handle used to talk to the watcher thread.
#[derive(Clone)]
pub struct WatchService {
    tx: Sender<WatchCommand>,
}

impl WatchService {
    /// Creates the service and the receiving end for the watcher thread.
    pub fn channel() -> (Self, Receiver<WatchCommand>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }

    /// A service with no watcher behind it; every command is discarded.
    pub fn disconnected() -> Self {
        let (tx, _) = channel();
        Self { tx }
    }

    /// Requests a spent-deposit watch for an order.
    pub fn watch_spent_deposit(&self, id: OrderId) {
        let _ = self.tx.send(WatchCommand::WatchSpentDeposit(id));
    }

    /// Drops the spent-deposit watch of an order.
    pub fn unwatch_spent_deposit(&self, id: OrderId) {
        let _ = self.tx.send(WatchCommand::UnwatchSpentDeposit(id));
    }

    /// Requests trader-deposit coverage for a brokered trade.
    pub fn watch_trader_deposit(&self, id: OrderId, trade: ExchangeOrderRef) {
        let _ = self.tx.send(WatchCommand::WatchTraderDeposit(id, trade));
    }

    /// Drops the trader-deposit coverage of a trade.
    pub fn unwatch_trader_deposit(&self, id: OrderId) {
        let _ = self.tx.send(WatchCommand::UnwatchTraderDeposit(id));
    }

    /// Asks the watcher thread to exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WatchCommand::Shutdown);
    }
}

struct TraderWatch {
    trade: ExchangeOrderRef,
    a_done: bool,
    a_attempts: u32,
    b_done: bool,
    b_attempts: u32,
}

/// The watcher state machine; owned by its thread.
pub struct Watcher {
    rx: Receiver<WatchCommand>,
    spent_watches: Vec<OrderId>,
    trader_watches: HashMap<OrderId, TraderWatch>,
}

impl Watcher {
    /// Builds a watcher draining `rx`.
    pub fn new(rx: Receiver<WatchCommand>) -> Self {
        Self {
            rx,
            spent_watches: Vec::new(),
            trader_watches: HashMap::new(),
        }
    }

    /// Runs until shutdown, polling every watched entry once per beat.
    pub fn run(&mut self, session: Arc<Session>, shutdown: Arc<AtomicBool>) {
        log::info!("deposit watcher started");
        while !shutdown.load(Relaxed) {
            loop {
                match self.rx.try_recv() {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            let watched: Vec<OrderId> = self.spent_watches.clone();
            for id in watched {
                if check_spent_deposit(&session, &id) {
                    self.spent_watches.retain(|w| *w != id);
                }
            }

            let trade_ids: Vec<OrderId> = self.trader_watches.keys().copied().collect();
            for id in trade_ids {
                if let Some(watch) = self.trader_watches.get_mut(&id) {
                    if check_trader_deposit(&session, &id, watch) {
                        self.trader_watches.remove(&id);
                    }
                }
            }

            thread::sleep(HEART_BEAT_INTERVAL);
        }
    }

    fn handle_command(&mut self, command: WatchCommand) -> bool {
        match command {
            WatchCommand::WatchSpentDeposit(id) => {
                log::info!("[{id}] watching deposit for counterparty spend");
                if !self.spent_watches.contains(&id) {
                    self.spent_watches.push(id);
                }
            }
            WatchCommand::UnwatchSpentDeposit(id) => {
                self.spent_watches.retain(|w| *w != id);
            }
            WatchCommand::WatchTraderDeposit(id, trade) => {
                log::info!("[{id}] covering trader deposits");
                self.trader_watches.entry(id).or_insert(TraderWatch {
                    trade,
                    a_done: false,
                    a_attempts: 0,
                    b_done: false,
                    b_attempts: 0,
                });
            }
            WatchCommand::UnwatchTraderDeposit(id) => {
                self.trader_watches.remove(&id);
            }
            WatchCommand::Shutdown => return false,
        }
        true
    }
}

/// One poll of a trader order's deposit. Returns true when the watch is
/// finished.
fn check_spent_deposit(session: &Session, id: &OrderId) -> bool {
    let Some(handle) = session.app.store.get(id) else {
        return true;
    };

    let (done, state, from_currency, bin_txid, bin_tx_vout, watch_block, pay_seen, tries) = {
        let xtx = lock(&handle);
        (
            xtx.is_done_watching(),
            xtx.state,
            xtx.from_currency,
            xtx.bin_txid.clone(),
            xtx.bin_tx_vout,
            xtx.watch_block(),
            !xtx.other_pay_txid().is_empty(),
            xtx.other_pay_tx_tries(),
        )
    };

    if done || state >= TraderState::Committed {
        return true;
    }

    let Some(conn) = session.app.connectors.by_currency(from_currency) else {
        return false;
    };

    // once the supplied pay txid is exhausted, fall back to scanning the
    // chain for the spend of our own deposit output
    if !pay_seen || tries >= MAX_OTHER_PAY_TX_TRIES {
        match conn.find_redeeming_transaction(&bin_txid, bin_tx_vout, watch_block) {
            Ok(Some(spender)) => {
                log::info!("[{id}] deposit spent by {spender}, extracting secret");
                lock(&handle).set_other_pay_txid(&spender);
            }
            Ok(None) => return false,
            Err(e) => {
                log::debug!("[{id}] deposit scan failed: {e:?}");
                return false;
            }
        }
    }

    lock(&handle).try_other_pay_tx();

    if session.redeem_order_counterparty_deposit(&handle).is_ok() {
        let mut xtx = lock(&handle);
        if xtx.state < TraderState::Committed {
            xtx.state = TraderState::Committed;
        }
        xtx.done_watching();
        drop(xtx);
        session.app.notifier.order_changed(id);
        log::info!("[{id}] redeemed counterparty deposit from watched spend");
        return true;
    }

    false
}

/// One poll of a brokered trade's deposits. Returns true when both sides
/// are settled.
fn check_trader_deposit(session: &Session, id: &OrderId, watch: &mut TraderWatch) -> bool {
    let (a, b) = {
        let tr = lock(&watch.trade);
        if tr.state == crate::order::FacilitatorState::Finished {
            return true;
        }
        (tr.a.clone(), tr.b.clone())
    };

    for (side, done, attempts) in [
        (&a, &mut watch.a_done, &mut watch.a_attempts),
        (&b, &mut watch.b_done, &mut watch.b_attempts),
    ] {
        if *done || side.ref_tx.is_empty() || side.lock_time == 0 {
            continue;
        }
        let Some(currency) = side.currency else {
            *done = true;
            continue;
        };
        let Some(conn) = session.app.connectors.by_currency(currency) else {
            continue;
        };
        let Ok(info) = conn.get_info() else {
            continue;
        };
        if info.blocks < side.lock_time {
            continue;
        }

        if session.refund_trader_deposit(id, currency, &side.ref_tx) {
            log::info!("[{id}] submitted trader refund on {currency}");
            *done = true;
        } else {
            *attempts += 1;
            if *attempts >= MAX_REFUND_ATTEMPTS {
                log::warn!(
                    "[{id}] giving up on trader refund for {currency} after \
                     {MAX_REFUND_ATTEMPTS} attempts"
                );
                *done = true;
            }
        }
    }

    watch.a_done && watch.b_done
}

/// Spawns the watcher thread.
pub fn spawn_watcher(
    session: Arc<Session>,
    rx: Receiver<WatchCommand>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("Deposit watcher thread".to_string())
        .spawn(move || {
            let mut watcher = Watcher::new(rx);
            watcher.run(session, shutdown);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn disconnected_service_swallows_commands() {
        let service = WatchService::disconnected();
        service.watch_spent_deposit(OrderId::from_byte_array([1u8; 32]));
        service.unwatch_spent_deposit(OrderId::from_byte_array([1u8; 32]));
        service.shutdown();
    }

    #[test]
    fn commands_arrive_in_order() {
        let (service, rx) = WatchService::channel();
        service.watch_spent_deposit(OrderId::from_byte_array([1u8; 32]));
        service.shutdown();

        assert!(matches!(
            rx.try_recv().unwrap(),
            WatchCommand::WatchSpentDeposit(_)
        ));
        assert!(matches!(rx.try_recv().unwrap(), WatchCommand::Shutdown));
    }

    #[test]
    fn duplicate_watches_collapse() {
        let (service, rx) = WatchService::channel();
        let id = OrderId::from_byte_array([2u8; 32]);
        service.watch_spent_deposit(id);
        service.watch_spent_deposit(id);

        let mut watcher = Watcher::new(rx);
        assert!(watcher.handle_command(WatchCommand::WatchSpentDeposit(id)));
        assert!(watcher.handle_command(WatchCommand::WatchSpentDeposit(id)));
        assert_eq!(watcher.spent_watches.len(), 1);
    }
}
