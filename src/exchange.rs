//! Facilitator order book.
//!
//! The exchange holds every order this service node is brokering: pending
//! orders waiting for a Taker and joined trades being walked through the
//! deposit choreography. Each protocol round (hold, init, create, confirm)
//! completes when both traders have acknowledged it; the exchange tracks
//! those acknowledgments and advances the facilitator state machine.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::{
    order::{FacilitatorState, OrderId},
    utill::{now_ts, Currency},
    wallet::{UtxoEntry, XAddr},
};

/// Pending orders that are not re-broadcast by their Maker within this
/// window are dropped.
#[cfg(feature = "integration-test")]
pub const PENDING_ORDER_EXPIRY: Duration = Duration::from_secs(30);
/// Pending orders that are not re-broadcast by their Maker within this
/// window are dropped.
#[cfg(not(feature = "integration-test"))]
pub const PENDING_ORDER_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// One trader's half of a brokered trade.
#[derive(Debug, Clone, Default)]
pub struct TraderSide {
    /// Source address on the chain this trader gives.
    pub address: XAddr,
    /// Destination address on the chain this trader receives.
    pub destination: XAddr,
    /// Currency this trader gives.
    pub currency: Option<Currency>,
    /// Amount this trader gives, base units.
    pub amount: u64,
    /// Outputs pledged by this trader.
    pub utxos: Vec<UtxoEntry>,
    /// Trader session public key; every packet from this trader must
    /// verify against it.
    pub pubkey: Option<[u8; 33]>,
    /// Refund lock-time reported in Created.
    pub lock_time: u32,
    /// Deposit txid reported in Created.
    pub bin_txid: String,
    /// Refund txid reported in Created.
    pub ref_txid: String,
    /// Raw refund transaction; submitted on the trader's behalf when it
    /// vanishes past its lock-time.
    pub ref_tx: String,
    /// Pay txid reported in Confirmed.
    pub pay_txid: String,
    /// Protocol fee txid reported in Initialized.
    pub fee_txid: [u8; 32],
}

/// One order as the facilitator sees it.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    /// Canonical order id.
    pub id: OrderId,
    /// Maker side.
    pub a: TraderSide,
    /// Taker side; empty until accepted.
    pub b: TraderSide,
    /// Facilitator state machine position.
    pub state: FacilitatorState,
    /// Creation time, UTC seconds.
    pub created_at: u64,
    /// Last activity, UTC seconds.
    pub updated_at: u64,
    /// Block hash salt from the Maker's broadcast.
    pub block_hash: [u8; 32],
    /// Maker's order timestamp, echoed in rebroadcasts.
    pub order_timestamp: u64,
    acks: HashSet<XAddr>,
}

impl ExchangeOrder {
    fn new(id: OrderId) -> Self {
        let now = now_ts();
        Self {
            id,
            a: TraderSide::default(),
            b: TraderSide::default(),
            state: FacilitatorState::Joined,
            created_at: now,
            updated_at: now,
            block_hash: [0u8; 32],
            order_timestamp: 0,
            acks: HashSet::new(),
        }
    }

    /// Bumps the activity timestamp.
    pub fn update_timestamp(&mut self) {
        self.updated_at = now_ts();
    }

    /// True when `addr` is one of the four trader addresses of this order.
    pub fn is_address_in_order(&self, addr: &XAddr) -> bool {
        self.a.address == *addr
            || self.b.address == *addr
            || self.a.destination == *addr
            || self.b.destination == *addr
    }

    fn both_acked(&self, first: &XAddr, second: &XAddr) -> bool {
        self.acks.contains(first) && self.acks.contains(second)
    }

    fn advance(&mut self, next: FacilitatorState) {
        self.state = next;
        self.acks.clear();
        self.update_timestamp();
    }

    /// Records a hold acknowledgment from a trader source address.
    ///
    /// Returns true when both sides have now held and the order advanced to
    /// [`FacilitatorState::Hold`].
    pub fn apply_hold(&mut self, from: &XAddr) -> bool {
        if self.state != FacilitatorState::Joined {
            return false;
        }
        if self.a.address != *from && self.b.address != *from {
            return false;
        }
        self.acks.insert(*from);
        let (a, b) = (self.a.address, self.b.address);
        if self.both_acked(&a, &b) {
            self.advance(FacilitatorState::Hold);
            return true;
        }
        self.update_timestamp();
        false
    }

    /// Records an initialization (with its fee txid) from a trader. The
    /// Initialized reply echoes the trader's routing address, which is its
    /// destination. True when both sides are now initialized.
    pub fn apply_initialized(&mut self, from: &XAddr, fee_txid: &[u8; 32]) -> bool {
        if self.state != FacilitatorState::Hold {
            return false;
        }
        if self.a.destination == *from {
            self.a.fee_txid = *fee_txid;
        } else if self.b.destination == *from {
            self.b.fee_txid = *fee_txid;
        } else {
            return false;
        }
        self.acks.insert(*from);
        let (a, b) = (self.a.destination, self.b.destination);
        if self.both_acked(&a, &b) {
            self.advance(FacilitatorState::Initialized);
            return true;
        }
        self.update_timestamp();
        false
    }

    /// Records a deposit report from a trader source address. True when
    /// both deposits are now reported.
    pub fn apply_created(&mut self, from: &XAddr, bin_txid: &str) -> bool {
        if self.state != FacilitatorState::Initialized {
            return false;
        }
        if self.a.address == *from {
            self.a.bin_txid = bin_txid.to_string();
        } else if self.b.address == *from {
            self.b.bin_txid = bin_txid.to_string();
        } else {
            return false;
        }
        self.acks.insert(*from);
        let (a, b) = (self.a.address, self.b.address);
        if self.both_acked(&a, &b) {
            self.advance(FacilitatorState::Created);
            return true;
        }
        self.update_timestamp();
        false
    }

    /// Records a redemption report from a trader destination address. True
    /// when both sides redeemed and the trade is finished.
    pub fn apply_confirmed(&mut self, destination: &XAddr) -> bool {
        if self.state != FacilitatorState::Created {
            return false;
        }
        if self.a.destination != *destination && self.b.destination != *destination {
            return false;
        }
        self.acks.insert(*destination);
        let (a, b) = (self.a.destination, self.b.destination);
        if self.both_acked(&a, &b) {
            self.advance(FacilitatorState::Finished);
            return true;
        }
        self.update_timestamp();
        false
    }
}

/// Shared handle to one brokered order.
pub type ExchangeOrderRef = Arc<Mutex<ExchangeOrder>>;

/// The facilitator's order book and signing identity.
pub struct Exchange {
    privkey: SecretKey,
    pubkey: PublicKey,
    pending: Mutex<HashMap<OrderId, ExchangeOrderRef>>,
    trades: Mutex<HashMap<OrderId, ExchangeOrderRef>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Exchange {
    /// Builds an exchange signing with the given service-node key.
    pub fn new(privkey: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, &privkey);
        Self {
            privkey,
            pubkey,
            pending: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
        }
    }

    /// The service-node signing key.
    pub fn privkey(&self) -> &SecretKey {
        &self.privkey
    }

    /// The service-node public key in wire form.
    pub fn pubkey(&self) -> [u8; 33] {
        self.pubkey.serialize()
    }

    /// Admits a Maker order, or finds the existing record for its id.
    ///
    /// Returns the order handle and whether it was newly created.
    #[allow(clippy::too_many_arguments)]
    pub fn create_order(
        &self,
        id: OrderId,
        saddr: XAddr,
        scurrency: Currency,
        samount: u64,
        daddr: XAddr,
        dcurrency: Currency,
        damount: u64,
        timestamp: u64,
        maker_pubkey: [u8; 33],
        utxos: Vec<UtxoEntry>,
        block_hash: [u8; 32],
    ) -> (ExchangeOrderRef, bool) {
        let mut pending = guard(&self.pending);
        if let Some(existing) = pending.get(&id) {
            return (existing.clone(), false);
        }

        let mut order = ExchangeOrder::new(id);
        order.a.address = saddr;
        order.a.destination = daddr;
        order.a.currency = Some(scurrency);
        order.a.amount = samount;
        order.a.utxos = utxos;
        order.a.pubkey = Some(maker_pubkey);
        // the taker will give what the maker wants
        order.b.currency = Some(dcurrency);
        order.b.amount = damount;
        order.block_hash = block_hash;
        order.order_timestamp = timestamp;

        let handle = Arc::new(Mutex::new(order));
        pending.insert(id, handle.clone());
        (handle, true)
    }

    /// Looks up a pending (unaccepted) order.
    pub fn pending_order(&self, id: &OrderId) -> Option<ExchangeOrderRef> {
        guard(&self.pending).get(id).cloned()
    }

    /// Looks up a joined trade.
    pub fn trade(&self, id: &OrderId) -> Option<ExchangeOrderRef> {
        guard(&self.trades).get(id).cloned()
    }

    /// Accepts a pending order with the Taker's side. First acceptance
    /// wins; later attempts return `None`.
    pub fn accept_order(
        &self,
        id: &OrderId,
        saddr: XAddr,
        daddr: XAddr,
        taker_pubkey: [u8; 33],
        utxos: Vec<UtxoEntry>,
    ) -> Option<ExchangeOrderRef> {
        let mut trades = guard(&self.trades);
        if trades.contains_key(id) {
            return None;
        }
        let handle = guard(&self.pending).remove(id)?;
        {
            let mut order = guard(&handle);
            order.b.address = saddr;
            order.b.destination = daddr;
            order.b.pubkey = Some(taker_pubkey);
            order.b.utxos = utxos;
            order.state = FacilitatorState::Joined;
            order.update_timestamp();
        }
        trades.insert(*id, handle.clone());
        Some(handle)
    }

    /// Drops a pending order.
    pub fn delete_pending(&self, id: &OrderId) {
        guard(&self.pending).remove(id);
    }

    /// Drops a joined trade.
    pub fn remove_trade(&self, id: &OrderId) {
        guard(&self.trades).remove(id);
    }

    /// Snapshot of pending orders, rebroadcast periodically.
    pub fn pending_orders(&self) -> Vec<ExchangeOrderRef> {
        guard(&self.pending).values().cloned().collect()
    }

    /// Snapshot of joined trades.
    pub fn trades(&self) -> Vec<ExchangeOrderRef> {
        guard(&self.trades).values().cloned().collect()
    }

    /// Refreshes a rebroadcast pending order, or expires it.
    ///
    /// Returns false when the order sat unrefreshed past
    /// [`PENDING_ORDER_EXPIRY`] and has been removed.
    pub fn update_timestamp_or_remove_expired(&self, handle: &ExchangeOrderRef) -> bool {
        let id = {
            let mut order = guard(handle);
            if now_ts().saturating_sub(order.updated_at) <= PENDING_ORDER_EXPIRY.as_secs() {
                order.update_timestamp();
                return true;
            }
            order.id
        };
        log::info!("[{id}] pending order expired, dropping");
        self.delete_pending(&id);
        false
    }

    /// Removes and returns pending orders whose Maker stopped
    /// rebroadcasting for longer than [`PENDING_ORDER_EXPIRY`].
    pub fn drop_expired_pending(&self) -> Vec<ExchangeOrderRef> {
        let cutoff = now_ts().saturating_sub(PENDING_ORDER_EXPIRY.as_secs());
        let mut pending = guard(&self.pending);
        let expired: Vec<OrderId> = pending
            .iter()
            .filter(|(_, handle)| guard(handle).updated_at <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        expired
            .iter()
            .filter_map(|id| pending.remove(id))
            .collect()
    }

    /// Joined trades with no progress within `timeout`, candidates for a
    /// timeout cancel.
    pub fn stale_trades(&self, timeout: Duration) -> Vec<ExchangeOrderRef> {
        let cutoff = now_ts().saturating_sub(timeout.as_secs());
        guard(&self.trades)
            .values()
            .filter(|handle| {
                let order = guard(handle);
                order.state < FacilitatorState::Finished && order.updated_at <= cutoff
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{hashes::Hash, key::rand::thread_rng};

    fn exchange() -> Exchange {
        let (sk, _) = Secp256k1::new().generate_keypair(&mut thread_rng());
        Exchange::new(sk)
    }

    fn id(n: u8) -> OrderId {
        OrderId::from_byte_array([n; 32])
    }

    fn cur(code: &str) -> Currency {
        Currency::new(code).unwrap()
    }

    fn make_order(e: &Exchange, n: u8) -> ExchangeOrderRef {
        let (handle, created) = e.create_order(
            id(n),
            [1u8; 20],
            cur("XLT"),
            10,
            [2u8; 20],
            cur("YRT"),
            20,
            now_ts(),
            [3u8; 33],
            vec![],
            [4u8; 32],
        );
        assert!(created);
        handle
    }

    fn accept(e: &Exchange, n: u8) -> ExchangeOrderRef {
        e.accept_order(&id(n), [5u8; 20], [6u8; 20], [7u8; 33], vec![])
            .unwrap()
    }

    #[test]
    fn duplicate_broadcast_reuses_record() {
        let e = exchange();
        make_order(&e, 1);
        let (_, created) = e.create_order(
            id(1),
            [1u8; 20],
            cur("XLT"),
            10,
            [2u8; 20],
            cur("YRT"),
            20,
            now_ts(),
            [3u8; 33],
            vec![],
            [4u8; 32],
        );
        assert!(!created);
        assert_eq!(e.pending_orders().len(), 1);
    }

    #[test]
    fn first_taker_wins() {
        let e = exchange();
        make_order(&e, 1);
        assert!(accept(&e, 1).lock().unwrap().state == FacilitatorState::Joined);
        // the order left pending, a second taker loses
        assert!(e
            .accept_order(&id(1), [8u8; 20], [9u8; 20], [10u8; 33], vec![])
            .is_none());
    }

    #[test]
    fn rounds_complete_on_both_acks() {
        let e = exchange();
        make_order(&e, 1);
        let handle = accept(&e, 1);
        let mut order = handle.lock().unwrap();

        assert!(!order.apply_hold(&[1u8; 20]));
        // duplicate ack from the same side changes nothing
        assert!(!order.apply_hold(&[1u8; 20]));
        assert!(order.apply_hold(&[5u8; 20]));
        assert_eq!(order.state, FacilitatorState::Hold);

        assert!(!order.apply_initialized(&[2u8; 20], &[0u8; 32]));
        assert!(order.apply_initialized(&[6u8; 20], &[9u8; 32]));
        assert_eq!(order.state, FacilitatorState::Initialized);
        assert_eq!(order.b.fee_txid, [9u8; 32]);

        assert!(!order.apply_created(&[1u8; 20], "atx"));
        assert!(order.apply_created(&[5u8; 20], "btx"));
        assert_eq!(order.state, FacilitatorState::Created);
        assert_eq!(order.a.bin_txid, "atx");
        assert_eq!(order.b.bin_txid, "btx");

        // confirms ack by destination addresses
        assert!(!order.apply_confirmed(&[2u8; 20]));
        assert!(order.apply_confirmed(&[6u8; 20]));
        assert_eq!(order.state, FacilitatorState::Finished);
    }

    #[test]
    fn out_of_round_acks_are_ignored() {
        let e = exchange();
        make_order(&e, 1);
        let handle = accept(&e, 1);
        let mut order = handle.lock().unwrap();

        // created before hold/init rounds completes nothing
        assert!(!order.apply_created(&[1u8; 20], "early"));
        assert_eq!(order.state, FacilitatorState::Joined);
        assert!(order.a.bin_txid.is_empty());

        // an address outside the order never acks
        assert!(!order.apply_hold(&[99u8; 20]));
        assert!(!order.apply_hold(&[98u8; 20]));
        assert_eq!(order.state, FacilitatorState::Joined);
    }

    #[test]
    fn stale_trades_are_reported() {
        let e = exchange();
        make_order(&e, 1);
        let handle = accept(&e, 1);
        handle.lock().unwrap().updated_at = now_ts() - 3600;

        let stale = e.stale_trades(Duration::from_secs(60));
        assert_eq!(stale.len(), 1);
        assert!(e.stale_trades(Duration::from_secs(7200)).is_empty());
    }
}
