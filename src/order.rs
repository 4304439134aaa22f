//! Order descriptors and their lifecycle states.

use std::fmt::{self, Display};

use bitcoin::{
    hashes::{sha256, sha256d, Hash, HashEngine},
    secp256k1::{PublicKey, SecretKey},
    ScriptBuf,
};
use serde::{Deserialize, Serialize};

use crate::{
    utill::{now_ts, Currency},
    wallet::{UtxoEntry, XAddr},
};

/// Canonical 32-byte order identifier.
pub type OrderId = sha256d::Hash;

/// Trade side. The Maker broadcast the order, the Taker accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Role A, order broadcaster. Holds the secret; redeems first.
    Maker,
    /// Role B, order acceptor. Learns the secret from the Maker's pay tx.
    Taker,
}

/// Trader-side order state.
///
/// Declaration order is the progression order: the protocol never rewinds
/// except into [`TraderState::Cancelled`] or [`TraderState::Rollback`],
/// which compare above every forward state so stale-packet checks treat a
/// cancelled order as past.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum TraderState {
    /// Created locally, not yet acknowledged by a facilitator.
    #[default]
    New,
    /// Acknowledged; facilitator key bound.
    Pending,
    /// Both sides held for this trade.
    Hold,
    /// Trade parameters exchanged (role B: fee published).
    Initialized,
    /// Own deposit broadcast.
    Created,
    /// Counterparty deposit redeemed; pay tx broadcast.
    Committed,
    /// Swap complete.
    Finished,
    /// Cancelled after deposit; refund pending or broadcast.
    Rollback,
    /// Refund broadcast failed; retrying.
    RollbackFailed,
    /// Cancelled before funds were at risk.
    Cancelled,
}

/// Facilitator-side order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FacilitatorState {
    /// Taker accepted; waiting for both holds.
    Joined,
    /// Both traders applied the hold.
    Hold,
    /// Both traders initialized.
    Initialized,
    /// Both deposits reported.
    Created,
    /// Both redemptions reported; trade complete.
    Finished,
    /// Trade cancelled.
    Cancelled,
}

/// Closed set of cancellation reasons carried in cancel packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CancelReason {
    /// Unspecified.
    #[default]
    Unknown,
    /// A pledged output vanished or failed validation.
    BadUtxo,
    /// Maker's deposit failed verification.
    BadDepositA,
    /// Taker's deposit failed verification.
    BadDepositB,
    /// Pledged outputs cannot cover amount plus fees.
    NoMoney,
    /// A wallet RPC failed fatally.
    RpcError,
    /// Protocol fee transaction could not be published.
    FeePayment,
    /// A trader address does not belong to the trade.
    InvalidAddress,
    /// Facilitator saw no progress within the sync timeout.
    Timeout,
}

impl CancelReason {
    /// Wire code of the reason.
    pub fn to_u32(self) -> u32 {
        match self {
            CancelReason::Unknown => 0,
            CancelReason::BadUtxo => 1,
            CancelReason::BadDepositA => 2,
            CancelReason::BadDepositB => 3,
            CancelReason::NoMoney => 4,
            CancelReason::RpcError => 5,
            CancelReason::FeePayment => 6,
            CancelReason::InvalidAddress => 7,
            CancelReason::Timeout => 8,
        }
    }

    /// Looks up the reason for a wire code; unknown codes collapse to
    /// [`CancelReason::Unknown`].
    pub fn from_u32(code: u32) -> Self {
        match code {
            1 => CancelReason::BadUtxo,
            2 => CancelReason::BadDepositA,
            3 => CancelReason::BadDepositB,
            4 => CancelReason::NoMoney,
            5 => CancelReason::RpcError,
            6 => CancelReason::FeePayment,
            7 => CancelReason::InvalidAddress,
            8 => CancelReason::Timeout,
            _ => CancelReason::Unknown,
        }
    }
}

/// Mutable per-order state held by a trader.
///
/// Local orders (this node is Maker or Taker) carry the session keypair and
/// walk the full state machine. Non-local entries are order-book views kept
/// only until the trade concludes.
#[derive(Debug, Clone)]
pub struct OrderDescr {
    /// Canonical order id.
    pub id: OrderId,
    /// This node's side, when local.
    pub role: Option<Role>,
    /// True when this node is a party to the trade.
    pub local: bool,

    /// Currency this node gives.
    pub from_currency: Currency,
    /// Amount this node gives, in base units.
    pub from_amount: u64,
    /// This node's address on the from-chain.
    pub from_address: XAddr,
    /// Currency this node receives.
    pub to_currency: Currency,
    /// Amount this node receives, in base units.
    pub to_amount: u64,
    /// This node's address on the to-chain.
    pub to_address: XAddr,

    /// Facilitator session address for unicast replies.
    pub hub_address: XAddr,
    /// Session public key; packet identity of this trader.
    pub m_pubkey: Option<PublicKey>,
    /// Session secret key, local orders only.
    pub m_privkey: Option<SecretKey>,
    /// Counterparty session public key, bound during Create.
    pub o_pubkey: Option<PublicKey>,
    /// Facilitator public key, bound at the first signed echo and pinned
    /// for the order's lifetime.
    pub s_pubkey: Option<[u8; 33]>,

    /// Secret preimage; Maker only until revealed on-chain.
    secret: Option<[u8; 32]>,
    /// hash160 of the counterparty's secret commitment.
    pub o_hashed_secret: Option<[u8; 20]>,
    /// Own deposit redeem script.
    pub lock_script: Option<ScriptBuf>,
    /// P2SH address of the own deposit output.
    pub lock_p2sh_address: String,
    /// Own refund lock-time (absolute height on the from-chain).
    pub lock_time: u32,
    /// Counterparty refund lock-time.
    pub opponent_lock_time: u32,

    /// Outputs pledged as collateral; locked in the registry while the
    /// order lives.
    pub used_coins: Vec<UtxoEntry>,
    /// Outputs reserved for the protocol fee.
    pub fee_utxos: Vec<UtxoEntry>,
    /// Pre-built protocol fee transaction (role B).
    pub raw_fee_tx: String,

    /// Own deposit txid.
    pub bin_txid: String,
    /// Own deposit output index.
    pub bin_tx_vout: u32,
    /// Own raw deposit transaction.
    pub bin_tx: String,

    /// Counterparty deposit txid.
    pub o_bin_txid: String,
    /// Counterparty deposit output index.
    pub o_bin_tx_vout: u32,
    /// Counterparty deposit redeem script.
    pub unlock_script: Option<ScriptBuf>,
    /// P2SH address of the counterparty deposit.
    pub unlock_p2sh_address: String,
    /// Counterparty deposit value beyond the expected amount; collected by
    /// our pay transaction.
    pub o_overpayment: u64,

    /// Own refund txid.
    pub ref_txid: String,
    /// Own raw refund transaction, broadcastable after `lock_time`.
    pub ref_tx: String,
    /// Own pay txid.
    pub pay_txid: String,
    /// Own raw pay transaction.
    pub pay_tx: String,
    /// Optional fixed refund address; a fresh one is drawn when empty.
    pub refund_address: String,

    /// Current protocol state.
    pub state: TraderState,
    /// Reason recorded when cancelled.
    pub reason: CancelReason,
    /// Creation time, UTC seconds.
    pub created_at: u64,
    /// Last activity time, UTC seconds.
    pub updated_at: u64,
    /// Recent block hash salted into the order id against replays.
    pub block_hash: [u8; 32],

    did_send_deposit: bool,
    sent_deposit_at: u64,
    watch_block: u32,
    other_pay_txid: String,
    other_pay_tx_tries: u32,
    done_watching: bool,
    counterparty_redeemed: bool,
}

impl OrderDescr {
    /// Starts a descriptor with empty transaction state.
    pub fn new(id: OrderId) -> Self {
        let now = now_ts();
        Self {
            id,
            role: None,
            local: false,
            from_currency: Currency::new("NONE").expect("static ticker"),
            from_amount: 0,
            from_address: [0u8; 20],
            to_currency: Currency::new("NONE").expect("static ticker"),
            to_amount: 0,
            to_address: [0u8; 20],
            hub_address: [0u8; 20],
            m_pubkey: None,
            m_privkey: None,
            o_pubkey: None,
            s_pubkey: None,
            secret: None,
            o_hashed_secret: None,
            lock_script: None,
            lock_p2sh_address: String::new(),
            lock_time: 0,
            opponent_lock_time: 0,
            used_coins: Vec::new(),
            fee_utxos: Vec::new(),
            raw_fee_tx: String::new(),
            bin_txid: String::new(),
            bin_tx_vout: 0,
            bin_tx: String::new(),
            o_bin_txid: String::new(),
            o_bin_tx_vout: 0,
            unlock_script: None,
            unlock_p2sh_address: String::new(),
            o_overpayment: 0,
            ref_txid: String::new(),
            ref_tx: String::new(),
            pay_txid: String::new(),
            pay_tx: String::new(),
            refund_address: String::new(),
            state: TraderState::New,
            reason: CancelReason::Unknown,
            created_at: now,
            updated_at: now,
            block_hash: [0u8; 32],
            did_send_deposit: false,
            sent_deposit_at: 0,
            watch_block: 0,
            other_pay_txid: String::new(),
            other_pay_tx_tries: 0,
            done_watching: false,
            counterparty_redeemed: false,
        }
    }

    /// True when this node holds the trade's session keys.
    pub fn is_local(&self) -> bool {
        self.local && self.m_privkey.is_some()
    }

    /// The session keypair, when local.
    pub fn keypair(&self) -> Option<(PublicKey, SecretKey)> {
        Some((self.m_pubkey?, self.m_privkey?))
    }

    /// Bumps the activity timestamp.
    pub fn update_timestamp(&mut self) {
        self.updated_at = now_ts();
    }

    /// Installs the secret preimage.
    pub fn set_secret(&mut self, secret: [u8; 32]) {
        self.secret = Some(secret);
    }

    /// The secret preimage, when known.
    pub fn secret(&self) -> Option<[u8; 32]> {
        self.secret
    }

    /// True when the secret preimage is known.
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Marks the own deposit as handed to the network.
    pub fn sent_deposit(&mut self) {
        self.did_send_deposit = true;
        self.sent_deposit_at = now_ts();
    }

    /// Reverts [`OrderDescr::sent_deposit`] after a failed broadcast.
    pub fn fail_deposit(&mut self) {
        self.did_send_deposit = false;
        self.sent_deposit_at = 0;
    }

    /// True when the own deposit reached the network.
    pub fn did_send_deposit(&self) -> bool {
        self.did_send_deposit
    }

    /// Chain height at which deposit watching starts.
    pub fn watch_block(&self) -> u32 {
        self.watch_block
    }

    /// Records the height at which the deposit was broadcast.
    pub fn set_watch_block(&mut self, height: u32) {
        self.watch_block = height;
    }

    /// Records the counterparty-supplied pay txid to poll for the secret.
    pub fn set_other_pay_txid(&mut self, txid: &str) {
        self.other_pay_txid = txid.to_string();
    }

    /// The counterparty pay txid being polled, if any.
    pub fn other_pay_txid(&self) -> &str {
        &self.other_pay_txid
    }

    /// Counts one poll of the counterparty pay txid.
    pub fn try_other_pay_tx(&mut self) {
        self.other_pay_tx_tries += 1;
    }

    /// Polls of the counterparty pay txid so far.
    pub fn other_pay_tx_tries(&self) -> u32 {
        self.other_pay_tx_tries
    }

    /// Stops all on-chain watching for this order.
    pub fn done_watching(&mut self) {
        self.done_watching = true;
    }

    /// True when on-chain watching has stopped.
    pub fn is_done_watching(&self) -> bool {
        self.done_watching
    }

    /// Notes that our pay transaction claimed the counterparty deposit.
    ///
    /// Past this point the node has been paid and every error demotes to a
    /// retry.
    pub fn counterparty_deposit_redeemed(&mut self) {
        self.counterparty_redeemed = true;
    }

    /// True once our pay transaction claimed the counterparty deposit.
    pub fn has_redeemed_counterparty_deposit(&self) -> bool {
        self.counterparty_redeemed
    }
}

impl Display for OrderDescr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "order {} {:?} {} {} -> {} {} role {:?}",
            self.id,
            self.state,
            self.from_amount,
            self.from_currency,
            self.to_amount,
            self.to_currency,
            self.role,
        )
    }
}

/// Computes the canonical order id.
///
/// Double-SHA256 over the Bitcoin-style serialization of the order content:
/// strings and byte vectors get a compact-size length prefix, integers are
/// little-endian, hashes are raw. The facilitator recomputes this and
/// rejects any order whose packet id differs.
#[allow(clippy::too_many_arguments)]
pub fn canonical_order_id(
    saddr: &str,
    scurrency: Currency,
    samount: u64,
    daddr: &str,
    dcurrency: Currency,
    damount: u64,
    timestamp: u64,
    block_hash: &[u8; 32],
    first_utxo_sig: &[u8],
) -> OrderId {
    let mut engine = sha256d::Hash::engine();
    write_var_bytes(&mut engine, saddr.as_bytes());
    write_var_bytes(&mut engine, scurrency.as_str().as_bytes());
    engine.input(&samount.to_le_bytes());
    write_var_bytes(&mut engine, daddr.as_bytes());
    write_var_bytes(&mut engine, dcurrency.as_str().as_bytes());
    engine.input(&damount.to_le_bytes());
    engine.input(&timestamp.to_le_bytes());
    engine.input(block_hash);
    write_var_bytes(&mut engine, first_utxo_sig);
    sha256d::Hash::from_engine(engine)
}

fn write_var_bytes(engine: &mut sha256::HashEngine, bytes: &[u8]) {
    write_compact_size(engine, bytes.len() as u64);
    engine.input(bytes);
}

fn write_compact_size(engine: &mut sha256::HashEngine, value: u64) {
    if value < 0xfd {
        engine.input(&[value as u8]);
    } else if value <= 0xffff {
        engine.input(&[0xfd]);
        engine.input(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        engine.input(&[0xfe]);
        engine.input(&(value as u32).to_le_bytes());
    } else {
        engine.input(&[0xff]);
        engine.input(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cur(code: &str) -> Currency {
        Currency::new(code).unwrap()
    }

    #[test]
    fn state_progression_is_ordered() {
        assert!(TraderState::New < TraderState::Pending);
        assert!(TraderState::Pending < TraderState::Hold);
        assert!(TraderState::Hold < TraderState::Initialized);
        assert!(TraderState::Initialized < TraderState::Created);
        assert!(TraderState::Created < TraderState::Committed);
        assert!(TraderState::Committed < TraderState::Finished);
        // side states count as past every forward state
        assert!(TraderState::Cancelled > TraderState::Finished);
        assert!(TraderState::Rollback > TraderState::Created);
    }

    #[test]
    fn cancel_reason_codes_round_trip() {
        for code in 0..9 {
            let reason = CancelReason::from_u32(code);
            assert_eq!(reason.to_u32(), code);
        }
        assert_eq!(CancelReason::from_u32(999), CancelReason::Unknown);
    }

    #[test]
    fn canonical_id_binds_every_field() {
        let base = || {
            canonical_order_id(
                "maker-addr",
                cur("XLT"),
                10,
                "taker-addr",
                cur("YRT"),
                20,
                1_700_000_000,
                &[3u8; 32],
                &[7u8; 64],
            )
        };
        assert_eq!(base(), base());

        let other_amount = canonical_order_id(
            "maker-addr",
            cur("XLT"),
            11,
            "taker-addr",
            cur("YRT"),
            20,
            1_700_000_000,
            &[3u8; 32],
            &[7u8; 64],
        );
        assert_ne!(base(), other_amount);

        let other_sig = canonical_order_id(
            "maker-addr",
            cur("XLT"),
            10,
            "taker-addr",
            cur("YRT"),
            20,
            1_700_000_000,
            &[3u8; 32],
            &[8u8; 64],
        );
        assert_ne!(base(), other_sig);
    }

    #[test]
    fn deposit_flags() {
        let mut descr = OrderDescr::new(OrderId::from_byte_array([1u8; 32]));
        assert!(!descr.did_send_deposit());
        descr.sent_deposit();
        assert!(descr.did_send_deposit());
        descr.fail_deposit();
        assert!(!descr.did_send_deposit());

        assert!(!descr.has_redeemed_counterparty_deposit());
        descr.counterparty_deposit_redeemed();
        assert!(descr.has_redeemed_counterparty_deposit());
    }
}
