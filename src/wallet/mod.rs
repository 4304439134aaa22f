//! Blockchain access abstraction.
//!
//! Every supported chain is represented by one [`WalletConnector`]. The
//! session core never talks to a node directly; it asks the connector to
//! build scripts and transactions, query outputs and heights, and broadcast.
//! Connectors are free to block; callers hold no shared lock across a call.

mod lock_registry;

pub use lock_registry::{UtxoLockKey, UtxoLockRegistry};

use std::{collections::HashMap, fmt::Write as _, sync::Arc};

use bitcoin::{
    secp256k1::{PublicKey, SecretKey},
    ScriptBuf, Txid,
};
use serde::{Deserialize, Serialize};

use crate::{
    order::Role,
    protocol::contract,
    utill::Currency,
};

/// Raw 20-byte chain address.
pub type XAddr = [u8; 20];

/// Errors surfaced by wallet connectors.
///
/// The split between [`WalletError::Transient`] and [`WalletError::Fatal`]
/// drives the session's retry-or-cancel decision.
#[derive(Debug)]
pub enum WalletError {
    /// Node unreachable or busy; the operation may succeed later.
    Transient(String),
    /// Permanent failure; the order cannot proceed.
    Fatal(String),
    /// Transaction referenced inputs the chain cannot see yet.
    MissingInputs,
    /// Submitted transaction is already in the chain.
    AlreadyInChain,
    /// Not enough funds for the requested operation.
    InsufficientFund {
        /// Amount available.
        available: u64,
        /// Amount required.
        required: u64,
    },
}

impl WalletError {
    /// True when retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::MissingInputs)
    }
}

/// One unspent output offered as order collateral.
///
/// The owner signs `"txid|vout|amount|address"` with the output's address
/// key so the facilitator can verify the funds belong to the trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoEntry {
    /// Funding transaction id.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Output value in base units.
    pub amount: u64,
    /// Raw 20-byte form of the owning address.
    pub raw_address: XAddr,
    /// Chain-encoded form of the owning address.
    pub address: String,
    /// Owner's signature over [`UtxoEntry::signed_message`].
    pub signature: Vec<u8>,
}

impl UtxoEntry {
    /// The canonical text the output owner signs.
    pub fn signed_message(&self) -> String {
        let mut msg = String::new();
        let _ = write!(
            msg,
            "{}|{}|{}|{}",
            self.txid, self.vout, self.amount, self.address
        );
        msg
    }
}

impl PartialEq for UtxoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.txid == other.txid && self.vout == other.vout
    }
}

impl Eq for UtxoEntry {}

/// Existence and depth of a transaction output.
#[derive(Debug, Clone, Copy)]
pub struct TxOutInfo {
    /// Output value in base units.
    pub amount: u64,
    /// Confirmation count; zero while in the mempool.
    pub confirmations: u32,
}

/// Chain tip information.
#[derive(Debug, Clone, Copy)]
pub struct WalletInfo {
    /// Best block height.
    pub blocks: u32,
    /// Best block hash; salts new orders against replays.
    pub best_block_hash: [u8; 32],
}

/// Input reference for transaction construction.
#[derive(Debug, Clone)]
pub struct TxInput {
    /// Previous transaction id.
    pub txid: String,
    /// Previous output index.
    pub vout: u32,
    /// Previous output value in base units.
    pub amount: u64,
}

/// A freshly built deposit transaction.
#[derive(Debug, Clone)]
pub struct CreatedDeposit {
    /// Transaction id.
    pub txid: String,
    /// Index of the P2SH deposit output.
    pub vout: u32,
    /// Raw serialized transaction.
    pub raw: String,
}

/// A freshly built refund or payment transaction.
#[derive(Debug, Clone)]
pub struct RawTransaction {
    /// Transaction id.
    pub txid: String,
    /// Raw serialized transaction.
    pub raw: String,
}

/// Result of probing a counterparty deposit on-chain.
#[derive(Debug, Clone, Copy)]
pub enum DepositCheck {
    /// Deposit not observable yet; retry later.
    Unavailable,
    /// Deposit exists but does not satisfy the expected script or amount.
    Bad,
    /// Deposit pays the expected P2SH with at least the expected amount.
    Good {
        /// Output index carrying the deposit.
        vout: u32,
        /// Value beyond the expected amount plus redeem fee; collected by
        /// the redeeming pay transaction.
        overpayment: u64,
    },
}

/// Result of probing a counterparty pay transaction for the secret.
#[derive(Debug, Clone)]
pub enum SecretCheck {
    /// Pay transaction not observable yet; retry later.
    Unavailable,
    /// Pay transaction spends the deposit but carries no matching preimage.
    Bad,
    /// Extracted preimage whose hash160 matches the committed hashed secret.
    Found([u8; 32]),
}

/// Capability set a chain adapter must provide.
///
/// Amount semantics: `min_tx_fee1` is the deposit fee model (many inputs,
/// up to three outputs), `min_tx_fee2` the redeem fee model (one input, one
/// output). A deposit output carries `amount + min_tx_fee2(1, 1)` so the
/// redeemer nets the full amount. `check_deposit_transaction` therefore
/// reports `overpayment = deposit_value - expected_amount - fee2`, and a
/// deposit is good only when that is non-negative.
pub trait WalletConnector: Send + Sync {
    /// Ticker of the chain this connector serves.
    fn currency(&self) -> Currency;

    /// Decodes a raw 20-byte address into the chain encoding.
    fn from_xaddr(&self, addr: &XAddr) -> String;

    /// Encodes a chain address into its raw 20-byte form.
    fn to_xaddr(&self, addr: &str) -> Option<XAddr>;

    /// Looks up an unspent output. `Ok(None)` means the output is unknown
    /// or already spent.
    fn get_tx_out(&self, utxo: &UtxoEntry) -> Result<Option<TxOutInfo>, WalletError>;

    /// Signs `message` with the key owning `address`. `None` when the
    /// wallet does not hold that key.
    fn sign_message(&self, address: &str, message: &str) -> Option<Vec<u8>>;

    /// Verifies a message signature made by `address`.
    fn verify_message(&self, address: &str, message: &str, signature: &[u8]) -> bool;

    /// Deposit-transaction fee for the given shape, in base units.
    fn min_tx_fee1(&self, inputs: usize, outputs: usize) -> u64;

    /// Redeem-transaction fee for the given shape, in base units.
    fn min_tx_fee2(&self, inputs: usize, outputs: usize) -> u64;

    /// True when `amount` is below the chain's dust threshold.
    fn is_dust_amount(&self, amount: u64) -> bool;

    /// Absolute lock-time height for a deposit made by `role`. The Maker's
    /// lock-time is the longer one so the Taker can always exit first.
    fn lock_time(&self, role: Role) -> Result<u32, WalletError>;

    /// True when a counterparty-proposed lock-time for `role` is within the
    /// accepted drift of our own view of the chain.
    fn acceptable_lock_time_drift(&self, role: Role, lock_time: u32) -> bool;

    /// Key id (hash160) of a public key.
    fn get_key_id(&self, pubkey: &PublicKey) -> [u8; 20] {
        contract::pubkey_id(pubkey)
    }

    /// Builds the deposit redeem script for this chain.
    fn create_deposit_unlock_script(
        &self,
        self_pub: &PublicKey,
        other_pub: &PublicKey,
        hashed_secret: &[u8; 20],
        lock_time: u32,
    ) -> ScriptBuf {
        contract::create_deposit_unlock_script(self_pub, other_pub, hashed_secret, lock_time)
    }

    /// Script id (P2SH payload) of a redeem script.
    fn get_script_id(&self, script: &ScriptBuf) -> [u8; 20] {
        contract::script_id(script)
    }

    /// Chain-encoded P2SH address for a script id.
    fn script_id_to_string(&self, script_id: &[u8; 20]) -> String;

    /// Builds, signs and returns (without broadcasting) the deposit
    /// transaction paying `outputs` from `inputs`.
    fn create_deposit_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[(String, u64)],
    ) -> Result<CreatedDeposit, WalletError>;

    /// Builds the refund transaction spending the deposit back to self,
    /// valid only from `lock_time` on.
    fn create_refund_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[(String, u64)],
        pubkey: &PublicKey,
        privkey: &SecretKey,
        lock_script: &ScriptBuf,
        lock_time: u32,
    ) -> Result<RawTransaction, WalletError>;

    /// Builds the payment transaction redeeming the counterparty deposit
    /// with the secret preimage.
    fn create_payment_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[(String, u64)],
        pubkey: &PublicKey,
        privkey: &SecretKey,
        secret: &[u8; 32],
        unlock_script: &ScriptBuf,
    ) -> Result<RawTransaction, WalletError>;

    /// Probes a counterparty deposit for the expected P2SH output.
    fn check_deposit_transaction(
        &self,
        txid: &str,
        expected_amount: u64,
        expected_p2sh: &str,
    ) -> Result<DepositCheck, WalletError>;

    /// Extracts the secret preimage from a pay transaction that spent our
    /// deposit output.
    fn get_secret_from_payment_transaction(
        &self,
        pay_txid: &str,
        deposit_txid: &str,
        deposit_vout: u32,
        hashed_secret: &[u8; 20],
    ) -> Result<SecretCheck, WalletError>;

    /// Scans for a transaction spending the given deposit output, starting
    /// at `from_block`. Used when the counterparty redeems without telling
    /// us its pay txid.
    fn find_redeeming_transaction(
        &self,
        deposit_txid: &str,
        deposit_vout: u32,
        from_block: u32,
    ) -> Result<Option<String>, WalletError>;

    /// Broadcasts a raw transaction, returning its txid.
    fn send_raw_transaction(&self, raw: &str) -> Result<String, WalletError>;

    /// Publishes the protocol fee transaction, returning its txid.
    fn store_data_into_blockchain(&self, raw: &str) -> Result<String, WalletError>;

    /// Chain tip info.
    fn get_info(&self) -> Result<WalletInfo, WalletError>;

    /// A fresh receive address from the wallet.
    fn get_new_address(&self) -> Result<String, WalletError>;
}

/// Immutable map from currency to connector, built once at startup.
#[derive(Clone, Default)]
pub struct ConnectorMap {
    inner: HashMap<Currency, Arc<dyn WalletConnector>>,
}

impl ConnectorMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector under its own currency.
    pub fn add(&mut self, connector: Arc<dyn WalletConnector>) {
        self.inner.insert(connector.currency(), connector);
    }

    /// Looks up the connector for a currency.
    pub fn by_currency(&self, currency: Currency) -> Option<Arc<dyn WalletConnector>> {
        self.inner.get(&currency).cloned()
    }

    /// Currencies with a registered connector.
    pub fn currencies(&self) -> Vec<Currency> {
        self.inner.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn utxo_signed_message_layout() {
        let entry = UtxoEntry {
            txid: Txid::from_byte_array([0u8; 32]),
            vout: 3,
            amount: 1500,
            raw_address: [0u8; 20],
            address: "addr1".into(),
            signature: vec![],
        };
        assert_eq!(
            entry.signed_message(),
            format!("{}|3|1500|addr1", entry.txid)
        );
    }

    #[test]
    fn utxo_equality_is_by_outpoint() {
        let a = UtxoEntry {
            txid: Txid::from_byte_array([1u8; 32]),
            vout: 0,
            amount: 10,
            raw_address: [0u8; 20],
            address: "x".into(),
            signature: vec![1],
        };
        let mut b = a.clone();
        b.amount = 99;
        b.signature = vec![2];
        assert_eq!(a, b);
        b.vout = 1;
        assert_ne!(a, b);
    }
}
