//! Shared test harness: simulated blockchains, mock wallet connectors and
//! an in-memory packet bus wiring trader and service-node sessions
//! together.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
        Arc, Mutex,
    },
};

use bitcoin::{
    hashes::{sha256d, Hash},
    key::rand::thread_rng,
    secp256k1::{PublicKey, Secp256k1, SecretKey},
    ScriptBuf, Txid,
};

use chainswap::{
    exchange::Exchange,
    order::Role,
    protocol::{contract, packet::Packet},
    session::{
        AppServices, DeferredQueue, NullNotifier, OrderParams, PacketSink, Session, SnodeRegistry,
    },
    store::OrderStore,
    utill::Currency,
    wallet::{
        ConnectorMap, CreatedDeposit, DepositCheck, RawTransaction, SecretCheck, TxInput,
        UtxoEntry, UtxoLockRegistry, WalletConnector, WalletError, WalletInfo, XAddr,
    },
    watcher::WatchService,
};

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

pub fn cur(code: &str) -> Currency {
    Currency::new(code).unwrap()
}

// ---- simulated chain --------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimTx {
    pub txid: String,
    pub inputs: Vec<(String, u32)>,
    pub outputs: Vec<(String, u64)>,
    pub lock_time: u32,
    pub secret: Option<[u8; 32]>,
    pub included_at: u32,
}

#[derive(Debug)]
struct UtxoSlot {
    amount: u64,
    address: String,
    spent: bool,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u32,
    utxos: HashMap<(String, u32), UtxoSlot>,
    txs: HashMap<String, SimTx>,
    prepared: HashMap<String, SimTx>,
    counter: u64,
}

/// One simulated blockchain, shared by every node's connector for that
/// currency.
#[derive(Clone)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                height: 100,
                ..Default::default()
            })),
        }
    }

    fn fresh_txid(state: &mut ChainState) -> String {
        state.counter += 1;
        let hash = sha256d::Hash::hash(&state.counter.to_le_bytes());
        Txid::from_byte_array(hash.to_byte_array()).to_string()
    }

    /// Credits `amount` to `address` (40 hex chars) with a fresh outpoint.
    pub fn fund(&self, address: &str, amount: u64) -> UtxoEntry {
        let mut state = self.state.lock().unwrap();
        let txid = Self::fresh_txid(&mut state);
        state.utxos.insert(
            (txid.clone(), 0),
            UtxoSlot {
                amount,
                address: address.to_string(),
                spent: false,
            },
        );
        let raw_address: XAddr = hex_decode(address)
            .and_then(|b| b.try_into().ok())
            .expect("funding address must be 20 hex bytes");
        UtxoEntry {
            txid: txid.parse().unwrap(),
            vout: 0,
            amount,
            raw_address,
            address: address.to_string(),
            signature: vec![],
        }
    }

    pub fn advance(&self, blocks: u32) {
        self.state.lock().unwrap().height += blocks;
    }

    pub fn height(&self) -> u32 {
        self.state.lock().unwrap().height
    }

    pub fn has_tx(&self, txid: &str) -> bool {
        self.state.lock().unwrap().txs.contains_key(txid)
    }

    pub fn tx(&self, txid: &str) -> Option<SimTx> {
        self.state.lock().unwrap().txs.get(txid).cloned()
    }
}

// ---- mock connector ---------------------------------------------------

/// Deterministic 64-byte test signature over (address, message).
fn mock_signature(address: &str, message: &str) -> Vec<u8> {
    let first = sha256d::Hash::hash(format!("{address}|{message}").as_bytes());
    let second = sha256d::Hash::hash(format!("{message}|{address}").as_bytes());
    let mut sig = Vec::with_capacity(64);
    sig.extend_from_slice(first.as_byte_array());
    sig.extend_from_slice(second.as_byte_array());
    sig
}

pub struct MockConnector {
    currency: Currency,
    chain: MockChain,
    own_addresses: Mutex<HashSet<String>>,
    address_counter: AtomicU64,
    /// Shorts the deposit output by this many base units; simulates a
    /// misbehaving counterparty wallet.
    pub deposit_shortfall: u64,
    /// When set, every broadcast fails; simulates a dead node.
    pub fail_sends: AtomicBool,
}

impl MockConnector {
    pub const DUST: u64 = 546;
    pub const DRIFT_TOLERANCE: u32 = 10;
    pub const TAKER_LOCK_OFFSET: u32 = 40;
    pub const MAKER_LOCK_OFFSET: u32 = 80;

    pub fn new(currency: Currency, chain: MockChain) -> Self {
        Self {
            currency,
            chain,
            own_addresses: Mutex::new(HashSet::new()),
            address_counter: AtomicU64::new(0),
            deposit_shortfall: 0,
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn with_shortfall(mut self, shortfall: u64) -> Self {
        self.deposit_shortfall = shortfall;
        self
    }

    /// Marks an address as held by this node's wallet so it can sign.
    pub fn own_address(&self, address: &str) {
        self.own_addresses.lock().unwrap().insert(address.to_string());
    }

    fn role_offset(role: Role) -> u32 {
        match role {
            Role::Maker => Self::MAKER_LOCK_OFFSET,
            Role::Taker => Self::TAKER_LOCK_OFFSET,
        }
    }
}

impl WalletConnector for MockConnector {
    fn currency(&self) -> Currency {
        self.currency
    }

    fn from_xaddr(&self, addr: &XAddr) -> String {
        hex_encode(addr)
    }

    fn to_xaddr(&self, addr: &str) -> Option<XAddr> {
        hex_decode(addr)?.try_into().ok()
    }

    fn get_tx_out(&self, utxo: &UtxoEntry) -> Result<Option<chainswap::wallet::TxOutInfo>, WalletError> {
        let state = self.chain.state.lock().unwrap();
        Ok(state
            .utxos
            .get(&(utxo.txid.to_string(), utxo.vout))
            .filter(|slot| !slot.spent)
            .map(|slot| chainswap::wallet::TxOutInfo {
                amount: slot.amount,
                confirmations: 1,
            }))
    }

    fn sign_message(&self, address: &str, message: &str) -> Option<Vec<u8>> {
        if !self.own_addresses.lock().unwrap().contains(address) {
            return None;
        }
        Some(mock_signature(address, message))
    }

    fn verify_message(&self, address: &str, message: &str, signature: &[u8]) -> bool {
        mock_signature(address, message) == signature
    }

    fn min_tx_fee1(&self, inputs: usize, outputs: usize) -> u64 {
        (inputs as u64) * 100 + (outputs as u64) * 50
    }

    fn min_tx_fee2(&self, inputs: usize, outputs: usize) -> u64 {
        (inputs as u64) * 80 + (outputs as u64) * 40
    }

    fn is_dust_amount(&self, amount: u64) -> bool {
        amount < Self::DUST
    }

    fn lock_time(&self, role: Role) -> Result<u32, WalletError> {
        Ok(self.chain.height() + Self::role_offset(role))
    }

    fn acceptable_lock_time_drift(&self, role: Role, lock_time: u32) -> bool {
        let expected = self.chain.height() + Self::role_offset(role);
        expected.abs_diff(lock_time) <= Self::DRIFT_TOLERANCE
    }

    fn script_id_to_string(&self, script_id: &[u8; 20]) -> String {
        format!("p2sh-{}", hex_encode(script_id))
    }

    fn create_deposit_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[(String, u64)],
    ) -> Result<CreatedDeposit, WalletError> {
        let mut state = self.chain.state.lock().unwrap();
        let txid = MockChain::fresh_txid(&mut state);
        let mut outputs = outputs.to_vec();
        if let Some(first) = outputs.first_mut() {
            first.1 = first.1.saturating_sub(self.deposit_shortfall);
        }
        state.prepared.insert(
            txid.clone(),
            SimTx {
                txid: txid.clone(),
                inputs: inputs.iter().map(|i| (i.txid.clone(), i.vout)).collect(),
                outputs,
                lock_time: 0,
                secret: None,
                included_at: 0,
            },
        );
        Ok(CreatedDeposit {
            txid: txid.clone(),
            vout: 0,
            raw: txid,
        })
    }

    fn create_refund_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[(String, u64)],
        _pubkey: &PublicKey,
        _privkey: &SecretKey,
        _lock_script: &ScriptBuf,
        lock_time: u32,
    ) -> Result<RawTransaction, WalletError> {
        let mut state = self.chain.state.lock().unwrap();
        let txid = MockChain::fresh_txid(&mut state);
        state.prepared.insert(
            txid.clone(),
            SimTx {
                txid: txid.clone(),
                inputs: inputs.iter().map(|i| (i.txid.clone(), i.vout)).collect(),
                outputs: outputs.to_vec(),
                lock_time,
                secret: None,
                included_at: 0,
            },
        );
        Ok(RawTransaction {
            txid: txid.clone(),
            raw: txid,
        })
    }

    fn create_payment_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[(String, u64)],
        _pubkey: &PublicKey,
        _privkey: &SecretKey,
        secret: &[u8; 32],
        _unlock_script: &ScriptBuf,
    ) -> Result<RawTransaction, WalletError> {
        let mut state = self.chain.state.lock().unwrap();
        let txid = MockChain::fresh_txid(&mut state);
        state.prepared.insert(
            txid.clone(),
            SimTx {
                txid: txid.clone(),
                inputs: inputs.iter().map(|i| (i.txid.clone(), i.vout)).collect(),
                outputs: outputs.to_vec(),
                lock_time: 0,
                secret: Some(*secret),
                included_at: 0,
            },
        );
        Ok(RawTransaction {
            txid: txid.clone(),
            raw: txid,
        })
    }

    fn check_deposit_transaction(
        &self,
        txid: &str,
        expected_amount: u64,
        expected_p2sh: &str,
    ) -> Result<DepositCheck, WalletError> {
        let state = self.chain.state.lock().unwrap();
        let Some(tx) = state.txs.get(txid) else {
            return Ok(DepositCheck::Unavailable);
        };
        let Some((vout, (_, amount))) = tx
            .outputs
            .iter()
            .enumerate()
            .find(|(_, (address, _))| address == expected_p2sh)
        else {
            return Ok(DepositCheck::Bad);
        };
        let fee2 = self.min_tx_fee2(1, 1);
        if *amount < expected_amount + fee2 {
            return Ok(DepositCheck::Bad);
        }
        Ok(DepositCheck::Good {
            vout: vout as u32,
            overpayment: amount - expected_amount - fee2,
        })
    }

    fn get_secret_from_payment_transaction(
        &self,
        pay_txid: &str,
        deposit_txid: &str,
        deposit_vout: u32,
        hashed_secret: &[u8; 20],
    ) -> Result<SecretCheck, WalletError> {
        let state = self.chain.state.lock().unwrap();
        let Some(tx) = state.txs.get(pay_txid) else {
            return Ok(SecretCheck::Unavailable);
        };
        if !tx
            .inputs
            .iter()
            .any(|(txid, vout)| txid == deposit_txid && *vout == deposit_vout)
        {
            return Ok(SecretCheck::Bad);
        }
        match tx.secret {
            Some(secret) if contract::hashed_secret(&secret) == *hashed_secret => {
                Ok(SecretCheck::Found(secret))
            }
            _ => Ok(SecretCheck::Bad),
        }
    }

    fn find_redeeming_transaction(
        &self,
        deposit_txid: &str,
        deposit_vout: u32,
        _from_block: u32,
    ) -> Result<Option<String>, WalletError> {
        let state = self.chain.state.lock().unwrap();
        Ok(state
            .txs
            .values()
            .find(|tx| {
                tx.inputs
                    .iter()
                    .any(|(txid, vout)| txid == deposit_txid && *vout == deposit_vout)
            })
            .map(|tx| tx.txid.clone()))
    }

    fn send_raw_transaction(&self, raw: &str) -> Result<String, WalletError> {
        if self.fail_sends.load(Relaxed) {
            return Err(WalletError::Fatal("node unreachable".into()));
        }
        let mut state = self.chain.state.lock().unwrap();
        let Some(mut tx) = state.prepared.remove(raw) else {
            if state.txs.contains_key(raw) {
                return Err(WalletError::AlreadyInChain);
            }
            return Err(WalletError::Fatal("unknown raw transaction".into()));
        };
        if tx.lock_time > state.height {
            state.prepared.insert(raw.to_string(), tx);
            return Err(WalletError::Fatal("non-final".into()));
        }
        for input in &tx.inputs {
            match state.utxos.get(&(input.0.clone(), input.1)) {
                Some(slot) if !slot.spent => {}
                _ => {
                    state.prepared.insert(raw.to_string(), tx);
                    return Err(WalletError::MissingInputs);
                }
            }
        }
        for input in tx.inputs.clone() {
            if let Some(slot) = state.utxos.get_mut(&input) {
                slot.spent = true;
            }
        }
        tx.included_at = state.height;
        for (vout, (address, amount)) in tx.outputs.iter().enumerate() {
            state.utxos.insert(
                (tx.txid.clone(), vout as u32),
                UtxoSlot {
                    amount: *amount,
                    address: address.clone(),
                    spent: false,
                },
            );
        }
        let txid = tx.txid.clone();
        state.txs.insert(txid.clone(), tx);
        Ok(txid)
    }

    fn store_data_into_blockchain(&self, _raw: &str) -> Result<String, WalletError> {
        let mut state = self.chain.state.lock().unwrap();
        let txid = MockChain::fresh_txid(&mut state);
        let height = state.height;
        state.txs.insert(
            txid.clone(),
            SimTx {
                txid: txid.clone(),
                inputs: vec![],
                outputs: vec![],
                lock_time: 0,
                secret: None,
                included_at: height,
            },
        );
        Ok(txid)
    }

    fn get_info(&self) -> Result<WalletInfo, WalletError> {
        let height = self.chain.height();
        Ok(WalletInfo {
            blocks: height,
            best_block_hash: sha256d::Hash::hash(&height.to_le_bytes()).to_byte_array(),
        })
    }

    fn get_new_address(&self) -> Result<String, WalletError> {
        let n = self.address_counter.fetch_add(1, Relaxed);
        let mut addr = [0xabu8; 20];
        addr[..8].copy_from_slice(&n.to_le_bytes());
        Ok(hex_encode(&addr))
    }
}

// ---- snode registry ---------------------------------------------------

pub struct StaticSnodeRegistry {
    known: HashSet<[u8; 33]>,
}

impl StaticSnodeRegistry {
    pub fn with_keys(keys: &[[u8; 33]]) -> Arc<Self> {
        Arc::new(Self {
            known: keys.iter().copied().collect(),
        })
    }
}

impl SnodeRegistry for StaticSnodeRegistry {
    fn is_known_snode(&self, pubkey: &[u8; 33]) -> bool {
        self.known.contains(pubkey)
    }
}

// ---- in-memory packet bus ---------------------------------------------

struct BusNode {
    session: Arc<Session>,
    keys: HashSet<XAddr>,
}

#[derive(Default)]
pub struct TestBus {
    queue: Mutex<VecDeque<(Option<XAddr>, Packet)>>,
    nodes: Mutex<Vec<BusNode>>,
    /// Every packet that crossed the bus, for replay tests.
    pub log: Mutex<Vec<Packet>>,
}

impl TestBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, session: Arc<Session>, keys: Vec<XAddr>) {
        let mut all_keys: HashSet<XAddr> = keys.into_iter().collect();
        all_keys.insert(*session.session_id());
        self.nodes.lock().unwrap().push(BusNode {
            session,
            keys: all_keys,
        });
    }

    /// Re-enqueues a captured packet, as a replaying peer would.
    pub fn inject_broadcast(&self, packet: Packet) {
        self.queue.lock().unwrap().push_back((None, packet));
    }

    /// Delivers queued packets until the queue drains. Returns how many
    /// deliveries happened.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        for _ in 0..10_000 {
            let next = self.queue.lock().unwrap().pop_front();
            let Some((target, packet)) = next else {
                break;
            };
            let sessions: Vec<Arc<Session>> = {
                let nodes = self.nodes.lock().unwrap();
                nodes
                    .iter()
                    .filter(|node| match &target {
                        Some(key) => node.keys.contains(key),
                        None => true,
                    })
                    .map(|node| node.session.clone())
                    .collect()
            };
            for session in sessions {
                let _ = session.process_packet(&packet);
                delivered += 1;
            }
        }
        delivered
    }
}

impl PacketSink for TestBus {
    fn send(&self, to: &XAddr, packet: &Packet) {
        self.log.lock().unwrap().push(packet.clone());
        self.queue.lock().unwrap().push_back((Some(*to), packet.clone()));
    }

    fn broadcast(&self, packet: &Packet) {
        self.log.lock().unwrap().push(packet.clone());
        self.queue.lock().unwrap().push_back((None, packet.clone()));
    }
}

// ---- node harness -----------------------------------------------------

pub struct TestNode {
    pub session: Arc<Session>,
    pub app: Arc<AppServices>,
}

fn build_app(
    bus: &Arc<TestBus>,
    connectors: Vec<Arc<MockConnector>>,
    snodes: Arc<StaticSnodeRegistry>,
    exchange: Option<Arc<Exchange>>,
) -> Arc<AppServices> {
    let mut map = ConnectorMap::new();
    for connector in connectors {
        map.add(connector);
    }
    Arc::new(AppServices {
        connectors: map,
        lock_registry: Arc::new(UtxoLockRegistry::new()),
        store: Arc::new(OrderStore::new()),
        exchange,
        deferred: Arc::new(DeferredQueue::new()),
        net: bus.clone(),
        snodes,
        notifier: Arc::new(NullNotifier),
        watch: WatchService::disconnected(),
    })
}

/// Builds a trader node and registers it on the bus under `addresses`.
pub fn trader_node(
    bus: &Arc<TestBus>,
    connectors: Vec<Arc<MockConnector>>,
    snodes: Arc<StaticSnodeRegistry>,
    addresses: Vec<XAddr>,
) -> TestNode {
    let app = build_app(bus, connectors, snodes, None);
    let session = Session::new(app.clone());
    bus.register(session.clone(), addresses);
    TestNode { session, app }
}

/// Builds an exchange-enabled service node.
pub fn snode_node(
    bus: &Arc<TestBus>,
    connectors: Vec<Arc<MockConnector>>,
    snodes: Arc<StaticSnodeRegistry>,
    privkey: SecretKey,
) -> TestNode {
    let app = build_app(bus, connectors, snodes, Some(Arc::new(Exchange::new(privkey))));
    let session = Session::new(app.clone());
    bus.register(session.clone(), vec![]);
    TestNode { session, app }
}

pub fn snode_keypair() -> (SecretKey, [u8; 33]) {
    let (sk, pk) = Secp256k1::new().generate_keypair(&mut thread_rng());
    (sk, pk.serialize())
}

/// Pumps the bus and retries deferred packets until nothing moves.
pub fn settle(bus: &Arc<TestBus>, nodes: &[&TestNode]) {
    for _ in 0..50 {
        let mut progressed = bus.pump() > 0;
        for node in nodes {
            for (_, packet) in node.app.deferred.drain() {
                let _ = node.session.process_packet(&packet);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

// ---- canonical two-chain swap setup -----------------------------------

pub struct SwapWorld {
    pub bus: Arc<TestBus>,
    pub chain_x: MockChain,
    pub chain_y: MockChain,
    pub maker: TestNode,
    pub taker: TestNode,
    pub snode: TestNode,
    pub maker_params: OrderParams,
    pub taker_params: OrderParams,
    /// The taker's connector for its give-chain, for fault injection.
    pub taker_y: Arc<MockConnector>,
}

pub const MAKER_FROM: XAddr = [0x11; 20];
pub const MAKER_TO: XAddr = [0x12; 20];
pub const TAKER_FROM: XAddr = [0x21; 20];
pub const TAKER_TO: XAddr = [0x22; 20];

/// A funded two-chain world ready to trade.
///
/// `taker_shortfall` shorts the taker's deposit output to simulate a bad
/// deposit.
pub fn swap_world(taker_shortfall: u64) -> SwapWorld {
    let bus = TestBus::new();
    let chain_x = MockChain::new();
    let chain_y = MockChain::new();
    let (snode_sk, snode_pk) = snode_keypair();
    let registry = StaticSnodeRegistry::with_keys(&[snode_pk]);

    let maker_from = hex_encode(&MAKER_FROM);
    let maker_to = hex_encode(&MAKER_TO);
    let taker_from = hex_encode(&TAKER_FROM);
    let taker_to = hex_encode(&TAKER_TO);

    // maker gives 10 X, receives 20 Y
    let from_amount = 10 * chainswap::utill::COIN / 100; // keep numbers readable
    let to_amount = 20 * chainswap::utill::COIN / 100;

    let maker_x = Arc::new(MockConnector::new(cur("XLT"), chain_x.clone()));
    maker_x.own_address(&maker_from);
    let maker_y = Arc::new(MockConnector::new(cur("YRT"), chain_y.clone()));
    let maker_utxo = chain_x.fund(&maker_from, from_amount + 10_000);

    let taker_y = Arc::new(
        MockConnector::new(cur("YRT"), chain_y.clone()).with_shortfall(taker_shortfall),
    );
    taker_y.own_address(&taker_to);
    taker_y.own_address(&taker_from);
    let taker_x = Arc::new(MockConnector::new(cur("XLT"), chain_x.clone()));
    let taker_utxo = chain_y.fund(&taker_from, to_amount + 10_000);

    let snode_x = Arc::new(MockConnector::new(cur("XLT"), chain_x.clone()));
    let snode_y = Arc::new(MockConnector::new(cur("YRT"), chain_y.clone()));

    let maker = trader_node(
        &bus,
        vec![maker_x, maker_y],
        registry.clone(),
        vec![MAKER_FROM, MAKER_TO],
    );
    let taker = trader_node(
        &bus,
        vec![taker_x, taker_y.clone()],
        registry.clone(),
        vec![TAKER_FROM, TAKER_TO],
    );
    let snode = snode_node(&bus, vec![snode_x, snode_y], registry, snode_sk);

    let maker_params = OrderParams {
        from_currency: cur("XLT"),
        from_amount,
        from_address: maker_from,
        to_currency: cur("YRT"),
        to_amount,
        to_address: maker_to,
        utxos: vec![maker_utxo],
        fee_utxos: vec![],
        raw_fee_tx: String::new(),
    };
    let taker_params = OrderParams {
        from_currency: cur("YRT"),
        from_amount: to_amount,
        from_address: taker_from,
        to_currency: cur("XLT"),
        to_amount: from_amount,
        to_address: taker_to,
        utxos: vec![taker_utxo],
        fee_utxos: vec![],
        raw_fee_tx: "feetx".to_string(),
    };

    SwapWorld {
        bus,
        chain_x,
        chain_y,
        maker,
        taker,
        snode,
        maker_params,
        taker_params,
        taker_y,
    }
}
