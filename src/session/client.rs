//! Trader-side packet handlers and order entry points.
//!
//! This node acts as Maker (role A) after broadcasting an order, or Taker
//! (role B) after accepting one. Every facilitator-signed packet is checked
//! against the service-node key pinned when the order first went pending;
//! a packet signing with any other key is dropped without state change.

use std::str::FromStr;

use bitcoin::{
    hashes::Hash,
    key::rand::{thread_rng, RngCore},
    secp256k1::{PublicKey, Secp256k1},
    Txid,
};

use crate::{
    order::{canonical_order_id, CancelReason, OrderDescr, OrderId, Role, TraderState},
    protocol::{
        contract,
        error::ProtocolError,
        packet::{Command, Packet, PacketReader},
    },
    store::OrderRef,
    utill::{now_ts, Currency, MAX_OTHER_PAY_TX_TRIES},
    wallet::{DepositCheck, TxInput, UtxoEntry, WalletConnector},
};

use super::{error::SessionError, lock, RedeemError, Session};

/// Everything a trader supplies to open or accept an order.
///
/// Collateral outputs arrive unsigned; the session signs each one with the
/// owning address key through the wallet connector.
#[derive(Debug, Clone)]
pub struct OrderParams {
    /// Currency this trader gives.
    pub from_currency: Currency,
    /// Amount this trader gives, base units.
    pub from_amount: u64,
    /// Chain-encoded source address.
    pub from_address: String,
    /// Currency this trader receives.
    pub to_currency: Currency,
    /// Amount this trader receives, base units.
    pub to_amount: u64,
    /// Chain-encoded destination address.
    pub to_address: String,
    /// Candidate collateral outputs.
    pub utxos: Vec<UtxoEntry>,
    /// Outputs reserved for the protocol fee.
    pub fee_utxos: Vec<UtxoEntry>,
    /// Pre-built protocol fee transaction; empty when fees are disabled.
    pub raw_fee_tx: String,
}

/// Per-UTXO wire item: txid(32) | vout(4) | address(20) | signature(64).
const UTXO_ITEM_SIZE: usize = 120;

impl Session {
    // ---- order entry points ------------------------------------------

    /// Builds and broadcasts a new order, entering it locally as Maker.
    pub fn create_order(&self, params: OrderParams) -> Result<OrderId, SessionError> {
        let conn_from = self
            .app
            .connectors
            .by_currency(params.from_currency)
            .ok_or(SessionError::NoConnector(params.from_currency))?;
        let conn_to = self
            .app
            .connectors
            .by_currency(params.to_currency)
            .ok_or(SessionError::NoConnector(params.to_currency))?;

        let from_xaddr = conn_from
            .to_xaddr(&params.from_address)
            .ok_or(SessionError::General("undecodable source address"))?;
        let to_xaddr = conn_to
            .to_xaddr(&params.to_address)
            .ok_or(SessionError::General("undecodable destination address"))?;

        if conn_from.is_dust_amount(params.from_amount)
            || conn_to.is_dust_amount(params.to_amount)
        {
            return Err(SessionError::General("dust amount"));
        }

        let utxos = sign_utxos(&*conn_from, params.utxos);
        let available: u64 = utxos.iter().map(|u| u.amount).sum();
        if utxos.is_empty() || available < params.from_amount {
            return Err(SessionError::Wallet(
                crate::wallet::WalletError::InsufficientFund {
                    available,
                    required: params.from_amount,
                },
            ));
        }

        let info = conn_from.get_info().map_err(SessionError::Wallet)?;

        if !self.app.lock_registry.try_lock(params.from_currency, &utxos) {
            return Err(SessionError::General("collateral already locked"));
        }
        if !params.fee_utxos.is_empty()
            && !self
                .app
                .lock_registry
                .try_lock_fee(params.from_currency, &params.fee_utxos)
        {
            self.app.lock_registry.unlock(params.from_currency, &utxos);
            return Err(SessionError::General("fee outputs already locked"));
        }

        let secp = Secp256k1::new();
        let (privkey, pubkey) = secp.generate_keypair(&mut thread_rng());
        let mut secret = [0u8; 32];
        thread_rng().fill_bytes(&mut secret);

        let timestamp = now_ts();
        let id = canonical_order_id(
            &params.from_address,
            params.from_currency,
            params.from_amount,
            &params.to_address,
            params.to_currency,
            params.to_amount,
            timestamp,
            &info.best_block_hash,
            &utxos[0].signature,
        );

        let mut descr = OrderDescr::new(id);
        descr.role = Some(Role::Maker);
        descr.local = true;
        descr.from_currency = params.from_currency;
        descr.from_amount = params.from_amount;
        descr.from_address = from_xaddr;
        descr.to_currency = params.to_currency;
        descr.to_amount = params.to_amount;
        descr.to_address = to_xaddr;
        descr.m_pubkey = Some(pubkey);
        descr.m_privkey = Some(privkey);
        descr.set_secret(secret);
        descr.used_coins = utxos.clone();
        descr.fee_utxos = params.fee_utxos;
        descr.raw_fee_tx = params.raw_fee_tx;
        descr.block_hash = info.best_block_hash;
        descr.created_at = timestamp;
        self.app.store.append(descr);

        let mut packet = Packet::new(Command::Transaction);
        packet.append_hash(id.as_byte_array());
        packet.append_address(&from_xaddr);
        packet.append_currency(params.from_currency);
        packet.append_u64(params.from_amount);
        packet.append_address(&to_xaddr);
        packet.append_currency(params.to_currency);
        packet.append_u64(params.to_amount);
        packet.append_u64(timestamp);
        packet.append_hash(&info.best_block_hash);
        append_utxo_items(&mut packet, &utxos);
        packet.sign(&privkey);

        self.send_packet_broadcast(&packet);
        self.app.notifier.order_received(&id);
        log::info!(
            "[{id}] order broadcast: {} {} -> {} {}",
            params.from_amount,
            params.from_currency,
            params.to_amount,
            params.to_currency
        );
        Ok(id)
    }

    /// Accepts a pending order seen on the network, entering it as Taker.
    ///
    /// The stored order-book view carries the Maker's perspective; accepting
    /// swaps it into ours.
    pub fn accept_order(&self, id: &OrderId, params: OrderParams) -> Result<(), SessionError> {
        let handle = self
            .app
            .store
            .get(id)
            .ok_or(SessionError::General("unknown order"))?;

        let hub_address = {
            let xtx = lock(&handle);
            if xtx.is_local() {
                return Err(SessionError::General("cannot accept own order"));
            }
            if xtx.state != TraderState::Pending {
                return Err(SessionError::General("order not pending"));
            }
            if xtx.s_pubkey.is_none() {
                return Err(SessionError::General("order has no facilitator"));
            }
            // the view shows the maker giving what we want to receive
            if xtx.from_currency != params.to_currency
                || xtx.to_currency != params.from_currency
                || xtx.from_amount != params.to_amount
                || xtx.to_amount != params.from_amount
            {
                return Err(SessionError::General("order terms do not match"));
            }
            xtx.hub_address
        };

        let conn_from = self
            .app
            .connectors
            .by_currency(params.from_currency)
            .ok_or(SessionError::NoConnector(params.from_currency))?;
        let conn_to = self
            .app
            .connectors
            .by_currency(params.to_currency)
            .ok_or(SessionError::NoConnector(params.to_currency))?;

        let from_xaddr = conn_from
            .to_xaddr(&params.from_address)
            .ok_or(SessionError::General("undecodable source address"))?;
        let to_xaddr = conn_to
            .to_xaddr(&params.to_address)
            .ok_or(SessionError::General("undecodable destination address"))?;

        let utxos = sign_utxos(&*conn_from, params.utxos);
        let available: u64 = utxos.iter().map(|u| u.amount).sum();
        if utxos.is_empty() || available < params.from_amount {
            return Err(SessionError::Wallet(
                crate::wallet::WalletError::InsufficientFund {
                    available,
                    required: params.from_amount,
                },
            ));
        }

        if !self.app.lock_registry.try_lock(params.from_currency, &utxos) {
            return Err(SessionError::General("collateral already locked"));
        }
        if !params.fee_utxos.is_empty()
            && !self
                .app
                .lock_registry
                .try_lock_fee(params.from_currency, &params.fee_utxos)
        {
            self.app.lock_registry.unlock(params.from_currency, &utxos);
            return Err(SessionError::General("fee outputs already locked"));
        }

        let secp = Secp256k1::new();
        let (privkey, pubkey) = secp.generate_keypair(&mut thread_rng());

        {
            let mut xtx = lock(&handle);
            xtx.role = Some(Role::Taker);
            xtx.local = true;
            xtx.from_currency = params.from_currency;
            xtx.from_amount = params.from_amount;
            xtx.from_address = from_xaddr;
            xtx.to_currency = params.to_currency;
            xtx.to_amount = params.to_amount;
            xtx.to_address = to_xaddr;
            xtx.m_pubkey = Some(pubkey);
            xtx.m_privkey = Some(privkey);
            xtx.used_coins = utxos.clone();
            xtx.fee_utxos = params.fee_utxos;
            xtx.raw_fee_tx = params.raw_fee_tx;
            xtx.update_timestamp();
        }

        let mut packet = Packet::new(Command::TransactionAccepting);
        packet.append_address(&hub_address);
        packet.append_hash(id.as_byte_array());
        packet.append_address(&from_xaddr);
        packet.append_currency(params.from_currency);
        packet.append_u64(params.from_amount);
        packet.append_address(&to_xaddr);
        packet.append_currency(params.to_currency);
        packet.append_u64(params.to_amount);
        append_utxo_items(&mut packet, &utxos);
        packet.sign(&privkey);

        self.send_packet(&hub_address, &packet);
        log::info!("[{id}] accepting order as taker");
        Ok(())
    }

    // ---- handlers -----------------------------------------------------

    pub(super) fn process_pending_transaction(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() != 124 {
            return Err(ProtocolError::WrongSize {
                need: 124,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let scurrency = reader.read_currency()?;
        let samount = reader.read_u64()?;
        let dcurrency = reader.read_currency()?;
        let damount = reader.read_u64()?;
        let hub_address = reader.read_address()?;
        let created = reader.read_u64()?;
        let block_hash = reader.read_hash()?;

        let spubkey = *packet.pubkey();

        if let Some(handle) = self.app.store.get(&id) {
            let mut xtx = lock(&handle);
            match xtx.s_pubkey {
                // the key pinned at first contact must sign every echo
                Some(pinned) => {
                    if !packet.verify(&pinned) {
                        log::warn!(
                            "[{id}] wrong servicenode handling order, dropping echo from \
                             different key"
                        );
                        return Ok(());
                    }
                }
                None => {
                    if !packet.verify(&spubkey) {
                        log::warn!("[{id}] invalid packet signature");
                        return Ok(());
                    }
                    xtx.s_pubkey = Some(spubkey);
                    xtx.hub_address = hub_address;
                }
            }

            if xtx.state > TraderState::Pending {
                log::info!("[{id}] already received order");
                return Ok(());
            }
            if xtx.state == TraderState::New {
                log::info!("[{id}] confirmed by servicenode, order now pending");
                xtx.state = TraderState::Pending;
            }
            xtx.update_timestamp();
            drop(xtx);
            self.app.notifier.order_changed(&id);
            return Ok(());
        }

        if self.app.store.history_entry(&id).is_some() {
            log::debug!("[{id}] echo for concluded order, ignoring");
            return Ok(());
        }

        if !packet.verify(&spubkey) {
            log::warn!("[{id}] invalid packet signature");
            return Ok(());
        }

        if self.app.connectors.by_currency(scurrency).is_none()
            || self.app.connectors.by_currency(dcurrency).is_none()
        {
            log::warn!("[{id}] no connector for order currencies, ignoring");
            return Ok(());
        }

        let mut descr = OrderDescr::new(id);
        descr.from_currency = scurrency;
        descr.from_amount = samount;
        descr.to_currency = dcurrency;
        descr.to_amount = damount;
        descr.hub_address = hub_address;
        descr.created_at = created;
        descr.state = TraderState::Pending;
        descr.s_pubkey = Some(spubkey);
        descr.block_hash = block_hash;
        self.app.store.append(descr);

        log::info!("[{id}] received order {samount} {scurrency} -> {damount} {dcurrency}");
        self.app.notifier.order_received(&id);
        Ok(())
    }

    pub(super) fn process_transaction_hold(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() != 52 {
            return Err(ProtocolError::WrongSize {
                need: 52,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let hub_address = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);

        let Some(handle) = self.app.store.get(&id) else {
            log::info!("[{id}] hold for unknown order");
            return Ok(());
        };

        if !self.verify_snode_packet(&handle, packet, &id)? {
            return Ok(());
        }

        let (state, is_local, to_currency, from_address, keys) = {
            let xtx = lock(&handle);
            (
                xtx.state,
                xtx.is_local(),
                xtx.to_currency,
                xtx.from_address,
                xtx.keypair(),
            )
        };

        if state >= TraderState::Hold {
            log::warn!("[{id}] wrong state {state:?} for hold, dropping");
            return Ok(());
        }

        if !is_local {
            // someone else's trade went exclusive, retire our view of it
            let mut xtx = lock(&handle);
            xtx.state = TraderState::Finished;
            drop(xtx);
            log::info!("[{id}] order held elsewhere, moving to history");
            self.app.store.move_to_history(&id);
            self.app.notifier.order_changed(&id);
            return Ok(());
        }

        if self.app.connectors.by_currency(to_currency).is_none() {
            log::warn!("[{id}] no connector for <{to_currency}>");
            return Ok(());
        }

        {
            let mut xtx = lock(&handle);
            xtx.state = TraderState::Hold;
            xtx.update_timestamp();
            log::info!("[{id}] holding order");
        }
        self.app.notifier.order_changed(&id);

        let Some((_, privkey)) = keys else {
            return Ok(());
        };
        let mut reply = Packet::new(Command::TransactionHoldApply);
        reply.append_address(&hub_address);
        reply.append_address(&from_address);
        reply.append_hash(id.as_byte_array());
        reply.sign(&privkey);
        self.send_packet(&hub_address, &reply);
        Ok(())
    }

    pub(super) fn process_transaction_init(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() != 144 {
            return Err(ProtocolError::WrongSize {
                need: 144,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let this_address = reader.read_address()?;
        let hub_address = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let from = reader.read_address()?;
        let from_currency = reader.read_currency()?;
        let from_amount = reader.read_u64()?;
        let to = reader.read_address()?;
        let to_currency = reader.read_currency()?;
        let to_amount = reader.read_u64()?;

        let Some(handle) = self.local_order(&id) else {
            return Ok(());
        };
        if !self.verify_snode_packet(&handle, packet, &id)? {
            return Ok(());
        }

        let (role, raw_fee_tx, own_from_currency, keys, fee_utxos) = {
            let xtx = lock(&handle);
            if xtx.state >= TraderState::Initialized {
                log::warn!("[{id}] wrong state {:?} for init, dropping", xtx.state);
                return Ok(());
            }
            // the facilitator must echo our own view of the trade
            if from != xtx.from_address
                || from_currency != xtx.from_currency
                || from_amount != xtx.from_amount
                || to != xtx.to_address
                || to_currency != xtx.to_currency
                || to_amount != xtx.to_amount
            {
                log::warn!("[{id}] init does not match order, dropping");
                return Ok(());
            }
            (
                xtx.role,
                xtx.raw_fee_tx.clone(),
                xtx.from_currency,
                xtx.keypair(),
                xtx.fee_utxos.clone(),
            )
        };

        let mut fee_txid = [0u8; 32];
        if role == Some(Role::Taker) && !raw_fee_tx.is_empty() {
            let Some(conn_from) = self.app.connectors.by_currency(own_from_currency) else {
                log::warn!("[{id}] no connector for <{own_from_currency}>");
                return Ok(());
            };
            match conn_from.store_data_into_blockchain(&raw_fee_tx) {
                Ok(txid) => match Txid::from_str(&txid) {
                    Ok(parsed) => {
                        fee_txid = parsed.to_byte_array();
                        self.app
                            .lock_registry
                            .unlock_fee(own_from_currency, &fee_utxos);
                    }
                    Err(_) => {
                        log::info!("[{id}] fee publication returned no txid, retrying later");
                        self.app.deferred.defer(id, packet.clone());
                        return Ok(());
                    }
                },
                Err(e) if e.is_transient() => {
                    log::info!("[{id}] fee publication unavailable, retrying later");
                    self.app.deferred.defer(id, packet.clone());
                    return Ok(());
                }
                Err(e) => {
                    log::error!("[{id}] failed to publish fee transaction: {e:?}");
                    self.send_cancel_order(&handle, CancelReason::FeePayment);
                    return Ok(());
                }
            }
        }

        {
            let mut xtx = lock(&handle);
            xtx.state = TraderState::Initialized;
            xtx.update_timestamp();
        }
        self.app.notifier.order_changed(&id);

        let Some((_, privkey)) = keys else {
            return Ok(());
        };
        let mut reply = Packet::new(Command::TransactionInitialized);
        reply.append_address(&hub_address);
        reply.append_address(&this_address);
        reply.append_hash(id.as_byte_array());
        reply.append_hash(&fee_txid);
        reply.sign(&privkey);
        self.send_packet(&hub_address, &reply);
        Ok(())
    }

    pub(super) fn process_transaction_create_a(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() != 85 {
            return Err(ProtocolError::WrongSize {
                need: 85,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let hub_address = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let other_pubkey_raw = reader.read_pubkey()?;

        let Some(handle) = self.local_order(&id) else {
            return Ok(());
        };
        if !self.verify_snode_packet(&handle, packet, &id)? {
            return Ok(());
        }

        let snapshot = {
            let xtx = lock(&handle);
            if xtx.role != Some(Role::Maker) {
                log::error!("[{id}] received create for wrong role, expected maker");
                return Ok(());
            }
            if xtx.state >= TraderState::Created {
                log::warn!("[{id}] wrong state {:?} for create, dropping", xtx.state);
                return Ok(());
            }
            (
                xtx.from_currency,
                xtx.to_currency,
                xtx.from_amount,
                xtx.used_coins.clone(),
                xtx.secret(),
                xtx.keypair(),
                xtx.refund_address.clone(),
            )
        };
        let (from_currency, to_currency, from_amount, used_coins, secret, keys, refund_address) =
            snapshot;

        let Some((m_pubkey, m_privkey)) = keys else {
            return Ok(());
        };
        let Some(secret) = secret else {
            log::error!("[{id}] maker order has no secret, cannot create deposit");
            return Ok(());
        };
        let other_pubkey = match PublicKey::from_slice(&other_pubkey_raw) {
            Ok(pk) => pk,
            Err(e) => return Err(SessionError::Protocol(e.into())),
        };

        let (Some(conn_from), Some(conn_to)) = (
            self.app.connectors.by_currency(from_currency),
            self.app.connectors.by_currency(to_currency),
        ) else {
            log::warn!("[{id}] missing connector, canceling order");
            self.send_cancel_order(&handle, CancelReason::RpcError);
            return Ok(());
        };

        let Some(selection) = select_coins(&*conn_from, &used_coins, from_amount) else {
            log::info!("[{id}] insufficient funds, canceling order");
            self.send_cancel_order(&handle, CancelReason::NoMoney);
            return Ok(());
        };

        let (lock_time, opponent_lock_time) = match (
            conn_from.lock_time(Role::Maker),
            conn_to.lock_time(Role::Taker),
        ) {
            (Ok(mine), Ok(theirs)) if mine > 0 && theirs > 0 => (mine, theirs),
            _ => {
                log::warn!("[{id}] lock time error, canceling order");
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        };

        let hx = contract::hashed_secret(&secret);
        let lock_script =
            conn_from.create_deposit_unlock_script(&m_pubkey, &other_pubkey, &hx, lock_time);
        let lock_p2sh = conn_from.script_id_to_string(&conn_from.get_script_id(&lock_script));

        let deposit = match self.build_deposit(
            &*conn_from,
            &selection,
            &lock_p2sh,
            from_amount,
        ) {
            Ok(deposit) => deposit,
            Err(e) => {
                log::error!("[{id}] failed to create deposit transaction: {e:?}");
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        };

        let refund = match self.build_refund(
            &*conn_from,
            &deposit,
            from_amount,
            &refund_address,
            &m_pubkey,
            &m_privkey,
            &lock_script,
            lock_time,
        ) {
            Ok(refund) => refund,
            Err(e) => {
                log::error!("[{id}] failed to create refund transaction: {e:?}");
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        };

        {
            let mut xtx = lock(&handle);
            xtx.o_pubkey = Some(other_pubkey);
            xtx.lock_time = lock_time;
            xtx.opponent_lock_time = opponent_lock_time;
            xtx.lock_script = Some(lock_script);
            xtx.lock_p2sh_address = lock_p2sh;
            xtx.bin_txid = deposit.txid.clone();
            xtx.bin_tx_vout = deposit.vout;
            xtx.bin_tx = deposit.raw.clone();
            xtx.ref_txid = refund.txid.clone();
            xtx.ref_tx = refund.raw.clone();
            xtx.state = TraderState::Created;
            xtx.sent_deposit();
            xtx.update_timestamp();
        }
        self.app.notifier.order_changed(&id);

        match conn_from.send_raw_transaction(&deposit.raw) {
            Ok(sent) => {
                log::info!("[{id}] deposited to p2sh, txid {} sent id {sent}", deposit.txid);
            }
            Err(e) => {
                log::error!("[{id}] error sending deposit, canceling order: {e:?}");
                lock(&handle).fail_deposit();
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        }

        let mut reply = Packet::new(Command::TransactionCreatedA);
        reply.append_address(&hub_address);
        reply.append_hash(id.as_byte_array());
        reply.append_cstr(&deposit.txid);
        reply.append_bytes(&hx);
        reply.append_u32(lock_time);
        reply.append_cstr(&refund.txid);
        reply.append_cstr(&refund.raw);
        reply.sign(&m_privkey);
        self.send_packet(&hub_address, &reply);
        Ok(())
    }

    pub(super) fn process_transaction_create_b(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() <= 109 {
            return Err(ProtocolError::WrongSize {
                need: 110,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let hub_address = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let maker_pubkey_raw = reader.read_pubkey()?;
        let bin_a_txid = reader.read_cstr()?.to_string();
        let hx = reader.read_address()?;
        let lock_time_a = reader.read_u32()?;

        let Some(handle) = self.local_order(&id) else {
            return Ok(());
        };
        if !self.verify_snode_packet(&handle, packet, &id)? {
            return Ok(());
        }

        let snapshot = {
            let xtx = lock(&handle);
            if xtx.state >= TraderState::Created {
                log::warn!("[{id}] wrong state {:?} for create, dropping", xtx.state);
                return Ok(());
            }
            if xtx.role != Some(Role::Taker) {
                log::error!("[{id}] received create for wrong role, expected taker");
                return Ok(());
            }
            if xtx.has_secret() {
                log::error!("[{id}] taker already holds a secret, bad role");
                return Ok(());
            }
            (
                xtx.from_currency,
                xtx.to_currency,
                xtx.from_amount,
                xtx.to_amount,
                xtx.used_coins.clone(),
                xtx.keypair(),
                xtx.refund_address.clone(),
            )
        };
        let (from_currency, to_currency, from_amount, to_amount, used_coins, keys, refund_address) =
            snapshot;

        if bin_a_txid.is_empty() {
            log::info!("[{id}] bad counterparty deposit txid received, canceling order");
            self.send_cancel_order(&handle, CancelReason::BadDepositA);
            return Ok(());
        }

        let Some((m_pubkey, m_privkey)) = keys else {
            return Ok(());
        };
        let maker_pubkey = match PublicKey::from_slice(&maker_pubkey_raw) {
            Ok(pk) => pk,
            Err(e) => return Err(SessionError::Protocol(e.into())),
        };

        let (Some(conn_from), Some(conn_to)) = (
            self.app.connectors.by_currency(from_currency),
            self.app.connectors.by_currency(to_currency),
        ) else {
            log::warn!("[{id}] missing connector, canceling order");
            self.send_cancel_order(&handle, CancelReason::RpcError);
            return Ok(());
        };

        if lock_time_a == 0 || !conn_to.acceptable_lock_time_drift(Role::Maker, lock_time_a) {
            log::info!("[{id}] incorrect locktime {lock_time_a} from counterparty, canceling");
            self.send_cancel_order(&handle, CancelReason::BadDepositA);
            return Ok(());
        }

        // the maker's deposit commits to (maker, me, hx, maker locktime)
        let counterparty_script =
            conn_to.create_deposit_unlock_script(&maker_pubkey, &m_pubkey, &hx, lock_time_a);
        let counterparty_p2sh =
            conn_to.script_id_to_string(&conn_to.get_script_id(&counterparty_script));

        let (cp_vout, cp_overpayment) =
            match conn_to.check_deposit_transaction(&bin_a_txid, to_amount, &counterparty_p2sh) {
                Ok(DepositCheck::Good { vout, overpayment }) => (vout, overpayment),
                Ok(DepositCheck::Bad) => {
                    log::info!("[{id}] bad counterparty deposit, canceling order");
                    self.send_cancel_order(&handle, CancelReason::BadDepositA);
                    return Ok(());
                }
                Ok(DepositCheck::Unavailable) | Err(_) => {
                    log::info!("[{id}] counterparty deposit not observable yet, retrying later");
                    self.app.deferred.defer(id, packet.clone());
                    return Ok(());
                }
            };
        log::info!("[{id}] counterparty deposit confirmed");

        let Some(selection) = select_coins(&*conn_from, &used_coins, from_amount) else {
            log::info!("[{id}] insufficient funds, canceling order");
            self.send_cancel_order(&handle, CancelReason::NoMoney);
            return Ok(());
        };

        let lock_time = match conn_from.lock_time(Role::Taker) {
            Ok(lt) if lt > 0 => lt,
            _ => {
                log::warn!("[{id}] lock time error, canceling order");
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        };

        let lock_script =
            conn_from.create_deposit_unlock_script(&m_pubkey, &maker_pubkey, &hx, lock_time);
        let lock_p2sh = conn_from.script_id_to_string(&conn_from.get_script_id(&lock_script));

        let deposit = match self.build_deposit(&*conn_from, &selection, &lock_p2sh, from_amount) {
            Ok(deposit) => deposit,
            Err(e) => {
                log::error!("[{id}] failed to create deposit transaction: {e:?}");
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        };

        let refund = match self.build_refund(
            &*conn_from,
            &deposit,
            from_amount,
            &refund_address,
            &m_pubkey,
            &m_privkey,
            &lock_script,
            lock_time,
        ) {
            Ok(refund) => refund,
            Err(e) => {
                log::error!("[{id}] failed to create refund transaction: {e:?}");
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        };

        let info = match conn_from.get_info() {
            Ok(info) => info,
            Err(e) => {
                log::error!("[{id}] failed to obtain chain height: {e:?}");
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        };

        {
            let mut xtx = lock(&handle);
            xtx.o_pubkey = Some(maker_pubkey);
            xtx.o_hashed_secret = Some(hx);
            xtx.lock_time = lock_time;
            xtx.opponent_lock_time = lock_time_a;
            xtx.o_bin_txid = bin_a_txid;
            xtx.o_bin_tx_vout = cp_vout;
            xtx.o_overpayment = cp_overpayment;
            xtx.unlock_script = Some(counterparty_script);
            xtx.unlock_p2sh_address = counterparty_p2sh;
            xtx.lock_script = Some(lock_script);
            xtx.lock_p2sh_address = lock_p2sh;
            xtx.bin_txid = deposit.txid.clone();
            xtx.bin_tx_vout = deposit.vout;
            xtx.bin_tx = deposit.raw.clone();
            xtx.ref_txid = refund.txid.clone();
            xtx.ref_tx = refund.raw.clone();
            xtx.state = TraderState::Created;
            xtx.sent_deposit();
            xtx.update_timestamp();
        }
        self.app.notifier.order_changed(&id);

        match conn_from.send_raw_transaction(&deposit.raw) {
            Ok(sent) => {
                log::info!("[{id}] deposited to p2sh, txid {} sent id {sent}", deposit.txid);
                let mut xtx = lock(&handle);
                xtx.set_watch_block(info.blocks);
                drop(xtx);
                self.app.watch.watch_spent_deposit(id);
            }
            Err(e) => {
                log::error!("[{id}] error sending deposit tx, canceling order: {e:?}");
                lock(&handle).fail_deposit();
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        }

        let mut reply = Packet::new(Command::TransactionCreatedB);
        reply.append_address(&hub_address);
        reply.append_hash(id.as_byte_array());
        reply.append_cstr(&deposit.txid);
        reply.append_u32(lock_time);
        reply.append_cstr(&refund.txid);
        reply.append_cstr(&refund.raw);
        reply.sign(&m_privkey);
        self.send_packet(&hub_address, &reply);
        Ok(())
    }

    pub(super) fn process_transaction_confirm_a(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() <= 56 {
            return Err(ProtocolError::WrongSize {
                need: 57,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let hub_address = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let bin_b_txid = reader.read_cstr()?.to_string();
        let lock_time_b = reader.read_u32()?;

        let Some(handle) = self.local_order(&id) else {
            return Ok(());
        };
        if !self.verify_snode_packet(&handle, packet, &id)? {
            return Ok(());
        }

        let snapshot = {
            let xtx = lock(&handle);
            if xtx.state >= TraderState::Committed {
                log::warn!("[{id}] wrong state {:?} for confirm, dropping", xtx.state);
                return Ok(());
            }
            if xtx.role != Some(Role::Maker) {
                log::error!("[{id}] received confirm for wrong role, expected maker");
                return Ok(());
            }
            (
                xtx.from_currency,
                xtx.to_currency,
                xtx.to_amount,
                xtx.secret(),
                xtx.keypair(),
                xtx.o_pubkey,
            )
        };
        let (from_currency, to_currency, to_amount, secret, keys, o_pubkey) = snapshot;

        let (Some((m_pubkey, m_privkey)), Some(o_pubkey), Some(secret)) =
            (keys, o_pubkey, secret)
        else {
            return Ok(());
        };

        let (Some(_conn_from), Some(conn_to)) = (
            self.app.connectors.by_currency(from_currency),
            self.app.connectors.by_currency(to_currency),
        ) else {
            log::warn!("[{id}] missing connector, canceling order");
            self.send_cancel_order(&handle, CancelReason::RpcError);
            return Ok(());
        };

        if lock_time_b == 0 || !conn_to.acceptable_lock_time_drift(Role::Taker, lock_time_b) {
            log::info!("[{id}] incorrect locktime {lock_time_b} from counterparty, canceling");
            self.send_cancel_order(&handle, CancelReason::BadDepositB);
            return Ok(());
        }

        // the taker's deposit commits to (taker, me, hx, taker locktime)
        let hx = contract::hashed_secret(&secret);
        let counterparty_script =
            conn_to.create_deposit_unlock_script(&o_pubkey, &m_pubkey, &hx, lock_time_b);
        let counterparty_p2sh =
            conn_to.script_id_to_string(&conn_to.get_script_id(&counterparty_script));

        let (cp_vout, cp_overpayment) =
            match conn_to.check_deposit_transaction(&bin_b_txid, to_amount, &counterparty_p2sh) {
                Ok(DepositCheck::Good { vout, overpayment }) => (vout, overpayment),
                Ok(DepositCheck::Bad) => {
                    log::info!("[{id}] bad counterparty deposit, canceling order");
                    self.send_cancel_order(&handle, CancelReason::BadDepositB);
                    return Ok(());
                }
                Ok(DepositCheck::Unavailable) | Err(_) => {
                    log::info!("[{id}] counterparty deposit not observable yet, retrying later");
                    self.app.deferred.defer(id, packet.clone());
                    return Ok(());
                }
            };
        log::info!("[{id}] counterparty deposit confirmed");

        {
            let mut xtx = lock(&handle);
            xtx.opponent_lock_time = lock_time_b;
            xtx.o_bin_txid = bin_b_txid;
            xtx.o_bin_tx_vout = cp_vout;
            xtx.o_overpayment = cp_overpayment;
            xtx.unlock_script = Some(counterparty_script);
            xtx.unlock_p2sh_address = counterparty_p2sh;
            xtx.update_timestamp();
        }

        // this broadcast reveals the secret on-chain
        match self.redeem_order_counterparty_deposit(&handle) {
            Ok(()) => {}
            Err(RedeemError::WaitForDeposit) => {
                log::info!("[{id}] trying to redeem again later");
                self.app.deferred.defer(id, packet.clone());
                return Ok(());
            }
            Err(RedeemError::Failed) => {
                log::info!("[{id}] failed to redeem counterparty deposit, canceling order");
                self.send_cancel_order(&handle, CancelReason::RpcError);
                return Ok(());
            }
        }

        let pay_txid = {
            let mut xtx = lock(&handle);
            xtx.state = TraderState::Committed;
            xtx.update_timestamp();
            xtx.pay_txid.clone()
        };
        self.app.notifier.order_changed(&id);

        let mut reply = Packet::new(Command::TransactionConfirmedA);
        reply.append_address(&hub_address);
        reply.append_hash(id.as_byte_array());
        reply.append_cstr(&pay_txid);
        reply.sign(&m_privkey);
        self.send_packet(&hub_address, &reply);
        Ok(())
    }

    pub(super) fn process_transaction_confirm_b(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() <= 52 || packet.size() > 1000 {
            return Err(ProtocolError::WrongSize {
                need: 53,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let hub_address = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let other_pay_txid = reader.read_cstr()?.to_string();

        let Some(handle) = self.local_order(&id) else {
            return Ok(());
        };
        if !self.verify_snode_packet(&handle, packet, &id)? {
            return Ok(());
        }

        let (from_currency, to_currency, keys) = {
            let mut xtx = lock(&handle);
            if xtx.state >= TraderState::Committed {
                log::warn!("[{id}] wrong state {:?} for confirm, dropping", xtx.state);
                return Ok(());
            }
            // poll the supplied pay tx only a bounded number of times; the
            // block scanner takes over afterwards
            if xtx.other_pay_tx_tries() < MAX_OTHER_PAY_TX_TRIES && !xtx.is_done_watching() {
                xtx.set_other_pay_txid(&other_pay_txid);
                xtx.try_other_pay_tx();
            }
            (xtx.from_currency, xtx.to_currency, xtx.keypair())
        };

        if self.app.connectors.by_currency(from_currency).is_none()
            || self.app.connectors.by_currency(to_currency).is_none()
        {
            log::warn!("[{id}] missing connector, retrying later");
            self.app.deferred.defer(id, packet.clone());
            return Ok(());
        }

        if self.redeem_order_counterparty_deposit(&handle).is_err() {
            self.app.deferred.defer(id, packet.clone());
            return Ok(());
        }

        let pay_txid = {
            let mut xtx = lock(&handle);
            xtx.state = TraderState::Committed;
            xtx.update_timestamp();
            xtx.pay_txid.clone()
        };
        self.app.notifier.order_changed(&id);

        let Some((_, m_privkey)) = keys else {
            return Ok(());
        };
        let mut reply = Packet::new(Command::TransactionConfirmedB);
        reply.append_address(&hub_address);
        reply.append_hash(id.as_byte_array());
        reply.append_cstr(&pay_txid);
        reply.sign(&m_privkey);
        self.send_packet(&hub_address, &reply);
        Ok(())
    }

    // ---- shared helpers ----------------------------------------------

    fn local_order(&self, id: &OrderId) -> Option<OrderRef> {
        let handle = match self.app.store.get(id) {
            Some(handle) => handle,
            None => {
                log::info!("[{id}] unknown order");
                return None;
            }
        };
        if !lock(&handle).is_local() {
            log::error!("[{id}] not a local order");
            return None;
        }
        Some(handle)
    }

    /// Checks a facilitator-signed packet against the pinned service-node
    /// key and the registry. `Ok(false)` drops the packet quietly.
    fn verify_snode_packet(
        &self,
        handle: &OrderRef,
        packet: &Packet,
        id: &OrderId,
    ) -> Result<bool, SessionError> {
        let pinned = lock(handle).s_pubkey;
        let Some(pinned) = pinned else {
            log::warn!("[{id}] no servicenode bound to order yet, dropping");
            return Ok(false);
        };
        if !packet.verify(&pinned) {
            log::warn!(
                "[{id}] wrong servicenode handling order, expected pinned key, dropping"
            );
            return Ok(false);
        }
        if PublicKey::from_slice(packet.pubkey()).is_err() {
            log::info!("[{id}] bad servicenode public key");
            return Err(SessionError::Protocol(ProtocolError::BadSignature));
        }
        if !self.app.snodes.is_known_snode(packet.pubkey()) {
            log::info!("[{id}] unknown service node, dropping");
            return Ok(false);
        }
        Ok(true)
    }

    fn build_deposit(
        &self,
        conn: &dyn WalletConnector,
        selection: &CoinSelection,
        lock_p2sh: &str,
        amount: u64,
    ) -> Result<crate::wallet::CreatedDeposit, crate::wallet::WalletError> {
        let inputs: Vec<TxInput> = selection
            .coins
            .iter()
            .map(|coin| TxInput {
                txid: coin.txid.to_string(),
                vout: coin.vout,
                amount: coin.amount,
            })
            .collect();

        let mut outputs = vec![(lock_p2sh.to_string(), amount + selection.fee2)];
        let spent = amount + selection.fee1 + selection.fee2;
        if selection.in_amount > spent {
            // change goes back to the largest input's address
            outputs.push((selection.largest_address.clone(), selection.in_amount - spent));
        }

        conn.create_deposit_transaction(&inputs, &outputs)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_refund(
        &self,
        conn: &dyn WalletConnector,
        deposit: &crate::wallet::CreatedDeposit,
        amount: u64,
        refund_address: &str,
        pubkey: &PublicKey,
        privkey: &bitcoin::secp256k1::SecretKey,
        lock_script: &bitcoin::ScriptBuf,
        lock_time: u32,
    ) -> Result<crate::wallet::RawTransaction, crate::wallet::WalletError> {
        let fee2 = conn.min_tx_fee2(1, 1);
        let inputs = [TxInput {
            txid: deposit.txid.clone(),
            vout: deposit.vout,
            amount: amount + fee2,
        }];

        let address = if refund_address.is_empty() {
            conn.get_new_address()?
        } else {
            refund_address.to_string()
        };
        let outputs = [(address, amount)];

        conn.create_refund_transaction(&inputs, &outputs, pubkey, privkey, lock_script, lock_time)
    }
}

struct CoinSelection {
    coins: Vec<UtxoEntry>,
    in_amount: u64,
    fee1: u64,
    fee2: u64,
    largest_address: String,
}

/// Walks the locked collateral until it covers `amount + fee1(n, 3) +
/// fee2(1, 1)`. Returns `None` when even the full set falls short.
fn select_coins(
    conn: &dyn WalletConnector,
    used_coins: &[UtxoEntry],
    amount: u64,
) -> Option<CoinSelection> {
    let fee2 = conn.min_tx_fee2(1, 1);
    let mut coins = Vec::new();
    let mut in_amount = 0u64;
    let mut fee1 = 0u64;

    for entry in used_coins {
        coins.push(entry.clone());
        in_amount += entry.amount;
        fee1 = conn.min_tx_fee1(coins.len(), 3);
        log::debug!(
            "using utxo item, id <{}> amount {} vout {}",
            entry.txid,
            entry.amount,
            entry.vout
        );
        if in_amount >= amount + fee1 + fee2 {
            break;
        }
    }

    log::debug!(
        "coin selection: in {in_amount}, required {} (fee1 {fee1}, fee2 {fee2})",
        amount + fee1 + fee2
    );

    if in_amount < amount + fee1 + fee2 {
        return None;
    }

    let largest_address = coins
        .iter()
        .max_by_key(|coin| coin.amount)
        .map(|coin| coin.address.clone())?;

    Some(CoinSelection {
        coins,
        in_amount,
        fee1,
        fee2,
        largest_address,
    })
}

fn sign_utxos(conn: &dyn WalletConnector, utxos: Vec<UtxoEntry>) -> Vec<UtxoEntry> {
    utxos
        .into_iter()
        .filter_map(|mut utxo| {
            let signature = conn.sign_message(&utxo.address, &utxo.signed_message())?;
            if signature.len() != 64 {
                log::warn!(
                    "skipping utxo <{}:{}>, signature is not compact",
                    utxo.txid,
                    utxo.vout
                );
                return None;
            }
            utxo.signature = signature;
            Some(utxo)
        })
        .collect()
}

fn append_utxo_items(packet: &mut Packet, utxos: &[UtxoEntry]) {
    packet.append_u32(utxos.len() as u32);
    for utxo in utxos {
        packet.append_hash(&utxo.txid.to_byte_array());
        packet.append_u32(utxo.vout);
        packet.append_address(&utxo.raw_address);
        packet.append_bytes(&utxo.signature);
    }
}

/// Reads the UTXO item list that tails Transaction and
/// TransactionAccepting bodies. Amounts and encoded addresses are filled
/// in later from the chain.
pub(super) fn read_utxo_items(
    reader: &mut PacketReader<'_>,
) -> Result<Vec<UtxoEntry>, ProtocolError> {
    let count = reader.read_u32()? as usize;
    let mut items = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        if reader.remaining() < UTXO_ITEM_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let txid = Txid::from_byte_array(reader.read_hash()?);
        let vout = reader.read_u32()?;
        let raw_address = reader.read_address()?;
        let signature = reader.read_bytes(64)?.to_vec();
        items.push(UtxoEntry {
            txid,
            vout,
            amount: 0,
            raw_address,
            address: String::new(),
            signature,
        });
    }
    Ok(items)
}
