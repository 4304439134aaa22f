//! Facilitator-side packet handlers.
//!
//! The service node admits Maker broadcasts, assigns the Taker, and walks
//! both peers through the deposit choreography, signing every step with
//! its registered key. It never touches funds; it validates, sequences and
//! relays.

use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc,
};
use std::thread::{self, JoinHandle};

use bitcoin::hashes::Hash;

use crate::{
    exchange::ExchangeOrderRef,
    order::{canonical_order_id, CancelReason, FacilitatorState, OrderId},
    protocol::{
        error::ProtocolError,
        packet::{Command, Packet, PacketReader},
    },
    utill::{HEART_BEAT_INTERVAL, ORDER_SYNC_TIMEOUT},
    wallet::UtxoEntry,
};

use super::{client::read_utxo_items, error::SessionError, lock, Session};

impl Session {
    pub(super) fn process_transaction(&self, packet: &Packet) -> Result<(), SessionError> {
        let Some(exchange) = self.app.exchange.clone() else {
            return Ok(());
        };

        if packet.size() < 152 {
            return Err(ProtocolError::WrongSize {
                need: 152,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let id = OrderId::from_byte_array(reader.read_hash()?);

        // a rebroadcast of a known order only refreshes its timestamp
        if let Some(existing) = exchange.pending_order(&id) {
            if exchange.update_timestamp_or_remove_expired(&existing) {
                if !self.maker_utxos_still_valid(&existing) {
                    self.send_cancel_trade(&existing, CancelReason::BadUtxo);
                    return Err(SessionError::General("maker utxos no longer valid"));
                }
                log::info!("[{id}] order already received, updating timestamp");
                self.send_pending_order(&existing);
            } else {
                let (currency, utxos) = {
                    let tr = lock(&existing);
                    (tr.a.currency, tr.a.utxos.clone())
                };
                if let Some(currency) = currency {
                    self.app.lock_registry.unlock(currency, &utxos);
                }
            }
            return Ok(());
        }

        let saddr = reader.read_address()?;
        let scurrency = reader.read_currency()?;
        let samount = reader.read_u64()?;
        let daddr = reader.read_address()?;
        let dcurrency = reader.read_currency()?;
        let damount = reader.read_u64()?;
        let timestamp = reader.read_u64()?;
        let block_hash = reader.read_hash()?;

        let maker_pubkey = *packet.pubkey();
        if !packet.verify(&maker_pubkey) {
            log::warn!("[{id}] invalid packet signature");
            return Ok(());
        }

        let (Some(sconn), Some(dconn)) = (
            self.app.connectors.by_currency(scurrency),
            self.app.connectors.by_currency(dcurrency),
        ) else {
            log::warn!("[{id}] no connector for order currencies");
            return Ok(());
        };

        let raw_items = read_utxo_items(&mut reader)?;
        let mut utxo_items: Vec<UtxoEntry> = Vec::new();
        let mut common_amount = 0u64;
        for mut entry in raw_items {
            entry.address = sconn.from_xaddr(&entry.raw_address);
            let Ok(Some(txout)) = sconn.get_tx_out(&entry) else {
                log::info!("[{id}] utxo entry not found <{}:{}>", entry.txid, entry.vout);
                continue;
            };
            entry.amount = txout.amount;
            if !sconn.verify_message(&entry.address, &entry.signed_message(), &entry.signature) {
                log::info!(
                    "[{id}] invalid signature, bad utxo entry <{}:{}>",
                    entry.txid,
                    entry.vout
                );
                continue;
            }
            common_amount += entry.amount;
            utxo_items.push(entry);
        }

        if utxo_items.is_empty() {
            log::info!("[{id}] order rejected, no usable utxo entries");
            return Ok(());
        }
        if common_amount < samount {
            log::info!(
                "[{id}] order rejected, utxo amount {common_amount} below required {samount}"
            );
            return Ok(());
        }

        let change = common_amount - samount;
        if sconn.is_dust_amount(samount)
            || (change > 0 && sconn.is_dust_amount(change))
            || dconn.is_dust_amount(damount)
        {
            log::info!("[{id}] rejecting dust amount order");
            return Ok(());
        }

        // the packet id must equal the canonical hash of its own content
        let check_id = canonical_order_id(
            &sconn.from_xaddr(&saddr),
            scurrency,
            samount,
            &dconn.from_xaddr(&daddr),
            dcurrency,
            damount,
            timestamp,
            &block_hash,
            &utxo_items[0].signature,
        );
        if check_id != id {
            log::warn!("[{id}] packet id differs from body hash {check_id}, rejecting");
            return Ok(());
        }

        if !self.app.lock_registry.try_lock(scurrency, &utxo_items) {
            log::info!("[{id}] order rejected, utxo entries already in use");
            return Ok(());
        }

        let (handle, created) = exchange.create_order(
            id,
            saddr,
            scurrency,
            samount,
            daddr,
            dcurrency,
            damount,
            timestamp,
            maker_pubkey,
            utxo_items,
            block_hash,
        );
        if created {
            log::info!(
                "[{id}] received order {samount} {scurrency} -> {damount} {dcurrency}"
            );
            self.app.notifier.order_received(&id);
        }

        self.send_pending_order(&handle);
        Ok(())
    }

    pub(super) fn process_transaction_accepting(&self, packet: &Packet) -> Result<(), SessionError> {
        let Some(exchange) = self.app.exchange.clone() else {
            return Ok(());
        };
        if !packet.addressed_to(self.session_id()) {
            return Ok(());
        }

        if packet.size() < 164 {
            return Err(ProtocolError::WrongSize {
                need: 164,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let _hub = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let saddr = reader.read_address()?;
        let scurrency = reader.read_currency()?;
        let samount = reader.read_u64()?;
        let daddr = reader.read_address()?;
        let _dcurrency = reader.read_currency()?;
        let _damount = reader.read_u64()?;

        let taker_pubkey = *packet.pubkey();

        if exchange.trade(&id).is_some() {
            log::warn!("[{id}] order already accepted");
            return Ok(());
        }
        if !packet.verify(&taker_pubkey) {
            log::warn!("[{id}] invalid packet signature");
            return Ok(());
        }

        let Some(conn) = self.app.connectors.by_currency(scurrency) else {
            log::warn!("[{id}] no connector for <{scurrency}>");
            return Ok(());
        };

        let Some(pending) = exchange.pending_order(&id) else {
            log::warn!("[{id}] no pending order found");
            return Ok(());
        };

        if !self.maker_utxos_still_valid(&pending) {
            self.send_cancel_trade(&pending, CancelReason::BadUtxo);
            return Err(SessionError::General("bad maker utxo in order"));
        }

        let raw_items = read_utxo_items(&mut reader)?;
        let mut utxo_items: Vec<UtxoEntry> = Vec::new();
        let mut common_amount = 0u64;
        for mut entry in raw_items {
            entry.address = conn.from_xaddr(&entry.raw_address);
            let Ok(Some(txout)) = conn.get_tx_out(&entry) else {
                log::info!("[{id}] utxo entry not found <{}:{}>", entry.txid, entry.vout);
                continue;
            };
            entry.amount = txout.amount;
            if !conn.verify_message(&entry.address, &entry.signed_message(), &entry.signature) {
                log::info!(
                    "[{id}] invalid signature, bad utxo entry <{}:{}>",
                    entry.txid,
                    entry.vout
                );
                continue;
            }
            common_amount += entry.amount;
            utxo_items.push(entry);
        }

        if common_amount < samount {
            log::info!(
                "[{id}] acceptance rejected, utxo amount {common_amount} below required {samount}"
            );
            return Ok(());
        }
        let change = common_amount - samount;
        if conn.is_dust_amount(samount) || (change > 0 && conn.is_dust_amount(change)) {
            log::info!("[{id}] rejecting dust amount acceptance");
            return Ok(());
        }

        if !self.app.lock_registry.try_lock(scurrency, &utxo_items) {
            log::info!("[{id}] acceptance rejected, utxo entries already in use");
            return Ok(());
        }

        let Some(trade) = exchange.accept_order(&id, saddr, daddr, taker_pubkey, utxo_items)
        else {
            // someone else won the race
            return Ok(());
        };
        {
            let mut tr = lock(&trade);
            tr.b.currency = Some(scurrency);
            tr.b.amount = samount;
        }

        log::info!("[{id}] order accepted, sending hold to traders");

        let mut reply = Packet::new(Command::TransactionHold);
        reply.append_address(self.session_id());
        reply.append_hash(id.as_byte_array());
        reply.sign(exchange.privkey());
        self.send_packet_broadcast(&reply);
        Ok(())
    }

    pub(super) fn process_transaction_hold_apply(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() != 72 {
            return Err(ProtocolError::WrongSize {
                need: 72,
                received: packet.size(),
            }
            .into());
        }
        if !packet.addressed_to(self.session_id()) {
            return Ok(());
        }
        let Some(exchange) = self.app.exchange.clone() else {
            return Ok(());
        };

        let mut reader = PacketReader::new(packet);
        let _hub = reader.read_address()?;
        let from = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);

        let Some(trade) = exchange.trade(&id) else {
            return Ok(());
        };
        if !self.verify_trader_packet(&trade, packet, &id) {
            return Ok(());
        }

        let both_held = {
            let mut tr = lock(&trade);
            if tr.state != FacilitatorState::Joined {
                log::warn!("[{id}] wrong state {:?} for hold apply", tr.state);
                return Ok(());
            }
            if !tr.is_address_in_order(&from) {
                drop(tr);
                log::error!("[{id}] hold apply from address outside the trade");
                self.send_cancel_trade(&trade, CancelReason::InvalidAddress);
                return Ok(());
            }
            tr.apply_hold(&from)
        };

        if both_held {
            self.send_init_packets(&trade);
        }
        Ok(())
    }

    pub(super) fn process_transaction_initialized(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() != 104 {
            return Err(ProtocolError::WrongSize {
                need: 104,
                received: packet.size(),
            }
            .into());
        }
        if !packet.addressed_to(self.session_id()) {
            return Ok(());
        }
        let Some(exchange) = self.app.exchange.clone() else {
            return Ok(());
        };

        let mut reader = PacketReader::new(packet);
        let _hub = reader.read_address()?;
        let from = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let fee_txid = reader.read_hash()?;

        let Some(trade) = exchange.trade(&id) else {
            return Ok(());
        };
        if !self.verify_trader_packet(&trade, packet, &id) {
            return Ok(());
        }

        let (both_initialized, maker_address, taker_pubkey) = {
            let mut tr = lock(&trade);
            if tr.state != FacilitatorState::Hold {
                log::warn!("[{id}] wrong state {:?} for initialized", tr.state);
                return Ok(());
            }
            if !tr.is_address_in_order(&from) {
                drop(tr);
                log::error!("[{id}] initialized from address outside the trade");
                self.send_cancel_trade(&trade, CancelReason::InvalidAddress);
                return Ok(());
            }
            let both = tr.apply_initialized(&from, &fee_txid);
            (both, tr.a.address, tr.b.pubkey)
        };

        if both_initialized {
            let Some(taker_pubkey) = taker_pubkey else {
                return Ok(());
            };
            log::info!("[{id}] both traders initialized, starting deposit round");
            let mut reply = Packet::new(Command::TransactionCreateA);
            reply.append_address(self.session_id());
            reply.append_hash(id.as_byte_array());
            reply.append_pubkey(&taker_pubkey);
            reply.sign(exchange.privkey());
            self.send_packet(&maker_address, &reply);
        }
        Ok(())
    }

    pub(super) fn process_transaction_created_a(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() <= 76 {
            return Err(ProtocolError::WrongSize {
                need: 77,
                received: packet.size(),
            }
            .into());
        }
        if !packet.addressed_to(self.session_id()) {
            return Ok(());
        }
        let Some(exchange) = self.app.exchange.clone() else {
            return Ok(());
        };

        let mut reader = PacketReader::new(packet);
        let _hub = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let bin_txid = reader.read_cstr()?.to_string();
        let hx = reader.read_address()?;
        let lock_time_a = reader.read_u32()?;
        let ref_txid = reader.read_cstr()?.to_string();
        let ref_tx = reader.read_cstr()?.to_string();

        let Some(trade) = exchange.trade(&id) else {
            return Ok(());
        };

        let maker_key_ok = {
            let tr = lock(&trade);
            tr.a.pubkey.is_some_and(|pk| packet.verify(&pk))
        };
        if !maker_key_ok {
            log::warn!("[{id}] bad maker packet signature, dropping");
            return Ok(());
        }

        let (both_created, maker_pubkey, taker_address) = {
            let mut tr = lock(&trade);
            if tr.state != FacilitatorState::Initialized {
                log::warn!("[{id}] wrong state {:?} for created", tr.state);
                return Ok(());
            }
            tr.a.lock_time = lock_time_a;
            tr.a.ref_txid = ref_txid;
            tr.a.ref_tx = ref_tx;
            let address = tr.a.address;
            let both = tr.apply_created(&address, &bin_txid);
            (both, tr.a.pubkey, tr.b.address)
        };

        // cover the trader deposits should either side vanish mid-trade
        self.app.watch.watch_trader_deposit(id, trade.clone());

        if both_created {
            log::error!("[{id}] bad state detected on order, taker created before maker");
            return Ok(());
        }

        let Some(maker_pubkey) = maker_pubkey else {
            return Ok(());
        };
        let mut reply = Packet::new(Command::TransactionCreateB);
        reply.append_address(self.session_id());
        reply.append_hash(id.as_byte_array());
        reply.append_pubkey(&maker_pubkey);
        reply.append_cstr(&bin_txid);
        reply.append_bytes(&hx);
        reply.append_u32(lock_time_a);
        reply.sign(exchange.privkey());
        self.send_packet(&taker_address, &reply);
        Ok(())
    }

    pub(super) fn process_transaction_created_b(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() <= 56 {
            return Err(ProtocolError::WrongSize {
                need: 57,
                received: packet.size(),
            }
            .into());
        }
        if !packet.addressed_to(self.session_id()) {
            return Ok(());
        }
        let Some(exchange) = self.app.exchange.clone() else {
            return Ok(());
        };

        let mut reader = PacketReader::new(packet);
        let _hub = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let bin_txid = reader.read_cstr()?.to_string();
        let lock_time_b = reader.read_u32()?;
        let ref_txid = reader.read_cstr()?.to_string();
        let ref_tx = reader.read_cstr()?.to_string();

        let Some(trade) = exchange.trade(&id) else {
            return Ok(());
        };

        let taker_key_ok = {
            let tr = lock(&trade);
            tr.b.pubkey.is_some_and(|pk| packet.verify(&pk))
        };
        if !taker_key_ok {
            log::warn!("[{id}] bad taker packet signature, dropping");
            return Ok(());
        }

        let (both_created, maker_destination) = {
            let mut tr = lock(&trade);
            if tr.state != FacilitatorState::Initialized {
                log::warn!("[{id}] wrong state {:?} for created", tr.state);
                return Ok(());
            }
            tr.b.lock_time = lock_time_b;
            tr.b.ref_txid = ref_txid;
            tr.b.ref_tx = ref_tx;
            let address = tr.b.address;
            let both = tr.apply_created(&address, &bin_txid);
            (both, tr.a.destination)
        };

        if both_created {
            log::info!("[{id}] both deposits reported, starting redeem round");
            let mut reply = Packet::new(Command::TransactionConfirmA);
            reply.append_address(self.session_id());
            reply.append_hash(id.as_byte_array());
            reply.append_cstr(&bin_txid);
            reply.append_u32(lock_time_b);
            reply.sign(exchange.privkey());
            self.send_packet(&maker_destination, &reply);
        }
        Ok(())
    }

    pub(super) fn process_transaction_confirmed_a(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() <= 52 || packet.size() > 1000 {
            return Err(ProtocolError::WrongSize {
                need: 53,
                received: packet.size(),
            }
            .into());
        }
        if !packet.addressed_to(self.session_id()) {
            return Ok(());
        }
        let Some(exchange) = self.app.exchange.clone() else {
            return Ok(());
        };

        let mut reader = PacketReader::new(packet);
        let _hub = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let pay_txid = reader.read_cstr()?.to_string();

        let Some(trade) = exchange.trade(&id) else {
            return Ok(());
        };

        let maker_key_ok = {
            let tr = lock(&trade);
            tr.a.pubkey.is_some_and(|pk| packet.verify(&pk))
        };
        if !maker_key_ok {
            log::warn!("[{id}] bad maker packet signature, dropping");
            return Ok(());
        }

        let (finished, taker_destination) = {
            let mut tr = lock(&trade);
            if tr.state != FacilitatorState::Created {
                log::warn!("[{id}] wrong state {:?} for confirmed", tr.state);
                return Ok(());
            }
            tr.a.pay_txid = pay_txid.clone();
            let destination = tr.a.destination;
            let finished = tr.apply_confirmed(&destination);
            (finished, tr.b.destination)
        };

        if finished {
            // cannot happen before the taker confirms; cannot cancel either,
            // the maker already spent the taker deposit
            log::error!("[{id}] invalid confirmation ordering");
        }

        let mut reply = Packet::new(Command::TransactionConfirmB);
        reply.append_address(self.session_id());
        reply.append_hash(id.as_byte_array());
        reply.append_cstr(&pay_txid);
        reply.sign(exchange.privkey());
        self.send_packet(&taker_destination, &reply);
        Ok(())
    }

    pub(super) fn process_transaction_confirmed_b(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() <= 52 || packet.size() > 1000 {
            return Err(ProtocolError::WrongSize {
                need: 53,
                received: packet.size(),
            }
            .into());
        }
        if !packet.addressed_to(self.session_id()) {
            return Ok(());
        }
        let Some(exchange) = self.app.exchange.clone() else {
            return Ok(());
        };

        let mut reader = PacketReader::new(packet);
        let _hub = reader.read_address()?;
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let pay_txid = reader.read_cstr()?.to_string();

        let Some(trade) = exchange.trade(&id) else {
            return Ok(());
        };

        let taker_key_ok = {
            let tr = lock(&trade);
            tr.b.pubkey.is_some_and(|pk| packet.verify(&pk))
        };
        if !taker_key_ok {
            log::warn!("[{id}] bad taker packet signature, dropping");
            return Ok(());
        }

        let finished = {
            let mut tr = lock(&trade);
            if tr.state != FacilitatorState::Created {
                log::warn!("[{id}] wrong state {:?} for confirmed", tr.state);
                return Ok(());
            }
            tr.b.pay_txid = pay_txid;
            let destination = tr.b.destination;
            let finished = tr.apply_confirmed(&destination);
            if finished {
                if let Some(currency) = tr.a.currency {
                    self.app.lock_registry.unlock(currency, &tr.a.utxos);
                }
                if let Some(currency) = tr.b.currency {
                    self.app.lock_registry.unlock(currency, &tr.b.utxos);
                }
            }
            finished
        };

        if finished {
            log::info!("[{id}] order finished");
            self.app.watch.unwatch_trader_deposit(id);
            exchange.remove_trade(&id);

            let mut reply = Packet::new(Command::TransactionFinished);
            reply.append_hash(id.as_byte_array());
            reply.sign(exchange.privkey());
            self.send_packet_broadcast(&reply);
        }
        Ok(())
    }

    // ---- helpers ------------------------------------------------------

    fn verify_trader_packet(&self, trade: &ExchangeOrderRef, packet: &Packet, id: &OrderId) -> bool {
        let tr = lock(trade);
        let ok = [tr.a.pubkey, tr.b.pubkey]
            .iter()
            .flatten()
            .any(|pk| packet.verify(pk));
        if !ok {
            log::warn!("[{id}] bad trader packet signature, dropping");
        }
        ok
    }

    fn maker_utxos_still_valid(&self, handle: &ExchangeOrderRef) -> bool {
        let (id, currency, utxos) = {
            let tr = lock(handle);
            (tr.id, tr.a.currency, tr.a.utxos.clone())
        };
        let Some(currency) = currency else {
            return false;
        };
        let Some(conn) = self.app.connectors.by_currency(currency) else {
            return false;
        };
        for entry in &utxos {
            if !matches!(conn.get_tx_out(entry), Ok(Some(_))) {
                log::error!(
                    "[{id}] bad maker utxo <{}:{}> in order",
                    entry.txid,
                    entry.vout
                );
                return false;
            }
        }
        true
    }

    /// Broadcasts the snode-signed echo of a pending order.
    pub(crate) fn send_pending_order(&self, handle: &ExchangeOrderRef) {
        let Some(exchange) = &self.app.exchange else {
            return;
        };

        let (id, a_currency, a_amount, b_currency, b_amount, created_at, block_hash) = {
            let tr = lock(handle);
            let (Some(ac), Some(bc)) = (tr.a.currency, tr.b.currency) else {
                return;
            };
            (
                tr.id,
                ac,
                tr.a.amount,
                bc,
                tr.b.amount,
                tr.created_at,
                tr.block_hash,
            )
        };

        let mut packet = Packet::new(Command::PendingTransaction);
        packet.append_hash(id.as_byte_array());
        packet.append_currency(a_currency);
        packet.append_u64(a_amount);
        packet.append_currency(b_currency);
        packet.append_u64(b_amount);
        packet.append_address(self.session_id());
        packet.append_u64(created_at);
        packet.append_hash(&block_hash);
        packet.sign(exchange.privkey());
        self.send_packet_broadcast(&packet);
    }

    fn send_init_packets(&self, trade: &ExchangeOrderRef) {
        let Some(exchange) = &self.app.exchange else {
            return;
        };

        let tr = lock(trade).clone();
        let (Some(a_currency), Some(b_currency)) = (tr.a.currency, tr.b.currency) else {
            return;
        };
        log::info!("[{}] both traders held, sending init", tr.id);

        // each trader gets its own view: what it gives, what it receives
        let mut to_maker = Packet::new(Command::TransactionInit);
        to_maker.append_address(&tr.a.destination);
        to_maker.append_address(self.session_id());
        to_maker.append_hash(tr.id.as_byte_array());
        to_maker.append_address(&tr.a.address);
        to_maker.append_currency(a_currency);
        to_maker.append_u64(tr.a.amount);
        to_maker.append_address(&tr.a.destination);
        to_maker.append_currency(b_currency);
        to_maker.append_u64(tr.b.amount);
        to_maker.sign(exchange.privkey());
        self.send_packet(&tr.a.destination, &to_maker);

        let mut to_taker = Packet::new(Command::TransactionInit);
        to_taker.append_address(&tr.b.destination);
        to_taker.append_address(self.session_id());
        to_taker.append_hash(tr.id.as_byte_array());
        to_taker.append_address(&tr.b.address);
        to_taker.append_currency(b_currency);
        to_taker.append_u64(tr.b.amount);
        to_taker.append_address(&tr.b.destination);
        to_taker.append_currency(a_currency);
        to_taker.append_u64(tr.a.amount);
        to_taker.sign(exchange.privkey());
        self.send_packet(&tr.b.destination, &to_taker);
    }
}

/// Spawns the facilitator maintenance heartbeat: cancels stale trades,
/// expires abandoned pending orders and rebroadcasts the live ones.
pub fn spawn_exchange_maintenance(
    session: Arc<Session>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("Exchange maintenance thread".to_string())
        .spawn(move || {
            log::info!("exchange maintenance started");
            while !shutdown.load(Relaxed) {
                if let Some(exchange) = session.app.exchange.clone() {
                    for stale in exchange.stale_trades(ORDER_SYNC_TIMEOUT) {
                        let id = lock(&stale).id;
                        log::warn!("[{id}] trade stalled past sync timeout, canceling");
                        session.send_cancel_trade(&stale, crate::order::CancelReason::Timeout);
                    }

                    for expired in exchange.drop_expired_pending() {
                        let (id, currency, utxos) = {
                            let tr = lock(&expired);
                            (tr.id, tr.a.currency, tr.a.utxos.clone())
                        };
                        log::info!("[{id}] pending order expired, releasing collateral");
                        if let Some(currency) = currency {
                            session.app.lock_registry.unlock(currency, &utxos);
                        }
                    }

                    for pending in exchange.pending_orders() {
                        session.send_pending_order(&pending);
                    }
                }
                thread::sleep(HEART_BEAT_INTERVAL);
            }
        })
}
