//! The session state machine.
//!
//! A [`Session`] dispatches every incoming packet to the handler bound for
//! its command under the session's role: a node operating an exchange with
//! an active service-node key runs the server handlers, everything else
//! runs the client handlers. Cancel and Finished are handled by both.
//!
//! Handlers run serially per session. Conditions the protocol absorbs
//! (unknown orders, stale states, signature pinning failures) are logged
//! and dropped; only malformed packets surface as errors, which the caller
//! counts against the sending peer.

mod client;
mod deferred;
pub mod error;
mod server;

pub use client::OrderParams;
pub use deferred::{spawn_retry_loop, DeferredQueue};
pub use server::spawn_exchange_maintenance;

use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::{
    hashes::Hash,
    key::rand::{thread_rng, RngCore},
};

use crate::{
    exchange::{Exchange, ExchangeOrderRef},
    order::{CancelReason, OrderId, TraderState},
    protocol::{
        error::ProtocolError,
        packet::{Command, Packet, PacketReader},
    },
    store::{OrderRef, OrderStore},
    utill::Currency,
    wallet::{ConnectorMap, UtxoLockRegistry, WalletError, XAddr},
    watcher::WatchService,
};

use error::SessionError;

/// Outbound packet transport; the broadcast substrate implements this.
///
/// `to` is a 20-byte routing key: a trader address or a session id.
pub trait PacketSink: Send + Sync {
    /// Delivers a packet to the node(s) registered under `to`.
    fn send(&self, to: &XAddr, packet: &Packet);
    /// Delivers a packet to every node.
    fn broadcast(&self, packet: &Packet);
}

/// Service-node registry lookup.
pub trait SnodeRegistry: Send + Sync {
    /// True when `pubkey` belongs to a registered service node.
    ///
    /// Implementations should try both the compressed and the decompressed
    /// form of the key before rejecting.
    fn is_known_snode(&self, pubkey: &[u8; 33]) -> bool;
}

/// Sink for order lifecycle notifications (UI hook).
pub trait TradeNotifier: Send + Sync {
    /// A new order became visible to this node.
    fn order_received(&self, _id: &OrderId) {}
    /// An order's state changed.
    fn order_changed(&self, _id: &OrderId) {}
}

/// Notifier that discards every event.
pub struct NullNotifier;

impl TradeNotifier for NullNotifier {}

/// Process-wide collaborators injected into a session.
pub struct AppServices {
    /// Per-currency chain adapters.
    pub connectors: ConnectorMap,
    /// Shared UTXO lock registry.
    pub lock_registry: Arc<UtxoLockRegistry>,
    /// Order descriptor store.
    pub store: Arc<OrderStore>,
    /// Facilitator order book; present only on exchange nodes.
    pub exchange: Option<Arc<Exchange>>,
    /// Deferred packet queue.
    pub deferred: Arc<DeferredQueue>,
    /// Outbound transport.
    pub net: Arc<dyn PacketSink>,
    /// Service-node registry.
    pub snodes: Arc<dyn SnodeRegistry>,
    /// Order lifecycle notification sink.
    pub notifier: Arc<dyn TradeNotifier>,
    /// Handle to the deposit watcher.
    pub watch: WatchService,
}

/// Outcome of a refund attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefundOutcome {
    /// Nothing left to do (refund broadcast, or never needed).
    Done,
    /// Lock-time not reached or broadcast failed; try again later.
    Retry,
}

/// Failure modes of a counterparty redemption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedeemError {
    /// Counterparty chain state not observable yet; retry later.
    WaitForDeposit,
    /// Construction or submission failed outright.
    Failed,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One protocol session.
pub struct Session {
    session_id: [u8; 20],
    server_mode: bool,
    dispatch_lock: Mutex<()>,
    pub(crate) app: Arc<AppServices>,
}

impl Session {
    /// Builds a session over the injected collaborators.
    ///
    /// The handler role is fixed here: server when an exchange is present,
    /// client otherwise.
    pub fn new(app: Arc<AppServices>) -> Arc<Self> {
        let mut session_id = [0u8; 20];
        thread_rng().fill_bytes(&mut session_id);
        Arc::new(Self {
            session_id,
            server_mode: app.exchange.is_some(),
            dispatch_lock: Mutex::new(()),
            app,
        })
    }

    /// The 20-byte random id unicast packets are addressed to.
    pub fn session_id(&self) -> &[u8; 20] {
        &self.session_id
    }

    /// True when this session runs the facilitator handlers.
    pub fn is_server(&self) -> bool {
        self.server_mode
    }

    /// Decodes a raw frame and processes it.
    pub fn process_message(&self, bytes: &[u8]) -> Result<(), SessionError> {
        match Packet::decode(bytes) {
            Ok(packet) => self.process_packet(&packet),
            Err(e) => {
                log::warn!("undecodable packet: {e:?}");
                Err(e.into())
            }
        }
    }

    /// Runs the handler bound for the packet's command.
    pub fn process_packet(&self, packet: &Packet) -> Result<(), SessionError> {
        let _serialized = lock(&self.dispatch_lock);

        if !self.decrypt_packet(packet) {
            log::error!("packet decoding error");
            return Err(SessionError::Protocol(ProtocolError::BadString));
        }

        let result = match (packet.command(), self.server_mode) {
            (Command::Invalid, _) => self.process_invalid(packet),

            // server side
            (Command::Transaction, true) => self.process_transaction(packet),
            (Command::TransactionAccepting, true) => self.process_transaction_accepting(packet),
            (Command::TransactionHoldApply, true) => self.process_transaction_hold_apply(packet),
            (Command::TransactionInitialized, true) => {
                self.process_transaction_initialized(packet)
            }
            (Command::TransactionCreatedA, true) => self.process_transaction_created_a(packet),
            (Command::TransactionCreatedB, true) => self.process_transaction_created_b(packet),
            (Command::TransactionConfirmedA, true) => {
                self.process_transaction_confirmed_a(packet)
            }
            (Command::TransactionConfirmedB, true) => {
                self.process_transaction_confirmed_b(packet)
            }

            // client side
            (Command::PendingTransaction, false) => self.process_pending_transaction(packet),
            (Command::TransactionHold, false) => self.process_transaction_hold(packet),
            (Command::TransactionInit, false) => self.process_transaction_init(packet),
            (Command::TransactionCreateA, false) => self.process_transaction_create_a(packet),
            (Command::TransactionCreateB, false) => self.process_transaction_create_b(packet),
            (Command::TransactionConfirmA, false) => self.process_transaction_confirm_a(packet),
            (Command::TransactionConfirmB, false) => self.process_transaction_confirm_b(packet),

            // common
            (Command::TransactionCancel, _) => self.process_transaction_cancel(packet),
            (Command::TransactionFinished, _) => self.process_transaction_finished(packet),
            (Command::XChatMessage, _) => self.process_xchat_message(packet),
            (Command::ServicesPing, _) => self.process_services_ping(packet),

            (command, _) => {
                let _ = self.process_invalid(packet);
                Err(SessionError::NoHandler(command))
            }
        };

        if let Err(e) = &result {
            log::error!("packet processing error <{}>: {e:?}", packet.command());
        }
        result
    }

    // Reserved for end-to-end encryption; the protocol currently runs in
    // cleartext over the substrate.
    fn decrypt_packet(&self, _packet: &Packet) -> bool {
        true
    }

    fn process_invalid(&self, _packet: &Packet) -> Result<(), SessionError> {
        Ok(())
    }

    fn process_xchat_message(&self, _packet: &Packet) -> Result<(), SessionError> {
        log::debug!("chat relay not implemented");
        Ok(())
    }

    fn process_services_ping(&self, _packet: &Packet) -> Result<(), SessionError> {
        Ok(())
    }

    pub(crate) fn send_packet(&self, to: &XAddr, packet: &Packet) {
        self.app.net.send(to, packet);
    }

    pub(crate) fn send_packet_broadcast(&self, packet: &Packet) {
        self.app.net.broadcast(packet);
    }

    // ---- cancel engine ------------------------------------------------

    /// User-driven cancellation of a local order.
    pub fn cancel_order(&self, id: &OrderId, reason: CancelReason) -> Result<(), SessionError> {
        let handle = self
            .app
            .store
            .get(id)
            .ok_or(SessionError::General("unknown order"))?;
        self.send_cancel_order(&handle, reason);
        Ok(())
    }

    /// Cancels a local order: signs a cancel packet with the trader key,
    /// applies it locally at once, then broadcasts it.
    pub(crate) fn send_cancel_order(&self, handle: &OrderRef, reason: CancelReason) {
        let (id, keys) = {
            let xtx = lock(handle);
            (xtx.id, xtx.keypair())
        };
        log::info!("[{id}] canceling order, reason {reason:?}");

        let mut packet = Packet::new(Command::TransactionCancel);
        packet.append_hash(id.as_byte_array());
        packet.append_u32(reason.to_u32());
        if let Some((_, privkey)) = keys {
            packet.sign(&privkey);
        }

        let _ = self.process_transaction_cancel(&packet);
        self.send_packet_broadcast(&packet);
        self.app.notifier.order_changed(&id);
    }

    /// Facilitator-side cancel: tears the order out of the book, releases
    /// its locks and broadcasts a snode-signed cancel.
    pub(crate) fn send_cancel_trade(&self, handle: &ExchangeOrderRef, reason: CancelReason) {
        let Some(exchange) = &self.app.exchange else {
            return;
        };

        let id = {
            let mut tr = lock(handle);
            tr.state = crate::order::FacilitatorState::Cancelled;
            if let Some(currency) = tr.a.currency {
                self.app.lock_registry.unlock(currency, &tr.a.utxos);
            }
            if let Some(currency) = tr.b.currency {
                self.app.lock_registry.unlock(currency, &tr.b.utxos);
            }
            tr.id
        };
        log::info!("[{id}] canceling order, reason {reason:?}");

        exchange.delete_pending(&id);
        exchange.remove_trade(&id);
        // the trader-deposit watch stays: if a trader vanishes without
        // rolling back, its stored refund gets submitted after lock-time

        let mut packet = Packet::new(Command::TransactionCancel);
        packet.append_hash(id.as_byte_array());
        packet.append_u32(reason.to_u32());
        packet.sign(exchange.privkey());

        self.send_packet_broadcast(&packet);
    }

    fn process_transaction_cancel(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() != 36 {
            return Err(ProtocolError::WrongSize {
                need: 36,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let id = OrderId::from_byte_array(reader.read_hash()?);
        let reason = CancelReason::from_u32(reader.read_u32()?);

        // facilitator: verify a trader signed it, then tear down
        if let Some(exchange) = &self.app.exchange {
            let handle = exchange.pending_order(&id).or_else(|| exchange.trade(&id));
            let Some(handle) = handle else {
                return Ok(());
            };
            let signer_ok = {
                let tr = lock(&handle);
                [tr.a.pubkey, tr.b.pubkey]
                    .iter()
                    .flatten()
                    .any(|pk| packet.verify(pk))
            };
            if !signer_ok {
                log::warn!("[{id}] invalid cancel signature, ignoring");
                return Ok(());
            }
            self.send_cancel_trade(&handle, reason);
            return Ok(());
        }

        let Some(handle) = self.app.store.get(&id) else {
            return Ok(());
        };

        enum Action {
            Ignore,
            CancelToHistory,
            CancelInPlace,
            Rollback,
        }

        let (action, from_currency) = {
            let xtx = lock(&handle);

            let mut signers: Vec<[u8; 33]> = Vec::new();
            if let Some(pk) = xtx.s_pubkey {
                signers.push(pk);
            }
            if let Some(pk) = xtx.o_pubkey {
                signers.push(pk.serialize());
            }
            if let Some(pk) = xtx.m_pubkey {
                signers.push(pk.serialize());
            }
            if !signers.iter().any(|pk| packet.verify(pk)) {
                log::info!("[{id}] bad cancel signature, not canceling");
                return Ok(());
            }

            let action = if xtx.state < TraderState::Created {
                Action::CancelToHistory
            } else if xtx.state == TraderState::Cancelled {
                Action::Ignore
            } else if !xtx.did_send_deposit() {
                Action::CancelInPlace
            } else if xtx.has_redeemed_counterparty_deposit() {
                // funds already secured, a cancel cannot take them back
                Action::Ignore
            } else if xtx.ref_tx.is_empty() {
                log::info!("[{id}] no refund transaction known, canceling in place");
                Action::CancelInPlace
            } else {
                Action::Rollback
            };
            (action, xtx.from_currency)
        };

        if self.app.connectors.by_currency(from_currency).is_none() {
            log::warn!("[{id}] no connector for <{from_currency}>");
            return Err(SessionError::NoConnector(from_currency));
        }

        match action {
            Action::Ignore => {}
            Action::CancelToHistory => {
                self.apply_local_cancel(&handle, reason);
                self.app.store.move_to_history(&id);
                self.app.notifier.order_changed(&id);
            }
            Action::CancelInPlace => {
                self.apply_local_cancel(&handle, reason);
            }
            Action::Rollback => {
                self.app.deferred.remove(&id);
                {
                    let mut xtx = lock(&handle);
                    xtx.state = TraderState::Rollback;
                    xtx.reason = reason;
                    xtx.update_timestamp();
                }
                match self.redeem_order_deposit(&handle) {
                    RefundOutcome::Done => {
                        let xtx = lock(&handle);
                        self.app
                            .lock_registry
                            .unlock(xtx.from_currency, &xtx.used_coins);
                    }
                    RefundOutcome::Retry => {
                        // locktime pending or the node hiccupped, retry on
                        // the next tick
                        self.app.deferred.defer(id, packet.clone());
                    }
                }
                self.app.notifier.order_changed(&id);
            }
        }

        Ok(())
    }

    fn apply_local_cancel(&self, handle: &OrderRef, reason: CancelReason) {
        let mut xtx = lock(handle);
        self.app.deferred.remove(&xtx.id);
        self.app
            .lock_registry
            .unlock(xtx.from_currency, &xtx.used_coins);
        if xtx.state < TraderState::Initialized {
            self.app
                .lock_registry
                .unlock_fee(xtx.from_currency, &xtx.fee_utxos);
        }
        xtx.state = TraderState::Cancelled;
        xtx.reason = reason;
        xtx.update_timestamp();
        log::info!("[{}] order cancelled, reason {reason:?}", xtx.id);
    }

    fn process_transaction_finished(&self, packet: &Packet) -> Result<(), SessionError> {
        if packet.size() != 32 {
            return Err(ProtocolError::WrongSize {
                need: 32,
                received: packet.size(),
            }
            .into());
        }

        let mut reader = PacketReader::new(packet);
        let id = OrderId::from_byte_array(reader.read_hash()?);

        let Some(handle) = self.app.store.get(&id) else {
            log::info!("[{id}] finish for unknown order");
            return Ok(());
        };

        {
            let mut xtx = lock(&handle);
            let Some(spk) = xtx.s_pubkey else {
                log::warn!("[{id}] finish before facilitator key bound, dropping");
                return Ok(());
            };
            if !packet.verify(&spk) {
                log::warn!("[{id}] finish not signed by assigned servicenode, dropping");
                return Ok(());
            }
            xtx.state = TraderState::Finished;
            xtx.update_timestamp();
            // terminal state, every reservation goes
            self.app
                .lock_registry
                .unlock(xtx.from_currency, &xtx.used_coins);
            self.app
                .lock_registry
                .unlock_fee(xtx.from_currency, &xtx.fee_utxos);
        }

        self.app.deferred.remove(&id);
        self.app.watch.unwatch_spent_deposit(id);
        self.app.store.move_to_history(&id);
        self.app.notifier.order_changed(&id);
        log::info!("[{id}] order finished");
        Ok(())
    }

    // ---- refund / redemption engines ---------------------------------

    /// Attempts to refund our own deposit after a rollback.
    ///
    /// Gated by the deposit lock-time; before expiry it only reports
    /// [`RefundOutcome::Retry`].
    pub(crate) fn redeem_order_deposit(&self, handle: &OrderRef) -> RefundOutcome {
        let (id, state, from_currency, ref_tx, bin_tx, lock_time) = {
            let xtx = lock(handle);
            (
                xtx.id,
                xtx.state,
                xtx.from_currency,
                xtx.ref_tx.clone(),
                xtx.bin_tx.clone(),
                xtx.lock_time,
            )
        };

        if state < TraderState::Created {
            return RefundOutcome::Done;
        }

        if ref_tx.is_empty() {
            if !bin_tx.is_empty() {
                log::error!(
                    "[{id}] unable to roll back: deposit exists but no refund transaction is known"
                );
            }
            return RefundOutcome::Done;
        }

        let Some(conn) = self.app.connectors.by_currency(from_currency) else {
            log::warn!("[{id}] rollback failed, no connector for <{from_currency}>");
            return RefundOutcome::Retry;
        };

        if let Ok(info) = conn.get_info() {
            if info.blocks < lock_time {
                log::info!(
                    "[{id}] refund available at block {lock_time}, current height {}",
                    info.blocks
                );
                return RefundOutcome::Retry;
            }
        }

        match conn.send_raw_transaction(&ref_tx) {
            Ok(txid) => {
                let mut xtx = lock(handle);
                xtx.state = TraderState::Rollback;
                xtx.update_timestamp();
                log::info!("[{id}] refund transaction broadcast, txid {txid}");
                self.app.notifier.order_changed(&id);
                RefundOutcome::Done
            }
            Err(WalletError::AlreadyInChain) => {
                let mut xtx = lock(handle);
                xtx.state = TraderState::Rollback;
                RefundOutcome::Done
            }
            Err(e) => {
                let mut xtx = lock(handle);
                xtx.state = TraderState::RollbackFailed;
                log::warn!("[{id}] failed to broadcast refund, trying again later: {e:?}");
                RefundOutcome::Retry
            }
        }
    }

    /// Redeems the counterparty's deposit with the secret preimage,
    /// discovering the secret from the counterparty's pay transaction
    /// first when this node is the Taker.
    pub(crate) fn redeem_order_counterparty_deposit(
        &self,
        handle: &OrderRef,
    ) -> Result<(), RedeemError> {
        let (
            id,
            from_currency,
            to_currency,
            has_secret,
            other_pay_txid,
            bin_txid,
            bin_tx_vout,
            o_hashed_secret,
        ) = {
            let xtx = lock(handle);
            if xtx.has_redeemed_counterparty_deposit() {
                return Ok(());
            }
            (
                xtx.id,
                xtx.from_currency,
                xtx.to_currency,
                xtx.has_secret(),
                xtx.other_pay_txid().to_string(),
                xtx.bin_txid.clone(),
                xtx.bin_tx_vout,
                xtx.o_hashed_secret,
            )
        };

        let (Some(conn_from), Some(conn_to)) = (
            self.app.connectors.by_currency(from_currency),
            self.app.connectors.by_currency(to_currency),
        ) else {
            log::error!("[{id}] cannot redeem, is the wallet for both chains running?");
            return Err(RedeemError::Failed);
        };

        if !has_secret {
            let Some(hx) = o_hashed_secret else {
                return Err(RedeemError::Failed);
            };
            if other_pay_txid.is_empty() {
                return Err(RedeemError::WaitForDeposit);
            }
            match conn_from.get_secret_from_payment_transaction(
                &other_pay_txid,
                &bin_txid,
                bin_tx_vout,
                &hx,
            ) {
                Ok(crate::wallet::SecretCheck::Found(secret)) => {
                    let mut xtx = lock(handle);
                    xtx.set_secret(secret);
                    xtx.done_watching();
                    drop(xtx);
                    self.app.watch.unwatch_spent_deposit(id);
                }
                Ok(crate::wallet::SecretCheck::Unavailable) | Err(_) => {
                    return Err(RedeemError::WaitForDeposit);
                }
                Ok(crate::wallet::SecretCheck::Bad) => {
                    log::error!(
                        "[{id}] no matching preimage in counterparty pay tx {other_pay_txid} \
                         spending deposit {bin_txid}:{bin_tx_vout}, counterparty could be \
                         misbehaving"
                    );
                    return Err(RedeemError::WaitForDeposit);
                }
            }
        }

        let (secret, keys, unlock_script, o_bin_txid, o_bin_tx_vout, to_amount, overpayment, to_address) = {
            let xtx = lock(handle);
            let Some(secret) = xtx.secret() else {
                return Err(RedeemError::Failed);
            };
            let Some(keys) = xtx.keypair() else {
                return Err(RedeemError::Failed);
            };
            let Some(script) = xtx.unlock_script.clone() else {
                return Err(RedeemError::Failed);
            };
            (
                secret,
                keys,
                script,
                xtx.o_bin_txid.clone(),
                xtx.o_bin_tx_vout,
                xtx.to_amount,
                xtx.o_overpayment,
                xtx.to_address,
            )
        };

        let fee2 = conn_to.min_tx_fee2(1, 1);
        let to_addr = conn_to.from_xaddr(&to_address);
        let inputs = [crate::wallet::TxInput {
            txid: o_bin_txid,
            vout: o_bin_tx_vout,
            amount: to_amount + overpayment + fee2,
        }];
        let outputs = [(to_addr, to_amount + overpayment)];

        let pay = match conn_to.create_payment_transaction(
            &inputs,
            &outputs,
            &keys.0,
            &keys.1,
            &secret,
            &unlock_script,
        ) {
            Ok(pay) => pay,
            Err(e) => {
                log::error!("[{id}] failed to create payment redeem transaction: {e:?}");
                return Err(RedeemError::Failed);
            }
        };

        {
            let mut xtx = lock(handle);
            xtx.pay_txid = pay.txid.clone();
            xtx.pay_tx = pay.raw.clone();
        }

        match conn_to.send_raw_transaction(&pay.raw) {
            Ok(_) => {
                log::info!(
                    "[{id}] redeeming counterparty deposit on {to_currency} with pay txid {}",
                    pay.txid
                );
            }
            Err(WalletError::AlreadyInChain) => {
                log::info!("[{id}] redeem tx already in chain, proceeding");
            }
            Err(WalletError::MissingInputs) => {
                log::info!("[{id}] counterparty deposit not spendable yet, trying again");
                return Err(RedeemError::WaitForDeposit);
            }
            Err(e) => {
                log::warn!("[{id}] failed to broadcast redeem tx: {e:?}");
                return Err(RedeemError::Failed);
            }
        }

        lock(handle).counterparty_deposit_redeemed();
        Ok(())
    }

    /// Submits a trader's stored refund transaction on its behalf. Used by
    /// the facilitator once a vanished trader's lock-time has expired.
    pub(crate) fn refund_trader_deposit(
        &self,
        order_id: &OrderId,
        currency: Currency,
        ref_tx: &str,
    ) -> bool {
        let Some(conn) = self.app.connectors.by_currency(currency) else {
            log::warn!(
                "[{order_id}] refund attempt failed, no connector for trader ({currency}), \
                 is the wallet running?"
            );
            return false;
        };

        if ref_tx.is_empty() {
            log::error!(
                "[{order_id}] unable to submit refund for trader ({currency}), refund tx unknown"
            );
            return true;
        }

        match conn.send_raw_transaction(ref_tx) {
            Ok(_) | Err(WalletError::AlreadyInChain) => true,
            Err(e) => {
                log::warn!("[{order_id}] trader refund broadcast failed: {e:?}");
                false
            }
        }
    }
}
