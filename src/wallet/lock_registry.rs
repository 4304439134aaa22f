//! Process-wide UTXO lock registry.
//!
//! Every output pledged to a live order is held here so concurrent orders
//! on this node can never double-spend each other. Ordinary collateral and
//! protocol-fee reservations live in separate pools, but an output locked
//! in either pool is unavailable to both.

use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard},
};

use bitcoin::Txid;

use super::UtxoEntry;
use crate::utill::Currency;

/// Registry key: one output on one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtxoLockKey {
    /// Chain the output lives on.
    pub currency: Currency,
    /// Funding transaction id.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
}

impl UtxoLockKey {
    fn new(currency: Currency, utxo: &UtxoEntry) -> Self {
        Self {
            currency,
            txid: utxo.txid,
            vout: utxo.vout,
        }
    }
}

/// The process-wide set of locked outpoints.
#[derive(Debug, Default)]
pub struct UtxoLockRegistry {
    locked: Mutex<HashSet<UtxoLockKey>>,
    fee_locked: Mutex<HashSet<UtxoLockKey>>,
}

fn guard(mutex: &Mutex<HashSet<UtxoLockKey>>) -> MutexGuard<'_, HashSet<UtxoLockKey>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl UtxoLockRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every output in `utxos`, or none of them.
    ///
    /// Fails when any member is already locked in either pool.
    pub fn try_lock(&self, currency: Currency, utxos: &[UtxoEntry]) -> bool {
        let fee_locked = guard(&self.fee_locked);
        let mut locked = guard(&self.locked);

        let keys: Vec<UtxoLockKey> = utxos
            .iter()
            .map(|utxo| UtxoLockKey::new(currency, utxo))
            .collect();
        if keys
            .iter()
            .any(|key| locked.contains(key) || fee_locked.contains(key))
        {
            return false;
        }
        locked.extend(keys);
        true
    }

    /// Releases outputs from the collateral pool. Unknown members are
    /// ignored.
    pub fn unlock(&self, currency: Currency, utxos: &[UtxoEntry]) {
        let mut locked = guard(&self.locked);
        for utxo in utxos {
            locked.remove(&UtxoLockKey::new(currency, utxo));
        }
    }

    /// Reserves outputs for the protocol fee, all-or-nothing.
    pub fn try_lock_fee(&self, currency: Currency, utxos: &[UtxoEntry]) -> bool {
        let locked = guard(&self.locked);
        let mut fee_locked = guard(&self.fee_locked);

        let keys: Vec<UtxoLockKey> = utxos
            .iter()
            .map(|utxo| UtxoLockKey::new(currency, utxo))
            .collect();
        if keys
            .iter()
            .any(|key| locked.contains(key) || fee_locked.contains(key))
        {
            return false;
        }
        fee_locked.extend(keys);
        true
    }

    /// Releases fee reservations. Unknown members are ignored.
    pub fn unlock_fee(&self, currency: Currency, utxos: &[UtxoEntry]) {
        let mut fee_locked = guard(&self.fee_locked);
        for utxo in utxos {
            fee_locked.remove(&UtxoLockKey::new(currency, utxo));
        }
    }

    /// True when the output is locked in either pool.
    pub fn is_locked(&self, currency: Currency, utxo: &UtxoEntry) -> bool {
        let key = UtxoLockKey::new(currency, utxo);
        guard(&self.locked).contains(&key) || guard(&self.fee_locked).contains(&key)
    }

    /// Number of locked outputs across both pools.
    pub fn len(&self) -> usize {
        guard(&self.locked).len() + guard(&self.fee_locked).len()
    }

    /// True when nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
