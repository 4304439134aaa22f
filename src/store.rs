//! Order descriptor store.
//!
//! Active orders live behind per-order mutexes so subsystems (session,
//! watcher, cancel path) share them without holding the store-wide lock.
//! Terminal orders move into a flat history map that can be snapshotted to
//! disk as CBOR.

use std::{
    collections::HashMap,
    fs::File,
    io,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

use crate::{
    order::{CancelReason, OrderDescr, OrderId, Role, TraderState},
    utill::{now_ts, Currency},
};

/// Immutable record kept for a concluded order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Canonical order id.
    pub id: OrderId,
    /// This node's side, when it was a party.
    pub role: Option<Role>,
    /// Currency given.
    pub from_currency: Currency,
    /// Amount given, base units.
    pub from_amount: u64,
    /// Currency received.
    pub to_currency: Currency,
    /// Amount received, base units.
    pub to_amount: u64,
    /// Final state.
    pub state: TraderState,
    /// Cancellation reason, when cancelled.
    pub reason: CancelReason,
    /// Creation time, UTC seconds.
    pub created_at: u64,
    /// Conclusion time, UTC seconds.
    pub updated_at: u64,
    /// Own deposit txid, when one was made.
    pub bin_txid: String,
    /// Own pay txid, when redemption happened.
    pub pay_txid: String,
    /// Own refund txid, when a rollback happened.
    pub ref_txid: String,
}

impl From<&OrderDescr> for HistoryEntry {
    fn from(descr: &OrderDescr) -> Self {
        Self {
            id: descr.id,
            role: descr.role,
            from_currency: descr.from_currency,
            from_amount: descr.from_amount,
            to_currency: descr.to_currency,
            to_amount: descr.to_amount,
            state: descr.state,
            reason: descr.reason,
            created_at: descr.created_at,
            updated_at: descr.updated_at,
            bin_txid: descr.bin_txid.clone(),
            pay_txid: descr.pay_txid.clone(),
            ref_txid: descr.ref_txid.clone(),
        }
    }
}

/// Shared handle to one active order.
pub type OrderRef = Arc<Mutex<OrderDescr>>;

/// The node's view of all orders it has seen.
#[derive(Debug, Default)]
pub struct OrderStore {
    active: Mutex<HashMap<OrderId, OrderRef>>,
    history: Mutex<HashMap<OrderId, HistoryEntry>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl OrderStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor, returning its shared handle. An existing entry
    /// for the same id is kept and returned unchanged.
    pub fn append(&self, descr: OrderDescr) -> OrderRef {
        let mut active = guard(&self.active);
        active
            .entry(descr.id)
            .or_insert_with(|| Arc::new(Mutex::new(descr)))
            .clone()
    }

    /// Looks up an active order.
    pub fn get(&self, id: &OrderId) -> Option<OrderRef> {
        guard(&self.active).get(id).cloned()
    }

    /// Snapshot of all active order handles.
    pub fn active_orders(&self) -> Vec<OrderRef> {
        guard(&self.active).values().cloned().collect()
    }

    /// Number of active orders.
    pub fn active_len(&self) -> usize {
        guard(&self.active).len()
    }

    /// Moves an order out of the active set into history.
    pub fn move_to_history(&self, id: &OrderId) -> Option<HistoryEntry> {
        let removed = guard(&self.active).remove(id)?;
        let entry = HistoryEntry::from(&*guard(&removed));
        guard(&self.history).insert(*id, entry.clone());
        Some(entry)
    }

    /// Looks up a concluded order.
    pub fn history_entry(&self, id: &OrderId) -> Option<HistoryEntry> {
        guard(&self.history).get(id).cloned()
    }

    /// Snapshot of the history.
    pub fn history(&self) -> Vec<HistoryEntry> {
        guard(&self.history).values().cloned().collect()
    }

    /// Drops cancelled history entries older than `min_age_secs`.
    ///
    /// Returns the pruned entries, newest-kept.
    pub fn flush_cancelled(&self, min_age_secs: u64) -> Vec<HistoryEntry> {
        let cutoff = now_ts().saturating_sub(min_age_secs);
        let mut history = guard(&self.history);
        let stale: Vec<OrderId> = history
            .values()
            .filter(|e| e.state == TraderState::Cancelled && e.updated_at <= cutoff)
            .map(|e| e.id)
            .collect();
        stale
            .iter()
            .filter_map(|id| history.remove(id))
            .collect()
    }

    /// Writes the history snapshot to `path` as CBOR.
    pub fn save_history(&self, path: &Path) -> io::Result<()> {
        let entries = self.history();
        let file = File::create(path)?;
        serde_cbor::to_writer(file, &entries).map_err(io::Error::other)
    }

    /// Loads a history snapshot written by [`OrderStore::save_history`].
    /// Missing or unreadable files leave the history empty.
    pub fn load_history(&self, path: &Path) {
        let Ok(file) = File::open(path) else {
            return;
        };
        let entries: Vec<HistoryEntry> = match serde_cbor::from_reader(file) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("unreadable order history at {}: {e}", path.display());
                return;
            }
        };
        let mut history = guard(&self.history);
        for entry in entries {
            history.insert(entry.id, entry);
        }
    }
}
