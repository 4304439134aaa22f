//! Deferred packet processor.
//!
//! Handlers that need chain progress (an unobservable deposit, an
//! unexpired lock-time, an undiscovered secret) park their packet here
//! instead of blocking. A heartbeat thread re-runs parked packets through
//! the session; handlers are idempotent and re-defer while their condition
//! is unmet. Cancelling an order discards its parked packet before the
//! next tick.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use crate::{order::OrderId, protocol::packet::Packet, utill::HEART_BEAT_INTERVAL};

use super::{lock, Session};

/// Parked packets, one slot per order; a newer deferral replaces an older
/// one.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    packets: Mutex<HashMap<OrderId, Packet>>,
}

impl DeferredQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a packet for retry on the next tick.
    pub fn defer(&self, id: OrderId, packet: Packet) {
        log::debug!("[{id}] deferring {} for retry", packet.command());
        lock(&self.packets).insert(id, packet);
    }

    /// Discards the parked packet of an order.
    pub fn remove(&self, id: &OrderId) {
        lock(&self.packets).remove(id);
    }

    /// Takes every parked packet, leaving the queue empty.
    pub fn drain(&self) -> Vec<(OrderId, Packet)> {
        lock(&self.packets).drain().collect()
    }

    /// Number of orders with a parked packet.
    pub fn len(&self) -> usize {
        lock(&self.packets).len()
    }

    /// True when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the retry heartbeat driving deferred packets through `session`.
pub fn spawn_retry_loop(
    session: Arc<Session>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("Deferred packet thread".to_string())
        .spawn(move || {
            log::info!("deferred packet processor started");
            while !shutdown.load(Relaxed) {
                for (id, packet) in session.app.deferred.drain() {
                    log::debug!("[{id}] retrying deferred {}", packet.command());
                    if let Err(e) = session.process_packet(&packet) {
                        log::warn!("[{id}] deferred packet failed: {e:?}");
                    }
                }
                thread::sleep(HEART_BEAT_INTERVAL);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::Command;
    use bitcoin::hashes::Hash;

    fn id(n: u8) -> OrderId {
        OrderId::from_byte_array([n; 32])
    }

    #[test]
    fn one_slot_per_order() {
        let queue = DeferredQueue::new();
        queue.defer(id(1), Packet::new(Command::TransactionConfirmB));
        queue.defer(id(1), Packet::new(Command::TransactionCancel));
        assert_eq!(queue.len(), 1);

        let drained = queue.drain();
        assert_eq!(drained[0].1.command(), Command::TransactionCancel);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_discards_parked_packet() {
        let queue = DeferredQueue::new();
        queue.defer(id(1), Packet::new(Command::TransactionCreateB));
        queue.defer(id(2), Packet::new(Command::TransactionCreateB));
        queue.remove(&id(1));

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, id(2));
    }
}
