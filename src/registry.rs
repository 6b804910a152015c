use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::types::ServerMessage;

/// Identifier handed to a subscriber when it registers.
pub type SubscriberId = u64;

/// Messages a subscriber may have queued before it counts as stalled.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Sending half of a subscriber channel. The transport task owns the
/// receiving half; dropping it is how a dead connection shows up here.
pub type Outbound = mpsc::Sender<ServerMessage>;

/// Currently connected subscribers.
///
/// The registry holds membership only: it never closes a connection itself,
/// it just forgets channels whose receiving side is gone or whose queue is
/// full. Forgetting drops the sender, which ends the transport task once it
/// drains what is already queued.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    next_id: SubscriberId,
    channels: BTreeMap<SubscriberId, Outbound>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Outbound) -> SubscriberId {
        self.next_id += 1;
        let id = self.next_id;
        self.channels.insert(id, channel);
        id
    }

    /// Forget a subscriber. Returns `false` if it was already gone.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        self.channels.remove(&id).is_some()
    }

    /// Send to one subscriber without pruning it on failure.
    pub fn send_to(&self, id: SubscriberId, msg: ServerMessage) -> bool {
        self.channels
            .get(&id)
            .map(|ch| ch.try_send(msg).is_ok())
            .unwrap_or(false)
    }

    /// Send `msg` to every subscriber, pruning the ones that are closed or
    /// too far behind.
    ///
    /// Returns how many subscribers accepted the message.
    pub fn broadcast(&mut self, msg: &ServerMessage) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        for (id, channel) in &self.channels {
            match channel.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "Subscriber queue full, dropping it");
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = id, "Pruning closed subscriber");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.channels.remove(&id);
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.channels.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventRecord, RoundStatus};
    use rust_decimal_macros::dec;

    fn crash(id: i64) -> ServerMessage {
        ServerMessage::Crash(EventRecord {
            id,
            value: dec!(1.23),
            status: RoundStatus::Settled,
            auxiliary: None,
        })
    }

    #[test]
    fn ids_are_unique() {
        let mut reg = SubscriberRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let a = reg.register(tx.clone());
        let b = reg.register(tx);
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn broadcast_reaches_every_live_channel() {
        let mut reg = SubscriberRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        reg.register(tx1);
        reg.register(tx2);

        assert_eq!(reg.broadcast(&crash(1)), 2);
        assert_eq!(rx1.try_recv().unwrap(), crash(1));
        assert_eq!(rx2.try_recv().unwrap(), crash(1));
    }

    #[test]
    fn dead_channel_is_pruned_without_affecting_others() {
        let mut reg = SubscriberRegistry::new();
        let (dead_tx, dead_rx) = mpsc::channel(8);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        let dead = reg.register(dead_tx);
        let live = reg.register(live_tx);
        drop(dead_rx);

        assert_eq!(reg.broadcast(&crash(1)), 1);
        assert_eq!(reg.broadcast(&crash(2)), 1);
        assert!(!reg.contains(dead));
        assert!(reg.contains(live));
        assert_eq!(live_rx.try_recv().unwrap(), crash(1));
        assert_eq!(live_rx.try_recv().unwrap(), crash(2));
    }

    #[test]
    fn stalled_channel_is_pruned_without_affecting_others() {
        let mut reg = SubscriberRegistry::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        let slow = reg.register(slow_tx);
        let live = reg.register(live_tx);

        assert_eq!(reg.broadcast(&crash(1)), 2);
        // The slow reader never drained its single slot.
        assert_eq!(reg.broadcast(&crash(2)), 1);
        assert!(!reg.contains(slow));
        assert!(reg.contains(live));
        assert_eq!(live_rx.try_recv().unwrap(), crash(1));
        assert_eq!(live_rx.try_recv().unwrap(), crash(2));
    }

    #[test]
    fn pruned_subscriber_sees_its_channel_close() {
        let mut reg = SubscriberRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        reg.register(tx);
        reg.broadcast(&crash(1));
        reg.broadcast(&crash(2));
        assert!(reg.is_empty());
        assert_eq!(rx.try_recv().unwrap(), crash(1));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn send_to_does_not_prune() {
        let mut reg = SubscriberRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let id = reg.register(tx);
        drop(rx);
        assert!(!reg.send_to(id, crash(1)));
        assert!(reg.contains(id));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = SubscriberRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = reg.register(tx);
        assert!(reg.remove(id));
        assert!(!reg.remove(id));
        assert!(reg.is_empty());
    }
}
