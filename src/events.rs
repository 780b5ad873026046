// LN core library: on-chain watcher & gossip router for the Lightning Network.
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Cross-actor plumbing: the lifecycle event bus and the shared block-count
//! atomic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use secp256k1::PublicKey;
use tokio::sync::broadcast;

use crate::wire::ShortChannelId;

/// Network graph lifecycle notifications published by the router.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum NetworkEvent {
    /// A channel announcement passed on-chain validation and joined the
    /// graph
    #[display("channel_discovered({0})")]
    ChannelDiscovered(ShortChannelId),

    /// A channel left the graph (spent funding output or staleness)
    #[display("channel_lost({0})")]
    ChannelLost(ShortChannelId),

    /// A node announcement was stored for the first time
    #[display("node_discovered({0})")]
    NodeDiscovered(PublicKey),

    /// A node lost its last incident channel and was dropped
    #[display("node_lost({0})")]
    NodeLost(PublicKey),
}

/// Multi-consumer broadcast bus for [`NetworkEvent`]s.
///
/// Delivery is at-least-once for every live subscriber; subscribers joining
/// later only observe subsequent events.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> EventBus {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NetworkEvent) {
        log::trace!("event: {}", event);
        // Send only fails when nobody subscribed, which is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

/// Best-known block count, written by the chain watcher only and read by
/// everyone else.
#[derive(Clone, Debug, Default)]
pub struct ChainTip(Arc<AtomicU64>);

impl ChainTip {
    pub fn new() -> ChainTip {
        ChainTip::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, block_count: u64) {
        self.0.store(block_count, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chain_tip_is_shared() {
        let tip = ChainTip::new();
        let clone = tip.clone();
        tip.set(700_000);
        assert_eq!(clone.get(), 700_000);
    }

    #[tokio::test]
    async fn event_bus_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let scid = ShortChannelId::new(1, 2, 3).unwrap();
        bus.publish(NetworkEvent::ChannelLost(scid));
        assert_eq!(rx1.recv().await.unwrap(), NetworkEvent::ChannelLost(scid));
        assert_eq!(rx2.recv().await.unwrap(), NetworkEvent::ChannelLost(scid));
    }
}
