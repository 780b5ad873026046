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

//! The validated network graph and the route computation over it.
//!
//! All methods are synchronous: the state is owned exclusively by the
//! gossip router actor, which serializes access through its mailbox.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;

use rand::seq::SliceRandom;
use rand::Rng;
use secp256k1::PublicKey;

use super::gossip::Peer;
use crate::events::NetworkEvent;
use crate::wire::{
    ChannelAnnouncement, ChannelId, ChannelUpdate, Direction, GossipMessage,
    NodeAnnouncement, ShortChannelId,
};

/// A channel with no on-chain activity for this many blocks is a staleness
/// candidate.
const STALE_CHANNEL_AGE_BLOCKS: u32 = 2016;
/// A staleness candidate survives if either direction was updated within
/// this window (14 days).
const STALE_UPDATE_AGE_SECS: u64 = 1_209_600;

/// Directed edge of the routable graph. A channel announcement yields two of
/// these, one per direction.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display
)]
#[display("{short_channel_id}/{from_node}->{to_node}")]
pub struct ChannelDesc {
    pub short_channel_id: ShortChannelId,
    pub from_node: PublicKey,
    pub to_node: PublicKey,
}

/// One hop of a computed route.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Hop {
    pub from_node: PublicKey,
    pub to_node: PublicKey,
    pub channel_update: ChannelUpdate,
}

/// Route computation failures surfaced to the caller.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum RouteError {
    /// the route start and end nodes are the same
    CannotRouteToSelf,

    /// no route over currently usable channels
    RouteNotFound,
}

/// Graph size counters for diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct NetworkStats {
    pub nodes: usize,
    pub channels: usize,
    pub updates: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AnnouncementOutcome {
    Duplicate,
    BadSignature,
    Stashed,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NodeOutcome {
    Stale,
    BadSignature,
    Updated,
    Added,
    Stashed,
    Unrelated,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UpdateOutcome {
    Applied,
    Stale,
    BadSignature,
    Stashed,
    Unknown,
}

/// Directed edge implied by an update's direction bit and the announced node
/// ordering.
pub(crate) fn desc_for(
    ann: &ChannelAnnouncement,
    update: &ChannelUpdate,
) -> ChannelDesc {
    match update.direction() {
        Direction::Node1ToNode2 => ChannelDesc {
            short_channel_id: ann.short_channel_id,
            from_node: ann.node_id_1,
            to_node: ann.node_id_2,
        },
        Direction::Node2ToNode1 => ChannelDesc {
            short_channel_id: ann.short_channel_id,
            from_node: ann.node_id_2,
            to_node: ann.node_id_1,
        },
    }
}

/// The network database owned by the gossip router.
///
/// A channel announcement is in exactly one of `channels`, `awaiting`,
/// `stash` or discarded; `updates` only keys channels present in `channels`
/// (or, for local channels, `local_updates`); `nodes` only keeps nodes with
/// at least one incident channel, re-established on every prune.
#[derive(Default)]
pub struct RouterState {
    pub(crate) nodes: BTreeMap<PublicKey, NodeAnnouncement>,
    pub(crate) channels: BTreeMap<ShortChannelId, ChannelAnnouncement>,
    pub(crate) updates: BTreeMap<ChannelDesc, ChannelUpdate>,
    /// Gossip waiting for a validation batch, in receipt order
    pub(crate) stash: Vec<(GossipMessage, Peer)>,
    /// Announcements handed to the chain watcher for validation
    pub(crate) awaiting: BTreeMap<ShortChannelId, (ChannelAnnouncement, Peer)>,
    /// Validated gossip waiting for the next broadcast tick, with origins
    pub(crate) rebroadcast: Vec<(GossipMessage, PublicKey)>,
    pub(crate) local_updates:
        BTreeMap<ChannelId, (ChannelDesc, ChannelUpdate)>,
    /// Temporarily unusable directed edges; every entry has a scheduled lift
    pub(crate) excluded: BTreeSet<ChannelDesc>,
}

impl RouterState {
    pub(crate) fn handle_channel_announcement(
        &mut self,
        ann: ChannelAnnouncement,
        origin: Peer,
    ) -> AnnouncementOutcome {
        let scid = ann.short_channel_id;
        let stashed = self.stash.iter().any(|(msg, _)| {
            matches!(
                msg,
                GossipMessage::ChannelAnnouncement(a)
                    if a.short_channel_id == scid
            )
        });
        if self.channels.contains_key(&scid)
            || self.awaiting.contains_key(&scid)
            || stashed
        {
            return AnnouncementOutcome::Duplicate;
        }
        if ann.verify().is_err() {
            return AnnouncementOutcome::BadSignature;
        }
        self.stash
            .push((GossipMessage::ChannelAnnouncement(ann), origin));
        AnnouncementOutcome::Stashed
    }

    pub(crate) fn handle_node_announcement(
        &mut self,
        ann: NodeAnnouncement,
        origin: Peer,
    ) -> NodeOutcome {
        if let Some(stored) = self.nodes.get(&ann.node_id) {
            if stored.timestamp >= ann.timestamp {
                return NodeOutcome::Stale;
            }
        }
        if ann.verify().is_err() {
            return NodeOutcome::BadSignature;
        }
        let node_id = ann.node_id;
        if self.nodes.contains_key(&node_id) {
            self.nodes.insert(node_id, ann.clone());
            self.rebroadcast.push((
                GossipMessage::NodeAnnouncement(ann),
                origin.node_id,
            ));
            NodeOutcome::Updated
        } else if self
            .channels
            .values()
            .any(|channel| channel.contains_node(&node_id))
        {
            self.nodes.insert(node_id, ann.clone());
            self.rebroadcast.push((
                GossipMessage::NodeAnnouncement(ann),
                origin.node_id,
            ));
            NodeOutcome::Added
        } else if self.pending_channel_references(&node_id) {
            self.stash
                .push((GossipMessage::NodeAnnouncement(ann), origin));
            NodeOutcome::Stashed
        } else {
            NodeOutcome::Unrelated
        }
    }

    pub(crate) fn handle_channel_update(
        &mut self,
        update: ChannelUpdate,
        origin: Peer,
    ) -> UpdateOutcome {
        let scid = update.short_channel_id;
        if let Some(ann) = self.channels.get(&scid) {
            let desc = desc_for(ann, &update);
            if let Some(existing) = self.updates.get(&desc) {
                if existing.timestamp >= update.timestamp {
                    return UpdateOutcome::Stale;
                }
            }
            if update.verify(&desc.from_node).is_err() {
                return UpdateOutcome::BadSignature;
            }
            self.updates.insert(desc, update);
            self.rebroadcast
                .push((GossipMessage::ChannelUpdate(update), origin.node_id));
            UpdateOutcome::Applied
        } else if self.awaiting.contains_key(&scid)
            || self.stash.iter().any(|(msg, _)| {
                matches!(
                    msg,
                    GossipMessage::ChannelAnnouncement(a)
                        if a.short_channel_id == scid
                )
            })
        {
            self.stash
                .push((GossipMessage::ChannelUpdate(update), origin));
            UpdateOutcome::Stashed
        } else {
            UpdateOutcome::Unknown
        }
    }

    fn pending_channel_references(&self, node_id: &PublicKey) -> bool {
        self.awaiting
            .values()
            .any(|(channel, _)| channel.contains_node(node_id))
            || self.stash.iter().any(|(msg, _)| {
                matches!(
                    msg,
                    GossipMessage::ChannelAnnouncement(a)
                        if a.contains_node(node_id)
                )
            })
    }

    /// Moves up to `max` stashed channel announcements into `awaiting` and
    /// returns them for on-chain validation. Other stash entries stay.
    pub(crate) fn take_validation_batch(
        &mut self,
        max: usize,
    ) -> Vec<ChannelAnnouncement> {
        let mut batch = Vec::new();
        let mut kept = Vec::new();
        for (msg, peer) in self.stash.drain(..) {
            match msg {
                GossipMessage::ChannelAnnouncement(ann)
                    if batch.len() < max =>
                {
                    self.awaiting
                        .insert(ann.short_channel_id, (ann.clone(), peer));
                    batch.push(ann);
                }
                other => kept.push((other, peer)),
            }
        }
        self.stash = kept;
        batch
    }

    /// Stores a validated channel and pulls the stashed messages that were
    /// waiting on it; the caller re-injects them through the normal path.
    pub(crate) fn admit_channel(
        &mut self,
        ann: ChannelAnnouncement,
    ) -> Vec<(GossipMessage, Peer)> {
        let scid = ann.short_channel_id;
        let node_1 = ann.node_id_1;
        let node_2 = ann.node_id_2;
        self.channels.insert(scid, ann);

        let mut reinject = Vec::new();
        let mut kept = Vec::new();
        for (msg, peer) in self.stash.drain(..) {
            let related = match &msg {
                GossipMessage::NodeAnnouncement(node) => {
                    node.node_id == node_1 || node.node_id == node_2
                }
                GossipMessage::ChannelUpdate(update) => {
                    update.short_channel_id == scid
                }
                GossipMessage::ChannelAnnouncement(_) => false,
            };
            if related {
                reinject.push((msg, peer));
            } else {
                kept.push((msg, peer));
            }
        }
        self.stash = kept;
        reinject
    }

    /// Removes a channel with its updates and the nodes it leaves orphaned.
    pub(crate) fn remove_channel(
        &mut self,
        scid: ShortChannelId,
    ) -> Vec<NetworkEvent> {
        let ann = match self.channels.remove(&scid) {
            Some(ann) => ann,
            None => return vec![],
        };
        self.updates
            .retain(|desc, _| desc.short_channel_id != scid);

        let mut events = vec![NetworkEvent::ChannelLost(scid)];
        for node_id in [ann.node_id_1, ann.node_id_2] {
            if !self.references_node(&node_id)
                && self.nodes.remove(&node_id).is_some()
            {
                events.push(NetworkEvent::NodeLost(node_id));
            }
        }
        events
    }

    /// Daily staleness pass: a channel is stale when its funding block is
    /// old and neither direction saw a recent update.
    pub(crate) fn prune_stale(
        &mut self,
        current_block: u32,
        now: u64,
    ) -> Vec<NetworkEvent> {
        let height_cutoff =
            current_block.saturating_sub(STALE_CHANNEL_AGE_BLOCKS);
        let time_cutoff = now.saturating_sub(STALE_UPDATE_AGE_SECS);
        let stale: Vec<ShortChannelId> = self
            .channels
            .keys()
            .filter(|scid| {
                scid.block_height < height_cutoff
                    && !self.has_fresh_update(**scid, time_cutoff)
            })
            .copied()
            .collect();
        let mut events = Vec::new();
        for scid in stale {
            log::info!("pruning stale channel {}", scid);
            events.extend(self.remove_channel(scid));
        }
        events
    }

    fn has_fresh_update(
        &self,
        scid: ShortChannelId,
        time_cutoff: u64,
    ) -> bool {
        self.updates.iter().any(|(desc, update)| {
            desc.short_channel_id == scid
                && update.timestamp as u64 >= time_cutoff
        })
    }

    fn references_node(&self, node_id: &PublicKey) -> bool {
        self.channels
            .values()
            .any(|channel| channel.contains_node(node_id))
            || self.local_updates.values().any(|(desc, _)| {
                desc.from_node == *node_id || desc.to_node == *node_id
            })
    }

    pub(crate) fn local_channel_up(
        &mut self,
        channel_id: ChannelId,
        desc: ChannelDesc,
        update: ChannelUpdate,
    ) {
        self.local_updates.insert(channel_id, (desc, update));
    }

    pub(crate) fn local_channel_down(&mut self, channel_id: ChannelId) {
        self.local_updates.remove(&channel_id);
    }

    pub(crate) fn network_stats(&self) -> NetworkStats {
        NetworkStats {
            nodes: self.nodes.len(),
            channels: self.channels.len(),
            updates: self.updates.len(),
        }
    }

    /// Unit-weight Dijkstra over the usable directed edges. Edge iteration
    /// order is shuffled per call so equal-length routes spread the load
    /// instead of always electing the same path.
    pub(crate) fn find_route<R: Rng>(
        &self,
        start: PublicKey,
        end: PublicKey,
        ignore_nodes: &BTreeSet<PublicKey>,
        ignore_channels: &BTreeSet<ShortChannelId>,
        rng: &mut R,
    ) -> Result<Vec<Hop>, RouteError> {
        if start == end {
            return Err(RouteError::CannotRouteToSelf);
        }

        // Public edges first, then local ones: local knowledge wins on a
        // shared desc
        let mut edges: BTreeMap<ChannelDesc, ChannelUpdate> =
            self.updates.clone();
        for (desc, update) in self.local_updates.values() {
            edges.insert(*desc, *update);
        }

        let mut adjacency: HashMap<
            PublicKey,
            Vec<(ChannelDesc, ChannelUpdate)>,
        > = HashMap::new();
        for (desc, update) in edges {
            if self.excluded.contains(&desc)
                || ignore_channels.contains(&desc.short_channel_id)
                || ignore_nodes.contains(&desc.from_node)
                || ignore_nodes.contains(&desc.to_node)
                || update.is_disabled()
            {
                continue;
            }
            adjacency
                .entry(desc.from_node)
                .or_default()
                .push((desc, update));
        }
        for neighbors in adjacency.values_mut() {
            neighbors.shuffle(rng);
        }

        let mut distance: HashMap<PublicKey, u32> = HashMap::new();
        let mut previous: HashMap<PublicKey, (ChannelDesc, ChannelUpdate)> =
            HashMap::new();
        let mut heap = BinaryHeap::new();
        let mut sequence = 0u64;
        distance.insert(start, 0);
        heap.push(Reverse((0u32, sequence, start)));

        while let Some(Reverse((cost, _, node))) = heap.pop() {
            if node == end {
                break;
            }
            if cost > distance.get(&node).copied().unwrap_or(u32::MAX) {
                continue;
            }
            if let Some(neighbors) = adjacency.get(&node) {
                for (desc, update) in neighbors {
                    let next_cost = cost + 1;
                    if next_cost
                        < distance
                            .get(&desc.to_node)
                            .copied()
                            .unwrap_or(u32::MAX)
                    {
                        distance.insert(desc.to_node, next_cost);
                        previous.insert(desc.to_node, (*desc, *update));
                        sequence += 1;
                        heap.push(Reverse((
                            next_cost,
                            sequence,
                            desc.to_node,
                        )));
                    }
                }
            }
        }

        let mut hops = Vec::new();
        let mut cursor = end;
        while cursor != start {
            let (desc, update) = previous
                .get(&cursor)
                .ok_or(RouteError::RouteNotFound)?;
            hops.push(Hop {
                from_node: desc.from_node,
                to_node: desc.to_node,
                channel_update: *update,
            });
            cursor = desc.from_node;
        }
        hops.reverse();
        Ok(hops)
    }
}
