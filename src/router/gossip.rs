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

//! The gossip router actor.
//!
//! A two-state machine: `NORMAL` accepts everything; while
//! `WAITING_FOR_VALIDATION` it still ingests and answers queries but
//! refuses to start a second on-chain validation batch. Timers for
//! validation, rebroadcast and staleness tick independently of the state.

use std::collections::BTreeSet;
use std::mem;
use std::time::Duration;

use chrono::Utc;
use secp256k1::PublicKey;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant};

use super::graph::{
    AnnouncementOutcome, ChannelDesc, Hop, NetworkStats, NodeOutcome,
    RouteError, RouterState, UpdateOutcome,
};
use crate::chain::{
    funding_script, BitcoinEvent, ChainWatcherHandle, EventSink,
    ValidateResult, Watch, WatchEvent,
};
use crate::events::{ChainTip, EventBus, NetworkEvent};
use crate::wire::{
    ChannelId, ChannelUpdate, ErrorMessage, GossipMessage, ShortChannelId,
};

/// Tunables of the gossip router.
#[derive(Clone, Debug)]
pub struct RouterConf {
    /// How often a pending validation batch is started
    pub validate_interval: Duration,

    /// How often the rebroadcast queue is drained downstream
    pub broadcast_interval: Duration,

    /// How often the staleness pass runs
    pub prune_interval: Duration,

    /// Most channel announcements handed to a single validation batch
    pub max_parallel_validations: usize,
}

impl Default for RouterConf {
    fn default() -> Self {
        RouterConf {
            validate_interval: Duration::from_secs(2),
            broadcast_interval: Duration::from_secs(60),
            prune_interval: Duration::from_secs(86_400),
            max_parallel_validations: 50,
        }
    }
}

/// Origin of a gossip message: the peer node id plus the channel protocol
/// error replies travel back on.
#[derive(Clone, Debug)]
pub struct Peer {
    pub node_id: PublicKey,
    pub replies: mpsc::UnboundedSender<ErrorMessage>,
}

impl Peer {
    pub fn new(
        node_id: PublicKey,
        replies: mpsc::UnboundedSender<ErrorMessage>,
    ) -> Peer {
        Peer { node_id, replies }
    }

    fn send_error(&self, message: ErrorMessage) {
        log::debug!("replying to {} with {}", self.node_id, message);
        let _ = self.replies.send(message);
    }
}

/// Validated gossip drained downstream on every broadcast tick. Each
/// message carries its origin so the broadcaster does not echo it back.
#[derive(Clone, Debug)]
pub struct RebroadcastBatch {
    pub messages: Vec<(GossipMessage, PublicKey)>,
}

enum RouterMsg {
    Ingest {
        message: GossipMessage,
        origin: Peer,
    },
    Route {
        start: PublicKey,
        end: PublicKey,
        ignore_nodes: BTreeSet<PublicKey>,
        ignore_channels: BTreeSet<ShortChannelId>,
        reply: oneshot::Sender<Result<Vec<Hop>, RouteError>>,
    },
    Exclude {
        desc: ChannelDesc,
        duration: Duration,
    },
    LiftExclusion {
        desc: ChannelDesc,
    },
    LocalChannelUp {
        channel_id: ChannelId,
        desc: ChannelDesc,
        update: ChannelUpdate,
    },
    LocalChannelDown {
        channel_id: ChannelId,
    },
    TickValidate,
    TickBroadcast,
    TickPrune,
    ValidationDone(Vec<ValidateResult>),
    Stats {
        reply: oneshot::Sender<NetworkStats>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
enum RouterStage {
    #[display("NORMAL")]
    Normal,

    #[display("WAITING_FOR_VALIDATION")]
    WaitingForValidation,
}

/// Cloneable handle feeding the router mailbox.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterMsg>,
    rebroadcast_tx: broadcast::Sender<RebroadcastBatch>,
}

impl RouterHandle {
    /// Ingests one gossip message from a peer.
    pub fn ingest(&self, message: GossipMessage, origin: Peer) {
        let _ = self.tx.send(RouterMsg::Ingest { message, origin });
    }

    /// Computes a route between two nodes over the currently usable graph.
    pub async fn route(
        &self,
        start: PublicKey,
        end: PublicKey,
        ignore_nodes: BTreeSet<PublicKey>,
        ignore_channels: BTreeSet<ShortChannelId>,
    ) -> Result<Vec<Hop>, RouteError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RouterMsg::Route {
                start,
                end,
                ignore_nodes,
                ignore_channels,
                reply,
            })
            .is_err()
        {
            log::warn!("gossip router is gone, failing the route request");
            return Err(RouteError::RouteNotFound);
        }
        rx.await.unwrap_or(Err(RouteError::RouteNotFound))
    }

    /// Makes a directed edge unavailable for routing; it is reinstated
    /// automatically after `duration`.
    pub fn exclude(&self, desc: ChannelDesc, duration: Duration) {
        let _ = self.tx.send(RouterMsg::Exclude { desc, duration });
    }

    /// Publishes or refreshes the outgoing edge of one of our own channels.
    pub fn local_channel_up(
        &self,
        channel_id: ChannelId,
        desc: ChannelDesc,
        update: ChannelUpdate,
    ) {
        let _ = self.tx.send(RouterMsg::LocalChannelUp {
            channel_id,
            desc,
            update,
        });
    }

    /// Withdraws one of our own channels from routing.
    pub fn local_channel_down(&self, channel_id: ChannelId) {
        let _ = self.tx.send(RouterMsg::LocalChannelDown { channel_id });
    }

    /// Graph size counters.
    pub async fn network_stats(&self) -> NetworkStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RouterMsg::Stats { reply }).is_err() {
            return NetworkStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Subscribes to the batches drained on every broadcast tick.
    pub fn subscribe_rebroadcast(
        &self,
    ) -> broadcast::Receiver<RebroadcastBatch> {
        self.rebroadcast_tx.subscribe()
    }
}

/// The router actor: exclusive owner of the network graph.
pub struct GossipRouter {
    conf: RouterConf,
    state: RouterState,
    stage: RouterStage,
    chain: ChainWatcherHandle,
    events: EventBus,
    tip: ChainTip,
    self_tx: mpsc::UnboundedSender<RouterMsg>,
    /// Sink handed to the chain watcher for the spend watches of admitted
    /// channels
    watch_sink: EventSink,
    rebroadcast_tx: broadcast::Sender<RebroadcastBatch>,
}

impl GossipRouter {
    pub fn spawn(
        conf: RouterConf,
        chain: ChainWatcherHandle,
        events: EventBus,
        tip: ChainTip,
    ) -> RouterHandle {
        let (self_tx, mailbox) = mpsc::unbounded_channel();
        let (watch_sink, watch_events) = mpsc::unbounded_channel();
        let (rebroadcast_tx, _) = broadcast::channel(64);
        let router = GossipRouter {
            conf,
            state: RouterState::default(),
            stage: RouterStage::Normal,
            chain,
            events,
            tip,
            self_tx: self_tx.clone(),
            watch_sink,
            rebroadcast_tx: rebroadcast_tx.clone(),
        };
        tokio::spawn(router.run(mailbox, watch_events));
        RouterHandle {
            tx: self_tx,
            rebroadcast_tx,
        }
    }

    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<RouterMsg>,
        mut watch_events: mpsc::UnboundedReceiver<WatchEvent>,
    ) {
        let mut validate = interval_at(
            Instant::now() + self.conf.validate_interval,
            self.conf.validate_interval,
        );
        let mut rebroadcast = interval_at(
            Instant::now() + self.conf.broadcast_interval,
            self.conf.broadcast_interval,
        );
        let mut prune = interval_at(
            Instant::now() + self.conf.prune_interval,
            self.conf.prune_interval,
        );
        loop {
            tokio::select! {
                msg = mailbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                event = watch_events.recv() => {
                    if let Some(event) = event {
                        self.handle_watch_event(event);
                    }
                }
                _ = validate.tick() => self.handle(RouterMsg::TickValidate),
                _ = rebroadcast.tick() => self.handle(RouterMsg::TickBroadcast),
                _ = prune.tick() => self.handle(RouterMsg::TickPrune),
            }
        }
    }

    fn handle(&mut self, msg: RouterMsg) {
        match msg {
            RouterMsg::Ingest { message, origin } => {
                self.ingest(message, origin)
            }
            RouterMsg::Route {
                start,
                end,
                ignore_nodes,
                ignore_channels,
                reply,
            } => {
                let result = self.state.find_route(
                    start,
                    end,
                    &ignore_nodes,
                    &ignore_channels,
                    &mut rand::thread_rng(),
                );
                let _ = reply.send(result);
            }
            RouterMsg::Exclude { desc, duration } => {
                self.exclude(desc, duration)
            }
            RouterMsg::LiftExclusion { desc } => {
                if self.state.excluded.remove(&desc) {
                    log::debug!("exclusion of {} lifted", desc);
                }
            }
            RouterMsg::LocalChannelUp {
                channel_id,
                desc,
                update,
            } => self.state.local_channel_up(channel_id, desc, update),
            RouterMsg::LocalChannelDown { channel_id } => {
                self.state.local_channel_down(channel_id)
            }
            RouterMsg::TickValidate => self.tick_validate(),
            RouterMsg::TickBroadcast => self.tick_broadcast(),
            RouterMsg::TickPrune => self.tick_prune(),
            RouterMsg::ValidationDone(results) => {
                self.validation_done(results)
            }
            RouterMsg::Stats { reply } => {
                let _ = reply.send(self.state.network_stats());
            }
        }
    }

    fn ingest(&mut self, message: GossipMessage, origin: Peer) {
        match message {
            GossipMessage::ChannelAnnouncement(ann) => {
                let scid = ann.short_channel_id;
                match self
                    .state
                    .handle_channel_announcement(ann, origin.clone())
                {
                    AnnouncementOutcome::Stashed => log::debug!(
                        "stashed channel announcement for {}",
                        scid
                    ),
                    AnnouncementOutcome::Duplicate => log::trace!(
                        "ignoring duplicate channel announcement for {}",
                        scid
                    ),
                    AnnouncementOutcome::BadSignature => {
                        origin.send_error(ErrorMessage {
                            channel_id: None,
                            data: format!(
                                "invalid signatures on channel announcement {}",
                                scid
                            ),
                        })
                    }
                }
            }
            GossipMessage::NodeAnnouncement(ann) => {
                let node_id = ann.node_id;
                match self.state.handle_node_announcement(ann, origin.clone())
                {
                    NodeOutcome::Added => self
                        .events
                        .publish(NetworkEvent::NodeDiscovered(node_id)),
                    NodeOutcome::Updated | NodeOutcome::Stashed => {}
                    NodeOutcome::Stale => log::trace!(
                        "ignoring stale node announcement of {}",
                        node_id
                    ),
                    NodeOutcome::Unrelated => log::trace!(
                        "ignoring node announcement of {} with no related \
                         channel",
                        node_id
                    ),
                    NodeOutcome::BadSignature => {
                        origin.send_error(ErrorMessage {
                            channel_id: None,
                            data: format!(
                                "invalid signature on node announcement of {}",
                                node_id
                            ),
                        })
                    }
                }
            }
            GossipMessage::ChannelUpdate(update) => {
                let scid = update.short_channel_id;
                match self.state.handle_channel_update(update, origin.clone())
                {
                    UpdateOutcome::Applied | UpdateOutcome::Stashed => {}
                    UpdateOutcome::Stale => log::trace!(
                        "ignoring stale channel update for {}",
                        scid
                    ),
                    UpdateOutcome::Unknown => log::trace!(
                        "ignoring channel update for unknown channel {}",
                        scid
                    ),
                    UpdateOutcome::BadSignature => {
                        origin.send_error(ErrorMessage {
                            channel_id: None,
                            data: format!(
                                "invalid signature on channel update for {}",
                                scid
                            ),
                        })
                    }
                }
            }
        }
    }

    /// `NORMAL -> WAITING_FOR_VALIDATION` iff the stash holds at least one
    /// channel announcement.
    fn tick_validate(&mut self) {
        if self.stage == RouterStage::WaitingForValidation {
            // one batch at a time
            return;
        }
        let batch = self
            .state
            .take_validation_batch(self.conf.max_parallel_validations);
        if batch.is_empty() {
            return;
        }
        log::debug!(
            "validating a batch of {} channel announcement(s)",
            batch.len()
        );
        self.stage = RouterStage::WaitingForValidation;
        let chain = self.chain.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let results = chain.validate(batch).await;
            let _ = self_tx.send(RouterMsg::ValidationDone(results));
        });
    }

    /// `WAITING_FOR_VALIDATION -> NORMAL`; admits channels whose funding
    /// output matches the announced keys and is unspent.
    fn validation_done(&mut self, results: Vec<ValidateResult>) {
        self.stage = RouterStage::Normal;
        for result in results {
            let scid = result.announcement.short_channel_id;
            let (ann, origin) = match self.state.awaiting.remove(&scid) {
                Some(entry) => entry,
                None => continue,
            };
            let funding_tx = match result.funding_tx {
                Some(tx) => tx,
                None => {
                    log::debug!(
                        "funding tx of {} not retrievable, dropping the \
                         announcement",
                        scid
                    );
                    continue;
                }
            };
            let expected =
                funding_script(&ann.bitcoin_key_1, &ann.bitcoin_key_2);
            let script_matches = funding_tx
                .output
                .get(scid.output_index as usize)
                .map(|output| output.script_pubkey == expected)
                .unwrap_or(false);
            if !script_matches {
                log::warn!(
                    "funding output of {} does not match the announced keys, \
                     discarding",
                    scid
                );
                continue;
            }
            if !result.unspent {
                log::debug!(
                    "funding output of {} is already spent, discarding",
                    scid
                );
                continue;
            }

            log::info!("channel {} validated and admitted", scid);
            let reinject = self.state.admit_channel(ann.clone());
            self.state.rebroadcast.push((
                GossipMessage::ChannelAnnouncement(ann),
                origin.node_id,
            ));
            self.events.publish(NetworkEvent::ChannelDiscovered(scid));
            self.chain.register(
                Watch::SpentBasic {
                    tx_id: funding_tx.txid(),
                    output_index: scid.output_index as u32,
                    event: BitcoinEvent::ExternalChannelSpent(scid),
                },
                self.watch_sink.clone(),
            );
            for (message, peer) in reinject {
                let _ = self
                    .self_tx
                    .send(RouterMsg::Ingest {
                        message,
                        origin: peer,
                    });
            }
        }
        // announcements the batch yielded nothing for are dropped, not
        // blacklisted
        let leftover: Vec<ShortChannelId> =
            self.state.awaiting.keys().copied().collect();
        for scid in leftover {
            log::debug!(
                "validation of {} yielded no result, dropping the \
                 announcement",
                scid
            );
            self.state.awaiting.remove(&scid);
        }
    }

    fn tick_broadcast(&mut self) {
        if self.state.rebroadcast.is_empty() {
            return;
        }
        let messages = mem::take(&mut self.state.rebroadcast);
        log::debug!("rebroadcasting {} message(s)", messages.len());
        let _ = self.rebroadcast_tx.send(RebroadcastBatch { messages });
    }

    fn tick_prune(&mut self) {
        let current_block = self.tip.get() as u32;
        let now = Utc::now().timestamp() as u64;
        for event in self.state.prune_stale(current_block, now) {
            self.events.publish(event);
        }
    }

    fn exclude(&mut self, desc: ChannelDesc, duration: Duration) {
        log::debug!("excluding {} from routing for {:?}", desc, duration);
        self.state.excluded.insert(desc);
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            sleep(duration).await;
            let _ = self_tx.send(RouterMsg::LiftExclusion { desc });
        });
    }

    fn handle_watch_event(&mut self, event: WatchEvent) {
        if let WatchEvent::SpentBasic {
            event: BitcoinEvent::ExternalChannelSpent(scid),
        } = event
        {
            log::info!("funding of {} was spent, removing the channel", scid);
            for event in self.state.remove_channel(scid) {
                self.events.publish(event);
            }
        }
    }
}
