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

//! The chain watcher actor.
//!
//! A single task owns the watch set and the publication queues. Message
//! handlers never await: every RPC round-trip runs in a detached task whose
//! outcome is posted back to the mailbox, so the state a continuation sees
//! may have moved and is always re-checked.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{OutPoint, Transaction, Txid};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::{
    cltv_timeout, csv_timeouts, BitcoinEvent, ChainRpc, EventSink, RpcError,
    TxWithMeta, ValidateResult, Watch, WatchEvent, WatcherConfig,
};
use crate::events::ChainTip;
use crate::wire::ChannelAnnouncement;

/// Mailbox protocol of the watcher.
enum ChainMsg {
    /// A new block was connected; only a trigger, contents are re-read over
    /// RPC after the debounce
    NewBlock,
    /// A transaction entered the mempool (or was backfilled by the
    /// already-spent check)
    NewTransaction(Transaction),
    Register {
        watch: Watch,
        sink: EventSink,
    },
    PublishAsap(Transaction),
    ValidateBatch {
        announcements: Vec<ChannelAnnouncement>,
        reply: oneshot::Sender<Vec<ValidateResult>>,
    },
    GetTxWithMeta {
        txid: Txid,
        reply: oneshot::Sender<Result<Option<TxWithMeta>, RpcError>>,
    },
    /// Debounced block tick
    Tick,
    /// Continuation of the tick RPC work
    TickOutcome {
        block_count: Option<u64>,
        confirmed: Vec<ConfirmedWatch>,
    },
}

struct ConfirmedWatch {
    watch_id: u64,
    block_height: u32,
    tx_index: u32,
    tx: Transaction,
}

struct WatchEntry {
    watch: Watch,
    sink: EventSink,
}

struct PendingPublish {
    tx: Transaction,
    parents_left: usize,
}

/// Cloneable handle feeding the watcher mailbox.
#[derive(Clone)]
pub struct ChainWatcherHandle {
    tx: mpsc::UnboundedSender<ChainMsg>,
}

impl ChainWatcherHandle {
    /// Registers a watch for a consumer. Duplicates are ignored; for the
    /// spent kinds an immediate backend check may fire the event right away
    /// when the output is already spent.
    pub fn register(&self, watch: Watch, sink: EventSink) {
        let _ = self.tx.send(ChainMsg::Register { watch, sink });
    }

    /// Queues a signed transaction for publication once its absolute and
    /// relative timelocks allow. Submission order is broadcast order.
    pub fn publish_asap(&self, tx: Transaction) {
        let _ = self.tx.send(ChainMsg::PublishAsap(tx));
    }

    /// Signals a newly connected block.
    pub fn new_block(&self) {
        let _ = self.tx.send(ChainMsg::NewBlock);
    }

    /// Feeds a transaction newly seen in the mempool.
    pub fn new_transaction(&self, tx: Transaction) {
        let _ = self.tx.send(ChainMsg::NewTransaction(tx));
    }

    /// Validates a batch of channel announcements against the chain. A batch
    /// that cannot be processed yields no positive results.
    pub async fn validate(
        &self,
        announcements: Vec<ChannelAnnouncement>,
    ) -> Vec<ValidateResult> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ChainMsg::ValidateBatch {
                announcements,
                reply,
            })
            .is_err()
        {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }

    /// A transaction with its best-effort block metadata.
    pub async fn get_tx_with_meta(
        &self,
        txid: Txid,
    ) -> Result<Option<TxWithMeta>, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ChainMsg::GetTxWithMeta { txid, reply })
            .map_err(|_| RpcError::Connection(s!("chain watcher is gone")))?;
        rx.await
            .map_err(|_| RpcError::Connection(s!("chain watcher is gone")))?
    }
}

/// The watcher actor: exclusive owner of the watch set, the watched-UTXO
/// index and the publication queues.
pub struct ChainWatcher<C: ChainRpc> {
    rpc: Arc<C>,
    conf: WatcherConfig,
    tip: ChainTip,
    self_tx: mpsc::UnboundedSender<ChainMsg>,
    /// Sink for the parent-confirmation watches the publish scheduler
    /// registers on itself
    internal_sink: EventSink,
    /// Single-writer publication queue; the consuming task preserves FIFO
    broadcaster: mpsc::UnboundedSender<Transaction>,
    watches: BTreeMap<u64, WatchEntry>,
    next_watch_id: u64,
    /// outpoint -> watch ids, so a new transaction is checked in
    /// O(inputs) regardless of the total watch count
    utxo_index: HashMap<OutPoint, BTreeSet<u64>>,
    /// nLockTime-delayed transactions keyed by the unlocking block height
    cltv_queue: BTreeMap<u32, Vec<Transaction>>,
    /// Transactions whose csv-delayed parents are not deep enough yet
    csv_waiting: HashMap<Txid, PendingPublish>,
    pending_tick: Option<JoinHandle<()>>,
}

impl<C: ChainRpc> ChainWatcher<C> {
    /// Spawns the watcher and its broadcast task, returning the mailbox
    /// handle.
    pub fn spawn(
        rpc: Arc<C>,
        tip: ChainTip,
        conf: WatcherConfig,
    ) -> ChainWatcherHandle {
        let (self_tx, mailbox) = mpsc::unbounded_channel();
        let (internal_sink, parent_events) = mpsc::unbounded_channel();
        let (broadcaster, broadcast_queue) = mpsc::unbounded_channel();
        tokio::spawn(broadcast_loop(
            rpc.clone(),
            broadcast_queue,
            conf.broadcast_retry_delay,
        ));
        let watcher = ChainWatcher {
            rpc,
            conf,
            tip,
            self_tx: self_tx.clone(),
            internal_sink,
            broadcaster,
            watches: BTreeMap::new(),
            next_watch_id: 0,
            utxo_index: HashMap::new(),
            cltv_queue: BTreeMap::new(),
            csv_waiting: HashMap::new(),
            pending_tick: None,
        };
        tokio::spawn(watcher.run(mailbox, parent_events));
        ChainWatcherHandle { tx: self_tx }
    }

    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<ChainMsg>,
        mut parent_events: mpsc::UnboundedReceiver<WatchEvent>,
    ) {
        loop {
            tokio::select! {
                msg = mailbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                event = parent_events.recv() => {
                    if let Some(WatchEvent::Confirmed {
                        event: BitcoinEvent::ParentTxConfirmed(child),
                        ..
                    }) = event
                    {
                        self.parent_confirmed(child);
                    }
                }
            }
        }
        if let Some(pending) = self.pending_tick.take() {
            pending.abort();
        }
    }

    fn handle(&mut self, msg: ChainMsg) {
        match msg {
            ChainMsg::NewBlock => self.schedule_tick(true),
            ChainMsg::Tick => self.tick(),
            ChainMsg::TickOutcome {
                block_count,
                confirmed,
            } => self.apply_tick_outcome(block_count, confirmed),
            ChainMsg::NewTransaction(tx) => self.process_transaction(&tx),
            ChainMsg::Register { watch, sink } => {
                self.register_watch(watch, sink)
            }
            ChainMsg::PublishAsap(tx) => self.publish(tx),
            ChainMsg::ValidateBatch {
                announcements,
                reply,
            } => self.validate_batch(announcements, reply),
            ChainMsg::GetTxWithMeta { txid, reply } => {
                self.get_tx_with_meta(txid, reply)
            }
        }
    }

    /// Schedules the debounced tick. A new block restarts the timer so block
    /// storms coalesce into a single re-evaluation.
    fn schedule_tick(&mut self, restart: bool) {
        if restart {
            if let Some(pending) = self.pending_tick.take() {
                pending.abort();
            }
        } else if self.pending_tick.is_some() {
            return;
        }
        let self_tx = self.self_tx.clone();
        let delay = self.conf.tick_debounce;
        self.pending_tick = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = self_tx.send(ChainMsg::Tick);
        }));
    }

    fn tick(&mut self) {
        self.pending_tick = None;
        self.reap_dead_consumers();
        let confirm_watches: Vec<(u64, Txid, u32)> = self
            .watches
            .iter()
            .filter_map(|(watch_id, entry)| match &entry.watch {
                Watch::Confirmed {
                    tx_id, min_depth, ..
                } => Some((*watch_id, *tx_id, *min_depth)),
                _ => None,
            })
            .collect();
        let rpc = self.rpc.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let block_count = match rpc.get_block_count().await {
                Ok(count) => Some(count),
                Err(err) => {
                    log::warn!(
                        "block count query failed, retrying on next tick: {}",
                        err
                    );
                    None
                }
            };
            let mut confirmed = Vec::new();
            for (watch_id, txid, min_depth) in confirm_watches {
                match tx_at_depth(rpc.as_ref(), &txid, min_depth).await {
                    Ok(Some((block_height, tx_index, tx))) => {
                        confirmed.push(ConfirmedWatch {
                            watch_id,
                            block_height,
                            tx_index,
                            tx,
                        })
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!(
                        "confirmation check for {} failed: {}",
                        txid,
                        err
                    ),
                }
            }
            let _ = self_tx.send(ChainMsg::TickOutcome {
                block_count,
                confirmed,
            });
        });
    }

    fn apply_tick_outcome(
        &mut self,
        block_count: Option<u64>,
        confirmed: Vec<ConfirmedWatch>,
    ) {
        if let Some(count) = block_count {
            if count != self.tip.get() {
                log::debug!("best block count is now {}", count);
                self.tip.set(count);
            }
            self.drain_cltv_queue(count as u32);
        }
        for outcome in confirmed {
            // The watch may have been resolved or reaped while the RPCs were
            // in flight
            let entry = match self.watches.get(&outcome.watch_id) {
                Some(entry) => entry,
                None => continue,
            };
            let event = match &entry.watch {
                Watch::Confirmed { event, .. } => event.clone(),
                _ => continue,
            };
            log::debug!(
                "{} reached depth at {}:{}",
                entry.watch,
                outcome.block_height,
                outcome.tx_index
            );
            let _ = entry.sink.send(WatchEvent::Confirmed {
                event,
                block_height: outcome.block_height,
                tx_index: outcome.tx_index,
                tx: outcome.tx,
            });
            self.remove_watch(outcome.watch_id);
        }
    }

    fn drain_cltv_queue(&mut self, block_count: u32) {
        let due: Vec<u32> = self
            .cltv_queue
            .range(..=block_count)
            .map(|(height, _)| *height)
            .collect();
        for height in due {
            if let Some(transactions) = self.cltv_queue.remove(&height) {
                for tx in transactions {
                    log::debug!(
                        "nLockTime {} reached, publishing {}",
                        height,
                        tx.txid()
                    );
                    let _ = self.broadcaster.send(tx);
                }
            }
        }
    }

    fn process_transaction(&mut self, tx: &Transaction) {
        let mut fired: Vec<u64> = Vec::new();
        for input in &tx.input {
            if let Some(ids) = self.utxo_index.get(&input.previous_output) {
                fired.extend(ids.iter().copied());
            }
        }
        let mut resolved = Vec::new();
        for watch_id in fired {
            let entry = match self.watches.get(&watch_id) {
                Some(entry) => entry,
                None => continue,
            };
            match &entry.watch {
                Watch::SpentBasic { event, .. } => {
                    log::debug!("{} fired", entry.watch);
                    let _ = entry.sink.send(WatchEvent::SpentBasic {
                        event: event.clone(),
                    });
                    resolved.push(watch_id);
                }
                Watch::Spent { event, .. } => {
                    // Permanent: several candidate spends may race and the
                    // consumer needs every one of them
                    log::debug!("{} fired", entry.watch);
                    let _ = entry.sink.send(WatchEvent::Spent {
                        event: event.clone(),
                        spending_tx: tx.clone(),
                    });
                }
                _ => {}
            }
        }
        for watch_id in resolved {
            self.remove_watch(watch_id);
        }
    }

    fn register_watch(&mut self, watch: Watch, sink: EventSink) {
        if matches!(watch, Watch::Lost { .. }) {
            log::trace!("unsupported watch kind {}, ignoring", watch);
            return;
        }
        if self.watches.values().any(|entry| entry.watch == watch) {
            log::trace!("duplicate registration of {}, ignoring", watch);
            return;
        }
        let watch_id = self.next_watch_id;
        self.next_watch_id += 1;
        match &watch {
            Watch::SpentBasic {
                tx_id,
                output_index,
                ..
            }
            | Watch::Spent {
                tx_id,
                output_index,
                ..
            } => {
                let outpoint = OutPoint::new(*tx_id, *output_index);
                self.utxo_index
                    .entry(outpoint)
                    .or_default()
                    .insert(watch_id);
                self.check_already_spent(*tx_id, *output_index);
            }
            Watch::Confirmed { .. } => self.schedule_tick(false),
            Watch::Lost { .. } => {}
        }
        log::debug!("registered {}", watch);
        self.watches.insert(watch_id, WatchEntry { watch, sink });
    }

    /// The watched output may have been spent long before registration; look
    /// for the spender in the mempool and on the chain, and feed it through
    /// the regular new-transaction path.
    fn check_already_spent(&self, txid: Txid, output_index: u32) {
        let rpc = self.rpc.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            match find_spender(rpc.as_ref(), &txid, output_index).await {
                Ok(Some(spender)) => {
                    log::debug!(
                        "{}:{} was already spent by {}",
                        txid,
                        output_index,
                        spender.txid()
                    );
                    let _ = self_tx.send(ChainMsg::NewTransaction(spender));
                }
                Ok(None) => {}
                Err(err) => log::warn!(
                    "spent check for {}:{} failed: {}",
                    txid,
                    output_index,
                    err
                ),
            }
        });
    }

    fn publish(&mut self, tx: Transaction) {
        let parents = csv_timeouts(&tx);
        if parents.is_empty() {
            self.publish_relative_locks_met(tx);
            return;
        }
        let txid = tx.txid();
        log::debug!(
            "{} has {} csv-delayed parent(s), deferring publication",
            txid,
            parents.len()
        );
        self.csv_waiting.insert(txid, PendingPublish {
            tx: tx.clone(),
            parents_left: parents.len(),
        });
        for (parent, delay) in parents {
            self.register_watch(
                Watch::Confirmed {
                    tx_id: parent,
                    min_depth: delay,
                    event: BitcoinEvent::ParentTxConfirmed(tx.clone()),
                },
                self.internal_sink.clone(),
            );
        }
    }

    /// Re-entry point after a csv parent reached its depth: relative locks
    /// are accounted for by block depth from here on.
    fn parent_confirmed(&mut self, child: Transaction) {
        let txid = child.txid();
        let ready = match self.csv_waiting.get_mut(&txid) {
            Some(pending) => {
                pending.parents_left = pending.parents_left.saturating_sub(1);
                pending.parents_left == 0
            }
            None => return,
        };
        if ready {
            if let Some(pending) = self.csv_waiting.remove(&txid) {
                log::debug!("all csv parents of {} are deep enough", txid);
                self.publish_relative_locks_met(pending.tx);
            }
        }
    }

    fn publish_relative_locks_met(&mut self, tx: Transaction) {
        let timeout = cltv_timeout(&tx);
        let current = self.tip.get() as u32;
        if timeout > current {
            log::debug!(
                "delaying publication of {} until block {} (currently {})",
                tx.txid(),
                timeout,
                current
            );
            self.cltv_queue.entry(timeout).or_default().push(tx);
        } else {
            let _ = self.broadcaster.send(tx);
        }
    }

    fn validate_batch(
        &self,
        announcements: Vec<ChannelAnnouncement>,
        reply: oneshot::Sender<Vec<ValidateResult>>,
    ) {
        let rpc = self.rpc.clone();
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(announcements.len());
            for announcement in announcements {
                results
                    .push(validate_announcement(rpc.as_ref(), announcement).await);
            }
            let _ = reply.send(results);
        });
    }

    fn get_tx_with_meta(
        &self,
        txid: Txid,
        reply: oneshot::Sender<Result<Option<TxWithMeta>, RpcError>>,
    ) {
        let rpc = self.rpc.clone();
        tokio::spawn(async move {
            let _ = reply.send(tx_with_meta(rpc.as_ref(), &txid).await);
        });
    }

    /// Consumers are weak references: a dropped receiver silently takes its
    /// watches with it.
    fn reap_dead_consumers(&mut self) {
        let dead: Vec<u64> = self
            .watches
            .iter()
            .filter(|(_, entry)| entry.sink.is_closed())
            .map(|(watch_id, _)| *watch_id)
            .collect();
        for watch_id in dead {
            if let Some(entry) = self.watches.get(&watch_id) {
                log::debug!(
                    "consumer of {} is gone, dropping the watch",
                    entry.watch
                );
            }
            self.remove_watch(watch_id);
        }
    }

    fn remove_watch(&mut self, watch_id: u64) {
        if let Some(entry) = self.watches.remove(&watch_id) {
            if let Watch::SpentBasic {
                tx_id,
                output_index,
                ..
            }
            | Watch::Spent {
                tx_id,
                output_index,
                ..
            } = &entry.watch
            {
                let outpoint = OutPoint::new(*tx_id, *output_index);
                if let Some(ids) = self.utxo_index.get_mut(&outpoint) {
                    ids.remove(&watch_id);
                    if ids.is_empty() {
                        self.utxo_index.remove(&outpoint);
                    }
                }
            }
        }
    }
}

async fn tx_at_depth<C: ChainRpc>(
    rpc: &C,
    txid: &Txid,
    min_depth: u32,
) -> Result<Option<(u32, u32, Transaction)>, RpcError> {
    let confirmations = match rpc.get_tx_confirmations(txid).await? {
        Some(confirmations) => confirmations,
        None => return Ok(None),
    };
    if confirmations < min_depth {
        return Ok(None);
    }
    let tx = match rpc.get_raw_transaction(txid).await? {
        Some(tx) => tx,
        None => return Ok(None),
    };
    let position = match rpc.get_tx_position(txid).await? {
        Some(position) => position,
        None => return Ok(None),
    };
    Ok(Some((position.0, position.1, tx)))
}

async fn find_spender<C: ChainRpc>(
    rpc: &C,
    txid: &Txid,
    output_index: u32,
) -> Result<Option<Transaction>, RpcError> {
    if rpc.is_output_spendable(txid, output_index, true).await? {
        return Ok(None);
    }
    let outpoint = OutPoint::new(*txid, output_index);
    for tx in rpc.get_mempool().await? {
        if tx
            .input
            .iter()
            .any(|input| input.previous_output == outpoint)
        {
            return Ok(Some(tx));
        }
    }
    rpc.look_for_spending_tx(txid, output_index).await
}

async fn validate_announcement<C: ChainRpc>(
    rpc: &C,
    announcement: ChannelAnnouncement,
) -> ValidateResult {
    let scid = announcement.short_channel_id;
    let funding_tx = match rpc
        .get_transaction_by_short_id(scid.block_height, scid.tx_index)
        .await
    {
        Ok(tx) => tx,
        Err(err) => {
            log::warn!("funding lookup for {} failed: {}", scid, err);
            None
        }
    };
    let unspent = match &funding_tx {
        Some(tx) => rpc
            .is_output_spendable(&tx.txid(), scid.output_index as u32, true)
            .await
            .unwrap_or_else(|err| {
                log::warn!("spendability check for {} failed: {}", scid, err);
                false
            }),
        None => false,
    };
    ValidateResult {
        announcement,
        funding_tx,
        unspent,
    }
}

async fn tx_with_meta<C: ChainRpc>(
    rpc: &C,
    txid: &Txid,
) -> Result<Option<TxWithMeta>, RpcError> {
    let tx = match rpc.get_raw_transaction(txid).await? {
        Some(tx) => tx,
        None => return Ok(None),
    };
    let confirmations = rpc.get_tx_confirmations(txid).await?.unwrap_or(0);
    let position = rpc.get_tx_position(txid).await?;
    Ok(Some(TxWithMeta {
        tx,
        block_height: position.map(|(height, _)| height),
        tx_index: position.map(|(_, index)| index),
        confirmations,
    }))
}

/// Serializes all publications so parent-before-child submission order is
/// preserved on the wire; retries the missing-inputs mempool race exactly
/// once.
async fn broadcast_loop<C: ChainRpc>(
    rpc: Arc<C>,
    mut queue: mpsc::UnboundedReceiver<Transaction>,
    retry_delay: Duration,
) {
    while let Some(tx) = queue.recv().await {
        let txid = tx.txid();
        match rpc.send_raw_transaction(&tx).await {
            Ok(_) => log::info!("published {}", txid),
            Err(err) if err.is_missing_inputs() => {
                log::warn!(
                    "publication of {} hit a mempool race, retrying once: {}",
                    txid,
                    err
                );
                sleep(retry_delay).await;
                match rpc.send_raw_transaction(&tx).await {
                    Ok(_) => log::info!("published {} on retry", txid),
                    Err(err) => log::error!(
                        "publication of {} failed after retry: {}",
                        txid,
                        err
                    ),
                }
            }
            Err(err) => {
                log::error!("publication of {} failed: {}", txid, err)
            }
        }
    }
}
