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

//! Test fixtures: an in-memory chain backend and signed gossip builders.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use amplify::Slice32;
use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{
    OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::chain::{funding_script, ChainRpc, RpcError};
use crate::router::{ChannelDesc, Peer};
use crate::wire::bolt7::{
    no_signature, CHANNEL_FLAG_DIRECTION, CHANNEL_FLAG_DISABLED,
};
use crate::wire::{
    ChannelAnnouncement, ChannelUpdate, ErrorMessage, Features,
    NodeAnnouncement, ShortChannelId,
};

/// Lets spawned actors, timers and RPC continuations settle under the
/// auto-advancing test clock.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}

pub(crate) fn dummy_txid(byte: u8) -> Txid {
    Txid::from_slice(&[byte; 32]).expect("32 bytes make a txid")
}

pub(crate) fn keypair(byte: u8) -> (SecretKey, PublicKey) {
    let sk = SecretKey::from_slice(&[byte; 32])
        .expect("fixed non-zero bytes make a key");
    (sk, PublicKey::from_secret_key(SECP256K1, &sk))
}

/// One-input one-output transaction with the given locks.
pub(crate) fn tx_with_locks(
    prev_txid: Txid,
    sequence: Sequence,
    lock_time: u32,
) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime(lock_time),
        input: vec![TxIn {
            previous_output: OutPoint::new(prev_txid, 0),
            script_sig: Script::new(),
            sequence,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: 10_000,
            script_pubkey: Script::new(),
        }],
    }
}

/// Transaction spending the given output; `salt` makes siblings distinct.
pub(crate) fn spend(txid: Txid, vout: u32, salt: u8) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(txid, vout),
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: 9_000 + salt as u64,
            script_pubkey: Script::new(),
        }],
    }
}

/// A signed channel announcement plus the keys needed to derive updates and
/// the funding transaction for it.
pub(crate) struct TestChannel {
    pub ann: ChannelAnnouncement,
    /// Key of `ann.node_id_1`
    pub node_1_key: SecretKey,
    /// Key of `ann.node_id_2`
    pub node_2_key: SecretKey,
}

/// Builds a fully signed channel announcement between the nodes derived
/// from the two seeds; bitcoin keys are derived from the node seeds.
pub(crate) fn channel(
    seed_a: u8,
    seed_b: u8,
    scid: ShortChannelId,
) -> TestChannel {
    let (sk_a, pk_a) = keypair(seed_a);
    let (sk_b, pk_b) = keypair(seed_b);
    let (node_1, node_2) = if pk_a.serialize() < pk_b.serialize() {
        ((sk_a, pk_a), (sk_b, pk_b))
    } else {
        ((sk_b, pk_b), (sk_a, pk_a))
    };
    let (funding_1, funding_pk_1) = keypair(seed_a.wrapping_add(0x40));
    let (funding_2, funding_pk_2) = keypair(seed_b.wrapping_add(0x40));
    let mut ann = ChannelAnnouncement {
        node_signature_1: no_signature(),
        node_signature_2: no_signature(),
        bitcoin_signature_1: no_signature(),
        bitcoin_signature_2: no_signature(),
        features: Features::none(),
        chain_hash: Slice32::default(),
        short_channel_id: scid,
        node_id_1: node_1.1,
        node_id_2: node_2.1,
        bitcoin_key_1: funding_pk_1,
        bitcoin_key_2: funding_pk_2,
    };
    ann.sign(&node_1.0, &node_2.0, &funding_1, &funding_2);
    TestChannel {
        ann,
        node_1_key: node_1.0,
        node_2_key: node_2.0,
    }
}

/// The funding transaction the announcement points at: pays the announced
/// 2-of-2 script at the announced output index.
pub(crate) fn funding_tx_for(ch: &TestChannel) -> Transaction {
    let scid = ch.ann.short_channel_id;
    let mut output = Vec::new();
    for _ in 0..scid.output_index {
        output.push(TxOut {
            value: 1_000,
            script_pubkey: Script::new(),
        });
    }
    output.push(TxOut {
        value: 1_000_000,
        script_pubkey: funding_script(
            &ch.ann.bitcoin_key_1,
            &ch.ann.bitcoin_key_2,
        ),
    });
    Transaction {
        version: 2,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(
                dummy_txid(
                    (scid.block_height as u8).wrapping_add(scid.tx_index as u8),
                ),
                0,
            ),
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output,
    }
}

/// A signed channel update for the direction starting at `from`.
pub(crate) fn update_from(
    ch: &TestChannel,
    from: &PublicKey,
    timestamp: u32,
    disabled: bool,
) -> ChannelUpdate {
    let (direction_flag, key) = if ch.ann.node_id_1 == *from {
        (0, &ch.node_1_key)
    } else {
        (CHANNEL_FLAG_DIRECTION, &ch.node_2_key)
    };
    let mut channel_flags = direction_flag;
    if disabled {
        channel_flags |= CHANNEL_FLAG_DISABLED;
    }
    let mut update = ChannelUpdate {
        signature: no_signature(),
        chain_hash: ch.ann.chain_hash,
        short_channel_id: ch.ann.short_channel_id,
        timestamp,
        message_flags: 1,
        channel_flags,
        cltv_expiry_delta: 144,
        htlc_minimum_msat: 1_000,
        fee_base_msat: 1_000,
        fee_proportional_millionths: 100,
        htlc_maximum_msat: 500_000_000,
    };
    update.sign(key);
    update
}

/// Directed edge starting at `from` over the test channel.
pub(crate) fn desc_from(ch: &TestChannel, from: &PublicKey) -> ChannelDesc {
    let to = if ch.ann.node_id_1 == *from {
        ch.ann.node_id_2
    } else {
        ch.ann.node_id_1
    };
    ChannelDesc {
        short_channel_id: ch.ann.short_channel_id,
        from_node: *from,
        to_node: to,
    }
}

/// A signed node announcement for the node behind the key.
pub(crate) fn node_announcement_for(
    key: &SecretKey,
    timestamp: u32,
) -> NodeAnnouncement {
    let mut ann = NodeAnnouncement {
        signature: no_signature(),
        features: Features::none(),
        timestamp,
        node_id: PublicKey::from_secret_key(SECP256K1, key),
        rgb_color: Default::default(),
        alias: Default::default(),
        addresses: Default::default(),
    };
    ann.sign(key);
    ann
}

/// A peer handle plus the receiving side of its error replies.
pub(crate) fn test_peer(
    byte: u8,
) -> (Peer, UnboundedReceiver<ErrorMessage>) {
    let (tx, rx) = unbounded_channel();
    (Peer::new(keypair(byte).1, tx), rx)
}

/// In-memory chain backend driven by the tests.
pub(crate) struct MockChain {
    state: Mutex<ChainState>,
}

#[derive(Default)]
struct ChainState {
    height: u64,
    /// txid -> (tx, block height, in-block index)
    confirmed: HashMap<Txid, (Transaction, u32, u32)>,
    mempool: Vec<Transaction>,
    /// Everything submitted through `sendrawtransaction`, in order
    broadcast: Vec<Transaction>,
    /// Broadcasts to fail with the missing-inputs code before succeeding
    broadcast_failures: u32,
}

impl MockChain {
    pub(crate) fn new(height: u64) -> MockChain {
        MockChain {
            state: Mutex::new(ChainState {
                height,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub(crate) fn mine(&self, tx: Transaction, block_height: u32, tx_index: u32) {
        let mut state = self.state.lock().unwrap();
        state
            .confirmed
            .insert(tx.txid(), (tx, block_height, tx_index));
    }

    pub(crate) fn add_mempool(&self, tx: Transaction) {
        self.state.lock().unwrap().mempool.push(tx);
    }

    pub(crate) fn broadcast_log(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().broadcast.clone()
    }

    pub(crate) fn fail_broadcasts(&self, times: u32) {
        self.state.lock().unwrap().broadcast_failures = times;
    }
}

impl ChainState {
    fn spent_in_chain(&self, outpoint: &OutPoint) -> bool {
        self.confirmed.values().any(|(tx, _, _)| {
            tx.input
                .iter()
                .any(|input| input.previous_output == *outpoint)
        })
    }

    fn spent_in_mempool(&self, outpoint: &OutPoint) -> bool {
        self.mempool.iter().any(|tx| {
            tx.input
                .iter()
                .any(|input| input.previous_output == *outpoint)
        })
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn get_block_count(&self) -> Result<u64, RpcError> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn get_raw_transaction(
        &self,
        txid: &Txid,
    ) -> Result<Option<Transaction>, RpcError> {
        let state = self.state.lock().unwrap();
        if let Some((tx, _, _)) = state.confirmed.get(txid) {
            return Ok(Some(tx.clone()));
        }
        Ok(state.mempool.iter().find(|tx| tx.txid() == *txid).cloned())
    }

    async fn get_tx_confirmations(
        &self,
        txid: &Txid,
    ) -> Result<Option<u32>, RpcError> {
        let state = self.state.lock().unwrap();
        if let Some((_, block_height, _)) = state.confirmed.get(txid) {
            let confirmations =
                (state.height as u32).saturating_sub(*block_height) + 1;
            return Ok(Some(confirmations));
        }
        if state.mempool.iter().any(|tx| tx.txid() == *txid) {
            return Ok(Some(0));
        }
        Ok(None)
    }

    async fn get_tx_position(
        &self,
        txid: &Txid,
    ) -> Result<Option<(u32, u32)>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .confirmed
            .get(txid)
            .map(|(_, block_height, tx_index)| (*block_height, *tx_index)))
    }

    async fn get_transaction_by_short_id(
        &self,
        block_height: u32,
        tx_index: u32,
    ) -> Result<Option<Transaction>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .confirmed
            .values()
            .find(|(_, height, index)| {
                *height == block_height && *index == tx_index
            })
            .map(|(tx, _, _)| tx.clone()))
    }

    async fn is_output_spendable(
        &self,
        txid: &Txid,
        output_index: u32,
        include_mempool: bool,
    ) -> Result<bool, RpcError> {
        let state = self.state.lock().unwrap();
        let outpoint = OutPoint::new(*txid, output_index);
        if state.spent_in_chain(&outpoint) {
            return Ok(false);
        }
        if include_mempool && state.spent_in_mempool(&outpoint) {
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_mempool(&self) -> Result<Vec<Transaction>, RpcError> {
        Ok(self.state.lock().unwrap().mempool.clone())
    }

    async fn look_for_spending_tx(
        &self,
        txid: &Txid,
        output_index: u32,
    ) -> Result<Option<Transaction>, RpcError> {
        let state = self.state.lock().unwrap();
        let outpoint = OutPoint::new(*txid, output_index);
        Ok(state
            .confirmed
            .values()
            .find(|(tx, _, _)| {
                tx.input
                    .iter()
                    .any(|input| input.previous_output == outpoint)
            })
            .map(|(tx, _, _)| tx.clone()))
    }

    async fn send_raw_transaction(
        &self,
        tx: &Transaction,
    ) -> Result<Txid, RpcError> {
        let mut state = self.state.lock().unwrap();
        if state.broadcast_failures > 0 {
            state.broadcast_failures -= 1;
            return Err(RpcError::Server {
                code: -25,
                message: s!("bad-txns-inputs-missingorspent"),
            });
        }
        state.broadcast.push(tx.clone());
        state.mempool.push(tx.clone());
        Ok(tx.txid())
    }
}
