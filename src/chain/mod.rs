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

//! Blockchain monitoring: watches over funding and commitment transactions,
//! confirmation tracking and timelocked transaction publication.

mod rpc;
mod watcher;

use std::collections::BTreeMap;
use std::time::Duration;

use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::blockdata::script::Builder;
use bitcoin::{Script, Transaction, Txid};
use secp256k1::PublicKey;
use tokio::sync::mpsc;

use crate::wire::{ChannelAnnouncement, ShortChannelId};

pub use rpc::{ChainRpc, RpcError, TxWithMeta};
pub use watcher::{ChainWatcher, ChainWatcherHandle};

/// nLockTime values below this threshold are block heights, above it they
/// are unix timestamps.
const LOCKTIME_THRESHOLD: u32 = 500_000_000;

// BIP-68 sequence field semantics
const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// What a firing watch means to its consumer.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum BitcoinEvent {
    /// The funding transaction reached its announced minimum depth
    #[display("funding_depth_ok")]
    FundingDepthOk,

    /// The funding transaction is buried deep enough to announce the channel
    #[display("funding_deeply_buried")]
    FundingDeeplyBuried,

    /// The funding output of one of our channels was spent
    #[display("funding_spent")]
    FundingSpent,

    /// A commitment transaction output was spent
    #[display("commitment_spent")]
    CommitmentSpent,

    /// A relative-timelock parent of a transaction queued for publication
    /// reached the required depth; carries the child awaiting publication
    #[display("parent_tx_confirmed(...)")]
    ParentTxConfirmed(Transaction),

    /// The funding output of an announced remote channel was spent
    #[display("external_channel_spent({0})")]
    ExternalChannelSpent(ShortChannelId),
}

/// A standing request to be told about an on-chain condition.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum Watch {
    /// Fires once when the output appears spent; the output may already be
    /// spent at registration time
    #[display("watch_spent_basic({tx_id}:{output_index}, {event})")]
    SpentBasic {
        tx_id: Txid,
        output_index: u32,
        event: BitcoinEvent,
    },

    /// Fires on every spending transaction observed; never expires
    #[display("watch_spent({tx_id}:{output_index}, {event})")]
    Spent {
        tx_id: Txid,
        output_index: u32,
        event: BitcoinEvent,
    },

    /// Fires once when the transaction reaches `min_depth` confirmations
    #[display("watch_confirmed({tx_id}, depth={min_depth}, {event})")]
    Confirmed {
        tx_id: Txid,
        min_depth: u32,
        event: BitcoinEvent,
    },

    /// Reserved watch kind for transactions evicted from the chain; not
    /// supported and silently ignored on registration
    #[display("watch_lost({tx_id})")]
    Lost { tx_id: Txid },
}

/// Notification delivered to the consumer registered with a [`Watch`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WatchEvent {
    SpentBasic {
        event: BitcoinEvent,
    },
    Spent {
        event: BitcoinEvent,
        spending_tx: Transaction,
    },
    Confirmed {
        event: BitcoinEvent,
        block_height: u32,
        tx_index: u32,
        tx: Transaction,
    },
}

/// Consumer side of a watch: an unbounded sender of [`WatchEvent`]s.
///
/// The watcher holds these as weak capabilities: once the receiving half is
/// dropped the associated watches are silently reaped.
pub type EventSink = mpsc::UnboundedSender<WatchEvent>;

/// Outcome of the on-chain validation of a channel announcement.
#[derive(Clone, Debug)]
pub struct ValidateResult {
    pub announcement: ChannelAnnouncement,
    /// The transaction located by the short channel id, when retrievable
    pub funding_tx: Option<Transaction>,
    /// Whether the funding output is currently unspent
    pub unspent: bool,
}

/// Tunables of the chain watcher.
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Delay between a new-block notification and the re-evaluation tick,
    /// coalescing block storms
    pub tick_debounce: Duration,

    /// Back-off before the single retry of a broadcast rejected for missing
    /// inputs
    pub broadcast_retry_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            tick_debounce: Duration::from_secs(2),
            broadcast_retry_delay: Duration::from_secs(3),
        }
    }
}

/// Funding output script of a channel: p2wsh over the 2-of-2 multisig of the
/// announced bitcoin keys, in announcement order.
pub fn funding_script(
    bitcoin_key_1: &PublicKey,
    bitcoin_key_2: &PublicKey,
) -> Script {
    Builder::new()
        .push_int(2)
        .push_slice(&bitcoin_key_1.serialize())
        .push_slice(&bitcoin_key_2.serialize())
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
        .to_v0_p2wsh()
}

/// Absolute timelock of a transaction as a block height; zero when the
/// transaction is final or time-locked by wall clock.
pub fn cltv_timeout(tx: &Transaction) -> u32 {
    let lock_time = tx.lock_time.0;
    if lock_time < LOCKTIME_THRESHOLD {
        lock_time
    } else {
        0
    }
}

/// Height-based relative timelocks of a transaction, keyed by the parent
/// whose confirmation depth satisfies them. Empty for version-1
/// transactions and time-based locks.
pub fn csv_timeouts(tx: &Transaction) -> BTreeMap<Txid, u32> {
    let mut timeouts = BTreeMap::new();
    if tx.version < 2 {
        return timeouts;
    }
    for input in &tx.input {
        let sequence = input.sequence.0;
        if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0
            || sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0
        {
            continue;
        }
        let delay = sequence & SEQUENCE_LOCKTIME_MASK;
        if delay == 0 {
            continue;
        }
        let parent = input.previous_output.txid;
        let entry = timeouts.entry(parent).or_insert(0);
        if *entry < delay {
            *entry = delay;
        }
    }
    timeouts
}

#[cfg(test)]
mod test {
    use bitcoin::{OutPoint, PackedLockTime, Sequence, TxIn, Witness};
    use secp256k1::{SecretKey, SECP256K1};

    use super::*;

    fn tx_with(
        version: i32,
        lock_time: u32,
        sequences: Vec<(Txid, Sequence)>,
    ) -> Transaction {
        Transaction {
            version,
            lock_time: PackedLockTime(lock_time),
            input: sequences
                .into_iter()
                .map(|(txid, sequence)| TxIn {
                    previous_output: OutPoint::new(txid, 0),
                    script_sig: Script::new(),
                    sequence,
                    witness: Witness::default(),
                })
                .collect(),
            output: vec![],
        }
    }

    fn txid(byte: u8) -> Txid {
        use bitcoin::hashes::Hash;
        Txid::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn cltv_timeout_reads_height_locktimes_only() {
        assert_eq!(cltv_timeout(&tx_with(2, 0, vec![])), 0);
        assert_eq!(cltv_timeout(&tx_with(2, 105, vec![])), 105);
        assert_eq!(cltv_timeout(&tx_with(2, 1_600_000_000, vec![])), 0);
    }

    #[test]
    fn csv_timeouts_follow_bip68() {
        let parent_a = txid(0xaa);
        let parent_b = txid(0xbb);
        let tx = tx_with(2, 0, vec![
            (parent_a, Sequence(144)),
            (parent_a, Sequence(72)),
            (parent_b, Sequence(SEQUENCE_LOCKTIME_DISABLE_FLAG | 10)),
            (parent_b, Sequence(SEQUENCE_LOCKTIME_TYPE_FLAG | 10)),
        ]);
        let timeouts = csv_timeouts(&tx);
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[&parent_a], 144);

        // version 1 transactions have no relative locks
        let tx = tx_with(1, 0, vec![(parent_a, Sequence(144))]);
        assert!(csv_timeouts(&tx).is_empty());
    }

    #[test]
    fn funding_script_is_p2wsh_of_multisig() {
        let key_1 = PublicKey::from_secret_key(
            SECP256K1,
            &SecretKey::from_slice(&[0x11; 32]).unwrap(),
        );
        let key_2 = PublicKey::from_secret_key(
            SECP256K1,
            &SecretKey::from_slice(&[0x22; 32]).unwrap(),
        );
        let script = funding_script(&key_1, &key_2);
        assert!(script.is_v0_p2wsh());
        // key order is the announcement order
        assert_ne!(script, funding_script(&key_2, &key_1));
    }
}
