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

//! BOLT-7 gossip messages.
//!
//! Messages arrive from and leave to the peer transport as typed values; the
//! byte forms constructed here are the BOLT-7 message bodies minus their
//! signatures, which is exactly what gossip signatures commit to (as a double
//! SHA256).

use amplify::flags::FlagVec;
use amplify::{Slice32, Wrapper};
use bitcoin::hashes::{sha256d, Hash};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use crate::bolt9::Features;
use crate::types::{AddressList, Alias, ChannelId, NodeColor, ShortChannelId};

/// Bit 0 of `channel_flags`: the direction the update applies to.
pub const CHANNEL_FLAG_DIRECTION: u8 = 0x01;
/// Bit 1 of `channel_flags`: the channel is temporarily disabled.
pub const CHANNEL_FLAG_DISABLED: u8 = 0x02;

/// Gossip signature verification failures.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum SignatureError {
    /// signature does not verify against the announced key
    InvalidSignature,

    /// node ids of a channel announcement are not in lexicographic order
    UnorderedNodeIds,
}

/// All-zero compact signature used as a placeholder until a message is
/// signed.
pub fn no_signature() -> Signature {
    Signature::from_compact(&[0u8; 64])
        .expect("all-zero compact signature is structurally valid")
}

fn message_from_body(body: &[u8]) -> Message {
    let digest = sha256d::Hash::hash(body);
    Message::from_slice(&digest.into_inner())
        .expect("32-byte digest always makes a valid message")
}

fn write_features(buf: &mut Vec<u8>, features: &Features) {
    let flags = FlagVec::from(features);
    let bytes = flags.as_inner();
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// This gossip message contains ownership information regarding a channel.
/// It ties each on-chain Bitcoin key to the associated Lightning node key,
/// and vice-versa. The channel is not practically usable until at least one
/// side has announced its fee levels and expiry, using `channel_update`.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display("channel_announcement({chain_hash}, {short_channel_id}, ...)")]
pub struct ChannelAnnouncement {
    /// Node Signature 1
    pub node_signature_1: Signature,

    /// Node Signature 2
    pub node_signature_2: Signature,

    /// Bitcoin Signature 1
    pub bitcoin_signature_1: Signature,

    /// Bitcoin Signature 2
    pub bitcoin_signature_2: Signature,

    /// feature bytes
    pub features: Features,

    /// chain hash
    pub chain_hash: Slice32,

    /// Short channel ID
    pub short_channel_id: ShortChannelId,

    /// Node Id 1
    pub node_id_1: PublicKey,

    /// Node Id 2
    pub node_id_2: PublicKey,

    /// Bitcoin key 1
    pub bitcoin_key_1: PublicKey,

    /// Bitcoin key 2
    pub bitcoin_key_2: PublicKey,
}

impl ChannelAnnouncement {
    /// Message the four signatures commit to.
    pub fn signature_hash(&self) -> Message {
        let mut body = Vec::with_capacity(178);
        write_features(&mut body, &self.features);
        body.extend_from_slice(self.chain_hash.as_inner());
        body.extend_from_slice(&self.short_channel_id.to_u64().to_be_bytes());
        body.extend_from_slice(&self.node_id_1.serialize());
        body.extend_from_slice(&self.node_id_2.serialize());
        body.extend_from_slice(&self.bitcoin_key_1.serialize());
        body.extend_from_slice(&self.bitcoin_key_2.serialize());
        message_from_body(&body)
    }

    /// Checks node id ordering and all four signatures.
    pub fn verify(&self) -> Result<(), SignatureError> {
        if self.node_id_1.serialize() >= self.node_id_2.serialize() {
            return Err(SignatureError::UnorderedNodeIds);
        }
        let msg = self.signature_hash();
        for (signature, key) in [
            (&self.node_signature_1, &self.node_id_1),
            (&self.node_signature_2, &self.node_id_2),
            (&self.bitcoin_signature_1, &self.bitcoin_key_1),
            (&self.bitcoin_signature_2, &self.bitcoin_key_2),
        ] {
            SECP256K1
                .verify_ecdsa(&msg, signature, key)
                .map_err(|_| SignatureError::InvalidSignature)?;
        }
        Ok(())
    }

    /// Produces the four signatures from the corresponding secret keys.
    pub fn sign(
        &mut self,
        node_key_1: &SecretKey,
        node_key_2: &SecretKey,
        bitcoin_key_1: &SecretKey,
        bitcoin_key_2: &SecretKey,
    ) {
        let msg = self.signature_hash();
        self.node_signature_1 = SECP256K1.sign_ecdsa(&msg, node_key_1);
        self.node_signature_2 = SECP256K1.sign_ecdsa(&msg, node_key_2);
        self.bitcoin_signature_1 = SECP256K1.sign_ecdsa(&msg, bitcoin_key_1);
        self.bitcoin_signature_2 = SECP256K1.sign_ecdsa(&msg, bitcoin_key_2);
    }

    pub fn contains_node(&self, node_id: &PublicKey) -> bool {
        self.node_id_1 == *node_id || self.node_id_2 == *node_id
    }
}

/// This gossip message allows a node to indicate extra data associated with
/// it, in addition to its public key. To avoid trivial denial of service
/// attacks, nodes not associated with an already known channel are ignored.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display("node_announcement({node_id}, {alias}, {addresses}, ...)")]
pub struct NodeAnnouncement {
    /// Signature
    pub signature: Signature,

    /// feature bytes
    pub features: Features,

    /// Time stamp
    pub timestamp: u32,

    /// Node Id
    pub node_id: PublicKey,

    /// RGB colour code
    pub rgb_color: NodeColor,

    /// Node Alias
    pub alias: Alias,

    /// Node address
    pub addresses: AddressList,
}

impl NodeAnnouncement {
    /// Message the node signature commits to.
    pub fn signature_hash(&self) -> Message {
        let mut body = Vec::with_capacity(128);
        write_features(&mut body, &self.features);
        body.extend_from_slice(&self.timestamp.to_be_bytes());
        body.extend_from_slice(&self.node_id.serialize());
        body.extend_from_slice(&self.rgb_color.to_array());
        body.extend_from_slice(&self.alias.to_array());
        self.addresses.write_to(&mut body);
        message_from_body(&body)
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        SECP256K1
            .verify_ecdsa(&self.signature_hash(), &self.signature, &self.node_id)
            .map_err(|_| SignatureError::InvalidSignature)
    }

    pub fn sign(&mut self, node_key: &SecretKey) {
        self.signature = SECP256K1.sign_ecdsa(&self.signature_hash(), node_key);
    }
}

/// After a channel has been initially announced, each side independently
/// announces the fees and minimum expiry delta it requires to relay HTLCs
/// through this channel. Each uses the 8-byte channel `shortid` that matches
/// the `channel_announcement` and the 1-bit `channel_flags` field to indicate
/// which end of the channel it's on (origin or final). A node can do this
/// multiple times, in order to change fees.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[display("channel_update({chain_hash}, {short_channel_id}, {timestamp}, ...)")]
pub struct ChannelUpdate {
    /// Signature
    pub signature: Signature,

    /// Chainhash
    pub chain_hash: Slice32,

    /// Short Channel Id
    pub short_channel_id: ShortChannelId,

    /// Time stamp
    pub timestamp: u32,

    /// message flags
    pub message_flags: u8,

    /// channel flags
    pub channel_flags: u8,

    /// CLTV expiry delta
    pub cltv_expiry_delta: u16,

    /// minimum HTLC in msat
    pub htlc_minimum_msat: u64,

    /// base fee in msat
    pub fee_base_msat: u32,

    /// fee proportional millionth
    pub fee_proportional_millionths: u32,

    /// Used only if `option_channel_htlc_max` in `message_flags` is set
    pub htlc_maximum_msat: u64,
}

/// The direction an update applies to, named after the ordered node ids of
/// the channel announcement.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Direction {
    /// From the lexicographically lesser node id to the greater one
    #[display("node1->node2")]
    Node1ToNode2,

    /// From the lexicographically greater node id to the lesser one
    #[display("node2->node1")]
    Node2ToNode1,
}

impl ChannelUpdate {
    pub fn direction(&self) -> Direction {
        if self.channel_flags & CHANNEL_FLAG_DIRECTION == 0 {
            Direction::Node1ToNode2
        } else {
            Direction::Node2ToNode1
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.channel_flags & CHANNEL_FLAG_DISABLED != 0
    }

    /// Message the signature commits to.
    pub fn signature_hash(&self) -> Message {
        let mut body = Vec::with_capacity(80);
        body.extend_from_slice(self.chain_hash.as_inner());
        body.extend_from_slice(&self.short_channel_id.to_u64().to_be_bytes());
        body.extend_from_slice(&self.timestamp.to_be_bytes());
        body.push(self.message_flags);
        body.push(self.channel_flags);
        body.extend_from_slice(&self.cltv_expiry_delta.to_be_bytes());
        body.extend_from_slice(&self.htlc_minimum_msat.to_be_bytes());
        body.extend_from_slice(&self.fee_base_msat.to_be_bytes());
        body.extend_from_slice(&self.fee_proportional_millionths.to_be_bytes());
        body.extend_from_slice(&self.htlc_maximum_msat.to_be_bytes());
        message_from_body(&body)
    }

    /// Verifies the signature against the node the update originates from.
    pub fn verify(&self, from_node: &PublicKey) -> Result<(), SignatureError> {
        SECP256K1
            .verify_ecdsa(&self.signature_hash(), &self.signature, from_node)
            .map_err(|_| SignatureError::InvalidSignature)
    }

    pub fn sign(&mut self, node_key: &SecretKey) {
        self.signature = SECP256K1.sign_ecdsa(&self.signature_hash(), node_key);
    }
}

/// Peer-level error reply, sent back to the originator of a message which
/// failed validation.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display("error({channel_id:?}, {data})")]
pub struct ErrorMessage {
    /// Channel the error applies to; `None` refers to the whole connection
    pub channel_id: Option<ChannelId>,

    /// Human-readable diagnostics
    pub data: String,
}

/// The gossip message kinds the router ingests and rebroadcasts.
#[derive(Clone, PartialEq, Eq, Debug, Display, From)]
pub enum GossipMessage {
    #[display("{0}")]
    #[from]
    ChannelAnnouncement(ChannelAnnouncement),

    #[display("{0}")]
    #[from]
    NodeAnnouncement(NodeAnnouncement),

    #[display("{0}")]
    #[from]
    ChannelUpdate(ChannelUpdate),
}

impl GossipMessage {
    /// Short channel id the message refers to, where one exists.
    pub fn short_channel_id(&self) -> Option<ShortChannelId> {
        match self {
            GossipMessage::ChannelAnnouncement(ann) => {
                Some(ann.short_channel_id)
            }
            GossipMessage::ChannelUpdate(update) => {
                Some(update.short_channel_id)
            }
            GossipMessage::NodeAnnouncement(_) => None,
        }
    }
}
