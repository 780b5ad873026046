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

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code
)]

//! Lightning network wire formats consumed and produced by the node core:
//! identifiers, BOLT-9 feature vectors, BOLT-2 channel types, BOLT-7 gossip
//! messages and the BOLT-11 invoice codec.

#[macro_use]
extern crate amplify;

pub mod bolt11;
pub mod bolt2;
pub mod bolt7;
pub mod bolt9;
pub mod types;

pub use bolt2::{ChannelFeatures, ChannelType, CommitmentFormat};
pub use bolt7::{
    ChannelAnnouncement, ChannelUpdate, Direction, ErrorMessage, GossipMessage,
    NodeAnnouncement, SignatureError,
};
pub use bolt9::{Feature, FeatureSupport, Features};
pub use types::{
    AddressList, Alias, ChannelId, NetAddress, NodeColor, ShortChannelId,
};
