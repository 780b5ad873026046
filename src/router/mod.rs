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

//! Gossip ingestion, the validated network graph and route computation.

mod gossip;
mod graph;

pub use gossip::{
    GossipRouter, Peer, RebroadcastBatch, RouterConf, RouterHandle,
};
pub use graph::{ChannelDesc, Hop, NetworkStats, RouteError};
