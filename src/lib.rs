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

//! Core of a Lightning Network node: the on-chain observer and the
//! gossip-driven payment router.
//!
//! Two cooperative actors own all mutable state:
//!
//! - [`chain::ChainWatcher`] tracks funding and commitment transactions on a
//!   Bitcoin backend, translates confirmations and spends into
//!   [`chain::WatchEvent`]s and schedules timelocked transaction publication;
//! - [`router::GossipRouter`] validates and stores the public channel graph
//!   and answers route requests over it.
//!
//! Both are spawned as tokio tasks and driven purely through their typed
//! mailboxes; the only shared mutable state is the best-known block count
//! atomic ([`events::ChainTip`]) and the broadcast event bus
//! ([`events::EventBus`]).

#[macro_use]
extern crate amplify;

pub extern crate lnwire as wire;

pub mod chain;
pub mod events;
pub mod router;
#[cfg(test)]
pub(crate) mod testkit;

pub use chain::{
    BitcoinEvent, ChainRpc, ChainWatcherHandle, EventSink, RpcError,
    ValidateResult, Watch, WatchEvent, WatcherConfig,
};
pub use events::{ChainTip, EventBus, NetworkEvent};
pub use router::{
    ChannelDesc, GossipRouter, Hop, NetworkStats, Peer, RebroadcastBatch,
    RouteError, RouterConf, RouterHandle,
};
