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

//! Asynchronous Bitcoin backend abstraction consumed by the chain watcher.
//!
//! Implementations sit on top of a bitcoind-style RPC interface
//! (`getblockcount`, `getrawtransaction`, `gettxout`, `getrawmempool`,
//! `sendrawtransaction`, block/short-id lookups); the watcher never assumes
//! more than the calls modelled here.

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};

/// bitcoind rejects transactions spending unknown inputs with this code.
const RPC_MISSING_INPUTS: i32 = -25;

/// Chain backend failures.
///
/// These are always transient from the watcher's point of view: they are
/// logged and the triggering work is retried on the next tick.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum RpcError {
    /// transport failure talking to the bitcoin backend: {0}
    Connection(String),

    /// bitcoin backend rejected the call with code {code}: {message}
    Server { code: i32, message: String },

    /// malformed response from the bitcoin backend: {0}
    Malformed(String),
}

impl RpcError {
    /// Whether the error is the mempool race on broadcast: the transaction
    /// spends outputs the backend does not know yet.
    pub fn is_missing_inputs(&self) -> bool {
        matches!(self, RpcError::Server { code, .. } if *code == RPC_MISSING_INPUTS)
    }
}

/// A transaction together with best-effort block metadata.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxWithMeta {
    pub tx: Transaction,
    /// Block height of the containing block, when confirmed
    pub block_height: Option<u32>,
    /// Position within the containing block, when confirmed
    pub tx_index: Option<u32>,
    pub confirmations: u32,
}

/// The Bitcoin RPC surface the node core consumes.
#[async_trait]
pub trait ChainRpc: Send + Sync + 'static {
    /// Current best block count.
    async fn get_block_count(&self) -> Result<u64, RpcError>;

    /// A transaction by id, looking at both chain and mempool.
    async fn get_raw_transaction(
        &self,
        txid: &Txid,
    ) -> Result<Option<Transaction>, RpcError>;

    /// Number of confirmations of a transaction; `Some(0)` for mempool
    /// transactions, `None` for unknown ones.
    async fn get_tx_confirmations(
        &self,
        txid: &Txid,
    ) -> Result<Option<u32>, RpcError>;

    /// Block height and in-block index of a confirmed transaction.
    async fn get_tx_position(
        &self,
        txid: &Txid,
    ) -> Result<Option<(u32, u32)>, RpcError>;

    /// The transaction at the given block height and in-block index, the
    /// short-channel-id lookup.
    async fn get_transaction_by_short_id(
        &self,
        block_height: u32,
        tx_index: u32,
    ) -> Result<Option<Transaction>, RpcError>;

    /// Whether the output is unspent, optionally considering mempool
    /// spenders.
    async fn is_output_spendable(
        &self,
        txid: &Txid,
        output_index: u32,
        include_mempool: bool,
    ) -> Result<bool, RpcError>;

    /// Full mempool contents.
    async fn get_mempool(&self) -> Result<Vec<Transaction>, RpcError>;

    /// Scans recent blocks for the transaction spending the given output.
    async fn look_for_spending_tx(
        &self,
        txid: &Txid,
        output_index: u32,
    ) -> Result<Option<Transaction>, RpcError>;

    /// Broadcasts a signed transaction.
    async fn send_raw_transaction(
        &self,
        tx: &Transaction,
    ) -> Result<Txid, RpcError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_inputs_classification() {
        let race = RpcError::Server {
            code: RPC_MISSING_INPUTS,
            message: s!("bad-txns-inputs-missingorspent"),
        };
        assert!(race.is_missing_inputs());
        assert!(!RpcError::Connection(s!("timeout")).is_missing_inputs());
        assert!(!RpcError::Server {
            code: -26,
            message: s!("txn-mempool-conflict")
        }
        .is_missing_inputs());
    }
}
