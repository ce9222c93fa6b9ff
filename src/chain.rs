//! Payment detection and broadcast against a chain data backend.

mod electrum;
mod indexer;
mod observer;

use bitcoin::{Address, Amount, Transaction, Txid};
use serde::{Deserialize, Serialize};

pub use self::electrum::ElectrumClient;
pub use self::indexer::IndexerClient;
pub use self::observer::{ChainObserver, Expected, Observation};
use crate::{OrdError, OrdResult};

/// Output paying an observed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub txid: Txid,
    pub vout: u32,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

/// Chain data service.
///
/// Failing to reach the service is always an `Err(OrdError::Transport)`; an address without
/// payments or an unknown transaction is a regular `Ok` answer.
#[async_trait::async_trait]
pub trait ChainBackend: Send + Sync {
    /// Outputs paying `address`, confirmed or in the mempool.
    async fn address_payments(&self, address: &Address) -> OrdResult<Vec<Payment>>;

    /// Submits `tx` to the network.
    async fn broadcast(&self, tx: &Transaction) -> OrdResult<Txid>;

    /// Status of `txid`, or `None` if the backend does not know it.
    async fn transaction_status(&self, txid: &Txid) -> OrdResult<Option<TxStatus>>;
}

/// Broadcasts `tx`, accepting a rejection when the transaction is already known to the backend.
pub async fn broadcast_or_known(backend: &dyn ChainBackend, tx: &Transaction) -> OrdResult<Txid> {
    let txid = tx.txid();

    match backend.broadcast(tx).await {
        Ok(txid) => Ok(txid),
        Err(OrdError::BroadcastRejected(reason)) => match backend.transaction_status(&txid).await? {
            Some(_) => {
                debug!("{txid} already known: {reason}");
                Ok(txid)
            }
            None => Err(OrdError::BroadcastRejected(reason)),
        },
        Err(err) => Err(err),
    }
}

pub(crate) fn transport<E: std::fmt::Display>(err: E) -> OrdError {
    OrdError::Transport(err.to_string())
}
