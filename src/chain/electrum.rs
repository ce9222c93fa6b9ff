use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Address, Script, Transaction, Txid};
use electrum_client::{Client, ConfigBuilder, ElectrumApi};

use super::{transport, ChainBackend, Payment, TxStatus};
use crate::{OrdError, OrdResult};

/// Chain backend over an Electrum server.
///
/// The underlying client is blocking, so every call runs on the blocking pool under the
/// call timeout.
pub struct ElectrumClient {
    client: Arc<Client>,
    timeout: Duration,
}

/// Whether the server answered that it does not know the transaction, as opposed to failing.
fn is_unknown_transaction(err: &electrum_client::Error) -> bool {
    match err {
        electrum_client::Error::Protocol(value) => {
            let message = value.to_string().to_lowercase();
            message.contains("no such mempool or blockchain transaction")
                || message.contains("not found")
        }
        _ => false,
    }
}

/// Outputs of `transactions` paying `script`; a height above zero means confirmed.
fn script_payments(
    script: &Script,
    transactions: impl IntoIterator<Item = (Transaction, i32)>,
) -> Vec<Payment> {
    transactions
        .into_iter()
        .flat_map(|(tx, height)| {
            let txid = tx.txid();
            tx.output
                .into_iter()
                .enumerate()
                .filter(|(_, output)| output.script_pubkey.as_script() == script)
                .map(move |(vout, output)| Payment {
                    txid,
                    vout: vout as u32,
                    amount: output.value,
                    confirmed: height > 0,
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

impl ElectrumClient {
    /// Connects to `url`, either `tcp://host:port`, `ssl://host:port` or a bare `host:port`
    /// for plain TCP.
    pub async fn connect(url: &str, timeout: Duration) -> OrdResult<Self> {
        let config = ConfigBuilder::new()
            .timeout(Some(timeout.as_secs().clamp(1, u8::MAX as u64) as u8))
            .build();
        let url = url.to_string();

        let client = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || Client::from_config(&url, config)),
        )
        .await
        .map_err(|_| OrdError::Transport("electrum connect: timed out".to_string()))?
        .map_err(transport)?
        .map_err(transport)?;

        Ok(Self {
            client: Arc::new(client),
            timeout,
        })
    }

    /// Runs `call` on the blocking pool. The inner result is the server's answer.
    async fn call<T, F>(
        &self,
        what: &str,
        call: F,
    ) -> OrdResult<Result<T, electrum_client::Error>>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T, electrum_client::Error> + Send + 'static,
    {
        let client = self.client.clone();
        let task = tokio::task::spawn_blocking(move || call(&client));

        tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| OrdError::Transport(format!("{what}: timed out")))?
            .map_err(|err| OrdError::Transport(format!("{what}: {err}")))
    }

    async fn history(&self, script: &Script) -> OrdResult<Vec<(Txid, i32)>> {
        let script = script.to_owned();
        let history = self
            .call("script history", move |client| client.script_get_history(&script))
            .await?
            .map_err(transport)?;

        Ok(history
            .into_iter()
            .map(|item| (item.tx_hash, item.height))
            .collect())
    }

    async fn transaction(&self, txid: &Txid) -> OrdResult<Option<Transaction>> {
        let txid = *txid;
        match self
            .call("transaction", move |client| client.transaction_get(&txid))
            .await?
        {
            Ok(tx) => Ok(Some(tx)),
            Err(err) if is_unknown_transaction(&err) => {
                debug!("transaction {txid} not found: {err}");
                Ok(None)
            }
            Err(err) => Err(transport(err)),
        }
    }
}

#[async_trait::async_trait]
impl ChainBackend for ElectrumClient {
    async fn address_payments(&self, address: &Address) -> OrdResult<Vec<Payment>> {
        let script_pubkey = address.script_pubkey();

        let mut transactions = Vec::new();
        for (txid, height) in self.history(&script_pubkey).await? {
            let tx = self.transaction(&txid).await?.ok_or_else(|| {
                OrdError::Transport(format!("history lists unknown {txid}"))
            })?;
            transactions.push((tx, height));
        }

        Ok(script_payments(&script_pubkey, transactions))
    }

    async fn broadcast(&self, tx: &Transaction) -> OrdResult<Txid> {
        let tx = tx.clone();

        match self
            .call("broadcast", move |client| client.transaction_broadcast(&tx))
            .await?
        {
            Ok(txid) => Ok(txid),
            Err(electrum_client::Error::Protocol(reason)) => {
                Err(OrdError::BroadcastRejected(reason.to_string()))
            }
            Err(err) => Err(transport(err)),
        }
    }

    async fn transaction_status(&self, txid: &Txid) -> OrdResult<Option<TxStatus>> {
        let Some(tx) = self.transaction(txid).await? else {
            return Ok(None);
        };

        // the height is only exposed through the history of a script the transaction pays
        let Some(output) = tx.output.first() else {
            return Ok(Some(TxStatus {
                confirmed: false,
                block_height: None,
            }));
        };
        let height = self
            .history(&output.script_pubkey)
            .await?
            .into_iter()
            .find(|(hash, _)| hash == txid)
            .map(|(_, height)| height)
            .filter(|height| *height > 0);

        Ok(Some(TxStatus {
            confirmed: height.is_some(),
            block_height: height.map(|height| height as u32),
        }))
    }
}
