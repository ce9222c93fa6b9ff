use std::str::FromStr;
use std::time::Duration;

use bitcoin::{Address, Amount, Transaction, Txid};
use reqwest::StatusCode;
use serde::Deserialize;

use super::{transport, ChainBackend, Payment, TxStatus};
use crate::fee_oracle::{FeeSource, RecommendedFees};
use crate::{OrdError, OrdResult};

/// Esplora / mempool.space REST client.
pub struct IndexerClient {
    client: reqwest::Client,
    base_url: String,
}

impl IndexerClient {
    /// `base_url` is the API root, e.g. `https://mempool.space/testnet/api`.
    pub fn new(base_url: impl ToString, timeout: Duration) -> OrdResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrdError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.to_string().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> OrdResult<Option<T>> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.get(&url).send().await.map_err(transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(OrdError::Transport(format!(
                "GET {url}: {}",
                response.status()
            )));
        }

        response.json().await.map(Some).map_err(transport)
    }
}

#[derive(Debug, Deserialize)]
struct ApiTransaction {
    txid: Txid,
    vout: Vec<ApiVout>,
    status: ApiStatus,
}

#[derive(Debug, Deserialize)]
struct ApiVout {
    scriptpubkey: String,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    confirmed: bool,
    block_height: Option<u32>,
}

fn payments_to(address: &Address, transactions: &[ApiTransaction]) -> Vec<Payment> {
    let script_hex = hex::encode(address.script_pubkey().as_bytes());

    transactions
        .iter()
        .flat_map(|tx| {
            tx.vout
                .iter()
                .enumerate()
                .filter(|(_, vout)| vout.scriptpubkey == script_hex)
                .map(|(index, vout)| Payment {
                    txid: tx.txid,
                    vout: index as u32,
                    amount: Amount::from_sat(vout.value),
                    confirmed: tx.status.confirmed,
                })
        })
        .collect()
}

#[async_trait::async_trait]
impl ChainBackend for IndexerClient {
    async fn address_payments(&self, address: &Address) -> OrdResult<Vec<Payment>> {
        let transactions: Vec<ApiTransaction> = self
            .get_json(&format!("/address/{address}/txs"))
            .await?
            .unwrap_or_default();

        Ok(payments_to(address, &transactions))
    }

    async fn broadcast(&self, tx: &Transaction) -> OrdResult<Txid> {
        let url = format!("{}/tx", self.base_url);
        let tx_hex = hex::encode(bitcoin::consensus::serialize(tx));
        debug!("tx_hex ({}): {tx_hex}", tx_hex.len());

        let response = self
            .client
            .post(&url)
            .body(tx_hex)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if status.is_success() {
            Txid::from_str(body.trim()).map_err(|e| OrdError::Parse(e.to_string()))
        } else if status.is_client_error() {
            Err(OrdError::BroadcastRejected(body))
        } else {
            Err(OrdError::Transport(format!("POST {url}: {status}")))
        }
    }

    async fn transaction_status(&self, txid: &Txid) -> OrdResult<Option<TxStatus>> {
        let status: Option<ApiStatus> = self.get_json(&format!("/tx/{txid}/status")).await?;

        Ok(status.map(|status| TxStatus {
            confirmed: status.confirmed,
            block_height: status.block_height,
        }))
    }
}

#[async_trait::async_trait]
impl FeeSource for IndexerClient {
    async fn recommended_fees(&self) -> OrdResult<RecommendedFees> {
        self.get_json("/v1/fees/recommended")
            .await?
            .ok_or_else(|| OrdError::Transport("recommended fees unavailable".to_string()))
    }
}
