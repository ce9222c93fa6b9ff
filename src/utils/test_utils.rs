use std::collections::HashMap;
use std::time::Duration;

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Amount, Network, OutPoint, PrivateKey, ScriptBuf, Transaction, TxOut, Txid};
use parking_lot::Mutex;

use super::fees::{dummy_key_spend_witness, template_transaction, unsigned_input};
use crate::chain::{ChainBackend, Payment, TxStatus};
use crate::{OrdError, OrdResult};

/// Deterministic P2WPKH address and its key.
pub fn keyed_address(seed: u8, network: Network) -> (Address, PrivateKey) {
    let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
    let private_key = PrivateKey::new(secret, network);
    let public_key = private_key.public_key(&Secp256k1::new());

    (Address::p2wpkh(&public_key, network).unwrap(), private_key)
}

pub fn address(seed: u8, network: Network) -> Address {
    keyed_address(seed, network).0
}

pub fn txid(n: u8) -> Txid {
    format!("{n:02x}").repeat(32).parse().unwrap()
}

/// A transaction paying `value` to `address`, unique per address and value.
pub fn dummy_transaction(address: &Address, value: u64) -> Transaction {
    template_transaction(
        vec![unsigned_input(
            OutPoint::new(txid(0xee), value as u32),
            dummy_key_spend_witness(),
        )],
        vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: address.script_pubkey(),
        }],
    )
}

/// In-memory chain: payments are credited by hand or by broadcasting.
#[derive(Default)]
pub struct MockChain {
    payments: Mutex<HashMap<ScriptBuf, Vec<Payment>>>,
    transactions: Mutex<HashMap<Txid, (Transaction, TxStatus)>>,
    broadcasted: Mutex<Vec<Transaction>>,
    offline: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    reject: Mutex<Option<String>>,
}

impl MockChain {
    pub fn pay(&self, address: &Address, txid: Txid, vout: u32, amount: Amount, confirmed: bool) {
        self.payments
            .lock()
            .entry(address.script_pubkey())
            .or_default()
            .push(Payment {
                txid,
                vout,
                amount,
                confirmed,
            });
    }

    /// Confirms a broadcasted transaction or a hand-made payment.
    pub fn confirm(&self, txid: &Txid) {
        if let Some((_, status)) = self.transactions.lock().get_mut(txid) {
            status.confirmed = true;
            status.block_height = Some(100);
        }
        for payments in self.payments.lock().values_mut() {
            for payment in payments.iter_mut().filter(|payment| payment.txid == *txid) {
                payment.confirmed = true;
            }
        }
    }

    pub fn broadcasted(&self) -> Vec<Transaction> {
        self.broadcasted.lock().clone()
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn reject_broadcasts(&self, reason: &str) {
        *self.reject.lock() = Some(reason.to_string());
    }

    async fn reach(&self) -> OrdResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.offline.lock() {
            return Err(OrdError::Transport("mock chain offline".to_string()));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl ChainBackend for MockChain {
    async fn address_payments(&self, address: &Address) -> OrdResult<Vec<Payment>> {
        self.reach().await?;

        Ok(self
            .payments
            .lock()
            .get(&address.script_pubkey())
            .cloned()
            .unwrap_or_default())
    }

    async fn broadcast(&self, tx: &Transaction) -> OrdResult<Txid> {
        self.reach().await?;

        let txid = tx.txid();
        if self.transactions.lock().contains_key(&txid) {
            return Err(OrdError::BroadcastRejected(
                "txn-already-known".to_string(),
            ));
        }
        if let Some(reason) = self.reject.lock().clone() {
            return Err(OrdError::BroadcastRejected(reason));
        }

        self.transactions.lock().insert(
            txid,
            (
                tx.clone(),
                TxStatus {
                    confirmed: false,
                    block_height: None,
                },
            ),
        );
        self.broadcasted.lock().push(tx.clone());

        let mut payments = self.payments.lock();
        for (vout, output) in tx.output.iter().enumerate() {
            payments
                .entry(output.script_pubkey.clone())
                .or_default()
                .push(Payment {
                    txid,
                    vout: vout as u32,
                    amount: output.value,
                    confirmed: false,
                });
        }

        Ok(txid)
    }

    async fn transaction_status(&self, txid: &Txid) -> OrdResult<Option<TxStatus>> {
        self.reach().await?;

        Ok(self
            .transactions
            .lock()
            .get(txid)
            .map(|(_, status)| *status))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generate_btc_address() {
        let (address, private_key) = keyed_address(3, Network::Bitcoin);

        assert_eq!(address.script_pubkey().to_bytes().len(), 22);
        assert_eq!(private_key.network, Network::Bitcoin);
    }

    #[tokio::test]
    async fn broadcast_credits_outputs() {
        let chain = MockChain::default();
        let funding = address(1, Network::Regtest);
        let tx = dummy_transaction(&funding, 2_000);

        chain.broadcast(&tx).await.unwrap();
        chain.confirm(&tx.txid());

        let payments = chain.address_payments(&funding).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert!(payments[0].confirmed);
        assert!(chain
            .transaction_status(&tx.txid())
            .await
            .unwrap()
            .unwrap()
            .confirmed);
    }
}
