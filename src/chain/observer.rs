use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Address, Amount, Transaction, Txid};
use futures::StreamExt as _;

use super::{broadcast_or_known, ChainBackend, Payment, TxStatus};
use crate::{OrdError, OrdResult};

/// What the chain says about a funding address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A confirmed payment of at least the expected amount.
    Funded(Payment),
    /// A large enough payment still waiting for confirmation.
    Unconfirmed(Payment),
    /// Paid, but less than expected; `best` is the largest payment seen.
    Underfunded { best: Payment, expected: Amount },
    NotFound,
}

/// Payment awaited on a funding address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub amount: Amount,
    /// Value of a parent inscription UTXO also sent to the address; outputs of exactly this
    /// value are never taken for the funding payment.
    pub parent: Option<Amount>,
}

impl Expected {
    pub fn with_parent(mut self, parent: Option<Amount>) -> Self {
        self.parent = parent;
        self
    }
}

impl From<Amount> for Expected {
    fn from(amount: Amount) -> Self {
        Self {
            amount,
            parent: None,
        }
    }
}

/// Answers whether funding addresses have been paid, bounding the calls in flight.
#[derive(Clone)]
pub struct ChainObserver {
    backend: Arc<dyn ChainBackend>,
    pool_size: usize,
    call_timeout: Duration,
    require_confirmation: bool,
}

impl ChainObserver {
    pub fn new(backend: Arc<dyn ChainBackend>, pool_size: usize, call_timeout: Duration) -> Self {
        Self {
            backend,
            pool_size: pool_size.max(1),
            call_timeout,
            require_confirmation: true,
        }
    }

    /// Accept payments still in the mempool as funding.
    pub fn accept_unconfirmed(mut self) -> Self {
        self.require_confirmation = false;
        self
    }

    pub fn backend(&self) -> &Arc<dyn ChainBackend> {
        &self.backend
    }

    pub async fn observe(
        &self,
        address: &Address,
        expected: impl Into<Expected>,
    ) -> OrdResult<Observation> {
        let payments = self
            .with_timeout("address payments", self.backend.address_payments(address))
            .await?;

        Ok(self.classify(&payments, expected.into()))
    }

    pub async fn transaction_status(&self, txid: &Txid) -> OrdResult<Option<TxStatus>> {
        self.with_timeout("transaction status", self.backend.transaction_status(txid))
            .await
    }

    pub async fn address_payments(&self, address: &Address) -> OrdResult<Vec<Payment>> {
        self.with_timeout("address payments", self.backend.address_payments(address))
            .await
    }

    /// Broadcasts `tx`; a transaction the backend already knows counts as broadcast.
    pub async fn broadcast(&self, tx: &Transaction) -> OrdResult<Txid> {
        self.with_timeout("broadcast", broadcast_or_known(self.backend.as_ref(), tx))
            .await
    }

    /// Observes every `(key, address, expected)` with at most `pool_size` calls in flight.
    ///
    /// Results come back in completion order.
    pub async fn observe_all<K>(
        &self,
        requests: Vec<(K, Address, Expected)>,
    ) -> Vec<(K, OrdResult<Observation>)>
    where
        K: Send,
    {
        futures::stream::iter(requests)
            .map(|(key, address, expected)| async move {
                let observation = self.observe(&address, expected).await;
                (key, observation)
            })
            .buffer_unordered(self.pool_size)
            .collect()
            .await
    }

    fn classify(&self, payments: &[Payment], expected: Expected) -> Observation {
        let payments = payments
            .iter()
            .filter(|payment| Some(payment.amount) != expected.parent)
            .collect::<Vec<_>>();
        let covering = |confirmed: bool| {
            payments
                .iter()
                .find(|payment| {
                    payment.amount >= expected.amount && payment.confirmed == confirmed
                })
                .map(|payment| **payment)
        };

        if let Some(payment) = covering(true) {
            return Observation::Funded(payment);
        }
        if let Some(payment) = covering(false) {
            return if self.require_confirmation {
                Observation::Unconfirmed(payment)
            } else {
                Observation::Funded(payment)
            };
        }

        match payments.iter().max_by_key(|payment| payment.amount) {
            Some(best) => Observation::Underfunded {
                best: **best,
                expected: expected.amount,
            },
            None => Observation::NotFound,
        }
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        call: impl Future<Output = OrdResult<T>>,
    ) -> OrdResult<T> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| OrdError::Transport(format!("{what}: timed out")))?
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Network;

    use super::*;
    use crate::utils::test_utils::{address, txid, MockChain};

    fn observer(chain: &Arc<MockChain>) -> ChainObserver {
        ChainObserver::new(chain.clone(), 4, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn should_distinguish_outcomes() {
        let chain = Arc::new(MockChain::default());
        let observer = observer(&chain);
        let funding = address(1, Network::Regtest);
        let expected = Amount::from_sat(10_000);

        assert_eq!(
            observer.observe(&funding, expected).await.unwrap(),
            Observation::NotFound
        );

        chain.pay(&funding, txid(1), 0, Amount::from_sat(4_000), true);
        assert!(matches!(
            observer.observe(&funding, expected).await.unwrap(),
            Observation::Underfunded { best, .. } if best.amount == Amount::from_sat(4_000)
        ));

        chain.pay(&funding, txid(2), 1, expected, false);
        assert!(matches!(
            observer.observe(&funding, expected).await.unwrap(),
            Observation::Unconfirmed(payment) if payment.txid == txid(2)
        ));
        assert!(matches!(
            observer
                .clone()
                .accept_unconfirmed()
                .observe(&funding, expected)
                .await
                .unwrap(),
            Observation::Funded(payment) if payment.txid == txid(2)
        ));

        chain.confirm(&txid(2));
        assert!(matches!(
            observer.observe(&funding, expected).await.unwrap(),
            Observation::Funded(payment) if payment.txid == txid(2) && payment.vout == 1
        ));
    }

    #[tokio::test]
    async fn parent_utxo_is_not_a_payment() {
        let chain = Arc::new(MockChain::default());
        let observer = observer(&chain);
        let funding = address(1, Network::Regtest);
        let parent = Amount::from_sat(20_000);
        let expected = Expected::from(Amount::from_sat(10_000)).with_parent(Some(parent));

        chain.pay(&funding, txid(1), 0, parent, true);
        assert_eq!(
            observer.observe(&funding, expected).await.unwrap(),
            Observation::NotFound
        );
        // without the parent value, the larger parent output would pass for the payment
        assert!(matches!(
            observer.observe(&funding, expected.amount).await.unwrap(),
            Observation::Funded(payment) if payment.txid == txid(1)
        ));

        chain.pay(&funding, txid(2), 0, expected.amount, true);
        assert!(matches!(
            observer.observe(&funding, expected).await.unwrap(),
            Observation::Funded(payment) if payment.txid == txid(2)
        ));
    }

    #[tokio::test]
    async fn transport_failure_is_not_not_found() {
        let chain = Arc::new(MockChain::default());
        chain.set_offline(true);

        assert!(matches!(
            observer(&chain)
                .observe(&address(1, Network::Regtest), Amount::from_sat(1))
                .await,
            Err(OrdError::Transport(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let chain = Arc::new(MockChain::default());
        chain.set_delay(Duration::from_secs(60));

        assert!(matches!(
            observer(&chain)
                .observe(&address(1, Network::Regtest), Amount::from_sat(1))
                .await,
            Err(OrdError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn should_observe_many_addresses() {
        let chain = Arc::new(MockChain::default());
        let observer = observer(&chain);
        let requests = (1..=10u8)
            .map(|seed| {
                let address = address(seed, Network::Regtest);
                if seed % 2 == 0 {
                    chain.pay(&address, txid(seed), 0, Amount::from_sat(1_000), true);
                }
                (seed, address, Amount::from_sat(1_000).into())
            })
            .collect::<Vec<_>>();

        let results = observer.observe_all(requests).await;

        assert_eq!(results.len(), 10);
        for (seed, observation) in results {
            let funded = matches!(observation.unwrap(), Observation::Funded(_));
            assert_eq!(funded, seed % 2 == 0);
        }
    }
}
