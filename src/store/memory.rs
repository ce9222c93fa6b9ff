use std::collections::HashMap;

use bitcoin::{Amount, Txid};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::funding::{
    FundedItem, FundingChange, FundingRequest, FundingStatus, FundingStore, FundingSummary,
    PollItem, Transition,
};
use super::query;
use crate::{OrdError, OrdResult};

pub(super) const CHANGE_STREAM_CAPACITY: usize = 1024;

/// Funding store held in memory.
///
/// Every operation runs under one write lock, which makes each conditional write atomic.
pub struct MemoryFundingStore {
    records: RwLock<HashMap<String, FundingRequest>>,
    changes: broadcast::Sender<FundingChange>,
}

impl Default for MemoryFundingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFundingStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Self {
            records: RwLock::default(),
            changes,
        }
    }

    /// Applies `update` to the record `id` under the write lock.
    fn update<T>(
        &self,
        id: &str,
        update: impl FnOnce(&mut FundingRequest) -> OrdResult<T>,
    ) -> OrdResult<T> {
        let mut records = self.records.write();
        let record = records
            .get_mut(id)
            .ok_or_else(|| OrdError::FundingNotFound(id.to_string()))?;

        let from = record.status;
        let result = update(record)?;
        if record.status != from {
            self.publish(record.change(from));
        }

        Ok(result)
    }

    fn publish(&self, change: FundingChange) {
        // no receivers is fine
        let _ = self.changes.send(change);
    }
}

#[async_trait::async_trait]
impl FundingStore for MemoryFundingStore {
    async fn create_funding(&self, request: FundingRequest) -> OrdResult<()> {
        let mut records = self.records.write();
        if records.contains_key(&request.id) {
            return Err(OrdError::AlreadyExists(request.id));
        }

        debug!("created funding {} at {}", request.id, request.address);
        records.insert(request.id.clone(), request);

        Ok(())
    }

    async fn get_funding(&self, id: &str) -> OrdResult<FundingRequest> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| OrdError::FundingNotFound(id.to_string()))
    }

    async fn address_funded(
        &self,
        id: &str,
        txid: Txid,
        vout: u32,
        amount: Amount,
        at: DateTime<Utc>,
    ) -> OrdResult<Transition> {
        self.update(id, |record| record.fund(txid, vout, amount, at))
    }

    async fn genesis_funded(&self, id: &str, genesis_txid: Txid) -> OrdResult<Transition> {
        self.update(id, |record| record.start_genesis(genesis_txid))
    }

    async fn create_batch(&self, ids: &[String], batch_id: &str) -> OrdResult<()> {
        let mut records = self.records.write();

        for id in ids {
            records
                .get(id)
                .ok_or_else(|| OrdError::FundingNotFound(id.clone()))?
                .ensure_batchable()?;
        }

        for id in ids {
            if let Some(record) = records.get_mut(id) {
                record.assign_batch(batch_id);
                self.publish(record.change(FundingStatus::Funded));
            }
        }

        Ok(())
    }

    async fn record_batch_genesis(&self, id: &str, genesis_txid: Txid) -> OrdResult<Transition> {
        self.update(id, |record| record.record_batch_genesis(genesis_txid))
    }

    async fn mark_revealed(&self, id: &str, reveal_txid: Txid) -> OrdResult<Transition> {
        self.update(id, |record| record.reveal(reveal_txid))
    }

    async fn update_funding_next_check_at(&self, id: &str, at: DateTime<Utc>) -> OrdResult<()> {
        self.update(id, |record| {
            record.next_check_at = at;
            Ok(())
        })
    }

    async fn update_funding_last_checked(&self, id: &str, at: DateTime<Utc>) -> OrdResult<u32> {
        self.update(id, |record| Ok(record.mark_checked(at)))
    }

    async fn reset_times_checked(&self, id: &str) -> OrdResult<()> {
        self.update(id, |record| {
            record.times_checked = 0;
            Ok(())
        })
    }

    async fn expire(&self, id: &str) -> OrdResult<Transition> {
        self.update(id, FundingRequest::expire)
    }

    async fn mark_republished(&self, id: &str, next_at: DateTime<Utc>) -> OrdResult<u32> {
        self.update(id, |record| record.mark_republished(next_at))
    }

    async fn list_by_status_and_next_check(
        &self,
        status: FundingStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> OrdResult<Vec<PollItem>> {
        Ok(query::due_for_check(
            self.records.read().values(),
            status,
            now,
            limit,
        ))
    }

    async fn list_by_status_and_funded_at(
        &self,
        status: FundingStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> OrdResult<Vec<FundedItem>> {
        Ok(query::funded_before(
            self.records.read().values(),
            status,
            before,
            limit,
        ))
    }

    async fn list_republish_due(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
        max_times: u32,
        limit: usize,
    ) -> OrdResult<Vec<FundedItem>> {
        Ok(query::republish_due(
            self.records.read().values(),
            before,
            now,
            max_times,
            limit,
        ))
    }

    async fn list_by_status_and_collection(
        &self,
        collection_id: &str,
        status: FundingStatus,
        limit: usize,
    ) -> OrdResult<Vec<FundingSummary>> {
        Ok(query::in_collection(
            self.records.read().values(),
            collection_id,
            status,
            limit,
        ))
    }

    async fn list_by_batch(&self, batch_id: &str) -> OrdResult<Vec<FundingSummary>> {
        Ok(query::in_batch(self.records.read().values(), batch_id))
    }

    async fn list_by_creator(
        &self,
        creator_id: &str,
        limit: usize,
    ) -> OrdResult<Vec<FundingSummary>> {
        Ok(query::by_creator(
            self.records.read().values(),
            creator_id,
            limit,
        ))
    }

    fn subscribe(&self) -> broadcast::Receiver<FundingChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitcoin::Network;
    use chrono::Duration;

    use super::*;
    use crate::utils::test_utils::{address, txid};

    fn request(seed: u8) -> FundingRequest {
        FundingRequest::new(
            &address(seed, Network::Regtest),
            &address(200, Network::Regtest),
            Network::Regtest,
            Amount::from_sat(10_000),
            Utc::now(),
        )
    }

    async fn funded(store: &MemoryFundingStore, seed: u8) -> String {
        let request = request(seed);
        let id = request.id.clone();
        store.create_funding(request).await.unwrap();
        store
            .address_funded(&id, txid(seed), 0, Amount::from_sat(10_000), Utc::now())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn create_is_insert_if_absent() {
        let store = MemoryFundingStore::new();

        store.create_funding(request(1)).await.unwrap();
        assert!(matches!(
            store.create_funding(request(1)).await,
            Err(OrdError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.get_funding("missing").await,
            Err(OrdError::FundingNotFound(_))
        ));
    }

    #[tokio::test]
    async fn address_funded_is_idempotent() {
        let store = MemoryFundingStore::new();
        let request = request(1);
        let id = request.id.clone();
        store.create_funding(request).await.unwrap();
        let at = Utc::now();

        assert_eq!(
            store
                .address_funded(&id, txid(1), 0, Amount::from_sat(10_000), at)
                .await
                .unwrap(),
            Transition::Applied
        );
        assert_eq!(
            store
                .address_funded(&id, txid(1), 0, Amount::from_sat(10_000), at)
                .await
                .unwrap(),
            Transition::Unchanged
        );
        assert!(matches!(
            store
                .address_funded(&id, txid(2), 0, Amount::from_sat(10_000), at)
                .await,
            Err(OrdError::FundingMismatch { .. })
        ));

        let record = store.get_funding(&id).await.unwrap();
        assert_eq!(record.status, FundingStatus::Funded);
        assert_eq!(record.funding_txid, Some(txid(1)));
        assert_eq!(record.funded_at, Some(at));
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let store = MemoryFundingStore::new();
        let id = funded(&store, 1).await;

        store.genesis_funded(&id, txid(10)).await.unwrap();
        store.mark_revealed(&id, txid(11)).await.unwrap();

        assert_eq!(
            store.mark_revealed(&id, txid(11)).await.unwrap(),
            Transition::Unchanged
        );
        assert!(store.mark_revealed(&id, txid(12)).await.is_err());
        assert!(store.genesis_funded(&id, txid(10)).await.is_err());
        assert!(store
            .address_funded(&id, txid(3), 0, Amount::from_sat(1), Utc::now())
            .await
            .is_err());
        assert!(matches!(
            store.expire(&id).await,
            Err(OrdError::ConditionFailed { .. })
        ));
        assert_eq!(
            store.get_funding(&id).await.unwrap().status,
            FundingStatus::Revealed
        );
    }

    #[tokio::test]
    async fn request_enters_a_single_batch() {
        let store = Arc::new(MemoryFundingStore::new());
        let a = funded(&store, 1).await;
        let b = funded(&store, 2).await;
        let c = funded(&store, 3).await;

        let first = {
            let store = store.clone();
            let ids = vec![a.clone(), b.clone()];
            tokio::spawn(async move { store.create_batch(&ids, "first").await })
        };
        let second = {
            let store = store.clone();
            let ids = vec![b.clone(), c.clone()];
            tokio::spawn(async move { store.create_batch(&ids, "second").await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        let batch = store.get_funding(&b).await.unwrap().batch_id.unwrap();
        assert_eq!(store.list_by_batch(&batch).await.unwrap().len(), 2);

        // the loser left its other request untouched
        let untouched = if batch == "first" { &c } else { &a };
        let record = store.get_funding(untouched).await.unwrap();
        assert_eq!(record.status, FundingStatus::Funded);
        assert_eq!(record.batch_id, None);

        // a batched request cannot take the single path
        assert!(store.genesis_funded(&b, txid(9)).await.is_err());
    }

    #[tokio::test]
    async fn batch_genesis_is_recorded_once() {
        let store = MemoryFundingStore::new();
        let id = funded(&store, 1).await;
        store.create_batch(&[id.clone()], "batch").await.unwrap();

        assert_eq!(
            store.record_batch_genesis(&id, txid(5)).await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            store.record_batch_genesis(&id, txid(5)).await.unwrap(),
            Transition::Unchanged
        );
        assert!(store.record_batch_genesis(&id, txid(6)).await.is_err());
        assert_eq!(
            store.mark_revealed(&id, txid(7)).await.unwrap(),
            Transition::Applied
        );
    }

    #[tokio::test]
    async fn poll_schedule_and_projections() {
        let store = MemoryFundingStore::new();
        let due = request(1);
        let later = request(2);
        let now = Utc::now();
        let (due_id, later_id) = (due.id.clone(), later.id.clone());
        store.create_funding(due).await.unwrap();
        store.create_funding(later.with_creator("alice")).await.unwrap();
        store
            .update_funding_next_check_at(&later_id, now + Duration::minutes(5))
            .await
            .unwrap();

        let items = store
            .list_by_status_and_next_check(FundingStatus::Funding, now, 10)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, due_id);

        assert_eq!(store.update_funding_last_checked(&due_id, now).await.unwrap(), 1);
        assert_eq!(store.update_funding_last_checked(&due_id, now).await.unwrap(), 2);
        store.reset_times_checked(&due_id).await.unwrap();
        assert_eq!(store.get_funding(&due_id).await.unwrap().times_checked, 0);

        let by_creator = store.list_by_creator("alice", 10).await.unwrap();
        assert_eq!(by_creator.len(), 1);
        assert_eq!(by_creator[0].id, later_id);
    }

    #[tokio::test]
    async fn stale_funded_listing() {
        let store = MemoryFundingStore::new();
        let id = funded(&store, 1).await;

        let stale = store
            .list_by_status_and_funded_at(
                FundingStatus::Funded,
                Utc::now() + Duration::seconds(1),
                10,
            )
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);
        assert_eq!(stale[0].funding_txid, txid(1));

        assert!(store
            .list_by_status_and_funded_at(
                FundingStatus::Funded,
                Utc::now() - Duration::minutes(1),
                10
            )
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn republication_is_counted_and_scheduled() {
        let store = MemoryFundingStore::new();
        let id = funded(&store, 1).await;
        let now = Utc::now() + Duration::minutes(10);

        let due = store.list_republish_due(now, now, 2, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].republish_count, 0);

        let next = now + Duration::minutes(20);
        assert_eq!(store.mark_republished(&id, next).await.unwrap(), 1);
        assert!(store.list_republish_due(now, now, 2, 10).await.unwrap().is_empty());
        assert_eq!(store.list_republish_due(now, next, 2, 10).await.unwrap().len(), 1);

        assert_eq!(store.mark_republished(&id, next).await.unwrap(), 2);
        // budget exhausted
        assert!(store
            .list_republish_due(now, next + Duration::days(1), 2, 10)
            .await
            .unwrap()
            .is_empty());

        store.genesis_funded(&id, txid(10)).await.unwrap();
        assert!(matches!(
            store.mark_republished(&id, next).await,
            Err(OrdError::ConditionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn changes_are_streamed() {
        let store = MemoryFundingStore::new();
        let mut changes = store.subscribe();
        let request = request(1).with_collection("punks");
        let id = request.id.clone();
        store.create_funding(request).await.unwrap();

        store.expire(&id).await.unwrap();
        assert_eq!(store.expire(&id).await.unwrap(), Transition::Unchanged);

        let change = changes.recv().await.unwrap();
        assert_eq!(change.id, id);
        assert_eq!(change.collection_id.as_deref(), Some("punks"));
        assert_eq!(change.from, FundingStatus::Funding);
        assert_eq!(change.to, FundingStatus::Expired);
        assert!(changes.try_recv().is_err());
    }
}
