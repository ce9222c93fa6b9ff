use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use super::funding::{FundingChange, FundingStatus, FundingStore};
use crate::{InscriptionId, OrdError, OrdResult};

/// Supply-limited group of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: String,
    pub name: String,
    /// Revealed items.
    pub total_count: u64,
    /// Items reserved by requests not yet revealed nor expired.
    pub pending_count: u64,
    pub max_supply: u64,
    pub parent_inscription_id: Option<InscriptionId>,
    #[serde(default)]
    pub meta: Value,
}

impl CollectionRecord {
    pub fn new(id: impl ToString, name: impl ToString, max_supply: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            total_count: 0,
            pending_count: 0,
            max_supply,
            parent_inscription_id: None,
            meta: Value::Null,
        }
    }

    pub fn with_parent(mut self, parent: InscriptionId) -> Self {
        self.parent_inscription_id = Some(parent);
        self
    }

    pub fn available(&self) -> u64 {
        self.max_supply
            .saturating_sub(self.total_count + self.pending_count)
    }

    pub(super) fn reserve(&mut self) -> OrdResult<()> {
        if self.available() == 0 {
            return Err(OrdError::CollectionSoldOut(self.id.clone()));
        }
        self.pending_count += 1;
        Ok(())
    }

    pub(super) fn complete(&mut self) -> OrdResult<()> {
        if self.pending_count == 0 {
            return Err(OrdError::ConditionFailed {
                id: self.id.clone(),
                expected: "pending items".to_string(),
                found: "none".to_string(),
            });
        }
        self.pending_count -= 1;
        self.total_count += 1;
        Ok(())
    }

    pub(super) fn release(&mut self) {
        self.pending_count = self.pending_count.saturating_sub(1);
    }
}

/// Collection counters, updated atomically.
#[async_trait::async_trait]
pub trait CollectionStore: Send + Sync {
    async fn create_collection(&self, record: CollectionRecord) -> OrdResult<()>;

    async fn get_collection(&self, id: &str) -> OrdResult<CollectionRecord>;

    /// Takes one unit of supply for a new request.
    async fn reserve(&self, id: &str) -> OrdResult<CollectionRecord>;

    /// Moves one reserved unit to the revealed total.
    async fn complete(&self, id: &str) -> OrdResult<()>;

    /// Gives one reserved unit back.
    async fn release(&self, id: &str) -> OrdResult<()>;

    async fn list_collections(&self) -> OrdResult<Vec<CollectionRecord>>;

    /// Overwrites both counters, after they were recomputed from the funding records.
    async fn set_counts(&self, id: &str, total: u64, pending: u64) -> OrdResult<()>;
}

#[derive(Default)]
pub struct MemoryCollectionStore {
    records: Mutex<HashMap<String, CollectionRecord>>,
}

impl MemoryCollectionStore {
    fn update<T>(
        &self,
        id: &str,
        update: impl FnOnce(&mut CollectionRecord) -> OrdResult<T>,
    ) -> OrdResult<T> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| OrdError::CollectionNotFound(id.to_string()))?;

        update(record)
    }
}

#[async_trait::async_trait]
impl CollectionStore for MemoryCollectionStore {
    async fn create_collection(&self, record: CollectionRecord) -> OrdResult<()> {
        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Err(OrdError::AlreadyExists(record.id));
        }
        records.insert(record.id.clone(), record);

        Ok(())
    }

    async fn get_collection(&self, id: &str) -> OrdResult<CollectionRecord> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| OrdError::CollectionNotFound(id.to_string()))
    }

    async fn reserve(&self, id: &str) -> OrdResult<CollectionRecord> {
        self.update(id, |record| {
            record.reserve()?;
            Ok(record.clone())
        })
    }

    async fn complete(&self, id: &str) -> OrdResult<()> {
        self.update(id, CollectionRecord::complete)
    }

    async fn release(&self, id: &str) -> OrdResult<()> {
        self.update(id, |record| {
            record.release();
            Ok(())
        })
    }

    async fn list_collections(&self) -> OrdResult<Vec<CollectionRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn set_counts(&self, id: &str, total: u64, pending: u64) -> OrdResult<()> {
        self.update(id, |record| {
            record.total_count = total;
            record.pending_count = pending;
            Ok(())
        })
    }
}

/// Keeps collection counters in line with the funding change stream.
///
/// Changes missed because the stream lagged are made up for by recounting every collection
/// from the funding store.
pub struct CollectionBookkeeper {
    collections: Arc<dyn CollectionStore>,
    funding: Arc<dyn FundingStore>,
}

const PENDING: [FundingStatus; 4] = [
    FundingStatus::Funding,
    FundingStatus::Funded,
    FundingStatus::Genesis,
    FundingStatus::Batch,
];

impl CollectionBookkeeper {
    pub fn new(collections: Arc<dyn CollectionStore>, funding: Arc<dyn FundingStore>) -> Self {
        Self {
            collections,
            funding,
        }
    }

    /// Recomputes the counters of every collection: revealed requests make the total,
    /// requests still in flight the pending count.
    pub async fn reconcile(&self) -> OrdResult<()> {
        for collection in self.collections.list_collections().await? {
            let total = self
                .funding
                .list_by_status_and_collection(&collection.id, FundingStatus::Revealed, usize::MAX)
                .await?
                .len() as u64;
            let mut pending = 0;
            for status in PENDING {
                pending += self
                    .funding
                    .list_by_status_and_collection(&collection.id, status, usize::MAX)
                    .await?
                    .len() as u64;
            }

            if (total, pending) != (collection.total_count, collection.pending_count) {
                info!(
                    "collection {}: recounted {total} revealed and {pending} pending",
                    collection.id
                );
                self.collections
                    .set_counts(&collection.id, total, pending)
                    .await?;
            }
        }

        Ok(())
    }

    pub async fn apply(&self, change: &FundingChange) -> OrdResult<()> {
        let Some(collection_id) = &change.collection_id else {
            return Ok(());
        };

        match change.to {
            FundingStatus::Revealed => self.collections.complete(collection_id).await,
            FundingStatus::Expired => self.collections.release(collection_id).await,
            _ => Ok(()),
        }
    }

    /// Consumes `changes` until the stream closes.
    pub async fn run(self, mut changes: broadcast::Receiver<FundingChange>) {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    if let Err(err) = self.apply(&change).await {
                        error!("collection bookkeeping failed for {}: {err}", change.id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("collection bookkeeper lagged, {skipped} changes skipped, recounting");
                    changes = changes.resubscribe();
                    if let Err(err) = self.reconcile().await {
                        error!("collection recount failed: {err}");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{Amount, Network};
    use chrono::Utc;

    use super::*;
    use crate::store::{FundingRequest, FundingStore, MemoryFundingStore};
    use crate::utils::test_utils::{address, txid};

    #[tokio::test]
    async fn should_enforce_max_supply() {
        let store = MemoryCollectionStore::default();
        store
            .create_collection(CollectionRecord::new("punks", "Punks", 2))
            .await
            .unwrap();

        store.reserve("punks").await.unwrap();
        store.reserve("punks").await.unwrap();
        assert!(matches!(
            store.reserve("punks").await,
            Err(OrdError::CollectionSoldOut(_))
        ));

        store.release("punks").await.unwrap();
        store.reserve("punks").await.unwrap();
        store.complete("punks").await.unwrap();

        let record = store.get_collection("punks").await.unwrap();
        assert_eq!(record.total_count, 1);
        assert_eq!(record.pending_count, 1);
        assert_eq!(record.available(), 0);
    }

    fn request(seed: u8) -> FundingRequest {
        FundingRequest::new(
            &address(seed, Network::Regtest),
            &address(9, Network::Regtest),
            Network::Regtest,
            Amount::from_sat(10_000),
            Utc::now(),
        )
        .with_collection("punks")
    }

    async fn punks(reserved: usize) -> Arc<MemoryCollectionStore> {
        let collections = Arc::new(MemoryCollectionStore::default());
        collections
            .create_collection(CollectionRecord::new("punks", "Punks", 10))
            .await
            .unwrap();
        for _ in 0..reserved {
            collections.reserve("punks").await.unwrap();
        }
        collections
    }

    /// Creates one revealed, one expired and one unpaid request.
    async fn populate(store: &MemoryFundingStore) {
        let revealed = request(1);
        let expired = request(2);
        let unpaid = request(3);
        let (revealed_id, expired_id) = (revealed.id.clone(), expired.id.clone());
        store.create_funding(revealed).await.unwrap();
        store.create_funding(expired).await.unwrap();
        store.create_funding(unpaid).await.unwrap();

        store
            .address_funded(&revealed_id, txid(1), 0, Amount::from_sat(10_000), Utc::now())
            .await
            .unwrap();
        store.genesis_funded(&revealed_id, txid(2)).await.unwrap();
        store.mark_revealed(&revealed_id, txid(3)).await.unwrap();
        store.expire(&expired_id).await.unwrap();
    }

    #[tokio::test]
    async fn bookkeeper_follows_the_change_stream() {
        let collections = punks(3).await;
        let store = Arc::new(MemoryFundingStore::new());
        let changes = store.subscribe();
        let bookkeeper = tokio::spawn(
            CollectionBookkeeper::new(collections.clone(), store.clone()).run(changes),
        );

        populate(&store).await;

        let counted = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let record = collections.get_collection("punks").await.unwrap();
                if (record.total_count, record.pending_count) == (1, 1) {
                    break record;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        bookkeeper.abort();

        assert_eq!(counted.total_count, 1);
        assert_eq!(counted.pending_count, 1);
    }

    #[tokio::test]
    async fn lagging_bookkeeper_recounts_from_the_store() {
        let collections = punks(3).await;
        let store = Arc::new(MemoryFundingStore::new());
        populate(&store).await;

        // a stream that overflowed: only the last of three changes is still buffered
        let (sender, changes) = broadcast::channel(1);
        for to in [FundingStatus::Funded, FundingStatus::Genesis, FundingStatus::Revealed] {
            sender
                .send(FundingChange {
                    id: "lost".to_string(),
                    collection_id: Some("punks".to_string()),
                    from: FundingStatus::Funding,
                    to,
                })
                .unwrap();
        }
        drop(sender);

        CollectionBookkeeper::new(collections.clone(), store)
            .run(changes)
            .await;

        let record = collections.get_collection("punks").await.unwrap();
        assert_eq!(record.total_count, 1);
        assert_eq!(record.pending_count, 1);
        assert_eq!(record.available(), 8);
    }
}
