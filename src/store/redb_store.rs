use std::path::Path;
use std::sync::Arc;

use bitcoin::{Amount, Txid};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use super::collection::{CollectionRecord, CollectionStore};
use super::funding::{
    FundedItem, FundingChange, FundingRequest, FundingStatus, FundingStore, FundingSummary,
    PollItem, Transition,
};
use super::memory::CHANGE_STREAM_CAPACITY;
use super::query;
use crate::error::storage;
use crate::{OrdError, OrdResult};

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const FUNDING: JsonTable = TableDefinition::new("FUNDING");
const COLLECTIONS: JsonTable = TableDefinition::new("COLLECTIONS");

/// Funding and collection records persisted in a redb database, as JSON values keyed by id.
///
/// Each conditional write reads, checks and writes the record inside one write transaction.
/// Changes are published once the transaction has committed.
pub struct RedbStore {
    db: Arc<Database>,
    changes: broadcast::Sender<FundingChange>,
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> OrdResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> OrdResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

impl RedbStore {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> OrdResult<Self> {
        let db = Database::create(path).map_err(storage)?;
        Self::new(Arc::new(db))
    }

    /// Uses an already open database, which may be shared with the durable queues.
    pub fn new(db: Arc<Database>) -> OrdResult<Self> {
        // read transactions fail on missing tables
        let wtx = db.begin_write().map_err(storage)?;
        wtx.open_table(FUNDING).map_err(storage)?;
        wtx.open_table(COLLECTIONS).map_err(storage)?;
        wtx.commit().map_err(storage)?;

        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Ok(Self { db, changes })
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    fn insert_new<T: Serialize>(&self, table: JsonTable, id: &str, value: &T) -> OrdResult<()> {
        let wtx = self.db.begin_write().map_err(storage)?;
        {
            let mut table = wtx.open_table(table).map_err(storage)?;
            if table.get(id).map_err(storage)?.is_some() {
                return Err(OrdError::AlreadyExists(id.to_string()));
            }
            table.insert(id, encode(value)?.as_slice()).map_err(storage)?;
        }
        wtx.commit().map_err(storage)?;

        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, id: &str) -> OrdResult<Option<T>> {
        let rtx = self.db.begin_read().map_err(storage)?;
        let table = rtx.open_table(table).map_err(storage)?;
        let value = table.get(id).map_err(storage)?;

        value.map(|value| decode(value.value())).transpose()
    }

    fn all<T: DeserializeOwned>(&self, table: JsonTable) -> OrdResult<Vec<T>> {
        let rtx = self.db.begin_read().map_err(storage)?;
        let table = rtx.open_table(table).map_err(storage)?;

        let mut values = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, value) = entry.map_err(storage)?;
            values.push(decode(value.value())?);
        }

        Ok(values)
    }

    /// Applies `update` to the funding record `id` in one write transaction.
    fn update<T>(
        &self,
        id: &str,
        update: impl FnOnce(&mut FundingRequest) -> OrdResult<T>,
    ) -> OrdResult<T> {
        let wtx = self.db.begin_write().map_err(storage)?;
        let (result, change) = {
            let mut table = wtx.open_table(FUNDING).map_err(storage)?;
            let mut record: FundingRequest = match table.get(id).map_err(storage)? {
                Some(value) => decode(value.value())?,
                None => return Err(OrdError::FundingNotFound(id.to_string())),
            };

            let from = record.status;
            let result = update(&mut record)?;
            table
                .insert(id, encode(&record)?.as_slice())
                .map_err(storage)?;

            (result, (record.status != from).then(|| record.change(from)))
        };
        wtx.commit().map_err(storage)?;

        if let Some(change) = change {
            self.publish(change);
        }

        Ok(result)
    }

    fn update_collection<T>(
        &self,
        id: &str,
        update: impl FnOnce(&mut CollectionRecord) -> OrdResult<T>,
    ) -> OrdResult<T> {
        let wtx = self.db.begin_write().map_err(storage)?;
        let result = {
            let mut table = wtx.open_table(COLLECTIONS).map_err(storage)?;
            let mut record: CollectionRecord = match table.get(id).map_err(storage)? {
                Some(value) => decode(value.value())?,
                None => return Err(OrdError::CollectionNotFound(id.to_string())),
            };

            let result = update(&mut record)?;
            table
                .insert(id, encode(&record)?.as_slice())
                .map_err(storage)?;
            result
        };
        wtx.commit().map_err(storage)?;

        Ok(result)
    }

    fn publish(&self, change: FundingChange) {
        // no receivers is fine
        let _ = self.changes.send(change);
    }

    fn records(&self) -> OrdResult<Vec<FundingRequest>> {
        self.all(FUNDING)
    }
}

#[async_trait::async_trait]
impl FundingStore for RedbStore {
    async fn create_funding(&self, request: FundingRequest) -> OrdResult<()> {
        self.insert_new(FUNDING, &request.id, &request)?;
        debug!("created funding {} at {}", request.id, request.address);

        Ok(())
    }

    async fn get_funding(&self, id: &str) -> OrdResult<FundingRequest> {
        self.get(FUNDING, id)?
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
        let wtx = self.db.begin_write().map_err(storage)?;
        let changes = {
            let mut table = wtx.open_table(FUNDING).map_err(storage)?;

            let mut records = Vec::with_capacity(ids.len());
            for id in ids {
                let record: FundingRequest = match table.get(id.as_str()).map_err(storage)? {
                    Some(value) => decode(value.value())?,
                    None => return Err(OrdError::FundingNotFound(id.clone())),
                };
                record.ensure_batchable()?;
                records.push(record);
            }

            let mut changes = Vec::with_capacity(records.len());
            for mut record in records {
                record.assign_batch(batch_id);
                table
                    .insert(record.id.as_str(), encode(&record)?.as_slice())
                    .map_err(storage)?;
                changes.push(record.change(FundingStatus::Funded));
            }
            changes
        };
        wtx.commit().map_err(storage)?;

        for change in changes {
            self.publish(change);
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
            self.records()?.iter(),
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
            self.records()?.iter(),
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
            self.records()?.iter(),
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
            self.records()?.iter(),
            collection_id,
            status,
            limit,
        ))
    }

    async fn list_by_batch(&self, batch_id: &str) -> OrdResult<Vec<FundingSummary>> {
        Ok(query::in_batch(self.records()?.iter(), batch_id))
    }

    async fn list_by_creator(
        &self,
        creator_id: &str,
        limit: usize,
    ) -> OrdResult<Vec<FundingSummary>> {
        Ok(query::by_creator(self.records()?.iter(), creator_id, limit))
    }

    fn subscribe(&self) -> broadcast::Receiver<FundingChange> {
        self.changes.subscribe()
    }
}

#[async_trait::async_trait]
impl CollectionStore for RedbStore {
    async fn create_collection(&self, record: CollectionRecord) -> OrdResult<()> {
        self.insert_new(COLLECTIONS, &record.id, &record)
    }

    async fn get_collection(&self, id: &str) -> OrdResult<CollectionRecord> {
        self.get(COLLECTIONS, id)?
            .ok_or_else(|| OrdError::CollectionNotFound(id.to_string()))
    }

    async fn reserve(&self, id: &str) -> OrdResult<CollectionRecord> {
        self.update_collection(id, |record| {
            record.reserve()?;
            Ok(record.clone())
        })
    }

    async fn complete(&self, id: &str) -> OrdResult<()> {
        self.update_collection(id, CollectionRecord::complete)
    }

    async fn release(&self, id: &str) -> OrdResult<()> {
        self.update_collection(id, |record| {
            record.release();
            Ok(())
        })
    }

    async fn list_collections(&self) -> OrdResult<Vec<CollectionRecord>> {
        self.all(COLLECTIONS)
    }

    async fn set_counts(&self, id: &str, total: u64, pending: u64) -> OrdResult<()> {
        self.update_collection(id, |record| {
            record.total_count = total;
            record.pending_count = pending;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Network;
    use chrono::Duration;
    use tempfile::NamedTempFile;

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

    #[tokio::test]
    async fn records_survive_a_reopen() {
        let dbfile = NamedTempFile::new().unwrap();
        let request = request(1).with_collection("punks");
        let id = request.id.clone();
        let next_check = Utc::now() + Duration::minutes(5);

        {
            let store = RedbStore::open(dbfile.path()).unwrap();
            store.create_funding(request).await.unwrap();
            store
                .update_funding_next_check_at(&id, next_check)
                .await
                .unwrap();
            store
                .create_collection(CollectionRecord::new("punks", "Punks", 2))
                .await
                .unwrap();
            store.reserve("punks").await.unwrap();
        }

        let store = RedbStore::open(dbfile.path()).unwrap();
        let record = store.get_funding(&id).await.unwrap();
        assert_eq!(record.status, FundingStatus::Funding);
        assert_eq!(record.next_check_at, next_check);
        assert_eq!(record.collection_id.as_deref(), Some("punks"));
        assert_eq!(
            store.get_collection("punks").await.unwrap().pending_count,
            1
        );

        assert!(store
            .list_by_status_and_next_check(FundingStatus::Funding, Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_by_status_and_next_check(FundingStatus::Funding, next_check, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn conditional_writes_hold_on_disk() {
        let dbfile = NamedTempFile::new().unwrap();
        let store = RedbStore::open(dbfile.path()).unwrap();
        let mut changes = store.subscribe();
        let request = request(1);
        let id = request.id.clone();

        store.create_funding(request.clone()).await.unwrap();
        assert!(matches!(
            store.create_funding(request).await,
            Err(OrdError::AlreadyExists(_))
        ));

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
        assert!(matches!(
            store.record_batch_genesis(&id, txid(3)).await,
            Err(OrdError::ConditionFailed { .. })
        ));

        store.create_batch(&[id.clone()], "batch").await.unwrap();
        assert!(store.create_batch(&[id.clone()], "other").await.is_err());
        store.record_batch_genesis(&id, txid(3)).await.unwrap();
        store.mark_revealed(&id, txid(4)).await.unwrap();
        assert!(store.expire(&id).await.is_err());

        let record = store.get_funding(&id).await.unwrap();
        assert_eq!(record.status, FundingStatus::Revealed);
        assert_eq!(record.batch_id.as_deref(), Some("batch"));
        assert_eq!(store.list_by_batch("batch").await.unwrap().len(), 1);

        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push(change.to);
        }
        assert_eq!(
            seen,
            vec![
                FundingStatus::Funded,
                FundingStatus::Batch,
                FundingStatus::Revealed
            ]
        );
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let dbfile = NamedTempFile::new().unwrap();
        let store = RedbStore::open(dbfile.path()).unwrap();
        let funded = request(1);
        let unpaid = request(2);
        let (funded_id, unpaid_id) = (funded.id.clone(), unpaid.id.clone());
        store.create_funding(funded).await.unwrap();
        store.create_funding(unpaid).await.unwrap();
        store
            .address_funded(&funded_id, txid(1), 0, Amount::from_sat(10_000), Utc::now())
            .await
            .unwrap();

        assert!(store
            .create_batch(&[funded_id.clone(), unpaid_id], "batch")
            .await
            .is_err());

        let record = store.get_funding(&funded_id).await.unwrap();
        assert_eq!(record.status, FundingStatus::Funded);
        assert_eq!(record.batch_id, None);
    }
}
