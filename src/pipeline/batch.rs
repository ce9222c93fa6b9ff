use super::events::GenesisEvent;
use super::funded::{build_genesis, restore};
use super::PipelineContext;
use crate::store::FundingStatus;
use crate::utils::sha256sum_hex;
use crate::OrdResult;

/// Groups the funded requests of a collection so they are revealed together.
pub struct BatchWorker {
    ctx: PipelineContext,
}

impl BatchWorker {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Finishes batches of `collection_id` left without a genesis by an earlier failure,
    /// then batches every funded request of the collection and broadcasts their genesis.
    ///
    /// Returns the id of the new batch, or `None` when there was nothing to batch or another
    /// worker took the requests first.
    pub async fn run_once(&self, collection_id: &str) -> OrdResult<Option<String>> {
        self.resume_unfinished(collection_id).await?;

        let mut ids = self
            .ctx
            .funding
            .list_by_status_and_collection(
                collection_id,
                FundingStatus::Funded,
                self.ctx.config.poller.batch_size,
            )
            .await?
            .into_iter()
            .filter(|summary| summary.batch_id.is_none())
            .map(|summary| summary.id)
            .collect::<Vec<_>>();
        if ids.is_empty() {
            return Ok(None);
        }
        ids.sort();

        let batch_id = sha256sum_hex(ids.join(",").as_bytes(), 16);
        match self.ctx.funding.create_batch(&ids, &batch_id).await {
            Ok(()) => info!("batch {batch_id}: {} requests of {collection_id}", ids.len()),
            Err(err) if err.is_concurrency_loss() => {
                debug!("batch {batch_id} not created: {err}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        self.resume(&batch_id).await?;

        Ok(Some(batch_id))
    }

    async fn resume_unfinished(&self, collection_id: &str) -> OrdResult<()> {
        let mut unfinished = self
            .ctx
            .funding
            .list_by_status_and_collection(collection_id, FundingStatus::Batch, usize::MAX)
            .await?
            .into_iter()
            .filter(|summary| summary.genesis_txid.is_none())
            .filter_map(|summary| summary.batch_id)
            .collect::<Vec<_>>();
        unfinished.sort();
        unfinished.dedup();

        for batch_id in unfinished {
            info!("batch {batch_id}: resuming genesis of {collection_id}");
            self.resume(&batch_id).await?;
        }

        Ok(())
    }

    /// Broadcasts the genesis of every request of `batch_id` and announces it.
    ///
    /// Safe to run again on a partially processed batch.
    pub async fn resume(&self, batch_id: &str) -> OrdResult<()> {
        for summary in self.ctx.funding.list_by_batch(batch_id).await? {
            if summary.status != FundingStatus::Batch {
                continue;
            }

            let record = self.ctx.funding.get_funding(&summary.id).await?;
            let restored = restore(&self.ctx, &record).await?;
            let genesis = build_genesis(&record, &restored)?;
            let genesis_txid = genesis.tx.txid();

            self.ctx.observer.broadcast(&genesis.tx).await?;
            self.ctx
                .funding
                .record_batch_genesis(&record.id, genesis_txid)
                .await?;
            debug!("batch {batch_id}: genesis {genesis_txid} of {}", record.id);

            self.ctx
                .queues
                .genesis
                .publish(
                    &GenesisEvent {
                        id: record.id,
                        address: record.address,
                        genesis_txid,
                        batch_id: Some(batch_id.to_string()),
                    }
                    .into(),
                )
                .await?;
        }

        Ok(())
    }
}
