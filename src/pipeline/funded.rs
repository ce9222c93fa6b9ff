use std::collections::HashSet;

use bitcoin::{Address, Amount};

use super::events::{FundedEvent, GenesisEvent, PipelineEvent};
use super::{EventHandler, PipelineContext};
use crate::secure::InscriptionDoc;
use crate::store::{FundingRequest, FundingStatus};
use crate::wallet::{construct_genesis_transaction, GenesisTransaction, TaprootPayload, Utxo};
use crate::{OrdError, OrdResult};

/// Stored parameters of a request, with its key opened.
pub(super) struct Restored {
    pub doc: InscriptionDoc,
    pub payload: TaprootPayload,
    pub destination: Address,
}

pub(super) async fn restore(ctx: &PipelineContext, record: &FundingRequest) -> OrdResult<Restored> {
    let doc = ctx
        .documents
        .get_document(&record.address, &record.id)
        .await?;
    let secret_key = ctx.documents.open_key(&doc).await?;
    let payload = doc.restore_payload(&secret_key)?;
    let destination = doc.destination()?;

    Ok(Restored {
        doc,
        payload,
        destination,
    })
}

/// Rebuilds the genesis of a funded request; the result only depends on stored data.
pub(super) fn build_genesis(
    record: &FundingRequest,
    restored: &Restored,
) -> OrdResult<GenesisTransaction> {
    let funded = record
        .funded_item()
        .ok_or_else(|| OrdError::NotReady(format!("{} has no funding outpoint", record.id)))?;
    let utxo = Utxo {
        id: funded.funding_txid,
        index: funded.funding_vout,
        amount: Amount::from_sat(funded.received_amount_sat),
    };

    construct_genesis_transaction(
        &utxo,
        &restored
            .doc
            .genesis_args(&restored.payload, &restored.destination),
    )
}

/// Builds and broadcasts the genesis of every funded request outside a batch.
pub struct FundedConsumer {
    ctx: PipelineContext,
    batched_collections: HashSet<String>,
}

impl FundedConsumer {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            batched_collections: HashSet::new(),
        }
    }

    /// Leaves the requests of these collections to the [`BatchWorker`](super::BatchWorker).
    pub fn with_batched_collections(mut self, collections: impl IntoIterator<Item = String>) -> Self {
        self.batched_collections.extend(collections);
        self
    }

    async fn on_funded(&self, event: FundedEvent) -> OrdResult<()> {
        let record = self.ctx.funding.get_funding(&event.id).await?;

        match record.status {
            FundingStatus::Funded if record.batch_id.is_none() => {}
            // broadcast done, event maybe lost
            FundingStatus::Genesis => {}
            status => {
                debug!("{}: {status}, nothing to do", record.id);
                return Ok(());
            }
        }
        if let Some(collection_id) = &record.collection_id {
            if self.batched_collections.contains(collection_id) {
                debug!("{}: left to the batch of {collection_id}", record.id);
                return Ok(());
            }
        }

        let restored = restore(&self.ctx, &record).await?;
        let genesis = build_genesis(&record, &restored)?;
        let genesis_txid = genesis.tx.txid();
        if let Some(recorded) = record.genesis_txid {
            if recorded != genesis_txid {
                return Err(OrdError::InvalidInscription(format!(
                    "{}: rebuilt genesis {genesis_txid} differs from {recorded}",
                    record.id
                )));
            }
        }

        self.ctx.observer.broadcast(&genesis.tx).await?;
        info!(
            "{}: genesis {genesis_txid} broadcast, fee {}",
            record.id, genesis.fee
        );

        self.ctx
            .funding
            .genesis_funded(&record.id, genesis_txid)
            .await?;

        self.ctx
            .queues
            .genesis
            .publish(
                &GenesisEvent {
                    id: record.id,
                    address: record.address,
                    genesis_txid,
                    batch_id: None,
                }
                .into(),
            )
            .await
    }
}

#[async_trait::async_trait]
impl EventHandler for FundedConsumer {
    async fn handle(&self, event: PipelineEvent) -> OrdResult<()> {
        match event {
            PipelineEvent::Funded(event) => self.on_funded(event).await,
            other => Err(OrdError::Parse(format!(
                "funded queue got unexpected event {other:?}"
            ))),
        }
    }
}
