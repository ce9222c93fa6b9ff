use bitcoin::{Amount, FeeRate, Transaction};

use super::events::{GenesisEvent, PipelineEvent, RevealEvent};
use super::funded::{build_genesis, restore, Restored};
use super::{EventHandler, PipelineContext};
use crate::store::{FundingRequest, FundingStatus};
use crate::wallet::{
    construct_reveal_transaction, FeeDestination, FeeRateRange, RevealRequest, Utxo,
};
use crate::{OrdError, OrdResult};

/// One request of a reveal, with everything its [`RevealRequest`] borrows.
struct Member {
    record: FundingRequest,
    restored: Restored,
    genesis: Transaction,
    fee_destinations: Vec<FeeDestination>,
    parent: Option<Utxo>,
}

impl Member {
    fn request(&self) -> RevealRequest<'_> {
        RevealRequest {
            payload: &self.restored.payload,
            genesis: &self.genesis,
            destination: &self.restored.destination,
            fee_destinations: &self.fee_destinations,
            tip: self.restored.doc.tip(),
            parent: self.parent,
        }
    }
}

/// Reveals requests once their genesis transactions are confirmed.
pub struct RevealConsumer {
    ctx: PipelineContext,
}

impl RevealConsumer {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    async fn on_genesis(&self, event: GenesisEvent) -> OrdResult<()> {
        let record = self.ctx.funding.get_funding(&event.id).await?;
        if !matches!(record.status, FundingStatus::Genesis | FundingStatus::Batch) {
            debug!("{}: {}, nothing to reveal", record.id, record.status);
            return Ok(());
        }

        let records = match &record.batch_id {
            Some(batch_id) => {
                let mut records = Vec::new();
                for summary in self.ctx.funding.list_by_batch(batch_id).await? {
                    records.push(self.ctx.funding.get_funding(&summary.id).await?);
                }
                records
            }
            None => vec![record],
        };

        let mut members = Vec::with_capacity(records.len());
        for record in records {
            members.push(self.member(record).await?);
        }

        let min = members
            .iter()
            .map(|member| member.restored.doc.fee_rate())
            .max()
            .unwrap_or(FeeRate::ZERO);
        let max = self
            .ctx
            .config
            .fees
            .max_reveal_rate()
            .unwrap_or(min)
            .max(min);

        let reveal = {
            let requests = members.iter().map(Member::request).collect::<Vec<_>>();
            construct_reveal_transaction(&requests, FeeRateRange::new(min, max)?)?
        };
        let reveal_txid = reveal.tx.txid();

        self.ctx.observer.broadcast(&reveal.tx).await?;
        info!(
            "reveal {reveal_txid} broadcast for {} requests, miner fee {}, platform fee {}",
            members.len(),
            reveal.miner_fee,
            reveal.platform_fee
        );
        if reveal.underpriced {
            warn!("reveal {reveal_txid} pays less than {min}");
        }

        // ids follow the request order, one per leaf
        let mut ids = reveal.inscription_ids.iter();
        for member in members {
            let inscription_ids = ids
                .by_ref()
                .take(member.restored.payload.leaves.len())
                .copied()
                .collect();

            match self
                .ctx
                .funding
                .mark_revealed(&member.record.id, reveal_txid)
                .await
            {
                Ok(_) => {}
                Err(err) if err.is_concurrency_loss() => {
                    debug!("{}: {err}", member.record.id);
                    continue;
                }
                Err(err) => return Err(err),
            }

            self.ctx
                .queues
                .notifications
                .publish(
                    &RevealEvent {
                        id: member.record.id,
                        address: member.record.address,
                        reveal_txid,
                        inscription_ids,
                        underpriced: reveal.underpriced,
                        batch_id: member.record.batch_id,
                    }
                    .into(),
                )
                .await?;
        }

        Ok(())
    }

    /// Restores a request and checks its genesis is confirmed.
    async fn member(&self, record: FundingRequest) -> OrdResult<Member> {
        let genesis_txid = record
            .genesis_txid
            .ok_or_else(|| OrdError::NotReady(format!("{} has no genesis yet", record.id)))?;

        let confirmed = self
            .ctx
            .observer
            .transaction_status(&genesis_txid)
            .await?
            .map(|status| status.confirmed)
            .unwrap_or(false);
        if !confirmed {
            return Err(OrdError::NotReady(format!(
                "genesis {genesis_txid} of {} is not confirmed",
                record.id
            )));
        }

        let restored = restore(&self.ctx, &record).await?;
        let genesis = build_genesis(&record, &restored)?.tx;
        if genesis.txid() != genesis_txid {
            return Err(OrdError::InvalidInscription(format!(
                "{}: rebuilt genesis {} differs from {genesis_txid}",
                record.id,
                genesis.txid()
            )));
        }

        let parent = match restored.doc.parent() {
            Some(parent) => Some(self.find_parent(&record, &restored, parent.value).await?),
            None => None,
        };
        let fee_destinations = restored.doc.fee_destinations()?;

        Ok(Member {
            record,
            restored,
            genesis,
            fee_destinations,
            parent,
        })
    }

    /// The UTXO carrying the parent inscription, sent to the funding address.
    async fn find_parent(
        &self,
        record: &FundingRequest,
        restored: &Restored,
        value: Amount,
    ) -> OrdResult<Utxo> {
        let payments = self
            .ctx
            .observer
            .address_payments(&restored.payload.address)
            .await?;

        payments
            .into_iter()
            .find(|payment| {
                payment.amount == value
                    && Some(payment.txid) != record.funding_txid
                    && Some(payment.txid) != record.genesis_txid
            })
            .map(|payment| Utxo {
                id: payment.txid,
                index: payment.vout,
                amount: payment.amount,
            })
            .ok_or_else(|| {
                OrdError::NotReady(format!("parent utxo of {} not received", record.id))
            })
    }
}

#[async_trait::async_trait]
impl EventHandler for RevealConsumer {
    async fn handle(&self, event: PipelineEvent) -> OrdResult<()> {
        match event {
            PipelineEvent::Genesis(event) => self.on_genesis(event).await,
            other => Err(OrdError::Parse(format!(
                "genesis queue got unexpected event {other:?}"
            ))),
        }
    }
}
