use std::str::FromStr;

use bitcoin::{Address, Amount};
use chrono::{DateTime, Utc};

use super::events::{FundedEvent, InsufficientFundsEvent};
use super::PipelineContext;
use crate::chain::{Expected, Observation, Payment};
use crate::store::{FundingStatus, PollItem};
use crate::{OrdError, OrdResult};

/// Outcome counters of one poller run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub examined: usize,
    pub funded: usize,
    pub underfunded: usize,
    /// Not paid yet, or paid but unconfirmed
    pub pending: usize,
    pub expired: usize,
    /// Left untouched after a chain or store failure
    pub failed: usize,
    /// Stale funded requests published again
    pub republished: usize,
}

/// Checks due funding addresses for payment.
///
/// Meant to be run on a schedule; the next check of each request is persisted in the store.
pub struct FundingPoller {
    ctx: PipelineContext,
}

impl FundingPoller {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> OrdResult<PollReport> {
        let mut report = PollReport::default();
        let poller = &self.ctx.config.poller;

        let due = self
            .ctx
            .funding
            .list_by_status_and_next_check(FundingStatus::Funding, now, poller.batch_size)
            .await?;
        report.examined = due.len();

        let expire_before = now - poller.expire_after();
        let mut observations = Vec::with_capacity(due.len());
        for item in due {
            let address = match Address::from_str(&item.address)
                .map_err(OrdError::from)
                .and_then(|address| {
                    address
                        .require_network(self.ctx.config.network)
                        .map_err(OrdError::from)
                }) {
                Ok(address) => address,
                Err(err) => {
                    error!("{}: bad funding address {}: {err}", item.id, item.address);
                    report.failed += 1;
                    continue;
                }
            };
            let expected = Expected::from(Amount::from_sat(item.funding_amount_sat))
                .with_parent(item.parent_value_sat.map(Amount::from_sat));
            observations.push((item, address, expected));
        }

        // a request is only expired after the chain was asked, so a payment arriving close
        // to the deadline still funds it
        for (item, observation) in self.ctx.observer.observe_all(observations).await {
            let outcome = match observation {
                Ok(observation) => {
                    let overdue = item.created_at <= expire_before;
                    self.apply(&item, observation, overdue, now, &mut report)
                        .await
                }
                Err(err) => {
                    warn!("{}: chain lookup failed: {err}", item.id);
                    report.failed += 1;
                    continue;
                }
            };
            if let Err(err) = outcome {
                if err.is_concurrency_loss() {
                    debug!("{}: {err}", item.id);
                } else {
                    error!("{}: {err}", item.id);
                    report.failed += 1;
                }
            }
        }

        report.republished = self.republish_stale(now).await?;
        debug!("poll run: {report:?}");

        Ok(report)
    }

    async fn apply(
        &self,
        item: &PollItem,
        observation: Observation,
        overdue: bool,
        now: DateTime<Utc>,
        report: &mut PollReport,
    ) -> OrdResult<()> {
        match observation {
            Observation::Funded(payment) => {
                if overdue {
                    info!("{}: paid after its deadline, funding anyway", item.id);
                }
                self.funded(item, payment, now).await?;
                report.funded += 1;
            }
            Observation::Underfunded { best, expected } => {
                info!(
                    "{}: underpaid, {} of {expected} received",
                    item.id, best.amount
                );
                self.ctx
                    .queues
                    .notifications
                    .publish(
                        &InsufficientFundsEvent {
                            id: item.id.clone(),
                            address: item.address.clone(),
                            txid: best.txid,
                            vout: best.vout,
                            received_sat: best.amount.to_sat(),
                            expected_sat: expected.to_sat(),
                        }
                        .into(),
                    )
                    .await?;
                report.underfunded += 1;
                if overdue {
                    self.expire(item, report).await?;
                } else {
                    self.back_off(item, now).await?;
                }
            }
            Observation::NotFound if overdue => self.expire(item, report).await?,
            // a payment waiting for confirmation keeps the request alive past its deadline
            Observation::Unconfirmed(_) | Observation::NotFound => {
                self.back_off(item, now).await?;
                report.pending += 1;
            }
        }

        Ok(())
    }

    async fn expire(&self, item: &PollItem, report: &mut PollReport) -> OrdResult<()> {
        self.ctx.funding.expire(&item.id).await?;
        info!("{}: expired unpaid", item.id);
        report.expired += 1;

        Ok(())
    }

    async fn funded(&self, item: &PollItem, payment: Payment, now: DateTime<Utc>) -> OrdResult<()> {
        self.ctx
            .funding
            .address_funded(&item.id, payment.txid, payment.vout, payment.amount, now)
            .await?;
        self.ctx.funding.reset_times_checked(&item.id).await?;
        info!(
            "{}: funded by {}:{} with {}",
            item.id, payment.txid, payment.vout, payment.amount
        );

        self.ctx
            .queues
            .funded
            .publish(
                &FundedEvent {
                    id: item.id.clone(),
                    address: item.address.clone(),
                    txid: payment.txid,
                    vout: payment.vout,
                    amount_sat: payment.amount.to_sat(),
                }
                .into(),
            )
            .await
    }

    /// `next = now + min(base·2^times_checked, max)`
    async fn back_off(&self, item: &PollItem, now: DateTime<Utc>) -> OrdResult<()> {
        let checked = self
            .ctx
            .funding
            .update_funding_last_checked(&item.id, now)
            .await?;
        let delay = self.ctx.config.poller.backoff(checked.saturating_sub(1));
        let next = now + chrono::Duration::seconds(delay.as_secs() as i64);

        self.ctx
            .funding
            .update_funding_next_check_at(&item.id, next)
            .await
    }

    /// Publishes funded events again for requests whose genesis never happened, at most
    /// `max_republish` times each, waiting twice as long after every attempt.
    async fn republish_stale(&self, now: DateTime<Utc>) -> OrdResult<usize> {
        let poller = &self.ctx.config.poller;
        let stale = self
            .ctx
            .funding
            .list_republish_due(
                now - poller.stale_funded_after(),
                now,
                poller.max_republish,
                poller.batch_size,
            )
            .await?;

        let mut republished = 0;
        for item in &stale {
            warn!("{}: funded since {}, publishing again", item.id, item.funded_at);
            self.ctx
                .queues
                .funded
                .publish(
                    &FundedEvent {
                        id: item.id.clone(),
                        address: item.address.clone(),
                        txid: item.funding_txid,
                        vout: item.funding_vout,
                        amount_sat: item.received_amount_sat,
                    }
                    .into(),
                )
                .await?;

            let next = now + poller.republish_backoff(item.republish_count);
            match self.ctx.funding.mark_republished(&item.id, next).await {
                Ok(times) if times >= poller.max_republish => {
                    error!(
                        "{}: funded by {}:{} but never reached genesis after {times} attempts, \
                         needs an operator",
                        item.id, item.funding_txid, item.funding_vout
                    );
                }
                Ok(_) => {}
                Err(err) if err.is_concurrency_loss() => debug!("{}: {err}", item.id),
                Err(err) => return Err(err),
            }
            republished += 1;
        }

        Ok(republished)
    }
}
