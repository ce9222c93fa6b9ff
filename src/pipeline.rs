//! Scheduled poller and queue consumers moving funding requests to `revealed`.
//!
//! Every stage reads the authoritative record before acting and relies on the store's
//! conditional writes, so any message may be delivered more than once.

mod batch;
mod events;
mod funded;
mod poller;
mod queue;
mod redb_queue;
mod reveal;


use std::sync::Arc;
use std::time::Duration;

pub use self::batch::BatchWorker;
pub use self::events::{
    FundedEvent, GenesisEvent, InsufficientFundsEvent, PipelineEvent, RevealEvent,
};
pub use self::funded::FundedConsumer;
pub use self::poller::{FundingPoller, PollReport};
pub use self::queue::{DeadLetter, Delivery, EventQueue, MemoryQueue};
pub use self::redb_queue::RedbQueue;
pub use self::reveal::RevealConsumer;
use crate::chain::ChainObserver;
use crate::config::QueueConfig;
use crate::secure::SecureDocumentStore;
use crate::store::FundingStore;
use crate::{Config, OrdResult};

/// Queues connecting the stages.
#[derive(Clone)]
pub struct Queues {
    /// [`FundedEvent`]s, consumed by [`FundedConsumer`]
    pub funded: Arc<dyn EventQueue>,
    /// [`GenesisEvent`]s, consumed by [`RevealConsumer`]
    pub genesis: Arc<dyn EventQueue>,
    /// Reveal and insufficient funds notifications for the outside world
    pub notifications: Arc<dyn EventQueue>,
}

impl Queues {
    pub fn memory(config: &QueueConfig) -> Self {
        let queue = || -> Arc<dyn EventQueue> { Arc::new(MemoryQueue::from_config(config)) };

        Self {
            funded: queue(),
            genesis: queue(),
            notifications: queue(),
        }
    }

    /// Durable queues, stored in `db` next to the funding records.
    pub fn redb(db: Arc<redb::Database>, config: &QueueConfig) -> OrdResult<Self> {
        let queue = |name| -> OrdResult<Arc<dyn EventQueue>> {
            Ok(Arc::new(RedbQueue::from_config(db.clone(), name, config)?))
        };

        Ok(Self {
            funded: queue("funded")?,
            genesis: queue("genesis")?,
            notifications: queue("notifications")?,
        })
    }
}

/// Everything a stage needs, built once at start.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub funding: Arc<dyn FundingStore>,
    pub documents: SecureDocumentStore,
    pub observer: ChainObserver,
    pub queues: Queues,
}

/// Consumer of one queue.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one delivery; an error decides between retry and dead letter.
    async fn handle(&self, event: PipelineEvent) -> OrdResult<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub handled: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Handles every visible message of `queue`.
///
/// Lost conditional writes are acknowledged, transient failures retried after
/// `retry_delay × receive count`, anything else dead-lettered.
pub async fn drain(
    queue: &dyn EventQueue,
    handler: &dyn EventHandler,
    retry_delay: Duration,
) -> OrdResult<DrainReport> {
    let mut report = DrainReport::default();

    while let Some(delivery) = queue.receive().await? {
        let id = delivery.event.id().to_string();

        match handler.handle(delivery.event).await {
            Ok(()) => {
                queue.ack(delivery.receipt).await?;
                report.handled += 1;
            }
            Err(err) if err.is_concurrency_loss() => {
                debug!("{id}: lost a concurrent update, dropping message: {err}");
                queue.ack(delivery.receipt).await?;
                report.handled += 1;
            }
            Err(err) if err.is_transient() => {
                warn!(
                    "{id}: delivery {} failed, will retry: {err}",
                    delivery.receive_count
                );
                queue
                    .retry(delivery.receipt, retry_delay * delivery.receive_count)
                    .await?;
                report.retried += 1;
            }
            Err(err) => {
                error!("{id}: dead-lettering message: {err}");
                queue.dead_letter(delivery.receipt, &err.to_string()).await?;
                report.dead_lettered += 1;
            }
        }
    }

    Ok(report)
}

/// Logs notifications; stands in for the delivery to users.
pub struct NotificationLogger;

#[async_trait::async_trait]
impl EventHandler for NotificationLogger {
    async fn handle(&self, event: PipelineEvent) -> OrdResult<()> {
        match event {
            PipelineEvent::Reveal(event) => info!(
                "{} revealed in {}: {} inscriptions, underpriced: {}",
                event.id,
                event.reveal_txid,
                event.inscription_ids.len(),
                event.underpriced
            ),
            PipelineEvent::InsufficientFunds(event) => info!(
                "{} underpaid: received {} of {} sat at {}",
                event.id, event.received_sat, event.expected_sat, event.address
            ),
            other => debug!("notification ignored: {other:?}"),
        }

        Ok(())
    }
}
