use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::events::PipelineEvent;
use crate::config::QueueConfig;
use crate::{OrdError, OrdResult};

/// A received message, hidden from other receivers until acknowledged or retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: u64,
    pub event: PipelineEvent,
    /// Deliveries so far, this one included
    pub receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub body: String,
    pub reason: String,
    pub receive_count: u32,
}

/// At-least-once queue of [`PipelineEvent`]s.
#[async_trait::async_trait]
pub trait EventQueue: Send + Sync {
    async fn publish(&self, event: &PipelineEvent) -> OrdResult<()>;

    /// Next visible message, if any.
    async fn receive(&self) -> OrdResult<Option<Delivery>>;

    /// Removes a handled message.
    async fn ack(&self, receipt: u64) -> OrdResult<()>;

    /// Makes a message visible again after `delay`, or dead-letters it once it has been
    /// received too many times.
    async fn retry(&self, receipt: u64, delay: Duration) -> OrdResult<()>;

    async fn dead_letter(&self, receipt: u64, reason: &str) -> OrdResult<()>;
}

struct Message {
    body: String,
    visible_at: Instant,
    receive_count: u32,
}

#[derive(Default)]
struct QueueState {
    next_receipt: u64,
    messages: BTreeMap<u64, Message>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn bury(&mut self, receipt: u64, reason: &str) {
        if let Some(message) = self.messages.remove(&receipt) {
            self.dead_letters.push(DeadLetter {
                body: message.body,
                reason: reason.to_string(),
                receive_count: message.receive_count,
            });
        }
    }
}

/// In-process queue with SQS-like visibility and redrive semantics.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    max_receives: u32,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(max_receives: u32, visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::default(),
            max_receives: max_receives.max(1),
            visibility_timeout,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_receives, config.visibility_timeout())
    }

    /// Messages not yet acknowledged nor dead-lettered.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    /// Pending events, in publish order, without receiving them.
    pub fn peek(&self) -> Vec<PipelineEvent> {
        self.state
            .lock()
            .messages
            .values()
            .filter_map(|message| serde_json::from_str(&message.body).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl EventQueue for MemoryQueue {
    async fn publish(&self, event: &PipelineEvent) -> OrdResult<()> {
        let body = serde_json::to_string(event)?;
        let mut state = self.state.lock();
        let receipt = state.next_receipt;
        state.next_receipt += 1;
        state.messages.insert(
            receipt,
            Message {
                body,
                visible_at: Instant::now(),
                receive_count: 0,
            },
        );

        Ok(())
    }

    async fn receive(&self) -> OrdResult<Option<Delivery>> {
        let now = Instant::now();
        let mut state = self.state.lock();

        loop {
            let Some((&receipt, message)) = state
                .messages
                .iter_mut()
                .find(|(_, message)| message.visible_at <= now)
            else {
                return Ok(None);
            };

            if message.receive_count >= self.max_receives {
                state.bury(receipt, "max receives exceeded");
                continue;
            }

            let event = match serde_json::from_str::<PipelineEvent>(&message.body) {
                Ok(event) => event,
                Err(err) => {
                    let reason = format!("undecodable message: {err}");
                    warn!("{reason}");
                    state.bury(receipt, &reason);
                    continue;
                }
            };

            message.receive_count += 1;
            message.visible_at = now + self.visibility_timeout;

            return Ok(Some(Delivery {
                receipt,
                event,
                receive_count: message.receive_count,
            }));
        }
    }

    async fn ack(&self, receipt: u64) -> OrdResult<()> {
        self.state.lock().messages.remove(&receipt);
        Ok(())
    }

    async fn retry(&self, receipt: u64, delay: Duration) -> OrdResult<()> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get_mut(&receipt)
            .ok_or_else(|| OrdError::Parse(format!("unknown receipt {receipt}")))?;

        if message.receive_count >= self.max_receives {
            state.bury(receipt, "max receives exceeded");
        } else {
            message.visible_at = Instant::now() + delay;
        }

        Ok(())
    }

    async fn dead_letter(&self, receipt: u64, reason: &str) -> OrdResult<()> {
        self.state.lock().bury(receipt, reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FundedEvent, GenesisEvent};
    use crate::utils::test_utils::txid;

    fn funded(id: &str) -> PipelineEvent {
        FundedEvent {
            id: id.to_string(),
            address: "bcrt1p".to_string(),
            txid: txid(1),
            vout: 0,
            amount_sat: 1_000,
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn received_messages_are_hidden_until_visible_again() {
        let queue = MemoryQueue::new(5, Duration::from_secs(30));
        queue.publish(&funded("a")).await.unwrap();
        queue.publish(&funded("b")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.event.id(), "a");
        assert_eq!(first.receive_count, 1);
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.event.id(), "b");
        assert!(queue.receive().await.unwrap().is_none());

        queue.ack(second.receipt).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.receipt, first.receipt);
        assert_eq!(again.receive_count, 2);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_delay_retries() {
        let queue = MemoryQueue::new(5, Duration::from_secs(30));
        queue
            .publish(
                &GenesisEvent {
                    id: "a".to_string(),
                    address: "bcrt1p".to_string(),
                    genesis_txid: txid(2),
                    batch_id: None,
                }
                .into(),
            )
            .await
            .unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        queue
            .retry(delivery.receipt, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(queue.receive().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(queue.receive().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn should_dead_letter_after_max_receives() {
        let queue = MemoryQueue::new(2, Duration::from_secs(30));
        queue.publish(&funded("a")).await.unwrap();

        for _ in 0..2 {
            let delivery = queue.receive().await.unwrap().unwrap();
            queue.retry(delivery.receipt, Duration::ZERO).await.unwrap();
        }

        assert!(queue.receive().await.unwrap().is_none());
        assert!(queue.is_empty());
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].receive_count, 2);
        assert!(dead[0].body.contains("\"funded\""));
    }

    #[tokio::test]
    async fn should_dead_letter_on_request() {
        let queue = MemoryQueue::new(5, Duration::from_secs(30));
        queue.publish(&funded("a")).await.unwrap();
        assert_eq!(queue.peek(), vec![funded("a")]);

        let delivery = queue.receive().await.unwrap().unwrap();
        queue
            .dead_letter(delivery.receipt, "negative output")
            .await
            .unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters()[0].reason, "negative output");
    }
}
