use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::events::PipelineEvent;
use super::queue::{DeadLetter, Delivery, EventQueue};
use crate::config::QueueConfig;
use crate::error::storage;
use crate::{OrdError, OrdResult};

type MessageTable<'a> = TableDefinition<'a, u64, &'static [u8]>;

/// Next receipt of every queue, keyed by queue name.
const RECEIPTS: TableDefinition<&str, u64> = TableDefinition::new("QUEUE_RECEIPTS");

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    body: String,
    visible_at: DateTime<Utc>,
    receive_count: u32,
}

/// Queue persisted in a redb database, with the same visibility and redrive rules as
/// [`MemoryQueue`](super::MemoryQueue). Visibility is tracked in wall-clock time so that
/// pending retries keep their schedule across restarts.
pub struct RedbQueue {
    db: Arc<Database>,
    name: String,
    messages: String,
    dead_letters: String,
    max_receives: u32,
    visibility_timeout: chrono::Duration,
}

fn to_chrono(duration: Duration) -> OrdResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|err| OrdError::Config(format!("duration {duration:?}: {err}")))
}

fn bury(
    messages: &mut redb::Table<u64, &'static [u8]>,
    dead_letters: &mut redb::Table<u64, &'static [u8]>,
    receipt: u64,
    message: StoredMessage,
    reason: &str,
) -> OrdResult<()> {
    let dead = DeadLetter {
        body: message.body,
        reason: reason.to_string(),
        receive_count: message.receive_count,
    };
    messages.remove(receipt).map_err(storage)?;
    dead_letters
        .insert(receipt, serde_json::to_vec(&dead)?.as_slice())
        .map_err(storage)?;

    Ok(())
}

fn first_visible(
    messages: &impl ReadableTable<u64, &'static [u8]>,
    now: DateTime<Utc>,
) -> OrdResult<Option<(u64, StoredMessage)>> {
    for entry in messages.iter().map_err(storage)? {
        let (receipt, value) = entry.map_err(storage)?;
        let message: StoredMessage = serde_json::from_slice(value.value())?;
        if message.visible_at <= now {
            return Ok(Some((receipt.value(), message)));
        }
    }

    Ok(None)
}

impl RedbQueue {
    /// Opens the queue `name` in `db`, creating its tables if needed.
    pub fn open(
        db: Arc<Database>,
        name: &str,
        max_receives: u32,
        visibility_timeout: Duration,
    ) -> OrdResult<Self> {
        let queue = Self {
            db,
            name: name.to_string(),
            messages: format!("{}_MESSAGES", name.to_uppercase()),
            dead_letters: format!("{}_DEAD_LETTERS", name.to_uppercase()),
            max_receives: max_receives.max(1),
            visibility_timeout: to_chrono(visibility_timeout)?,
        };

        let wtx = queue.db.begin_write().map_err(storage)?;
        wtx.open_table(queue.messages()).map_err(storage)?;
        wtx.open_table(queue.dead_letters()).map_err(storage)?;
        wtx.open_table(RECEIPTS).map_err(storage)?;
        wtx.commit().map_err(storage)?;

        Ok(queue)
    }

    pub fn from_config(db: Arc<Database>, name: &str, config: &QueueConfig) -> OrdResult<Self> {
        Self::open(db, name, config.max_receives, config.visibility_timeout())
    }

    fn messages(&self) -> MessageTable<'_> {
        TableDefinition::new(&self.messages)
    }

    fn dead_letters(&self) -> MessageTable<'_> {
        TableDefinition::new(&self.dead_letters)
    }

    /// Messages not yet acknowledged nor dead-lettered.
    pub fn pending(&self) -> OrdResult<usize> {
        let rtx = self.db.begin_read().map_err(storage)?;
        let table = rtx.open_table(self.messages()).map_err(storage)?;
        Ok(table.len().map_err(storage)? as usize)
    }

    pub fn dead_letter_list(&self) -> OrdResult<Vec<DeadLetter>> {
        let rtx = self.db.begin_read().map_err(storage)?;
        let table = rtx.open_table(self.dead_letters()).map_err(storage)?;

        let mut dead = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, value) = entry.map_err(storage)?;
            dead.push(serde_json::from_slice(value.value())?);
        }

        Ok(dead)
    }

    /// Rewrites message `receipt` with `update`, or dead-letters it when `update` returns a
    /// reason.
    fn modify(
        &self,
        receipt: u64,
        update: impl FnOnce(&mut StoredMessage) -> Option<&'static str>,
    ) -> OrdResult<()> {
        let wtx = self.db.begin_write().map_err(storage)?;
        {
            let mut messages = wtx.open_table(self.messages()).map_err(storage)?;
            let mut message: StoredMessage = match messages.get(receipt).map_err(storage)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(OrdError::Parse(format!("unknown receipt {receipt}"))),
            };

            match update(&mut message) {
                Some(reason) => {
                    let mut dead_letters =
                        wtx.open_table(self.dead_letters()).map_err(storage)?;
                    bury(&mut messages, &mut dead_letters, receipt, message, reason)?;
                }
                None => {
                    messages
                        .insert(receipt, serde_json::to_vec(&message)?.as_slice())
                        .map_err(storage)?;
                }
            }
        }
        wtx.commit().map_err(storage)?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl EventQueue for RedbQueue {
    async fn publish(&self, event: &PipelineEvent) -> OrdResult<()> {
        let message = StoredMessage {
            body: serde_json::to_string(event)?,
            visible_at: Utc::now(),
            receive_count: 0,
        };

        let wtx = self.db.begin_write().map_err(storage)?;
        {
            let mut receipts = wtx.open_table(RECEIPTS).map_err(storage)?;
            let receipt = receipts
                .get(self.name.as_str())
                .map_err(storage)?
                .map(|value| value.value())
                .unwrap_or_default();
            receipts
                .insert(self.name.as_str(), receipt + 1)
                .map_err(storage)?;

            let mut messages = wtx.open_table(self.messages()).map_err(storage)?;
            messages
                .insert(receipt, serde_json::to_vec(&message)?.as_slice())
                .map_err(storage)?;
        }
        wtx.commit().map_err(storage)?;

        Ok(())
    }

    async fn receive(&self) -> OrdResult<Option<Delivery>> {
        let now = Utc::now();

        let wtx = self.db.begin_write().map_err(storage)?;
        let delivery = {
            let mut messages = wtx.open_table(self.messages()).map_err(storage)?;
            let mut dead_letters = wtx.open_table(self.dead_letters()).map_err(storage)?;

            loop {
                let Some((receipt, mut message)) = first_visible(&messages, now)? else {
                    break None;
                };

                if message.receive_count >= self.max_receives {
                    bury(
                        &mut messages,
                        &mut dead_letters,
                        receipt,
                        message,
                        "max receives exceeded",
                    )?;
                    continue;
                }

                let event = match serde_json::from_str::<PipelineEvent>(&message.body) {
                    Ok(event) => event,
                    Err(err) => {
                        let reason = format!("undecodable message: {err}");
                        warn!("{}: {reason}", self.name);
                        bury(&mut messages, &mut dead_letters, receipt, message, &reason)?;
                        continue;
                    }
                };

                message.receive_count += 1;
                message.visible_at = now + self.visibility_timeout;
                messages
                    .insert(receipt, serde_json::to_vec(&message)?.as_slice())
                    .map_err(storage)?;

                break Some(Delivery {
                    receipt,
                    event,
                    receive_count: message.receive_count,
                });
            }
        };
        wtx.commit().map_err(storage)?;

        Ok(delivery)
    }

    async fn ack(&self, receipt: u64) -> OrdResult<()> {
        let wtx = self.db.begin_write().map_err(storage)?;
        wtx.open_table(self.messages())
            .map_err(storage)?
            .remove(receipt)
            .map_err(storage)?;
        wtx.commit().map_err(storage)?;

        Ok(())
    }

    async fn retry(&self, receipt: u64, delay: Duration) -> OrdResult<()> {
        let visible_at = Utc::now() + to_chrono(delay)?;
        let max_receives = self.max_receives;

        self.modify(receipt, |message| {
            if message.receive_count >= max_receives {
                return Some("max receives exceeded");
            }
            message.visible_at = visible_at;
            None
        })
    }

    async fn dead_letter(&self, receipt: u64, reason: &str) -> OrdResult<()> {
        let wtx = self.db.begin_write().map_err(storage)?;
        {
            let mut messages = wtx.open_table(self.messages()).map_err(storage)?;
            let message: Option<StoredMessage> = match messages.get(receipt).map_err(storage)? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };
            if let Some(message) = message {
                let mut dead_letters = wtx.open_table(self.dead_letters()).map_err(storage)?;
                bury(&mut messages, &mut dead_letters, receipt, message, reason)?;
            }
        }
        wtx.commit().map_err(storage)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;
    use crate::pipeline::FundedEvent;
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

    fn open(dbfile: &NamedTempFile, name: &str, max_receives: u32) -> RedbQueue {
        let db = Arc::new(Database::create(dbfile.path()).unwrap());
        RedbQueue::open(db, name, max_receives, Duration::from_secs(3600)).unwrap()
    }

    #[tokio::test]
    async fn received_messages_stay_hidden_until_retried() {
        let dbfile = NamedTempFile::new().unwrap();
        let queue = open(&dbfile, "funded", 5);
        queue.publish(&funded("a")).await.unwrap();
        queue.publish(&funded("b")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.event.id(), "a");
        assert_eq!(first.receive_count, 1);
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.event.id(), "b");
        assert!(queue.receive().await.unwrap().is_none());

        queue.ack(second.receipt).await.unwrap();
        queue.retry(first.receipt, Duration::ZERO).await.unwrap();

        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.receipt, first.receipt);
        assert_eq!(again.receive_count, 2);
        assert_eq!(queue.pending().unwrap(), 1);

        queue
            .retry(again.receipt, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letters_after_max_receives() {
        let dbfile = NamedTempFile::new().unwrap();
        let queue = open(&dbfile, "genesis", 2);
        queue.publish(&funded("a")).await.unwrap();

        for _ in 0..2 {
            let delivery = queue.receive().await.unwrap().unwrap();
            queue.retry(delivery.receipt, Duration::ZERO).await.unwrap();
        }

        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(queue.pending().unwrap(), 0);
        let dead = queue.dead_letter_list().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].receive_count, 2);
        assert!(dead[0].body.contains("\"funded\""));
    }

    #[tokio::test]
    async fn messages_survive_a_reopen() {
        let dbfile = NamedTempFile::new().unwrap();
        {
            let queue = open(&dbfile, "funded", 5);
            queue.publish(&funded("a")).await.unwrap();
            queue.publish(&funded("b")).await.unwrap();
            let delivery = queue.receive().await.unwrap().unwrap();
            queue
                .dead_letter(delivery.receipt, "negative output")
                .await
                .unwrap();
        }

        let queue = open(&dbfile, "funded", 5);
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.event.id(), "b");
        assert_eq!(queue.dead_letter_list().unwrap()[0].reason, "negative output");

        // receipts keep counting after a reopen
        queue.publish(&funded("c")).await.unwrap();
        queue.ack(delivery.receipt).await.unwrap();
        let next = queue.receive().await.unwrap().unwrap();
        assert_eq!(next.event.id(), "c");
        assert!(next.receipt > delivery.receipt);
    }

    #[tokio::test]
    async fn queues_sharing_a_database_are_separate() {
        let dbfile = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::create(dbfile.path()).unwrap());
        let funded_queue =
            RedbQueue::open(db.clone(), "funded", 5, Duration::from_secs(60)).unwrap();
        let genesis_queue = RedbQueue::open(db, "genesis", 5, Duration::from_secs(60)).unwrap();

        funded_queue.publish(&funded("a")).await.unwrap();

        assert!(genesis_queue.receive().await.unwrap().is_none());
        assert!(funded_queue.receive().await.unwrap().is_some());
    }
}
