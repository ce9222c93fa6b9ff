use std::fmt;

use bitcoin::{Address, Amount, Network, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::utils::sha256sum_hex;
use crate::{OrdError, OrdResult};

/// Lifecycle of a funding request.
///
/// `funding → funded → {genesis | batch} → revealed`, and `expired` from any state but
/// `revealed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingStatus {
    Funding,
    Funded,
    Genesis,
    Batch,
    Revealed,
    Expired,
}

impl FundingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Revealed | Self::Expired)
    }

    pub fn can_transition_to(&self, next: FundingStatus) -> bool {
        use FundingStatus::*;

        match (self, next) {
            (Funding, Funded) | (Funded, Genesis) | (Funded, Batch) => true,
            (Genesis, Revealed) | (Batch, Revealed) => true,
            (from, Expired) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for FundingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Funding => "funding",
            Self::Funded => "funded",
            Self::Genesis => "genesis",
            Self::Batch => "batch",
            Self::Revealed => "revealed",
            Self::Expired => "expired",
        };
        write!(f, "{status}")
    }
}

/// Outcome of a conditional write that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The request already was in the requested state with the same data.
    Unchanged,
}

/// One inscription attempt, stored under `(id, "funding")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRequest {
    pub id: String,
    pub address: String,
    pub destination_address: String,
    pub network: Network,
    pub status: FundingStatus,
    pub funding_amount_sat: u64,
    pub tip_amount_sat: u64,
    pub tip_destination: Option<String>,
    pub times_checked: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub funding_txid: Option<Txid>,
    pub funding_vout: Option<u32>,
    /// Value of the funding output, set with the outpoint.
    pub received_amount_sat: Option<u64>,
    pub genesis_txid: Option<Txid>,
    pub reveal_txid: Option<Txid>,
    pub batch_id: Option<String>,
    pub collection_id: Option<String>,
    pub creator_id: Option<String>,
    /// Value of the linked parent inscription's UTXO, which is sent to the funding address too.
    #[serde(default)]
    pub parent_value_sat: Option<u64>,
    #[serde(default)]
    pub republish_count: u32,
    #[serde(default)]
    pub next_republish_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: Value,
}

impl FundingRequest {
    pub fn new(
        address: &Address,
        destination: &Address,
        network: Network,
        funding_amount: Amount,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::request_id(address),
            address: address.to_string(),
            destination_address: destination.to_string(),
            network,
            status: FundingStatus::Funding,
            funding_amount_sat: funding_amount.to_sat(),
            tip_amount_sat: 0,
            tip_destination: None,
            times_checked: 0,
            last_checked_at: None,
            next_check_at: created_at,
            created_at,
            funded_at: None,
            funding_txid: None,
            funding_vout: None,
            received_amount_sat: None,
            genesis_txid: None,
            reveal_txid: None,
            batch_id: None,
            collection_id: None,
            creator_id: None,
            parent_value_sat: None,
            republish_count: 0,
            next_republish_at: None,
            meta: Value::Null,
        }
    }

    /// Id of the request funded through `address`: hex of the first 16 bytes of its sha256.
    pub fn request_id(address: &Address) -> String {
        sha256sum_hex(address.to_string().as_bytes(), 16)
    }

    pub fn with_tip(mut self, tip: Amount, destination: Option<String>) -> Self {
        self.tip_amount_sat = tip.to_sat();
        self.tip_destination = destination;
        self
    }

    pub fn with_collection(mut self, collection_id: impl ToString) -> Self {
        self.collection_id = Some(collection_id.to_string());
        self
    }

    pub fn with_creator(mut self, creator_id: impl ToString) -> Self {
        self.creator_id = Some(creator_id.to_string());
        self
    }

    pub fn with_parent_value(mut self, value: Amount) -> Self {
        self.parent_value_sat = Some(value.to_sat());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn funding_amount(&self) -> Amount {
        Amount::from_sat(self.funding_amount_sat)
    }

    pub fn poll_item(&self) -> PollItem {
        PollItem {
            id: self.id.clone(),
            address: self.address.clone(),
            funding_amount_sat: self.funding_amount_sat,
            parent_value_sat: self.parent_value_sat,
            times_checked: self.times_checked,
            next_check_at: self.next_check_at,
            created_at: self.created_at,
        }
    }

    pub fn funded_item(&self) -> Option<FundedItem> {
        Some(FundedItem {
            id: self.id.clone(),
            address: self.address.clone(),
            funded_at: self.funded_at?,
            funding_txid: self.funding_txid?,
            funding_vout: self.funding_vout?,
            received_amount_sat: self.received_amount_sat?,
            republish_count: self.republish_count,
            next_republish_at: self.next_republish_at,
        })
    }

    pub fn summary(&self) -> FundingSummary {
        FundingSummary {
            id: self.id.clone(),
            address: self.address.clone(),
            status: self.status,
            batch_id: self.batch_id.clone(),
            genesis_txid: self.genesis_txid,
            reveal_txid: self.reveal_txid,
            created_at: self.created_at,
        }
    }
}

// Conditional transitions, shared by every store. Each one validates against the current
// record and either mutates it or fails without touching it.
impl FundingRequest {
    pub(super) fn condition_failed(&self, expected: impl ToString) -> OrdError {
        OrdError::ConditionFailed {
            id: self.id.clone(),
            expected: expected.to_string(),
            found: self.status.to_string(),
        }
    }

    pub(super) fn fund(
        &mut self,
        txid: Txid,
        vout: u32,
        amount: Amount,
        at: DateTime<Utc>,
    ) -> OrdResult<Transition> {
        if let (Some(existing_txid), Some(existing_vout)) = (self.funding_txid, self.funding_vout) {
            if (existing_txid, existing_vout) == (txid, vout) {
                return Ok(Transition::Unchanged);
            }
            return Err(OrdError::FundingMismatch {
                id: self.id.clone(),
                existing: bitcoin::OutPoint::new(existing_txid, existing_vout),
                attempted: bitcoin::OutPoint::new(txid, vout),
            });
        }
        if self.status != FundingStatus::Funding {
            return Err(self.condition_failed(FundingStatus::Funding));
        }

        self.status = FundingStatus::Funded;
        self.funding_txid = Some(txid);
        self.funding_vout = Some(vout);
        self.received_amount_sat = Some(amount.to_sat());
        self.funded_at = Some(at);

        Ok(Transition::Applied)
    }

    pub(super) fn start_genesis(&mut self, genesis_txid: Txid) -> OrdResult<Transition> {
        if self.status == FundingStatus::Genesis && self.genesis_txid == Some(genesis_txid) {
            return Ok(Transition::Unchanged);
        }
        if self.status != FundingStatus::Funded || self.batch_id.is_some() {
            return Err(self.condition_failed(FundingStatus::Funded));
        }

        self.status = FundingStatus::Genesis;
        self.genesis_txid = Some(genesis_txid);

        Ok(Transition::Applied)
    }

    pub(super) fn ensure_batchable(&self) -> OrdResult<()> {
        if self.status != FundingStatus::Funded || self.batch_id.is_some() {
            return Err(self.condition_failed(FundingStatus::Funded));
        }
        Ok(())
    }

    /// `funded → batch`; callers check [`Self::ensure_batchable`] on every member first.
    pub(super) fn assign_batch(&mut self, batch_id: &str) {
        self.status = FundingStatus::Batch;
        self.batch_id = Some(batch_id.to_string());
    }

    pub(super) fn record_batch_genesis(&mut self, genesis_txid: Txid) -> OrdResult<Transition> {
        if self.status != FundingStatus::Batch {
            return Err(self.condition_failed(FundingStatus::Batch));
        }
        match self.genesis_txid {
            Some(existing) if existing == genesis_txid => Ok(Transition::Unchanged),
            Some(existing) => Err(OrdError::ConditionFailed {
                id: self.id.clone(),
                expected: "no genesis".to_string(),
                found: existing.to_string(),
            }),
            None => {
                self.genesis_txid = Some(genesis_txid);
                Ok(Transition::Applied)
            }
        }
    }

    pub(super) fn reveal(&mut self, reveal_txid: Txid) -> OrdResult<Transition> {
        if self.status == FundingStatus::Revealed && self.reveal_txid == Some(reveal_txid) {
            return Ok(Transition::Unchanged);
        }
        if !self.status.can_transition_to(FundingStatus::Revealed) {
            return Err(self.condition_failed("genesis or batch"));
        }

        self.status = FundingStatus::Revealed;
        self.reveal_txid = Some(reveal_txid);

        Ok(Transition::Applied)
    }

    pub(super) fn expire(&mut self) -> OrdResult<Transition> {
        if self.status == FundingStatus::Expired {
            return Ok(Transition::Unchanged);
        }
        if !self.status.can_transition_to(FundingStatus::Expired) {
            return Err(self.condition_failed("non-terminal status"));
        }

        self.status = FundingStatus::Expired;
        Ok(Transition::Applied)
    }

    pub(super) fn mark_checked(&mut self, at: DateTime<Utc>) -> u32 {
        self.last_checked_at = Some(at);
        self.times_checked += 1;
        self.times_checked
    }

    pub(super) fn mark_republished(&mut self, next_at: DateTime<Utc>) -> OrdResult<u32> {
        if self.status != FundingStatus::Funded {
            return Err(self.condition_failed(FundingStatus::Funded));
        }

        self.republish_count += 1;
        self.next_republish_at = Some(next_at);
        Ok(self.republish_count)
    }

    pub(super) fn change(&self, from: FundingStatus) -> FundingChange {
        debug!("funding {}: {from} -> {}", self.id, self.status);
        FundingChange {
            id: self.id.clone(),
            collection_id: self.collection_id.clone(),
            from,
            to: self.status,
        }
    }
}

/// Projection driving the funding poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollItem {
    pub id: String,
    pub address: String,
    pub funding_amount_sat: u64,
    #[serde(default)]
    pub parent_value_sat: Option<u64>,
    pub times_checked: u32,
    pub next_check_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Projection of funded requests, for re-publishing stale ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundedItem {
    pub id: String,
    pub address: String,
    pub funded_at: DateTime<Utc>,
    pub funding_txid: Txid,
    pub funding_vout: u32,
    pub received_amount_sat: u64,
    pub republish_count: u32,
    pub next_republish_at: Option<DateTime<Utc>>,
}

/// Projection used by the collection, batch and creator listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingSummary {
    pub id: String,
    pub address: String,
    pub status: FundingStatus,
    pub batch_id: Option<String>,
    pub genesis_txid: Option<Txid>,
    pub reveal_txid: Option<Txid>,
    pub created_at: DateTime<Utc>,
}

/// Status change published on the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingChange {
    pub id: String,
    pub collection_id: Option<String>,
    pub from: FundingStatus,
    pub to: FundingStatus,
}

/// Authoritative store of funding requests.
///
/// Every status change is conditional on the stored status at write time; a lost race fails
/// with [`OrdError::ConditionFailed`](crate::OrdError::ConditionFailed) and leaves the record
/// untouched.
#[async_trait::async_trait]
pub trait FundingStore: Send + Sync {
    /// Inserts `request` unless its id is already taken.
    async fn create_funding(&self, request: FundingRequest) -> OrdResult<()>;

    async fn get_funding(&self, id: &str) -> OrdResult<FundingRequest>;

    /// `funding → funded`, recording the funding outpoint.
    ///
    /// Repeating the call with the same outpoint is a no-op; a different outpoint is refused.
    async fn address_funded(
        &self,
        id: &str,
        txid: Txid,
        vout: u32,
        amount: Amount,
        at: DateTime<Utc>,
    ) -> OrdResult<Transition>;

    /// `funded → genesis`, for requests not assigned to a batch.
    async fn genesis_funded(&self, id: &str, genesis_txid: Txid) -> OrdResult<Transition>;

    /// `funded → batch` for every id, or for none.
    async fn create_batch(&self, ids: &[String], batch_id: &str) -> OrdResult<()>;

    /// Records the genesis transaction of a batched request.
    async fn record_batch_genesis(&self, id: &str, genesis_txid: Txid) -> OrdResult<Transition>;

    /// `{genesis | batch} → revealed`.
    async fn mark_revealed(&self, id: &str, reveal_txid: Txid) -> OrdResult<Transition>;

    async fn update_funding_next_check_at(&self, id: &str, at: DateTime<Utc>) -> OrdResult<()>;

    /// Stamps a check and returns the incremented `times_checked`.
    async fn update_funding_last_checked(&self, id: &str, at: DateTime<Utc>) -> OrdResult<u32>;

    async fn reset_times_checked(&self, id: &str) -> OrdResult<()>;

    /// Any non-terminal status → `expired`.
    async fn expire(&self, id: &str) -> OrdResult<Transition>;

    /// Counts one re-publication of a `funded` request and schedules the next one at
    /// `next_at`. Returns the new count.
    async fn mark_republished(&self, id: &str, next_at: DateTime<Utc>) -> OrdResult<u32>;

    /// Requests in `status` due for a check at `now`, oldest schedule first.
    async fn list_by_status_and_next_check(
        &self,
        status: FundingStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> OrdResult<Vec<PollItem>>;

    /// Requests in `status` funded before `before`, oldest first.
    async fn list_by_status_and_funded_at(
        &self,
        status: FundingStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> OrdResult<Vec<FundedItem>>;

    /// `funded` requests funded before `before` that were re-published fewer than `max_times`
    /// times and whose next re-publication is due at `now`, oldest first.
    async fn list_republish_due(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
        max_times: u32,
        limit: usize,
    ) -> OrdResult<Vec<FundedItem>>;

    async fn list_by_status_and_collection(
        &self,
        collection_id: &str,
        status: FundingStatus,
        limit: usize,
    ) -> OrdResult<Vec<FundingSummary>>;

    async fn list_by_batch(&self, batch_id: &str) -> OrdResult<Vec<FundingSummary>>;

    /// Requests of a creator, newest first.
    async fn list_by_creator(&self, creator_id: &str, limit: usize)
        -> OrdResult<Vec<FundingSummary>>;

    /// Stream of status changes applied from now on.
    fn subscribe(&self) -> broadcast::Receiver<FundingChange>;
}
