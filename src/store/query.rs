use chrono::{DateTime, Utc};

use super::funding::{FundedItem, FundingRequest, FundingStatus, FundingSummary, PollItem};

// Listings over a full set of records, shared by the store implementations.

pub(super) fn due_for_check<'a>(
    records: impl Iterator<Item = &'a FundingRequest>,
    status: FundingStatus,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<PollItem> {
    let mut items = records
        .filter(|record| record.status == status && record.next_check_at <= now)
        .map(FundingRequest::poll_item)
        .collect::<Vec<_>>();
    items.sort_by_key(|item| item.next_check_at);
    items.truncate(limit);
    items
}

pub(super) fn funded_before<'a>(
    records: impl Iterator<Item = &'a FundingRequest>,
    status: FundingStatus,
    before: DateTime<Utc>,
    limit: usize,
) -> Vec<FundedItem> {
    let mut items = records
        .filter(|record| record.status == status)
        .filter_map(FundingRequest::funded_item)
        .filter(|item| item.funded_at < before)
        .collect::<Vec<_>>();
    items.sort_by_key(|item| item.funded_at);
    items.truncate(limit);
    items
}

pub(super) fn republish_due<'a>(
    records: impl Iterator<Item = &'a FundingRequest>,
    before: DateTime<Utc>,
    now: DateTime<Utc>,
    max_times: u32,
    limit: usize,
) -> Vec<FundedItem> {
    let mut items = funded_before(records, FundingStatus::Funded, before, usize::MAX)
        .into_iter()
        .filter(|item| item.republish_count < max_times)
        .filter(|item| item.next_republish_at.map_or(true, |at| at <= now))
        .collect::<Vec<_>>();
    items.truncate(limit);
    items
}

pub(super) fn in_collection<'a>(
    records: impl Iterator<Item = &'a FundingRequest>,
    collection_id: &str,
    status: FundingStatus,
    limit: usize,
) -> Vec<FundingSummary> {
    let mut records = records
        .filter(|record| {
            record.status == status && record.collection_id.as_deref() == Some(collection_id)
        })
        .collect::<Vec<_>>();
    records.sort_by_key(|record| record.funded_at.unwrap_or(record.created_at));

    records
        .into_iter()
        .take(limit)
        .map(FundingRequest::summary)
        .collect()
}

pub(super) fn in_batch<'a>(
    records: impl Iterator<Item = &'a FundingRequest>,
    batch_id: &str,
) -> Vec<FundingSummary> {
    let mut items = records
        .filter(|record| record.batch_id.as_deref() == Some(batch_id))
        .map(FundingRequest::summary)
        .collect::<Vec<_>>();
    items.sort_by(|a, b| a.id.cmp(&b.id));
    items
}

/// Newest first.
pub(super) fn by_creator<'a>(
    records: impl Iterator<Item = &'a FundingRequest>,
    creator_id: &str,
    limit: usize,
) -> Vec<FundingSummary> {
    let mut items = records
        .filter(|record| record.creator_id.as_deref() == Some(creator_id))
        .map(FundingRequest::summary)
        .collect::<Vec<_>>();
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    items.truncate(limit);
    items
}
