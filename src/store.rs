//! Funding requests and collections, mutated only through conditional transitions.

mod collection;
mod funding;
mod memory;
mod query;
mod redb_store;

pub use self::collection::{
    CollectionBookkeeper, CollectionRecord, CollectionStore, MemoryCollectionStore,
};
pub use self::funding::{
    FundedItem, FundingChange, FundingRequest, FundingStatus, FundingStore, FundingSummary,
    PollItem, Transition,
};
pub use self::memory::MemoryFundingStore;
pub use self::redb_store::RedbStore;
