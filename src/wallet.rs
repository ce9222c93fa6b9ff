pub mod builder;
pub mod fee_destination;

pub use builder::{
    construct_genesis_transaction, construct_refund_transaction, construct_reveal_transaction,
    derive_funding_address, genesis_fee_output, FeeRateRange, FundingAddress, FundingArgs,
    GenesisArgs, GenesisTransaction, ParentArgs, RevealRequest, RevealTransaction,
    TaprootKeypair, TaprootLeaf, TaprootPayload, Utxo,
};
pub use fee_destination::{FeeDestination, FeeDestinationRecord};
