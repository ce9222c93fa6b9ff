use bitcoin::{Amount, OutPoint};
use thiserror::Error;

/// Ordinal funding error
#[derive(Error, Debug)]
pub enum OrdError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("condition failed for {id}: expected {expected}, found {found}")]
    ConditionFailed {
        id: String,
        expected: String,
        found: String,
    },
    #[error("funding {0} not found")]
    FundingNotFound(String),
    #[error("funding {0} already exists")]
    AlreadyExists(String),
    #[error("funding {id} already funded by {existing}, refusing {attempted}")]
    FundingMismatch {
        id: String,
        existing: OutPoint,
        attempted: OutPoint,
    },
    #[error("collection {0} not found")]
    CollectionNotFound(String),
    #[error("collection {0} has no supply left")]
    CollectionSoldOut(String),
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },
    #[error("no eligible fee destination for {0}")]
    NoEligibleFeeDestination(Amount),
    #[error("outputs exceed inputs")]
    NegativeOutput,
    #[error("output of {0} is below the dust limit")]
    BelowDust(Amount),
    #[error("zero fee rate is only allowed on test networks")]
    ZeroFeeRate,
    #[error("fee computation overflowed")]
    FeeOverflow,
    #[error("invalid inscription: {0}")]
    InvalidInscription(String),
    #[error("taproot computation failed")]
    TaprootCompute,
    #[error("stored parameters do not match address {0}")]
    AddressMismatch(String),
    #[error("bad transaction input: {0}")]
    InputNotFound(usize),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("invalid encrypted envelope: {0}")]
    InvalidEnvelope(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("bitcoin address error: {0}")]
    Address(#[from] bitcoin::address::Error),
    #[error("bitcoin address parse error: {0}")]
    AddressParse(#[from] bitcoin::address::ParseError),
    #[error("bitcoin sighash error: {0}")]
    Sighash(#[from] bitcoin::sighash::Error),
    #[error("bitcoin script error: {0}")]
    PushBytes(#[from] bitcoin::script::PushBytesError),
    #[error("bitcoin consensus encoding error: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),
    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),
}

/// Lifts any redb error into [`OrdError::Storage`].
pub(crate) fn storage(err: impl Into<redb::Error>) -> OrdError {
    OrdError::Storage(err.into())
}

impl OrdError {
    /// Whether the failure may go away by itself, so the work should be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::NotReady(_) | Self::BroadcastRejected(_) | Self::Io(_)
        )
    }

    /// Whether the failure only means another worker advanced the request first.
    pub fn is_concurrency_loss(&self) -> bool {
        matches!(
            self,
            Self::ConditionFailed { .. } | Self::FundingMismatch { .. }
        )
    }
}
