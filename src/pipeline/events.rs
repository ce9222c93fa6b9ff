use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::InscriptionId;

/// Message exchanged between pipeline stages, JSON on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Funded(FundedEvent),
    Genesis(GenesisEvent),
    Reveal(RevealEvent),
    InsufficientFunds(InsufficientFundsEvent),
}

impl PipelineEvent {
    /// Funding request the event is about.
    pub fn id(&self) -> &str {
        match self {
            Self::Funded(event) => &event.id,
            Self::Genesis(event) => &event.id,
            Self::Reveal(event) => &event.id,
            Self::InsufficientFunds(event) => &event.id,
        }
    }
}

/// The funding address received the expected amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundedEvent {
    pub id: String,
    pub address: String,
    pub txid: Txid,
    pub vout: u32,
    pub amount_sat: u64,
}

/// The genesis transaction of a request was broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisEvent {
    pub id: String,
    pub address: String,
    pub genesis_txid: Txid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealEvent {
    pub id: String,
    pub address: String,
    pub reveal_txid: Txid,
    pub inscription_ids: Vec<InscriptionId>,
    /// The reveal pays less than the quoted fee rate and may confirm slowly
    pub underpriced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

/// The funding address was paid less than quoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientFundsEvent {
    pub id: String,
    pub address: String,
    pub txid: Txid,
    pub vout: u32,
    pub received_sat: u64,
    pub expected_sat: u64,
}

macro_rules! into_pipeline_event {
    ($($event:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$event> for PipelineEvent {
                fn from(event: $event) -> Self {
                    Self::$variant(event)
                }
            }
        )*
    };
}

into_pipeline_event! {
    FundedEvent => Funded,
    GenesisEvent => Genesis,
    RevealEvent => Reveal,
    InsufficientFundsEvent => InsufficientFunds,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::txid;

    #[test]
    fn should_tag_events() {
        let event = PipelineEvent::from(FundedEvent {
            id: "abc".to_string(),
            address: "bcrt1q".to_string(),
            txid: txid(1),
            vout: 2,
            amount_sat: 10_000,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "funded");
        assert_eq!(json["vout"], 2);
        assert_eq!(json["txid"], txid(1).to_string());

        let decoded: PipelineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.id(), "abc");
    }

    #[test]
    fn should_decode_reveal_event() {
        let reveal_txid = txid(3);
        let json = format!(
            r#"{{"type":"reveal","id":"abc","address":"bcrt1p","reveal_txid":"{reveal_txid}",
                "inscription_ids":["{reveal_txid}i0","{reveal_txid}i1"],"underpriced":false}}"#
        );

        let PipelineEvent::Reveal(event) = serde_json::from_str(&json).unwrap() else {
            panic!("expected a reveal event");
        };
        assert_eq!(event.inscription_ids[1], InscriptionId::new(reveal_txid, 1));
        assert_eq!(event.batch_id, None);
    }
}
