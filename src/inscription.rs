//! Inscription content and its on-chain envelope.

pub mod envelope;
pub mod iid;
mod parser;

use bitcoin::taproot::ControlBlock;
use bitcoin::{Amount, ScriptBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::parser::{inscription_ids, ParsedInscription};
use crate::{OrdError, OrdResult};

/// One content item of a funding request.
///
/// The body is written to the envelope as is; when `compressed` is set the body must already be
/// brotli-compressed and the envelope advertises the `br` content encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritableInscription {
    /// MIME type of the body, e.g. `image/png`.
    pub content_type: String,
    #[serde(with = "hex")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub compressed: bool,
    /// Arbitrary JSON, CBOR-encoded into the envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Value of the output carrying this inscription, in sats; the request padding when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<u64>,
}

impl WritableInscription {
    pub fn new(content_type: impl ToString, body: Vec<u8>) -> Self {
        Self {
            content_type: content_type.to_string(),
            body,
            compressed: false,
            metadata: None,
            padding: None,
        }
    }

    /// Marks the body as brotli-compressed.
    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_padding(mut self, padding: Amount) -> Self {
        self.padding = Some(padding.to_sat());
        self
    }

    /// Padding of this item, falling back to `default`.
    pub fn padding_or(&self, default: Amount) -> Amount {
        self.padding.map(Amount::from_sat).unwrap_or(default)
    }

    /// Validates the content type.
    pub fn validate(&self) -> OrdResult<()> {
        if !self.content_type.contains('/') {
            return Err(OrdError::InvalidInscription(format!(
                "bad content type: {}",
                self.content_type
            )));
        }

        Ok(())
    }

    /// Metadata encoded as CBOR, if any.
    pub fn cbor_metadata(&self) -> OrdResult<Option<Vec<u8>>> {
        let Some(metadata) = &self.metadata else {
            return Ok(None);
        };

        let mut encoded = Vec::new();
        ciborium::into_writer(metadata, &mut encoded)
            .map_err(|e| OrdError::InvalidInscription(format!("metadata: {e}")))?;

        Ok(Some(encoded))
    }
}

/// Per-item spending data, fixed when the funding address is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InscriptionLayout {
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
    pub padding: Amount,
}
