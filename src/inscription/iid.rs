//! Implements `InscriptionId`

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::OrdError;

/// Identifies an inscription by its reveal transaction and its envelope index, `{txid}i{index}`.
#[derive(
    Debug, PartialEq, Copy, Clone, Hash, Eq, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr,
)]
pub struct InscriptionId {
    pub txid: Txid,
    pub index: u32,
}

impl InscriptionId {
    pub fn new(txid: Txid, index: u32) -> Self {
        Self { txid, index }
    }

    /// Raw encoding used by the parent tag: txid bytes followed by the little-endian index
    /// without trailing zeroes.
    pub fn get_raw(&self) -> Vec<u8> {
        let index = self.index.to_le_bytes();
        let mut index_slice = index.as_slice();

        while index_slice.last().copied() == Some(0) {
            index_slice = &index_slice[0..index_slice.len() - 1];
        }

        self.txid
            .to_byte_array()
            .iter()
            .chain(index_slice)
            .copied()
            .collect()
    }

    /// Decodes the raw parent-tag encoding.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() < 32 || raw.len() > 36 {
            return None;
        }

        let txid = Txid::from_slice(&raw[..32]).ok()?;
        let mut index = [0u8; 4];
        index[..raw.len() - 32].copy_from_slice(&raw[32..]);

        Some(Self {
            txid,
            index: u32::from_le_bytes(index),
        })
    }
}

impl fmt::Display for InscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}i{}", self.txid, self.index)
    }
}

impl FromStr for InscriptionId {
    type Err = OrdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const TXID_LEN: usize = 64;

        let (txid, index) = s
            .split_once('i')
            .ok_or_else(|| OrdError::Parse(format!("missing separator in inscription id {s}")))?;

        if txid.len() != TXID_LEN {
            return Err(OrdError::Parse(format!(
                "bad inscription id length: {}",
                s.len()
            )));
        }

        Ok(Self {
            txid: txid
                .parse()
                .map_err(|e| OrdError::Parse(format!("bad txid in {s}: {e}")))?,
            index: index
                .parse()
                .map_err(|e| OrdError::Parse(format!("bad index in {s}: {e}")))?,
        })
    }
}
