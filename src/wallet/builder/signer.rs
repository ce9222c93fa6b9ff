use bitcoin::hashes::Hash as _;
use bitcoin::key::{Keypair, Secp256k1};
use bitcoin::secp256k1::{self, All};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::LeafVersion;
use bitcoin::{TapLeafHash, TapSighashType, Transaction, TxOut, Witness};

use super::taproot::{TaprootLeaf, TaprootPayload};
use crate::{OrdError, OrdResult};

/// How a single input of the funding address is spent.
#[derive(Debug, Clone, Copy)]
pub enum SpendPath<'a> {
    /// Key-path spend with the tweaked key of the payload.
    Key(&'a TaprootPayload),
    /// Script-path spend revealing `leaf`, signed by the internal key.
    Script(&'a TaprootPayload, &'a TaprootLeaf),
}

/// Schnorr signer for inputs locked to funding addresses.
pub struct Signer {
    secp: Secp256k1<All>,
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    /// Signs every input of `transaction`.
    ///
    /// `prevouts` and `paths` must be given in input order.
    pub fn sign(
        &self,
        transaction: Transaction,
        prevouts: &[TxOut],
        paths: &[SpendPath],
    ) -> OrdResult<Transaction> {
        if transaction.input.len() != prevouts.len() || prevouts.len() != paths.len() {
            return Err(OrdError::InputNotFound(
                transaction.input.len().min(prevouts.len()).min(paths.len()),
            ));
        }

        let prevouts = Prevouts::All(prevouts);
        let mut sighash_cache = SighashCache::new(transaction);

        for (index, path) in paths.iter().enumerate() {
            let witness = match path {
                SpendPath::Key(payload) => {
                    self.key_spend_witness(&mut sighash_cache, &prevouts, index, payload)?
                }
                SpendPath::Script(payload, leaf) => {
                    self.script_spend_witness(&mut sighash_cache, &prevouts, index, payload, leaf)?
                }
            };
            debug!("witness for input {index}: {witness:?}");

            *sighash_cache
                .witness_mut(index)
                .ok_or(OrdError::InputNotFound(index))? = witness;
        }

        Ok(sighash_cache.into_transaction())
    }

    fn key_spend_witness(
        &self,
        sighash_cache: &mut SighashCache<Transaction>,
        prevouts: &Prevouts<TxOut>,
        index: usize,
        payload: &TaprootPayload,
    ) -> OrdResult<Witness> {
        let sighash = sighash_cache.taproot_key_spend_signature_hash(
            index,
            prevouts,
            TapSighashType::Default,
        )?;

        let keypair = payload.tweaked_keypair(&self.secp);
        let signature = self.sign_schnorr(sighash.to_byte_array(), &keypair)?;

        Ok(Witness::from_slice(&[signature.to_vec()]))
    }

    fn script_spend_witness(
        &self,
        sighash_cache: &mut SighashCache<Transaction>,
        prevouts: &Prevouts<TxOut>,
        index: usize,
        payload: &TaprootPayload,
        leaf: &TaprootLeaf,
    ) -> OrdResult<Witness> {
        let sighash = sighash_cache.taproot_script_spend_signature_hash(
            index,
            prevouts,
            TapLeafHash::from_script(&leaf.script, LeafVersion::TapScript),
            TapSighashType::Default,
        )?;

        let signature = self.sign_schnorr(sighash.to_byte_array(), &payload.keypair)?;

        let mut witness = Witness::new();
        witness.push(signature.to_vec());
        witness.push(leaf.script.as_bytes());
        witness.push(leaf.control_block.serialize());

        Ok(witness)
    }

    fn sign_schnorr(
        &self,
        digest: [u8; 32],
        keypair: &Keypair,
    ) -> OrdResult<bitcoin::taproot::Signature> {
        let msg = secp256k1::Message::from_digest(digest);
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, keypair);

        // verify
        self.secp
            .verify_schnorr(&sig, &msg, &keypair.x_only_public_key().0)?;

        Ok(bitcoin::taproot::Signature {
            sig,
            hash_ty: TapSighashType::Default,
        })
    }
}
