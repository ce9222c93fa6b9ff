mod taproot_keypair;

use bitcoin::key::{TapTweak, UntweakedKeypair};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapNodeHash, TaprootBuilder};
use bitcoin::{Address, Network, ScriptBuf, XOnlyPublicKey};

pub use self::taproot_keypair::TaprootKeypair;
use crate::{OrdError, OrdResult};

/// Script leaf of the funding address together with its inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaprootLeaf {
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
}

/// Funding address committing to one leaf per inscription, plus the parent leaf when linked.
#[derive(Debug, Clone)]
pub struct TaprootPayload {
    pub address: Address,
    pub keypair: UntweakedKeypair,
    pub merkle_root: Option<TapNodeHash>,
    /// Inscription leaves, in request order.
    pub leaves: Vec<TaprootLeaf>,
    pub parent_leaf: Option<TaprootLeaf>,
}

impl TaprootPayload {
    /// Build the script tree with equal weights and get the P2TR address
    pub fn build(
        secp: &Secp256k1<All>,
        keypair: UntweakedKeypair,
        scripts: Vec<ScriptBuf>,
        parent_script: Option<ScriptBuf>,
        network: Network,
    ) -> OrdResult<Self> {
        if scripts.is_empty() {
            return Err(OrdError::InvalidInscription(
                "at least one inscription is required".to_string(),
            ));
        }

        let weighted = scripts
            .iter()
            .chain(parent_script.iter())
            .map(|script| (1u32, script.clone()));

        let taproot_spend_info = TaprootBuilder::with_huffman_tree(weighted)
            .map_err(|_| OrdError::TaprootCompute)?
            .finalize(secp, keypair.x_only_public_key().0)
            .map_err(|_| OrdError::TaprootCompute)?;

        let leaf = |script: ScriptBuf| -> OrdResult<TaprootLeaf> {
            let control_block = taproot_spend_info
                .control_block(&(script.clone(), LeafVersion::TapScript))
                .ok_or(OrdError::TaprootCompute)?;
            Ok(TaprootLeaf {
                script,
                control_block,
            })
        };

        let leaves = scripts.into_iter().map(leaf).collect::<OrdResult<Vec<_>>>()?;
        let parent_leaf = parent_script.map(leaf).transpose()?;

        Ok(Self {
            address: Address::p2tr_tweaked(taproot_spend_info.output_key(), network),
            keypair,
            merkle_root: taproot_spend_info.merkle_root(),
            leaves,
            parent_leaf,
        })
    }

    /// Rebuilds a payload from stored leaves and checks it still pays `expected_address`.
    pub fn restore(
        secp: &Secp256k1<All>,
        keypair: UntweakedKeypair,
        scripts: Vec<ScriptBuf>,
        parent_script: Option<ScriptBuf>,
        network: Network,
        expected_address: &str,
    ) -> OrdResult<Self> {
        let payload = Self::build(secp, keypair, scripts, parent_script, network)?;
        if payload.address.to_string() != expected_address {
            return Err(OrdError::AddressMismatch(expected_address.to_string()));
        }

        Ok(payload)
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Keypair signing key-path spends of the funding address.
    pub fn tweaked_keypair(&self, secp: &Secp256k1<All>) -> UntweakedKeypair {
        self.keypair.tap_tweak(secp, self.merkle_root).to_inner()
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::key::{Keypair, TweakedPublicKey};
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::ScriptBuf;

    use super::*;

    fn keypair(secp: &Secp256k1<All>) -> Keypair {
        Keypair::from_secret_key(secp, &SecretKey::from_slice(&[5; 32]).unwrap())
    }

    fn scripts(n: u8) -> Vec<ScriptBuf> {
        (0..n).map(|i| ScriptBuf::from_bytes(vec![0x51, 0x01, i])).collect()
    }

    #[test]
    fn every_leaf_proves_inclusion() {
        let secp = Secp256k1::new();
        let payload = TaprootPayload::build(
            &secp,
            keypair(&secp),
            scripts(3),
            Some(ScriptBuf::from_bytes(vec![0x52])),
            Network::Regtest,
        )
        .unwrap();

        let output_key = payload
            .keypair
            .x_only_public_key()
            .0
            .tap_tweak(&secp, payload.merkle_root)
            .0
            .to_inner();

        assert_eq!(payload.leaves.len(), 3);
        for leaf in payload.leaves.iter().chain(payload.parent_leaf.iter()) {
            assert!(leaf
                .control_block
                .verify_taproot_commitment(&secp, output_key, &leaf.script));
        }
    }

    #[test]
    fn tweaked_keypair_matches_address() {
        let secp = Secp256k1::new();
        let payload =
            TaprootPayload::build(&secp, keypair(&secp), scripts(2), None, Network::Regtest)
                .unwrap();

        let tweaked = payload.tweaked_keypair(&secp).x_only_public_key().0;
        let expected = Address::p2tr_tweaked(
            TweakedPublicKey::dangerous_assume_tweaked(tweaked),
            Network::Regtest,
        );

        assert_eq!(payload.address, expected);
    }

    #[test]
    fn should_restore_or_detect_mismatch() {
        let secp = Secp256k1::new();
        let payload =
            TaprootPayload::build(&secp, keypair(&secp), scripts(2), None, Network::Regtest)
                .unwrap();

        let restored = TaprootPayload::restore(
            &secp,
            keypair(&secp),
            scripts(2),
            None,
            Network::Regtest,
            &payload.address.to_string(),
        )
        .unwrap();
        assert_eq!(restored.address, payload.address);

        assert!(matches!(
            TaprootPayload::restore(
                &secp,
                keypair(&secp),
                scripts(1),
                None,
                Network::Regtest,
                &payload.address.to_string(),
            ),
            Err(OrdError::AddressMismatch(_))
        ));
    }

    #[test]
    fn should_refuse_empty_tree() {
        let secp = Secp256k1::new();
        assert!(
            TaprootPayload::build(&secp, keypair(&secp), vec![], None, Network::Regtest).is_err()
        );
    }
}
