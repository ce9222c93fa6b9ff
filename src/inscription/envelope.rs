//! Tapscript leaves committing to inscription envelopes.

use bitcoin::opcodes;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_ENDIF, OP_IF};
use bitcoin::script::{Builder as ScriptBuilder, ScriptBuf};
use bitcoin::XOnlyPublicKey;

use super::iid::InscriptionId;
use super::WritableInscription;
use crate::utils::{bytes_to_push_bytes, push_chunks};
use crate::utils::constants::{
    BODY_TAG, BROTLI_ENCODING, CONTENT_ENCODING_TAG, CONTENT_TYPE_TAG, METADATA_TAG, PARENT_TAG,
    PROTOCOL_ID,
};
use crate::OrdResult;

/// Builds the leaf revealing `inscription`:
///
/// - `<internal key>` OP_CHECKSIG
/// - OP_FALSE OP_IF "ord"
/// - 0x01 `<content type>`
/// - 0x03 `<parent id>` when linked to a parent
/// - 0x05 `<cbor chunk>` for each metadata chunk
/// - 0x09 "br" when the body is compressed
/// - OP_0 `<body chunk>`...
/// - OP_ENDIF
pub fn inscription_leaf(
    inscription: &WritableInscription,
    internal_key: &XOnlyPublicKey,
    parent: Option<&InscriptionId>,
) -> OrdResult<ScriptBuf> {
    let mut builder = ScriptBuilder::new()
        .push_x_only_key(internal_key)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(opcodes::OP_FALSE)
        .push_opcode(OP_IF)
        .push_slice(PROTOCOL_ID)
        .push_slice(CONTENT_TYPE_TAG)
        .push_slice(bytes_to_push_bytes(inscription.content_type.as_bytes())?);

    if let Some(parent) = parent {
        builder = builder
            .push_slice(PARENT_TAG)
            .push_slice(bytes_to_push_bytes(&parent.get_raw())?);
    }

    if let Some(metadata) = inscription.cbor_metadata()? {
        for chunk in push_chunks(&metadata)? {
            builder = builder.push_slice(METADATA_TAG).push_slice(chunk);
        }
    }

    if inscription.compressed {
        builder = builder
            .push_slice(CONTENT_ENCODING_TAG)
            .push_slice(bytes_to_push_bytes(BROTLI_ENCODING.as_bytes())?);
    }

    builder = builder.push_slice(BODY_TAG);
    for chunk in push_chunks(&inscription.body)? {
        builder = builder.push_slice(chunk);
    }

    Ok(builder.push_opcode(OP_ENDIF).into_script())
}

/// Leaf spending the parent inscription back out of the funding address.
pub fn parent_leaf(internal_key: &XOnlyPublicKey) -> ScriptBuf {
    ScriptBuilder::new()
        .push_x_only_key(internal_key)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

#[cfg(test)]
mod tests {
    use bitcoin::key::Keypair;
    use bitcoin::script::Instruction;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use super::*;
    use crate::utils::constants::MAX_PUSH_SIZE;

    fn internal_key() -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[1; 32]).unwrap();
        Keypair::from_secret_key(&secp, &secret)
            .x_only_public_key()
            .0
    }

    #[test]
    fn should_build_plain_text_leaf() {
        let key = internal_key();
        let script =
            inscription_leaf(&WritableInscription::new("text/plain", b"hello".to_vec()), &key, None)
                .unwrap();

        let pushes = script
            .instructions()
            .map(|i| i.unwrap())
            .collect::<Vec<_>>();

        assert_eq!(pushes[0], Instruction::PushBytes((&key.serialize()).into()));
        assert_eq!(pushes[1], Instruction::Op(OP_CHECKSIG));
        assert_eq!(pushes[3], Instruction::Op(OP_IF));
        assert_eq!(pushes[4], Instruction::PushBytes(b"ord".into()));
        assert_eq!(pushes[6], Instruction::PushBytes(b"text/plain".into()));
        assert_eq!(pushes[8], Instruction::PushBytes(b"hello".into()));
        assert_eq!(pushes.last(), Some(&Instruction::Op(OP_ENDIF)));
    }

    #[test]
    fn should_chunk_large_body() {
        let body = vec![0xab; MAX_PUSH_SIZE * 2 + 1];
        let script =
            inscription_leaf(&WritableInscription::new("image/png", body), &internal_key(), None)
                .unwrap();

        let pushes = script
            .instructions()
            .map(|i| i.unwrap())
            .collect::<Vec<_>>();
        let full_chunks = pushes
            .iter()
            .filter(|i| matches!(i, Instruction::PushBytes(bytes) if bytes.len() == MAX_PUSH_SIZE))
            .count();

        assert_eq!(full_chunks, 2);
        assert_eq!(pushes[pushes.len() - 2], Instruction::PushBytes((&[0xabu8]).into()));
    }

    #[test]
    fn should_build_parent_leaf() {
        let key = internal_key();
        let script = parent_leaf(&key);

        assert_eq!(script.len(), 34);
        assert_eq!(script.as_bytes()[33], OP_CHECKSIG.to_u8());
    }
}
