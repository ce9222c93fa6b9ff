// Envelope parsing follows the inscription envelope convention of
// https://github.com/ordinals/ord/blob/master/src/inscriptions/envelope.rs

use std::collections::BTreeMap;
use std::iter::Peekable;

use bitcoin::script::{Error as ScriptError, Instruction, Instructions};
use bitcoin::{opcodes, Script, Transaction};

use super::iid::InscriptionId;
use crate::utils::constants::{
    CONTENT_ENCODING_TAG, CONTENT_TYPE_TAG, METADATA_TAG, PARENT_TAG, PROTOCOL_ID,
};

type ParseResult<T> = std::result::Result<T, ScriptError>;

/// Inscription found in a transaction witness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedInscription {
    /// Index of the input whose witness carried the envelope.
    pub input: u32,
    pub content_type: Option<Vec<u8>>,
    pub content_encoding: Option<Vec<u8>>,
    pub parent: Option<InscriptionId>,
    pub metadata: Option<Vec<u8>>,
    pub body: Option<Vec<u8>>,
}

impl ParsedInscription {
    /// All envelopes of `transaction`, in input order.
    pub fn from_transaction(transaction: &Transaction) -> Vec<Self> {
        let mut inscriptions = Vec::new();

        for (index, input) in transaction.input.iter().enumerate() {
            let Some(tapscript) = input.witness.tapscript() else {
                continue;
            };

            if let Ok(payloads) = raw_envelopes(tapscript) {
                inscriptions.extend(
                    payloads
                        .into_iter()
                        .map(|payload| Self::from_payload(index as u32, payload)),
                );
            }
        }

        inscriptions
    }

    fn from_payload(input: u32, payload: Vec<Vec<u8>>) -> Self {
        let body = payload
            .iter()
            .enumerate()
            .position(|(i, push)| i % 2 == 0 && push.is_empty());

        let mut fields: BTreeMap<&[u8], Vec<&[u8]>> = BTreeMap::new();
        for item in payload[..body.unwrap_or(payload.len())].chunks(2) {
            if let [key, value] = item {
                fields.entry(key).or_default().push(value);
            }
        }

        let first = |fields: &BTreeMap<&[u8], Vec<&[u8]>>, tag: &[u8]| {
            fields
                .get(tag)
                .and_then(|values| values.first())
                .map(|value| value.to_vec())
        };

        Self {
            input,
            content_type: first(&fields, &CONTENT_TYPE_TAG),
            content_encoding: first(&fields, &CONTENT_ENCODING_TAG),
            parent: first(&fields, &PARENT_TAG).and_then(|raw| InscriptionId::from_raw(&raw)),
            metadata: fields
                .get(METADATA_TAG.as_slice())
                .map(|chunks| chunks.concat()),
            body: body.map(|i| payload[i + 1..].concat()),
        }
    }
}

/// Ids of the inscriptions revealed by `transaction`, `{txid}i{n}` in envelope order.
pub fn inscription_ids(transaction: &Transaction) -> Vec<InscriptionId> {
    let txid = transaction.txid();

    (0..ParsedInscription::from_transaction(transaction).len() as u32)
        .map(|index| InscriptionId::new(txid, index))
        .collect()
}

fn raw_envelopes(tapscript: &Script) -> ParseResult<Vec<Vec<Vec<u8>>>> {
    let mut envelopes = Vec::new();
    let mut instructions = tapscript.instructions().peekable();

    while let Some(instruction) = instructions.next().transpose()? {
        if instruction == Instruction::PushBytes((&[]).into()) {
            if let Some(payload) = envelope_payload(&mut instructions)? {
                envelopes.push(payload);
            }
        }
    }

    Ok(envelopes)
}

fn accept(instructions: &mut Peekable<Instructions>, instruction: Instruction) -> ParseResult<bool> {
    if instructions.peek() == Some(&Ok(instruction)) {
        instructions.next().transpose()?;
        Ok(true)
    } else {
        Ok(false)
    }
}

fn envelope_payload(instructions: &mut Peekable<Instructions>) -> ParseResult<Option<Vec<Vec<u8>>>> {
    if !accept(instructions, Instruction::Op(opcodes::all::OP_IF))? {
        return Ok(None);
    }

    if !accept(instructions, Instruction::PushBytes((&PROTOCOL_ID).into()))? {
        return Ok(None);
    }

    let mut payload = Vec::new();

    loop {
        match instructions.next().transpose()? {
            None => return Ok(None),
            Some(Instruction::Op(opcodes::all::OP_ENDIF)) => return Ok(Some(payload)),
            Some(Instruction::Op(opcodes::all::OP_PUSHNUM_NEG1)) => payload.push(vec![0x81]),
            Some(Instruction::Op(op))
                if (opcodes::all::OP_PUSHNUM_1.to_u8()..=opcodes::all::OP_PUSHNUM_16.to_u8())
                    .contains(&op.to_u8()) =>
            {
                payload.push(vec![op.to_u8() - opcodes::all::OP_PUSHNUM_1.to_u8() + 1]);
            }
            Some(Instruction::PushBytes(data)) => payload.push(data.as_bytes().to_vec()),
            Some(_) => return Ok(None),
        }
    }
}
