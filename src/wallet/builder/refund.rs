use bitcoin::{Address, Amount, FeeRate, Transaction, TxOut, Witness};

use super::signer::{Signer, SpendPath};
use super::{TaprootPayload, Utxo};
use crate::utils::constants::DUST_LIMIT;
use crate::utils::fees::{
    calculate_transaction_fees, ensure_above_dust, template_transaction, unsigned_input,
};
use crate::{OrdError, OrdResult};

/// Sends every UTXO held by the funding address back to `refund_address`.
///
/// The fee is measured on the signed transaction and subtracted from the single refund output.
pub fn construct_refund_transaction(
    utxos: &[Utxo],
    payload: &TaprootPayload,
    refund_address: &Address,
    fee_rate: FeeRate,
) -> OrdResult<Transaction> {
    let total = utxos.iter().map(|utxo| utxo.amount).sum::<Amount>();
    if utxos.is_empty() {
        return Err(OrdError::InsufficientFunds {
            required: Amount::from_sat(DUST_LIMIT),
            available: total,
        });
    }

    let prevouts = utxos
        .iter()
        .map(|utxo| TxOut {
            value: utxo.amount,
            script_pubkey: payload.script_pubkey(),
        })
        .collect::<Vec<_>>();
    let paths = vec![SpendPath::Key(payload); utxos.len()];
    let signer = Signer::new();

    let unsigned = |value: Amount| {
        template_transaction(
            utxos
                .iter()
                .map(|utxo| unsigned_input(utxo.outpoint(), Witness::new()))
                .collect(),
            vec![TxOut {
                value,
                script_pubkey: refund_address.script_pubkey(),
            }],
        )
    };

    let measured = signer.sign(unsigned(total), &prevouts, &paths)?;
    let fee = calculate_transaction_fees(&measured, fee_rate)?;
    let refund = total.checked_sub(fee).ok_or(OrdError::NegativeOutput)?;
    ensure_above_dust(refund)?;
    debug!("refunding {refund} to {refund_address}, fee {fee}");

    signer.sign(unsigned(refund), &prevouts, &paths)
}
