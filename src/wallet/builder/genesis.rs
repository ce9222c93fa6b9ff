use bitcoin::{Address, Amount, FeeRate, OutPoint, Transaction, TxOut};

use super::signer::{Signer, SpendPath};
use super::{FundingAddress, TaprootPayload, Utxo};
use crate::utils::constants::DUST_LIMIT;
use crate::utils::fees::{
    calculate_transaction_fees, dummy_key_spend_witness, template_transaction, unsigned_input,
};
use crate::{OrdError, OrdResult};

/// Arguments for creating a genesis transaction
#[derive(Debug, Clone)]
pub struct GenesisArgs<'a> {
    pub payload: &'a TaprootPayload,
    /// Value of each inscription output, in leaf order
    pub paddings: Vec<Amount>,
    /// Output funding the reveal fee and the tip
    pub fee_output: Option<Amount>,
    pub fee_rate: FeeRate,
    /// Receiver of the overpayment, if large enough to be worth an output
    pub change_address: &'a Address,
}

impl<'a> GenesisArgs<'a> {
    pub fn from_funding(
        funding: &'a FundingAddress,
        fee_rate: FeeRate,
        change_address: &'a Address,
    ) -> Self {
        Self {
            payload: &funding.payload,
            paddings: funding.layout.iter().map(|item| item.padding).collect(),
            fee_output: funding.fee_output,
            fee_rate,
            change_address,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenesisTransaction {
    /// The transaction to be broadcasted
    pub tx: Transaction,
    /// Miner fee paid by the transaction
    pub fee: Amount,
    pub change: Option<Amount>,
}

/// Creates the genesis transaction, a key-path spend of the funding UTXO.
///
/// Outputs are one per inscription to the funding address, then the fee output, then the
/// change. Overpayment below the dust limit is left to the miner.
pub fn construct_genesis_transaction(
    funding_utxo: &Utxo,
    args: &GenesisArgs,
) -> OrdResult<GenesisTransaction> {
    let outputs = genesis_outputs(args.payload, &args.paddings, args.fee_output);
    let committed = outputs.iter().map(|output| output.value).sum::<Amount>();

    let fee = estimate_fee(outputs.clone(), args.fee_rate)?;
    let required = committed + fee;
    let leftover = funding_utxo
        .amount
        .checked_sub(required)
        .ok_or(OrdError::InsufficientFunds {
            required,
            available: funding_utxo.amount,
        })?;
    debug!("genesis leftover: {leftover}");

    let mut tx_out = outputs;
    let mut change = None;
    if leftover.to_sat() >= DUST_LIMIT {
        // the change output needs fees too
        let mut with_change = tx_out.clone();
        with_change.push(TxOut {
            value: leftover,
            script_pubkey: args.change_address.script_pubkey(),
        });

        let fee_with_change = estimate_fee(with_change.clone(), args.fee_rate)?;
        let change_value = funding_utxo
            .amount
            .checked_sub(committed + fee_with_change)
            .unwrap_or(Amount::ZERO);

        if change_value.to_sat() >= DUST_LIMIT {
            with_change
                .last_mut()
                .ok_or(OrdError::NegativeOutput)?
                .value = change_value;
            tx_out = with_change;
            change = Some(change_value);
        }
    }

    let unsigned_tx = template_transaction(
        vec![unsigned_input(funding_utxo.outpoint(), Default::default())],
        tx_out,
    );
    let prevouts = [TxOut {
        value: funding_utxo.amount,
        script_pubkey: args.payload.script_pubkey(),
    }];
    let tx = Signer::new().sign(unsigned_tx, &prevouts, &[SpendPath::Key(args.payload)])?;

    let fee = funding_utxo.amount - tx.output.iter().map(|output| output.value).sum::<Amount>();
    debug!("genesis {} pays {fee}", tx.txid());

    Ok(GenesisTransaction { tx, fee, change })
}

/// Fee of the genesis transaction as quoted at funding time, without change.
pub(super) fn estimate_genesis_fee(
    payload: &TaprootPayload,
    paddings: &[Amount],
    fee_output: Option<Amount>,
    fee_rate: FeeRate,
) -> OrdResult<Amount> {
    estimate_fee(genesis_outputs(payload, paddings, fee_output), fee_rate)
}

fn genesis_outputs(
    payload: &TaprootPayload,
    paddings: &[Amount],
    fee_output: Option<Amount>,
) -> Vec<TxOut> {
    paddings
        .iter()
        .copied()
        .chain(fee_output)
        .map(|value| TxOut {
            value,
            script_pubkey: payload.script_pubkey(),
        })
        .collect()
}

fn estimate_fee(outputs: Vec<TxOut>, fee_rate: FeeRate) -> OrdResult<Amount> {
    let template = template_transaction(
        vec![unsigned_input(OutPoint::null(), dummy_key_spend_witness())],
        outputs,
    );

    calculate_transaction_fees(&template, fee_rate)
}
