use bitcoin::absolute::LockTime;
use bitcoin::taproot::ControlBlock;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, FeeRate, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use super::constants::{DUST_LIMIT, SCHNORR_SIGNATURE_SIZE};
use crate::{OrdError, OrdResult};

/// Key-path witness carrying a placeholder signature of the final size.
pub fn dummy_key_spend_witness() -> Witness {
    Witness::from_slice(&[vec![0; SCHNORR_SIGNATURE_SIZE]])
}

/// Script-path witness carrying a placeholder signature of the final size.
pub fn dummy_script_spend_witness(leaf: &ScriptBuf, control_block: &ControlBlock) -> Witness {
    let mut witness = Witness::new();
    witness.push(vec![0; SCHNORR_SIGNATURE_SIZE]);
    witness.push(leaf.as_bytes());
    witness.push(control_block.serialize());
    witness
}

/// Input spending `previous_output` with an empty script sig; the witness is filled by the signer.
pub fn unsigned_input(previous_output: OutPoint, witness: Witness) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness,
    }
}

pub fn template_transaction(input: Vec<TxIn>, output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    }
}

pub fn fee_for_vsize(fee_rate: FeeRate, vsize: usize) -> OrdResult<Amount> {
    fee_rate.fee_vb(vsize as u64).ok_or(OrdError::FeeOverflow)
}

/// Fee paid by `transaction` at `fee_rate`, measured on its current witnesses.
pub fn calculate_transaction_fees(transaction: &Transaction, fee_rate: FeeRate) -> OrdResult<Amount> {
    fee_for_vsize(fee_rate, transaction.vsize())
}

/// `true` iff `miner_fee / vsize` is below the requested rate.
pub fn is_underpriced(miner_fee: Amount, vsize: usize, requested: FeeRate) -> OrdResult<bool> {
    Ok(miner_fee < fee_for_vsize(requested, vsize)?)
}

/// A zero fee rate only relays on test networks.
pub fn ensure_fee_rate_allowed(fee_rate: FeeRate, network: Network) -> OrdResult<()> {
    if fee_rate == FeeRate::ZERO && network == Network::Bitcoin {
        return Err(OrdError::ZeroFeeRate);
    }

    Ok(())
}

pub fn ensure_above_dust(value: Amount) -> OrdResult<()> {
    if value.to_sat() < DUST_LIMIT {
        return Err(OrdError::BelowDust(value));
    }

    Ok(())
}
