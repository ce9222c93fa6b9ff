use bitcoin::{Address, Amount, FeeRate, OutPoint, Transaction, TxIn, TxOut, Witness};

use super::signer::{Signer, SpendPath};
use super::{TaprootPayload, Utxo};
use crate::inscription::inscription_ids;
use crate::utils::constants::DUST_LIMIT;
use crate::utils::fees::{
    calculate_transaction_fees, dummy_key_spend_witness, dummy_script_spend_witness,
    fee_for_vsize, is_underpriced, template_transaction, unsigned_input,
};
use crate::wallet::fee_destination::{aggregate_fee_destinations, split_fee, FeeDestination};
use crate::{InscriptionId, OrdError, OrdResult};

/// Request whose genesis outputs are spent by a reveal.
#[derive(Debug, Clone, Copy)]
pub struct RevealRequest<'a> {
    pub payload: &'a TaprootPayload,
    /// The broadcast genesis transaction of the request
    pub genesis: &'a Transaction,
    /// Receiver of the inscriptions and of the parent
    pub destination: &'a Address,
    pub fee_destinations: &'a [FeeDestination],
    pub tip: Amount,
    /// Parent inscription UTXO held by the funding address
    pub parent: Option<Utxo>,
}

/// Acceptable miner fee rates of a reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRateRange {
    /// Rate below which the reveal is flagged as underpriced
    pub min: FeeRate,
    /// Rate above which the surplus is paid to the fee destinations
    pub max: FeeRate,
}

impl FeeRateRange {
    pub fn new(min: FeeRate, max: FeeRate) -> OrdResult<Self> {
        if max < min {
            return Err(OrdError::Config(format!(
                "max fee rate {max} is below min fee rate {min}"
            )));
        }

        Ok(Self { min, max })
    }

    pub fn exact(rate: FeeRate) -> Self {
        Self {
            min: rate,
            max: rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RevealTransaction {
    pub tx: Transaction,
    pub miner_fee: Amount,
    pub platform_fee: Amount,
    /// Whether the miner fee is below the minimum requested rate
    pub underpriced: bool,
    pub inscription_ids: Vec<InscriptionId>,
}

struct RevealInput<'a> {
    outpoint: OutPoint,
    prevout: TxOut,
    path: SpendPath<'a>,
}

impl RevealInput<'_> {
    fn dummy(&self) -> TxIn {
        unsigned_input(self.outpoint, dummy_witness(&self.path))
    }
}

/// Create the reveal transaction of one or more requests.
///
/// Inputs `[parent?, item...]` of every request map one to one to outputs
/// `[parent?, destination...]`, so each inscription sits on the first sat of its own output.
/// The key-path fee inputs follow, and the platform fee outputs close the transaction. The
/// miner gets what is left, capped at `fee_rate_range.max`.
pub fn construct_reveal_transaction(
    requests: &[RevealRequest],
    fee_rate_range: FeeRateRange,
) -> OrdResult<RevealTransaction> {
    if requests.is_empty() {
        return Err(OrdError::InvalidInscription(
            "nothing to reveal".to_string(),
        ));
    }

    let mut aligned_inputs = Vec::new();
    let mut aligned_outputs = Vec::new();
    let mut fee_inputs = Vec::new();

    for request in requests {
        let funding_script = request.payload.script_pubkey();
        let destination_script = request.destination.script_pubkey();

        if let Some(parent_leaf) = &request.payload.parent_leaf {
            let parent = request.parent.ok_or_else(|| {
                OrdError::NotReady(format!(
                    "parent of {} not yet at the funding address",
                    request.payload.address
                ))
            })?;
            aligned_inputs.push(RevealInput {
                outpoint: parent.outpoint(),
                prevout: TxOut {
                    value: parent.amount,
                    script_pubkey: funding_script.clone(),
                },
                path: SpendPath::Script(request.payload, parent_leaf),
            });
            aligned_outputs.push(TxOut {
                value: parent.amount,
                script_pubkey: destination_script.clone(),
            });
        }

        let genesis_txid = request.genesis.txid();
        for (vout, leaf) in request.payload.leaves.iter().enumerate() {
            let output = request
                .genesis
                .output
                .get(vout)
                .filter(|output| output.script_pubkey == funding_script)
                .ok_or_else(|| {
                    OrdError::InvalidInscription(format!(
                        "genesis {genesis_txid} has no inscription output {vout}"
                    ))
                })?;

            aligned_inputs.push(RevealInput {
                outpoint: OutPoint::new(genesis_txid, vout as u32),
                prevout: output.clone(),
                path: SpendPath::Script(request.payload, leaf),
            });
            aligned_outputs.push(TxOut {
                value: output.value,
                script_pubkey: destination_script.clone(),
            });
        }

        let fee_vout = request.payload.leaves.len();
        if let Some(output) = request
            .genesis
            .output
            .get(fee_vout)
            .filter(|output| output.script_pubkey == funding_script)
        {
            fee_inputs.push(RevealInput {
                outpoint: OutPoint::new(genesis_txid, fee_vout as u32),
                prevout: output.clone(),
                path: SpendPath::Key(request.payload),
            });
        }
    }

    let inputs = aligned_inputs
        .into_iter()
        .chain(fee_inputs)
        .collect::<Vec<_>>();
    let total_in = sum_values(inputs.iter().map(|input| &input.prevout));
    let aligned_total = sum_values(&aligned_outputs);

    let tip = requests.iter().map(|request| request.tip).sum::<Amount>();
    let destinations =
        aggregate_fee_destinations(requests.iter().map(|request| request.fee_destinations));
    let mut platform_outputs = split_fee(tip, &destinations)?;

    let mut miner_fee = total_in
        .checked_sub(aligned_total)
        .and_then(|available| available.checked_sub(sum_values(&platform_outputs)))
        .ok_or(OrdError::NegativeOutput)?;

    // cap the miner fee, sized with an output for every destination
    let widest = template_transaction(
        inputs.iter().map(RevealInput::dummy).collect(),
        aligned_outputs
            .iter()
            .cloned()
            .chain(destinations.iter().map(|destination| TxOut {
                value: Amount::ZERO,
                script_pubkey: destination.address.script_pubkey(),
            }))
            .collect(),
    );
    let max_fee = fee_for_vsize(fee_rate_range.max, widest.vsize())?;
    if miner_fee > max_fee && (miner_fee - max_fee).to_sat() >= DUST_LIMIT {
        match split_fee(tip + miner_fee - max_fee, &destinations) {
            Ok(outputs) => {
                debug!("paying {} above max fee to fee destinations", miner_fee - max_fee);
                platform_outputs = outputs;
                miner_fee = max_fee;
            }
            Err(err) => debug!("surplus left to the miner: {err}"),
        }
    }

    let platform_fee = sum_values(&platform_outputs);
    let unsigned_tx = template_transaction(
        inputs
            .iter()
            .map(|input| unsigned_input(input.outpoint, Witness::new()))
            .collect(),
        aligned_outputs.into_iter().chain(platform_outputs).collect(),
    );
    let prevouts = inputs
        .iter()
        .map(|input| input.prevout.clone())
        .collect::<Vec<_>>();
    let paths = inputs.iter().map(|input| input.path).collect::<Vec<_>>();

    let tx = Signer::new().sign(unsigned_tx, &prevouts, &paths)?;

    debug_assert_eq!(total_in, sum_values(&tx.output) + miner_fee);
    let vsize = tx.vsize();
    let underpriced = is_underpriced(miner_fee, vsize, fee_rate_range.min)?;
    if underpriced {
        warn!(
            "reveal {} is underpriced: {miner_fee} for {vsize} vbytes, min rate {}",
            tx.txid(),
            fee_rate_range.min
        );
    }

    let inscription_ids = inscription_ids(&tx);
    debug!("reveal {} carries {} inscriptions", tx.txid(), inscription_ids.len());

    Ok(RevealTransaction {
        tx,
        miner_fee,
        platform_fee,
        underpriced,
        inscription_ids,
    })
}

/// Fee of the reveal of a single request as quoted at funding time.
pub(super) fn estimate_reveal_fee(
    payload: &TaprootPayload,
    destination: &Address,
    paddings: &[Amount],
    parent_value: Option<Amount>,
    platform_outputs: Vec<TxOut>,
    has_fee_input: bool,
    fee_rate: FeeRate,
) -> OrdResult<Amount> {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    if let (Some(value), Some(leaf)) = (parent_value, &payload.parent_leaf) {
        inputs.push(unsigned_input(
            OutPoint::null(),
            dummy_witness(&SpendPath::Script(payload, leaf)),
        ));
        outputs.push(TxOut {
            value,
            script_pubkey: destination.script_pubkey(),
        });
    }

    for (leaf, padding) in payload.leaves.iter().zip(paddings) {
        inputs.push(unsigned_input(
            OutPoint::null(),
            dummy_witness(&SpendPath::Script(payload, leaf)),
        ));
        outputs.push(TxOut {
            value: *padding,
            script_pubkey: destination.script_pubkey(),
        });
    }

    if has_fee_input {
        inputs.push(unsigned_input(OutPoint::null(), dummy_key_spend_witness()));
    }
    outputs.extend(platform_outputs);

    calculate_transaction_fees(&template_transaction(inputs, outputs), fee_rate)
}

fn dummy_witness(path: &SpendPath) -> Witness {
    match path {
        SpendPath::Key(_) => dummy_key_spend_witness(),
        SpendPath::Script(_, leaf) => dummy_script_spend_witness(&leaf.script, &leaf.control_block),
    }
}

fn sum_values<'a>(outputs: impl IntoIterator<Item = &'a TxOut>) -> Amount {
    outputs.into_iter().map(|output| output.value).sum()
}
