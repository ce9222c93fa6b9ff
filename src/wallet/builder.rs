mod genesis;
mod refund;
mod reveal;
pub mod signer;
mod taproot;

use bitcoin::secp256k1::{self, SecretKey};
use bitcoin::{Address, Amount, FeeRate, Network, OutPoint, Txid};

pub use self::genesis::{construct_genesis_transaction, GenesisArgs, GenesisTransaction};
pub use self::refund::construct_refund_transaction;
pub use self::reveal::{
    construct_reveal_transaction, FeeRateRange, RevealRequest, RevealTransaction,
};
pub use self::taproot::{TaprootKeypair, TaprootLeaf, TaprootPayload};
use super::fee_destination::{split_fee, FeeDestination};
use crate::inscription::envelope::{inscription_leaf, parent_leaf};
use crate::inscription::InscriptionLayout;
use crate::utils::constants::DUST_LIMIT;
use crate::utils::fees::{ensure_above_dust, ensure_fee_rate_allowed};
use crate::{InscriptionId, OrdError, OrdResult, WritableInscription};

/// Unspent transaction output to be used as input of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub id: Txid,
    pub index: u32,
    pub amount: Amount,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.id,
            vout: self.index,
        }
    }
}

/// Parent inscription linked to every item of a request.
///
/// The UTXO carrying the parent must be sent to the funding address before the reveal; the
/// reveal spends it through the parent leaf and returns it to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentArgs {
    pub inscription_id: InscriptionId,
    /// Value of the UTXO carrying the parent.
    pub value: Amount,
}

/// Arguments for deriving a funding address
#[derive(Debug, Clone)]
pub struct FundingArgs<'a> {
    /// Items to inscribe, in reveal order
    pub inscriptions: &'a [WritableInscription],
    pub network: Network,
    /// Fee rate of both the genesis and the reveal transaction
    pub fee_rate: FeeRate,
    /// Platform tip, split over `fee_destinations` in the reveal
    pub tip: Amount,
    /// Default value of each inscription output
    pub padding: Amount,
    /// Receiver of the inscriptions
    pub destination: &'a Address,
    pub fee_destinations: &'a [FeeDestination],
    pub parent: Option<ParentArgs>,
    pub keypair: TaprootKeypair,
}

/// One-time funding address with everything needed to spend it later.
#[derive(Debug, Clone)]
pub struct FundingAddress {
    pub address: Address,
    pub secret_key: SecretKey,
    pub payload: TaprootPayload,
    pub layout: Vec<InscriptionLayout>,
    pub genesis_fee: Amount,
    pub reveal_fee: Amount,
    pub total_fee: Amount,
    /// Genesis output paying the reveal fee and the tip, if any.
    pub fee_output: Option<Amount>,
    /// Exact amount the requester must pay to `address`.
    pub funding_amount: Amount,
}

/// Derives a one-time funding address committing to every inscription of a request and quotes
/// the amount to pay.
///
/// The quote is `Σ padding + fee output + genesis fee`, where the fee output carries the tip
/// and the reveal fee. Both fees are measured on full transaction templates.
pub fn derive_funding_address(args: FundingArgs) -> OrdResult<FundingAddress> {
    if args.inscriptions.is_empty() {
        return Err(OrdError::InvalidInscription(
            "at least one inscription is required".to_string(),
        ));
    }
    ensure_fee_rate_allowed(args.fee_rate, args.network)?;
    for inscription in args.inscriptions {
        inscription.validate()?;
    }

    let secp = secp256k1::Secp256k1::new();
    let (keypair, x_public_key) = args.keypair.generate_keypair(&secp);

    // one leaf per inscription, plus the parent leaf
    let parent_id = args.parent.as_ref().map(|parent| &parent.inscription_id);
    let scripts = args
        .inscriptions
        .iter()
        .map(|inscription| inscription_leaf(inscription, &x_public_key, parent_id))
        .collect::<OrdResult<Vec<_>>>()?;
    let parent_script = args.parent.map(|_| parent_leaf(&x_public_key));

    let payload = TaprootPayload::build(&secp, keypair, scripts, parent_script, args.network)?;
    debug!("funding address: {}", payload.address);

    let paddings = args
        .inscriptions
        .iter()
        .map(|inscription| inscription.padding_or(args.padding))
        .collect::<Vec<_>>();
    for padding in &paddings {
        ensure_above_dust(*padding)?;
    }

    // fails early when the tip cannot be paid out
    let platform_outputs = split_fee(args.tip, args.fee_destinations)?;

    let has_fee_input = args.tip > Amount::ZERO || args.fee_rate > FeeRate::ZERO;
    let reveal_fee = reveal::estimate_reveal_fee(
        &payload,
        args.destination,
        &paddings,
        args.parent.map(|parent| parent.value),
        platform_outputs,
        has_fee_input,
        args.fee_rate,
    )?;
    debug!("reveal_fee: {reveal_fee}");

    let fee_output = genesis_fee_output(args.tip, reveal_fee);
    let genesis_fee = genesis::estimate_genesis_fee(&payload, &paddings, fee_output, args.fee_rate)?;
    debug!("genesis_fee: {genesis_fee}");

    let funding_amount = paddings
        .iter()
        .copied()
        .chain(fee_output)
        .chain(Some(genesis_fee))
        .try_fold(Amount::ZERO, |total, value| total.checked_add(value))
        .ok_or(OrdError::FeeOverflow)?;
    debug!("funding_amount: {funding_amount}");

    let layout = payload
        .leaves
        .iter()
        .zip(&paddings)
        .map(|(leaf, padding)| InscriptionLayout {
            script: leaf.script.clone(),
            control_block: leaf.control_block.clone(),
            padding: *padding,
        })
        .collect();

    Ok(FundingAddress {
        address: payload.address.clone(),
        secret_key: keypair.secret_key(),
        layout,
        genesis_fee,
        reveal_fee,
        total_fee: genesis_fee + reveal_fee,
        fee_output,
        funding_amount,
        payload,
    })
}

/// Value of the genesis output funding the reveal: `tip + reveal_fee`, raised to the dust limit,
/// or nothing when both are zero.
pub fn genesis_fee_output(tip: Amount, reveal_fee: Amount) -> Option<Amount> {
    let value = tip + reveal_fee;
    if value == Amount::ZERO {
        None
    } else {
        Some(value.max(Amount::from_sat(DUST_LIMIT)))
    }
}
