//! Weighted platform fee destinations.

use std::str::FromStr;

use bitcoin::{Address, Amount, Network, TxOut};
use serde::{Deserialize, Serialize};

use crate::utils::constants::{DUST_LIMIT, FEE_WEIGHT_TOTAL};
use crate::{OrdError, OrdResult};

/// Recipient of a share of the platform fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeDestination {
    pub address: Address,
    pub weight: u64,
}

/// Serialized form of a [`FeeDestination`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeDestinationRecord {
    pub address: String,
    pub weight: u64,
}

impl FeeDestination {
    pub fn new(address: Address, weight: u64) -> Self {
        Self { address, weight }
    }

    pub fn from_record(record: &FeeDestinationRecord, network: Network) -> OrdResult<Self> {
        Ok(Self {
            address: Address::from_str(&record.address)?.require_network(network)?,
            weight: record.weight,
        })
    }

    pub fn to_record(&self) -> FeeDestinationRecord {
        FeeDestinationRecord {
            address: self.address.to_string(),
            weight: self.weight,
        }
    }
}

/// Merges the destinations of every request sharing one reveal.
///
/// Destinations are deduplicated by address in first-seen order, their weights summed over all
/// occurrences, then renormalised to [`FEE_WEIGHT_TOTAL`].
pub fn aggregate_fee_destinations<'a, I>(groups: I) -> Vec<FeeDestination>
where
    I: IntoIterator<Item = &'a [FeeDestination]>,
{
    let mut merged: Vec<FeeDestination> = Vec::new();

    for destination in groups.into_iter().flatten() {
        match merged
            .iter_mut()
            .find(|known| known.address == destination.address)
        {
            Some(known) => known.weight += destination.weight,
            None => merged.push(destination.clone()),
        }
    }

    renormalize(merged)
}

/// Rescales weights so they sum to exactly [`FEE_WEIGHT_TOTAL`]; zero weights are dropped.
pub fn renormalize(destinations: Vec<FeeDestination>) -> Vec<FeeDestination> {
    let destinations = destinations
        .into_iter()
        .filter(|destination| destination.weight > 0)
        .collect::<Vec<_>>();

    let weights = destinations.iter().map(|d| d.weight).collect::<Vec<_>>();
    let scaled = apportion(FEE_WEIGHT_TOTAL, &weights);

    destinations
        .into_iter()
        .zip(scaled)
        .map(|(destination, weight)| FeeDestination { weight, ..destination })
        .collect()
}

/// Splits `amount` over `destinations` by weight.
///
/// While some share is below the dust limit, the smallest such destination is dropped and the
/// remaining weights renormalised. The returned outputs always sum to `amount`.
pub fn split_fee(amount: Amount, destinations: &[FeeDestination]) -> OrdResult<Vec<TxOut>> {
    if amount == Amount::ZERO {
        return Ok(Vec::new());
    }

    let mut eligible = renormalize(destinations.to_vec());

    loop {
        if eligible.is_empty() {
            return Err(OrdError::NoEligibleFeeDestination(amount));
        }

        let weights = eligible.iter().map(|d| d.weight).collect::<Vec<_>>();
        let shares = apportion(amount.to_sat(), &weights);

        let below_dust = shares
            .iter()
            .enumerate()
            .filter(|(_, share)| **share < DUST_LIMIT)
            .min_by_key(|(index, share)| (**share, std::cmp::Reverse(*index)))
            .map(|(index, _)| index);

        match below_dust {
            Some(index) => {
                debug!(
                    "dropping fee destination {}: share below dust",
                    eligible[index].address
                );
                eligible.remove(index);
                eligible = renormalize(eligible);
            }
            None => {
                return Ok(eligible
                    .iter()
                    .zip(shares)
                    .map(|(destination, share)| TxOut {
                        value: Amount::from_sat(share),
                        script_pubkey: destination.address.script_pubkey(),
                    })
                    .collect())
            }
        }
    }
}

/// Largest remainder apportionment of `total` by `weights`; ties go to the earlier entry.
fn apportion(total: u64, weights: &[u64]) -> Vec<u64> {
    let weight_sum: u128 = weights.iter().map(|w| *w as u128).sum();
    if weight_sum == 0 {
        return vec![0; weights.len()];
    }

    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (index, weight) in weights.iter().enumerate() {
        let exact = total as u128 * *weight as u128;
        shares.push((exact / weight_sum) as u64);
        remainders.push((exact % weight_sum, index));
    }

    let distributed: u64 = shares.iter().sum();
    remainders.sort_by(|(a, a_index), (b, b_index)| b.cmp(a).then(a_index.cmp(b_index)));
    for (_, index) in remainders.into_iter().take((total - distributed) as usize) {
        shares[index] += 1;
    }

    shares
}
