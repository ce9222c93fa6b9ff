//! # ord-funder
//!
//! Funds and reveals Ordinal inscriptions through a Taproot commit/reveal pair.
//!
//! A caller asks for one or more inscriptions; the crate derives a one-time funding address
//! whose script tree commits to every inscription envelope, waits for the payment to show up
//! on chain, then broadcasts a *genesis* transaction followed by a *reveal* transaction that
//! exposes the content and forwards the inscribed sats to the destination address.
//!
//! The pieces, leaf first:
//!
//! - [`wallet`] and [`inscription`]: pure transaction construction, no I/O;
//! - [`fee_oracle`]: cached recommended fee tiers;
//! - [`chain`]: payment detection and broadcast over an indexer API or Electrum;
//! - [`store`]: the per-request state machine with conditional transitions;
//! - [`secure`]: envelope-encrypted storage for the ephemeral keys and the raw content;
//! - [`pipeline`]: the poller and queue consumers driving requests to `revealed`;
//! - [`inscriber`]: the request handler creating a quote and its records.
//!
//! ## Example
//!
//! ```rust
//! use bitcoin::secp256k1::{Secp256k1, SecretKey};
//! use bitcoin::{Address, Amount, FeeRate, Network, PrivateKey};
//! use ord_funder::wallet::{derive_funding_address, FundingArgs};
//! use ord_funder::WritableInscription;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let secret = SecretKey::from_slice(&[7; 32])?;
//!     let public_key = PrivateKey::new(secret, Network::Regtest).public_key(&Secp256k1::new());
//!     let destination = Address::p2wpkh(&public_key, Network::Regtest)?;
//!     let items = vec![WritableInscription::new("text/plain", b"hello".to_vec())];
//!
//!     let funding = derive_funding_address(FundingArgs {
//!         inscriptions: &items,
//!         network: Network::Regtest,
//!         fee_rate: FeeRate::from_sat_per_vb_unchecked(10),
//!         tip: Amount::ZERO,
//!         padding: Amount::from_sat(546),
//!         destination: &destination,
//!         fee_destinations: &[],
//!         parent: None,
//!         keypair: Default::default(),
//!     })?;
//!
//!     println!("pay {} to {}", funding.funding_amount, funding.address);
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate log;

pub mod chain;
pub mod config;
mod error;
pub mod fee_oracle;
pub mod inscriber;
pub mod inscription;
pub mod pipeline;
mod result;
pub mod secure;
pub mod store;
pub mod utils;
pub mod wallet;

pub use config::Config;
pub use error::OrdError;
pub use inscription::iid::InscriptionId;
pub use inscription::WritableInscription;
pub use result::OrdResult;
pub use utils::constants;
