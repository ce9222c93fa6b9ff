//! Request handler: quotes an inscription request and creates its records.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::{Address, Amount, FeeRate};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::fee_oracle::FeeOracle;
use crate::secure::{InscriptionDoc, SecureDocumentStore};
use crate::store::{CollectionStore, FundingRequest, FundingStore};
use crate::wallet::{derive_funding_address, FundingArgs, ParentArgs, TaprootKeypair};
use crate::{Config, OrdError, OrdResult, WritableInscription};

/// What a caller asks to inscribe.
#[derive(Debug, Clone)]
pub struct InscribeRequest {
    pub inscriptions: Vec<WritableInscription>,
    /// Receiver of the inscriptions
    pub destination: String,
    /// Quoted rate; the configured fee tier when unset
    pub fee_rate: Option<FeeRate>,
    /// Platform tip; the configured tip when unset
    pub tip: Option<Amount>,
    pub parent: Option<ParentArgs>,
    pub collection_id: Option<String>,
    pub creator_id: Option<String>,
    pub meta: Value,
}

impl InscribeRequest {
    pub fn new(inscriptions: Vec<WritableInscription>, destination: impl ToString) -> Self {
        Self {
            inscriptions,
            destination: destination.to_string(),
            fee_rate: None,
            tip: None,
            parent: None,
            collection_id: None,
            creator_id: None,
            meta: Value::Null,
        }
    }
}

/// Amount to pay and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub id: String,
    pub address: Address,
    pub funding_amount: Amount,
    pub fee_rate: FeeRate,
    pub genesis_fee: Amount,
    pub reveal_fee: Amount,
    pub total_fee: Amount,
    pub tip: Amount,
    /// Past this instant the request is expired unless paid
    pub expires_at: DateTime<Utc>,
}

pub struct Inscriber {
    config: Arc<Config>,
    funding: Arc<dyn FundingStore>,
    collections: Arc<dyn CollectionStore>,
    documents: SecureDocumentStore,
    fees: Arc<FeeOracle>,
}

impl Inscriber {
    pub fn new(
        config: Arc<Config>,
        funding: Arc<dyn FundingStore>,
        collections: Arc<dyn CollectionStore>,
        documents: SecureDocumentStore,
        fees: Arc<FeeOracle>,
    ) -> Self {
        Self {
            config,
            funding,
            collections,
            documents,
            fees,
        }
    }

    /// Derives a one-time funding address for `request` and stores its records.
    ///
    /// The funding record and its document are created together or not at all; a collection
    /// slot taken for the request is given back on failure.
    pub async fn inscribe(&self, request: InscribeRequest, now: DateTime<Utc>) -> OrdResult<Quote> {
        let network = self.config.network;
        let destination = Address::from_str(&request.destination)?.require_network(network)?;
        let fee_rate = match request.fee_rate {
            Some(fee_rate) => fee_rate,
            None => self.fees.fee_rate(network, self.config.fees.tier).await?,
        };

        if let Some(collection_id) = &request.collection_id {
            self.collections.reserve(collection_id).await?;
        }

        let result = self.create(&request, &destination, fee_rate, now).await;
        if let (Err(err), Some(collection_id)) = (&result, &request.collection_id) {
            warn!("releasing slot of {collection_id} after failed request: {err}");
            if let Err(err) = self.collections.release(collection_id).await {
                error!("cannot release slot of {collection_id}: {err}");
            }
        }

        result
    }

    async fn create(
        &self,
        request: &InscribeRequest,
        destination: &Address,
        fee_rate: FeeRate,
        now: DateTime<Utc>,
    ) -> OrdResult<Quote> {
        let network = self.config.network;
        let fee_destinations = self.config.fees.fee_destinations(network)?;
        let tip = request.tip.unwrap_or_else(|| self.config.fees.tip());

        let args = FundingArgs {
            inscriptions: &request.inscriptions,
            network,
            fee_rate,
            tip,
            padding: self.config.fees.padding(),
            destination,
            fee_destinations: &fee_destinations,
            parent: request.parent,
            keypair: TaprootKeypair::Random,
        };
        let funding = derive_funding_address(args.clone())?;
        if let Some(parent) = &request.parent {
            // both arrive at the same address and are told apart by value
            if parent.value == funding.funding_amount {
                return Err(OrdError::InvalidInscription(format!(
                    "parent utxo value {} equals the funding amount",
                    parent.value
                )));
            }
        }

        let encrypted_key = self.documents.seal_key(&funding.secret_key).await?;
        let doc = InscriptionDoc::new(&funding, &args, encrypted_key);
        let item_count = request.inscriptions.len();

        let mut record = FundingRequest::new(
            &funding.address,
            destination,
            network,
            funding.funding_amount,
            now,
        )
        .with_meta(request.meta.clone());
        if tip > Amount::ZERO {
            record = record.with_tip(
                tip,
                fee_destinations
                    .first()
                    .map(|destination| destination.address.to_string()),
            );
        }
        if let Some(collection_id) = &request.collection_id {
            record = record.with_collection(collection_id);
        }
        if let Some(creator_id) = &request.creator_id {
            record = record.with_creator(creator_id);
        }
        if let Some(parent) = &request.parent {
            record = record.with_parent_value(parent.value);
        }

        let stored = self.store(&doc, request, record).await;
        if let Err(err) = &stored {
            warn!("{}: rolling back documents: {err}", doc.id);
            if let Err(err) = self
                .documents
                .delete_document(&doc.funding_address, &doc.id, item_count)
                .await
            {
                error!("{}: rollback failed: {err}", doc.id);
            }
        }
        stored?;

        info!(
            "{}: pay {} to {}",
            doc.id, funding.funding_amount, funding.address
        );

        Ok(Quote {
            id: doc.id,
            address: funding.address,
            funding_amount: funding.funding_amount,
            fee_rate,
            genesis_fee: funding.genesis_fee,
            reveal_fee: funding.reveal_fee,
            total_fee: funding.total_fee,
            tip,
            expires_at: now + self.config.poller.expire_after(),
        })
    }

    /// Content first, then the document, the funding record last.
    async fn store(
        &self,
        doc: &InscriptionDoc,
        request: &InscribeRequest,
        record: FundingRequest,
    ) -> OrdResult<()> {
        for (index, item) in request.inscriptions.iter().enumerate() {
            self.documents
                .put_content(&doc.funding_address, &doc.id, index, item)
                .await?;
        }
        self.documents.put_document(doc).await?;
        self.funding.create_funding(record).await
    }
}
