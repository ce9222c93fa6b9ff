use std::str::FromStr;
use std::sync::Arc;

use bitcoin::key::Keypair;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::taproot::TapNodeHash;
use bitcoin::{Address, Amount, FeeRate, Network, ScriptBuf, XOnlyPublicKey};
use serde::{Deserialize, Serialize};

use super::envelope::{self, EncryptedEnvelope};
use super::key_service::KeyService;
use super::object_store::ObjectStore;
use crate::store::FundingRequest;
use crate::wallet::{
    FeeDestination, FeeDestinationRecord, FundingAddress, FundingArgs, GenesisArgs, ParentArgs,
    TaprootLeaf, TaprootPayload,
};
use crate::{InscriptionId, OrdError, OrdResult, WritableInscription};

pub fn transaction_path(address: &str, id: &str) -> String {
    format!("address/{address}/inscriptions/{id}/transaction.json")
}

pub fn content_path(address: &str, id: &str, index: usize) -> String {
    format!("address/{address}/inscriptions/{id}/content/{index:04}.json")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafDoc {
    pub script: ScriptBuf,
    #[serde(with = "hex")]
    pub control_block: Vec<u8>,
    pub padding_sat: u64,
}

impl LeafDoc {
    fn new(leaf: &TaprootLeaf, padding: Amount) -> Self {
        Self {
            script: leaf.script.clone(),
            control_block: leaf.control_block.serialize(),
            padding_sat: padding.to_sat(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentDoc {
    pub inscription_id: InscriptionId,
    pub value_sat: u64,
}

/// Everything needed to rebuild the genesis and reveal of a request, once the key is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InscriptionDoc {
    pub id: String,
    pub funding_address: String,
    pub network: Network,
    pub internal_key: XOnlyPublicKey,
    pub output_key: XOnlyPublicKey,
    pub merkle_root: Option<TapNodeHash>,
    pub leaves: Vec<LeafDoc>,
    pub parent_leaf: Option<LeafDoc>,
    pub parent: Option<ParentDoc>,
    /// Exact fee rate, sat/kwu
    pub fee_rate_sat_kwu: u64,
    pub genesis_fee_sat: u64,
    pub reveal_fee_sat: u64,
    pub total_fee_sat: u64,
    pub fee_output_sat: Option<u64>,
    pub tip_sat: u64,
    pub fee_destinations: Vec<FeeDestinationRecord>,
    pub destination_address: String,
    /// `ENVELOPE[...]` sealing the ephemeral secret key
    pub encrypted_key: String,
}

impl InscriptionDoc {
    pub fn new(funding: &FundingAddress, args: &FundingArgs, encrypted_key: String) -> Self {
        let secp = Secp256k1::new();

        Self {
            id: FundingRequest::request_id(&funding.address),
            funding_address: funding.address.to_string(),
            network: args.network,
            internal_key: funding.payload.internal_key(),
            output_key: funding.payload.tweaked_keypair(&secp).x_only_public_key().0,
            merkle_root: funding.payload.merkle_root,
            leaves: funding
                .payload
                .leaves
                .iter()
                .zip(&funding.layout)
                .map(|(leaf, item)| LeafDoc::new(leaf, item.padding))
                .collect(),
            parent_leaf: funding
                .payload
                .parent_leaf
                .as_ref()
                .map(|leaf| LeafDoc::new(leaf, Amount::ZERO)),
            parent: args.parent.map(|parent| ParentDoc {
                inscription_id: parent.inscription_id,
                value_sat: parent.value.to_sat(),
            }),
            fee_rate_sat_kwu: args.fee_rate.to_sat_per_kwu(),
            genesis_fee_sat: funding.genesis_fee.to_sat(),
            reveal_fee_sat: funding.reveal_fee.to_sat(),
            total_fee_sat: funding.total_fee.to_sat(),
            fee_output_sat: funding.fee_output.map(Amount::to_sat),
            tip_sat: args.tip.to_sat(),
            fee_destinations: args
                .fee_destinations
                .iter()
                .map(FeeDestination::to_record)
                .collect(),
            destination_address: args.destination.to_string(),
            encrypted_key,
        }
    }

    /// Rebuilds the script tree with the opened key and checks it still pays the funding address.
    pub fn restore_payload(&self, secret_key: &SecretKey) -> OrdResult<TaprootPayload> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, secret_key);
        if keypair.x_only_public_key().0 != self.internal_key {
            return Err(OrdError::AddressMismatch(self.funding_address.clone()));
        }

        TaprootPayload::restore(
            &secp,
            keypair,
            self.leaves.iter().map(|leaf| leaf.script.clone()).collect(),
            self.parent_leaf.as_ref().map(|leaf| leaf.script.clone()),
            self.network,
            &self.funding_address,
        )
    }

    pub fn genesis_args<'a>(
        &self,
        payload: &'a TaprootPayload,
        change_address: &'a Address,
    ) -> GenesisArgs<'a> {
        GenesisArgs {
            payload,
            paddings: self.paddings(),
            fee_output: self.fee_output_sat.map(Amount::from_sat),
            fee_rate: self.fee_rate(),
            change_address,
        }
    }

    pub fn paddings(&self) -> Vec<Amount> {
        self.leaves
            .iter()
            .map(|leaf| Amount::from_sat(leaf.padding_sat))
            .collect()
    }

    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_sat_per_kwu(self.fee_rate_sat_kwu)
    }

    pub fn tip(&self) -> Amount {
        Amount::from_sat(self.tip_sat)
    }

    pub fn destination(&self) -> OrdResult<Address> {
        Ok(Address::from_str(&self.destination_address)?.require_network(self.network)?)
    }

    pub fn fee_destinations(&self) -> OrdResult<Vec<FeeDestination>> {
        self.fee_destinations
            .iter()
            .map(|record| FeeDestination::from_record(record, self.network))
            .collect()
    }

    pub fn parent(&self) -> Option<ParentArgs> {
        self.parent.map(|parent| ParentArgs {
            inscription_id: parent.inscription_id,
            value: Amount::from_sat(parent.value_sat),
        })
    }
}

/// Documents and content kept in an [`ObjectStore`], keys sealed by a [`KeyService`].
#[derive(Clone)]
pub struct SecureDocumentStore {
    objects: Arc<dyn ObjectStore>,
    keys: Arc<dyn KeyService>,
}

impl SecureDocumentStore {
    pub fn new(objects: Arc<dyn ObjectStore>, keys: Arc<dyn KeyService>) -> Self {
        Self { objects, keys }
    }

    /// Envelope-encrypts an ephemeral secret key.
    pub async fn seal_key(&self, secret_key: &SecretKey) -> OrdResult<String> {
        let envelope = envelope::encrypt(self.keys.as_ref(), &secret_key.secret_bytes()).await?;
        Ok(envelope.to_string())
    }

    pub async fn open_key(&self, doc: &InscriptionDoc) -> OrdResult<SecretKey> {
        let envelope = EncryptedEnvelope::from_str(&doc.encrypted_key)?;
        let plaintext = envelope::decrypt(self.keys.as_ref(), &envelope).await?;

        Ok(SecretKey::from_slice(&plaintext)?)
    }

    pub async fn put_document(&self, doc: &InscriptionDoc) -> OrdResult<()> {
        let body = serde_json::to_vec(doc)?;
        self.objects
            .put(&transaction_path(&doc.funding_address, &doc.id), body)
            .await
    }

    pub async fn get_document(&self, address: &str, id: &str) -> OrdResult<InscriptionDoc> {
        let body = self.objects.get(&transaction_path(address, id)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn put_content(
        &self,
        address: &str,
        id: &str,
        index: usize,
        item: &WritableInscription,
    ) -> OrdResult<()> {
        let body = serde_json::to_vec(item)?;
        self.objects
            .put(&content_path(address, id, index), body)
            .await
    }

    pub async fn get_content(
        &self,
        address: &str,
        id: &str,
        index: usize,
    ) -> OrdResult<WritableInscription> {
        let body = self.objects.get(&content_path(address, id, index)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Removes the document and its `items` content objects.
    pub async fn delete_document(&self, address: &str, id: &str, items: usize) -> OrdResult<()> {
        for index in 0..items {
            self.objects.delete(&content_path(address, id, index)).await?;
        }
        self.objects.delete(&transaction_path(address, id)).await
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Network;

    use super::*;
    use crate::secure::{LocalKeyService, MemoryObjectStore};
    use crate::utils::test_utils::{address, txid};
    use crate::wallet::{
        construct_genesis_transaction, derive_funding_address, GenesisArgs, TaprootKeypair, Utxo,
    };

    fn documents() -> (SecureDocumentStore, Arc<MemoryObjectStore>) {
        let objects = Arc::new(MemoryObjectStore::default());
        let keys = Arc::new(LocalKeyService::new(&[3u8; 32]).unwrap());
        (SecureDocumentStore::new(objects.clone(), keys), objects)
    }

    #[test]
    fn should_format_paths() {
        assert_eq!(
            transaction_path("bc1p", "abcd"),
            "address/bc1p/inscriptions/abcd/transaction.json"
        );
        assert_eq!(
            content_path("bc1p", "abcd", 7),
            "address/bc1p/inscriptions/abcd/content/0007.json"
        );
    }

    #[tokio::test]
    async fn should_store_and_restore_a_request() {
        let (documents, objects) = documents();
        let destination = address(1, Network::Regtest);
        let fee_destinations = vec![FeeDestination::new(address(2, Network::Regtest), 100)];
        let items = vec![
            WritableInscription::new("text/plain", b"first".to_vec()),
            WritableInscription::new("text/plain", b"second".to_vec()),
        ];
        let args = FundingArgs {
            inscriptions: &items,
            network: Network::Regtest,
            fee_rate: FeeRate::from_sat_per_vb(10).unwrap(),
            tip: Amount::from_sat(1_000),
            padding: Amount::from_sat(546),
            destination: &destination,
            fee_destinations: &fee_destinations,
            parent: None,
            keypair: TaprootKeypair::Random,
        };
        let funding = derive_funding_address(args.clone()).unwrap();

        let sealed = documents.seal_key(&funding.secret_key).await.unwrap();
        assert!(sealed.starts_with("ENVELOPE["));
        let doc = InscriptionDoc::new(&funding, &args, sealed);
        documents.put_document(&doc).await.unwrap();
        for (index, item) in items.iter().enumerate() {
            documents
                .put_content(&doc.funding_address, &doc.id, index, item)
                .await
                .unwrap();
        }

        let stored = documents
            .get_document(&funding.address.to_string(), &doc.id)
            .await
            .unwrap();
        assert_eq!(stored, doc);
        assert_eq!(
            documents
                .get_content(&doc.funding_address, &doc.id, 1)
                .await
                .unwrap(),
            items[1]
        );

        let secret_key = documents.open_key(&stored).await.unwrap();
        assert_eq!(secret_key, funding.secret_key);
        let payload = stored.restore_payload(&secret_key).unwrap();
        assert_eq!(payload.address, funding.address);
        assert_eq!(stored.destination().unwrap(), destination);
        assert_eq!(stored.fee_destinations().unwrap(), fee_destinations);

        // the stored parameters rebuild the very same genesis
        let utxo = Utxo {
            id: txid(1),
            index: 0,
            amount: funding.funding_amount,
        };
        let expected = construct_genesis_transaction(
            &utxo,
            &GenesisArgs::from_funding(&funding, args.fee_rate, &destination),
        )
        .unwrap();
        let rebuilt =
            construct_genesis_transaction(&utxo, &stored.genesis_args(&payload, &destination))
                .unwrap();
        assert_eq!(rebuilt.tx.txid(), expected.tx.txid());

        documents
            .delete_document(&doc.funding_address, &doc.id, items.len())
            .await
            .unwrap();
        assert!(objects.paths().is_empty());
        assert!(matches!(
            documents.get_document(&doc.funding_address, &doc.id).await,
            Err(OrdError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn wrong_key_is_detected() {
        let (documents, _) = documents();
        let destination = address(1, Network::Regtest);
        let items = vec![WritableInscription::new("text/plain", b"x".to_vec())];
        let args = FundingArgs {
            inscriptions: &items,
            network: Network::Regtest,
            fee_rate: FeeRate::from_sat_per_vb(2).unwrap(),
            tip: Amount::ZERO,
            padding: Amount::from_sat(546),
            destination: &destination,
            fee_destinations: &[],
            parent: None,
            keypair: TaprootKeypair::Random,
        };
        let funding = derive_funding_address(args.clone()).unwrap();
        let doc = InscriptionDoc::new(&funding, &args, String::new());

        let other = SecretKey::from_slice(&[9u8; 32]).unwrap();
        assert!(matches!(
            doc.restore_payload(&other),
            Err(OrdError::AddressMismatch(_))
        ));
        assert!(documents.open_key(&doc).await.is_err());
    }
}
