use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore as _;
use zeroize::Zeroizing;

use crate::{OrdError, OrdResult};

pub const DATA_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// Data key issued by a [`KeyService`].
pub struct DataKey {
    pub plaintext: Zeroizing<Vec<u8>>,
    /// The key encrypted under the master key, safe to store.
    pub wrapped: Vec<u8>,
}

/// Master-key service wrapping per-document data keys.
#[async_trait::async_trait]
pub trait KeyService: Send + Sync {
    /// Generates a random data key, returned both in clear and wrapped.
    async fn generate_data_key(&self) -> OrdResult<DataKey>;

    /// Unwraps a data key previously issued by [`KeyService::generate_data_key`].
    async fn decrypt_data_key(&self, wrapped: &[u8]) -> OrdResult<Zeroizing<Vec<u8>>>;
}

/// Key service holding the master key in process, wrapping with AES-256-GCM.
///
/// Wrapped keys are `nonce || ciphertext || tag`.
pub struct LocalKeyService {
    cipher: Aes256Gcm,
}

impl LocalKeyService {
    pub fn new(master_key: &[u8]) -> OrdResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(master_key)
            .map_err(|_| OrdError::Config("master key must be 32 bytes".to_string()))?;

        Ok(Self { cipher })
    }

    pub fn from_hex(master_key: &str) -> OrdResult<Self> {
        let master_key = Zeroizing::new(hex::decode(master_key)?);
        Self::new(&master_key)
    }
}

#[async_trait::async_trait]
impl KeyService for LocalKeyService {
    async fn generate_data_key(&self) -> OrdResult<DataKey> {
        let mut rng = rand::thread_rng();
        let mut plaintext = Zeroizing::new(vec![0u8; DATA_KEY_SIZE]);
        rng.fill_bytes(&mut plaintext);
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| OrdError::Encryption(format!("wrap data key: {e}")))?;

        let mut wrapped = nonce.to_vec();
        wrapped.extend(sealed);

        Ok(DataKey { plaintext, wrapped })
    }

    async fn decrypt_data_key(&self, wrapped: &[u8]) -> OrdResult<Zeroizing<Vec<u8>>> {
        if wrapped.len() <= NONCE_SIZE {
            return Err(OrdError::Encryption("wrapped key too short".to_string()));
        }
        let (nonce, sealed) = wrapped.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map(Zeroizing::new)
            .map_err(|e| OrdError::Encryption(format!("unwrap data key: {e}")))
    }
}
