use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore as _;
use zeroize::Zeroizing;

use super::key_service::{KeyService, NONCE_SIZE};
use crate::{OrdError, OrdResult};

const TAG_SIZE: usize = 16;
const PREFIX: &str = "ENVELOPE[";
const SUFFIX: &str = "]";

/// AES-256-GCM ciphertext with the wrapped data key it was sealed with.
///
/// Serialized as `ENVELOPE[authTag:ciphertext:dataKey:iv]`, every component base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub auth_tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub data_key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl fmt::Display for EncryptedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}{}:{}:{}:{}{SUFFIX}",
            STANDARD.encode(&self.auth_tag),
            STANDARD.encode(&self.ciphertext),
            STANDARD.encode(&self.data_key),
            STANDARD.encode(&self.iv)
        )
    }
}

impl FromStr for EncryptedEnvelope {
    type Err = OrdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix(PREFIX)
            .and_then(|s| s.strip_suffix(SUFFIX))
            .ok_or_else(|| OrdError::InvalidEnvelope("missing ENVELOPE[...] frame".to_string()))?;

        let parts = inner.split(':').collect::<Vec<_>>();
        let [auth_tag, ciphertext, data_key, iv] = parts.as_slice() else {
            return Err(OrdError::InvalidEnvelope(format!(
                "expected 4 components, found {}",
                parts.len()
            )));
        };

        let envelope = Self {
            auth_tag: STANDARD.decode(auth_tag)?,
            ciphertext: STANDARD.decode(ciphertext)?,
            data_key: STANDARD.decode(data_key)?,
            iv: STANDARD.decode(iv)?,
        };
        if envelope.iv.len() != NONCE_SIZE || envelope.auth_tag.len() != TAG_SIZE {
            return Err(OrdError::InvalidEnvelope("bad iv or tag length".to_string()));
        }

        Ok(envelope)
    }
}

/// Seals `plaintext` under a fresh data key issued by `keys`.
pub async fn encrypt(keys: &dyn KeyService, plaintext: &[u8]) -> OrdResult<EncryptedEnvelope> {
    let data_key = keys.generate_data_key().await?;
    let cipher = Aes256Gcm::new_from_slice(&data_key.plaintext)
        .map_err(|_| OrdError::Encryption("bad data key length".to_string()))?;

    let mut iv = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| OrdError::Encryption(e.to_string()))?;
    let auth_tag = ciphertext.split_off(ciphertext.len() - TAG_SIZE);

    Ok(EncryptedEnvelope {
        auth_tag,
        ciphertext,
        data_key: data_key.wrapped,
        iv: iv.to_vec(),
    })
}

/// Opens `envelope`; needs the key service that issued its data key.
pub async fn decrypt(
    keys: &dyn KeyService,
    envelope: &EncryptedEnvelope,
) -> OrdResult<Zeroizing<Vec<u8>>> {
    if envelope.iv.len() != NONCE_SIZE {
        return Err(OrdError::InvalidEnvelope("bad iv length".to_string()));
    }

    let data_key = keys.decrypt_data_key(&envelope.data_key).await?;
    let cipher = Aes256Gcm::new_from_slice(&data_key)
        .map_err(|_| OrdError::Encryption("bad data key length".to_string()))?;

    let mut sealed = envelope.ciphertext.clone();
    sealed.extend_from_slice(&envelope.auth_tag);

    cipher
        .decrypt(Nonce::from_slice(&envelope.iv), sealed.as_slice())
        .map(Zeroizing::new)
        .map_err(|e| OrdError::Encryption(e.to_string()))
}
