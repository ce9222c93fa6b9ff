use bitcoin::key::{Keypair, Secp256k1};
use bitcoin::secp256k1::{All, SecretKey};
use bitcoin::XOnlyPublicKey;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaprootKeypair {
    /// Generate a keypair using a secret key
    SecretKey(SecretKey),
    /// Generate a keypair using a random number generator
    #[default]
    Random,
}

impl TaprootKeypair {
    pub fn generate_keypair(&self, secp: &Secp256k1<All>) -> (Keypair, XOnlyPublicKey) {
        let keypair = match self {
            Self::SecretKey(secret_key) => Keypair::from_secret_key(secp, secret_key),
            Self::Random => Keypair::new(secp, &mut rand::thread_rng()),
        };

        let x_public_key = XOnlyPublicKey::from_keypair(&keypair).0;
        (keypair, x_public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_key_keypair_is_deterministic() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[9; 32]).unwrap();

        let (a, xa) = TaprootKeypair::SecretKey(secret).generate_keypair(&secp);
        let (b, xb) = TaprootKeypair::SecretKey(secret).generate_keypair(&secp);

        assert_eq!(a.secret_key(), b.secret_key());
        assert_eq!(xa, xb);
    }

    #[test]
    fn random_keypairs_differ() {
        let secp = Secp256k1::new();

        let (_, xa) = TaprootKeypair::default().generate_keypair(&secp);
        let (_, xb) = TaprootKeypair::Random.generate_keypair(&secp);

        assert_ne!(xa, xb);
    }
}
