use bitcoin::hashes::{sha256, Hash};

/// Compute sha256 hash of bytes
pub fn sha256sum(bytes: &[u8]) -> Vec<u8> {
    sha256::Hash::hash(bytes).to_byte_array().to_vec()
}

/// Hex encoding of the first `len` bytes of the sha256 of `bytes`.
pub fn sha256sum_hex(bytes: &[u8], len: usize) -> String {
    let digest = sha256sum(bytes);
    hex::encode(&digest[..len.min(digest.len())])
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_compute_sha256sum() {
        assert_eq!(
            hex::decode("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
                .unwrap(),
            sha256sum("hello world".as_bytes())
        );
    }

    #[test]
    fn test_should_truncate_hex_digest() {
        assert_eq!(
            sha256sum_hex("hello world".as_bytes(), 4),
            "b94d27b9".to_string()
        );
    }
}
